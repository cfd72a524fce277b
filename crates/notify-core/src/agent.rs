//! Agent assembly
//!
//! Wires the package registry, state store, lifecycle engine and the
//! background tasks (dialog channel listener, index purge) together.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::AgentConfig;
use crate::engine::{SubscribeOutcome, SubscriptionEngine};
use crate::error::Result;
use crate::packages::DialogPackage;
use crate::packages::dialog::EVENT_TYPE as DIALOG_EVENT;
use crate::registry::PackageRegistry;
use crate::sip::{DialogLayer, SipRequest};
use crate::store::{KvStore, StateStore};

/// A running notification agent
pub struct NotifyAgent {
    config: Arc<AgentConfig>,
    store: Arc<StateStore>,
    engine: Arc<SubscriptionEngine>,
    dialog_package: Option<Arc<DialogPackage>>,
    tasks: Vec<JoinHandle<()>>,
}

impl NotifyAgent {
    /// Build the agent over `kv` and start its background tasks
    pub async fn start(config: AgentConfig, kv: Arc<dyn KvStore>, dialogs: Arc<dyn DialogLayer>) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let mut registry = PackageRegistry::new();
        let dialog_package = if config.is_supported(DIALOG_EVENT) {
            let package = Arc::new(DialogPackage::new(
                Arc::clone(&kv),
                Arc::clone(&dialogs),
                config.dialog.clone(),
            ));
            registry.register(package.clone());
            Some(package)
        } else {
            None
        };

        let store = Arc::new(StateStore::new(kv, Arc::new(registry)));
        let engine = SubscriptionEngine::new(Arc::clone(&config), Arc::clone(&store), dialogs);

        let mut tasks = Vec::new();
        if let Some(package) = &dialog_package {
            tasks.push(Arc::clone(package).start_listener().await?);
        }
        if config.store.purge_interval_secs > 0 {
            tasks.push(store.spawn_purge_task(Duration::from_secs(config.store.purge_interval_secs)));
        } else {
            warn!("Event state index purge is disabled");
        }

        info!(
            "Notify agent started, event packages: {}",
            config.supported_events.join(", ")
        );

        Ok(Self {
            config,
            store,
            engine,
            dialog_package,
            tasks,
        })
    }

    /// Connect to the Redis server named in the config and start the agent
    #[cfg(feature = "redis")]
    pub async fn connect(config: AgentConfig, dialogs: Arc<dyn DialogLayer>) -> Result<Self> {
        let kv = crate::store::RedisStore::connect(&config.store.url).await?;
        Self::start(config, Arc::new(kv), dialogs).await
    }

    pub async fn handle_subscribe(&self, request: &SipRequest) -> SubscribeOutcome {
        self.engine.handle_subscribe(request).await
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn engine(&self) -> &Arc<SubscriptionEngine> {
        &self.engine
    }

    pub fn dialog_package(&self) -> Option<&Arc<DialogPackage>> {
        self.dialog_package.as_ref()
    }

    /// Stop the background tasks
    ///
    /// Armed expiry timers are left to run out; they only hold a weak
    /// reference to the engine.
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("Notify agent stopped");
    }
}

impl Drop for NotifyAgent {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
