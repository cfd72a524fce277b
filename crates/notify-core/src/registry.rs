//! Event package registry
//!
//! An event package owns the schema and notification behaviour for one
//! event type. Packages are registered once at startup; the state store
//! hands every event-type-sensitive operation for a registered type to its
//! package and never touches the generic schema for it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::sip::DialogHandle;
use crate::types::{EventState, Subscription};

/// Capabilities every event package provides
#[async_trait]
pub trait EventPackage: Send + Sync {
    /// Event header token this package handles
    fn event_type(&self) -> &str;

    /// Current state of `resource` as seen by `subscriber`
    ///
    /// `Ok(None)` means there is nothing to report.
    async fn get_event_state(&self, subscriber: &str, resource: &str) -> Result<Option<EventState>>;

    /// Persist a subscription made on `dialog`; the record lives for
    /// `subscription.expires` seconds
    async fn add_subscription(
        &self,
        dialog: &DialogHandle,
        subscription: &Subscription,
    ) -> Result<Subscription>;

    async fn remove_subscription(&self, subscription: &Subscription) -> Result<()>;

    /// Live subscriptions watching `resource`
    async fn find_subscriptions(&self, _resource: &str) -> Result<Vec<Subscription>> {
        Ok(Vec::new())
    }
}

/// Static map from event type to package
#[derive(Default, Clone)]
pub struct PackageRegistry {
    packages: HashMap<String, Arc<dyn EventPackage>>,
}

impl std::fmt::Debug for PackageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageRegistry")
            .field("event_types", &self.event_types())
            .finish()
    }
}

impl PackageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a package, replacing any earlier one for the same type
    pub fn register(&mut self, package: Arc<dyn EventPackage>) {
        let event_type = package.event_type().to_ascii_lowercase();
        self.packages.insert(event_type, package);
    }

    pub fn with(mut self, package: Arc<dyn EventPackage>) -> Self {
        self.register(package);
        self
    }

    pub fn get(&self, event_type: &str) -> Option<Arc<dyn EventPackage>> {
        self.packages.get(&event_type.to_ascii_lowercase()).cloned()
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.packages.contains_key(&event_type.to_ascii_lowercase())
    }

    pub fn event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.packages.keys().cloned().collect();
        types.sort();
        types
    }
}
