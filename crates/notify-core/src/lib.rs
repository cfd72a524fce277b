//! # Notify-Core
//!
//! SIP event notification agent (RFC 3265) for RVoIP-style deployments.
//!
//! This crate provides:
//! - The subscription lifecycle engine: admit, refresh and terminate
//!   SUBSCRIBE dialogs, with one expiry timer per dialog and event type
//! - A state store over a key-value backend (in-memory, or Redis behind the
//!   `redis` feature) for registrations, published event state and
//!   subscriptions
//! - A static registry of event packages, and the `dialog` package
//!   (RFC 4235) that fans dialog state changes out to watchers
//!
//! ## Architecture
//!
//! SIP parsing and transactions belong to the dialog library in front of
//! the agent. It hands SUBSCRIBE requests to [`NotifyAgent::handle_subscribe`]
//! and implements [`DialogLayer`] so the engine can answer them and send
//! NOTIFY requests back.
//!
//! ```no_run
//! use std::sync::Arc;
//! use notify_core::{AgentConfig, DialogLayer, MemoryStore, NotifyAgent};
//!
//! # async fn run(dialogs: Arc<dyn DialogLayer>) -> notify_core::Result<()> {
//! let config = AgentConfig::load("notify.toml")?;
//! notify_core::setup_logging(&config.logging_config()?)?;
//! let agent = NotifyAgent::start(config, Arc::new(MemoryStore::new()), dialogs).await?;
//! # let _ = agent;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod packages;
pub mod registry;
pub mod sip;
pub mod store;
pub mod types;
pub mod util;

pub use agent::NotifyAgent;
pub use config::AgentConfig;
pub use engine::{SubscribeOutcome, SubscriptionEngine};
pub use error::{NotifyError, Result};
pub use logging::{setup_logging, LoggingConfig};
pub use packages::DialogPackage;
pub use registry::{EventPackage, PackageRegistry};
pub use sip::{DialogHandle, DialogLayer, NotifyRequest, SipRequest, SipUri, StatusCode, SubscriptionState};
pub use store::{Criticality, KvStore, MemoryStore, StateStore};
#[cfg(feature = "redis")]
pub use store::RedisStore;
pub use types::{DialogCallState, DialogDirection, DialogInfo, EventState, Registration, Subscription};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
