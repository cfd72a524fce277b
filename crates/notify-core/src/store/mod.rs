//! Persistent state store
//!
//! Translates registrations, event state and subscriptions to and from the
//! key-value schema in [`keys`]. Event-type-sensitive operations go to the
//! registered [`EventPackage`](crate::registry::EventPackage) when there is
//! one for the type.
//!
//! ## Schema
//!
//! ```text
//! reg:<aor>                                          hash, TTL = expires
//! es:<aor>:<event>                                   hash, TTL = expires
//! event_zset                                         zset  es:* keys scored by etag
//! sub:<opaque>                                       hash, TTL = expires
//! subkeydlg:<resource>:<event>:<subscriber>:<callId> string -> sub:<opaque>
//! subkeyid:<resource>:<event>:<subscriber>:<id>      string -> sub:<opaque>
//! ```
//!
//! Expiry of an `es:` record does not clean `event_zset`; [`StateStore::purge_expired`]
//! removes index entries whose record is gone.

pub mod keys;
pub mod kv;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{NotifyError, Result};
use crate::registry::PackageRegistry;
use crate::sip::DialogHandle;
use crate::types::{EventState, Registration, Subscription};
use crate::util::{etag_score, generate_etag};

pub use kv::{Batch, Command, KvStore, MessageStream};
pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

const MIN_PURGE_INTERVAL: Duration = Duration::from_secs(1);

/// How a failed store call is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Criticality {
    /// Failure aborts the surrounding operation
    Critical,
    /// Failure is logged and ignored
    BestEffort,
}

impl Criticality {
    /// Apply this policy to the outcome of `operation`
    pub fn settle(self, operation: &str, result: Result<()>) -> Result<()> {
        match (self, result) {
            (_, Ok(())) => Ok(()),
            (Criticality::Critical, Err(e)) => {
                error!("Store operation {} failed: {}", operation, e);
                Err(e)
            }
            (Criticality::BestEffort, Err(e)) => {
                warn!("Ignoring failed best-effort store operation {}: {}", operation, e);
                Ok(())
            }
        }
    }
}

/// Data-access layer over a [`KvStore`]
pub struct StateStore {
    kv: Arc<dyn KvStore>,
    packages: Arc<PackageRegistry>,
}

impl StateStore {
    pub fn new(kv: Arc<dyn KvStore>, packages: Arc<PackageRegistry>) -> Self {
        Self { kv, packages }
    }

    /// Execute `batch` under the given failure policy
    pub async fn apply(&self, criticality: Criticality, operation: &str, batch: Batch) -> Result<()> {
        let result = self.kv.exec(batch).await.map(|_| ());
        criticality.settle(operation, result)
    }

    // ---- registrations ----

    pub async fn add_registration(
        &self,
        aor: &str,
        contact: &str,
        transport: &str,
        proxy: &str,
        expires: u32,
    ) -> Result<Registration> {
        let registration = Registration {
            aor: aor.to_string(),
            contact: contact.to_string(),
            transport: transport.to_string(),
            proxy: proxy.to_string(),
            expires,
            registered_at: Utc::now(),
        };
        let key = keys::registration(aor);
        let batch = Batch::new()
            .del(&key)
            .hset_ex(&key, registration.to_fields(), expires as u64);
        self.apply(Criticality::Critical, "add_registration", batch).await?;
        debug!("Registered {} at {} via {}", aor, contact, proxy);
        Ok(registration)
    }

    /// Current registration; store failures read as "not registered"
    pub async fn get_registration(&self, aor: &str) -> Result<Option<Registration>> {
        let fields = match self.kv.hgetall(&keys::registration(aor)).await {
            Ok(fields) => fields,
            Err(e) => {
                warn!("Failed to read registration for {}: {}", aor, e);
                return Ok(None);
            }
        };
        if fields.is_empty() {
            return Ok(None);
        }
        Registration::from_fields(aor, &fields).map(Some)
    }

    pub async fn remove_registration(&self, aor: &str) -> Result<()> {
        let batch = Batch::new().del(&keys::registration(aor));
        self.apply(Criticality::Critical, "remove_registration", batch).await
    }

    // ---- event state ----

    /// Publish new state for `resource`, replacing any previous version
    pub async fn add_event_state(
        &self,
        resource: &str,
        expires: u64,
        event_type: &str,
        content_type: &str,
        content: &str,
    ) -> Result<EventState> {
        let state = EventState {
            resource: resource.to_string(),
            event: event_type.to_string(),
            etag: generate_etag(),
            content_type: content_type.to_string(),
            content: content.to_string(),
            expires,
        };
        let key = keys::event_state(resource, event_type);
        let batch = Batch::new()
            .del(&key)
            .hset_ex(&key, state.to_fields(), expires)
            .zadd(keys::EVENT_INDEX, etag_score(&state.etag)?, &key);
        self.apply(Criticality::Critical, "add_event_state", batch).await?;
        debug!("Stored {} state for {} with etag {}", event_type, resource, state.etag);
        Ok(state)
    }

    /// State to put in a NOTIFY for `subscriber`
    ///
    /// Store failures read as "no state".
    pub async fn get_event_state(
        &self,
        subscriber: &str,
        resource: &str,
        event_type: &str,
    ) -> Result<Option<EventState>> {
        let result = match self.packages.get(event_type) {
            Some(package) => package.get_event_state(subscriber, resource).await,
            None => self.read_event_state(&keys::event_state(resource, event_type)).await,
        };
        match result {
            Err(NotifyError::Store(e)) => {
                warn!("Failed to read {} state for {}: {}", event_type, resource, e);
                Ok(None)
            }
            other => other,
        }
    }

    /// Look a state record up by version tag
    pub async fn get_event_state_by_etag(&self, etag: &str) -> Result<Option<EventState>> {
        Ok(self.resolve_etag(etag).await?.map(|(_, state)| state))
    }

    /// Extend the lifetime of a published state under a fresh tag
    pub async fn refresh_event_state(&self, etag: &str, expires: u64) -> Result<EventState> {
        let (key, mut state) = self.require_etag(etag).await?;
        state.expires = expires;
        self.rotate_etag(&key, state, "refresh_event_state").await
    }

    /// Replace the content of a published state under a fresh tag
    pub async fn modify_event_state(
        &self,
        etag: &str,
        expires: u64,
        content_type: &str,
        content: &str,
    ) -> Result<EventState> {
        let (key, mut state) = self.require_etag(etag).await?;
        state.expires = expires;
        state.content_type = content_type.to_string();
        state.content = content.to_string();
        self.rotate_etag(&key, state, "modify_event_state").await
    }

    pub async fn remove_event_state(&self, etag: &str) -> Result<()> {
        let (key, state) = self.require_etag(etag).await?;
        let batch = Batch::new().del(&key).zrem(keys::EVENT_INDEX, &key);
        self.apply(Criticality::Critical, "remove_event_state", batch).await?;
        debug!("Removed {} state for {} (etag {})", state.event, state.resource, etag);
        Ok(())
    }

    /// Drop index entries whose state record has expired, returning how many
    ///
    /// An entry is only removed while its record is still absent and its
    /// score unchanged, so a republish racing the purge keeps its entry.
    pub async fn purge_expired(&self) -> Result<usize> {
        let indexed = self.kv.zrange_with_scores(keys::EVENT_INDEX).await?;
        let mut removed = 0;
        for (key, score) in indexed {
            if self.kv.exists(&key).await? {
                continue;
            }
            let batch = Batch::new()
                .guard_absent(&key)
                .guard_zscore(keys::EVENT_INDEX, &key, score)
                .zrem(keys::EVENT_INDEX, &key);
            if self.kv.exec(batch).await? {
                removed += 1;
            } else {
                debug!("Kept index entry for {}: republished during purge", key);
            }
        }
        if removed > 0 {
            info!("Purged {} expired event state index entries", removed);
        }
        Ok(removed)
    }

    /// Run [`purge_expired`](Self::purge_expired) every `interval`
    ///
    /// A zero interval is raised to one second.
    pub fn spawn_purge_task(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let interval = if interval.is_zero() {
            warn!("Event state purge interval of zero raised to {:?}", MIN_PURGE_INTERVAL);
            MIN_PURGE_INTERVAL
        } else {
            interval
        };
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = store.purge_expired().await {
                    warn!("Event state purge failed: {}", e);
                }
            }
        })
    }

    async fn read_event_state(&self, key: &str) -> Result<Option<EventState>> {
        let fields = self.kv.hgetall(key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        EventState::from_fields(&fields).map(Some)
    }

    async fn resolve_etag(&self, etag: &str) -> Result<Option<(String, EventState)>> {
        let score = etag_score(etag)?;
        for key in self.kv.zrange_by_score(keys::EVENT_INDEX, score, score).await? {
            if let Some(state) = self.read_event_state(&key).await? {
                if state.etag == etag {
                    return Ok(Some((key, state)));
                }
            }
        }
        Ok(None)
    }

    async fn require_etag(&self, etag: &str) -> Result<(String, EventState)> {
        self.resolve_etag(etag)
            .await?
            .ok_or_else(|| NotifyError::NotFound(format!("no event state with etag {}", etag)))
    }

    async fn rotate_etag(&self, key: &str, mut state: EventState, operation: &str) -> Result<EventState> {
        let old = std::mem::replace(&mut state.etag, generate_etag());
        let batch = Batch::new()
            .del(key)
            .hset_ex(key, state.to_fields(), state.expires)
            .zrem(keys::EVENT_INDEX, key)
            .zadd(keys::EVENT_INDEX, etag_score(&state.etag)?, key);
        self.apply(Criticality::Critical, operation, batch).await?;
        debug!("Rotated etag for {}: {} -> {}", key, old, state.etag);
        Ok(state)
    }

    // ---- subscriptions ----

    /// Persist a subscription, returning it with its version tag set
    pub async fn add_subscription(
        &self,
        dialog: &DialogHandle,
        subscription: &Subscription,
    ) -> Result<Subscription> {
        if let Some(package) = self.packages.get(&subscription.event) {
            return package.add_subscription(dialog, subscription).await;
        }

        let call_id = subscription.call_id.as_deref().ok_or_else(|| {
            NotifyError::InvalidSubscription("Call-ID is required to index a subscription".into())
        })?;

        let mut stored = subscription.clone();
        stored.etag = Some(generate_etag());

        let record_key = keys::subscription(&Uuid::new_v4().simple().to_string());
        let ttl = stored.expires as u64;
        let mut batch = Batch::new()
            .hset_ex(&record_key, stored.to_fields(), ttl)
            .set_ex(
                &keys::subscription_by_dialog(&stored.resource, &stored.event, &stored.subscriber, call_id),
                &record_key,
                ttl,
            );
        if let Some(id) = &stored.id {
            batch = batch.set_ex(
                &keys::subscription_by_id(&stored.resource, &stored.event, &stored.subscriber, id),
                &record_key,
                ttl,
            );
        }
        self.apply(Criticality::Critical, "add_subscription", batch).await?;

        debug!(
            "Stored {} subscription {} -> {} as {}",
            stored.event, stored.subscriber, stored.resource, record_key
        );
        Ok(stored)
    }

    /// Delete a subscription under the given failure policy
    pub async fn remove_subscription(
        &self,
        subscription: &Subscription,
        criticality: Criticality,
    ) -> Result<()> {
        let result = match self.packages.get(&subscription.event) {
            Some(package) => package.remove_subscription(subscription).await,
            None => self.remove_generic_subscription(subscription).await,
        };
        criticality.settle("remove_subscription", result)
    }

    async fn remove_generic_subscription(&self, subscription: &Subscription) -> Result<()> {
        let Some(call_id) = subscription.call_id.as_deref() else {
            return Err(NotifyError::InvalidSubscription(
                "Call-ID is required to locate a subscription".into(),
            ));
        };
        let dialog_key = keys::subscription_by_dialog(
            &subscription.resource,
            &subscription.event,
            &subscription.subscriber,
            call_id,
        );

        let mut batch = Batch::new().del(&dialog_key);
        if let Some(record_key) = self.kv.get(&dialog_key).await? {
            batch = batch.del(&record_key);
        }
        if let Some(id) = &subscription.id {
            batch = batch.del(&keys::subscription_by_id(
                &subscription.resource,
                &subscription.event,
                &subscription.subscriber,
                id,
            ));
        }
        self.kv.exec(batch).await.map(|_| ())
    }

    /// Live subscriptions to `resource` for `event_type`
    pub async fn find_subscriptions(&self, resource: &str, event_type: &str) -> Result<Vec<Subscription>> {
        if let Some(package) = self.packages.get(event_type) {
            return package.find_subscriptions(resource).await;
        }

        let pattern = keys::subscription_by_dialog_pattern(resource, event_type);
        let mut found = Vec::new();
        for pointer in self.kv.keys(&pattern).await? {
            let Some(record_key) = self.kv.get(&pointer).await? else {
                continue;
            };
            let fields = self.kv.hgetall(&record_key).await?;
            if fields.is_empty() {
                debug!("Skipping {}: subscription record {} has expired", pointer, record_key);
                continue;
            }
            found.push(Subscription::from_fields(&fields)?);
        }
        Ok(found)
    }
}
