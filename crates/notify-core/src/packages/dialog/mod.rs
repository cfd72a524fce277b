//! Dialog event package (RFC 4235)
//!
//! Keeps one dialog-info snapshot per resource (`dlg-info:<aor>`), one
//! subscription record per watcher/resource pair
//! (`dlg-sub:<subscriber>-<resource>`) and a set of those record keys per
//! resource (`watched-aor:<resource>`). Dialog state changes arrive on a
//! publish channel as single lines:
//!
//! ```text
//! <aor> <dialog-id> <call-id> <local-tag> <remote-tag> <direction> <state>
//! ```
//!
//! with `undef` standing in for a missing tag. Every change is fanned out
//! as a NOTIFY to each live watcher of the resource.

pub mod xml;

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::DialogPackageConfig;
use crate::error::{NotifyError, Result};
use crate::registry::EventPackage;
use crate::sip::{DialogHandle, DialogLayer, NotifyRequest, SubscriptionState};
use crate::store::keys;
use crate::store::{Batch, Criticality, KvStore};
use crate::types::{DialogInfo, EventState, Subscription};
use crate::util::generate_etag;

pub use xml::render_dialog_info;

pub const EVENT_TYPE: &str = "dialog";
pub const CONTENT_TYPE: &str = "application/dialog-info+xml";

/// Token used on the channel for an absent tag
const UNDEF: &str = "undef";

/// Parse one channel line into a dialog snapshot
pub fn parse_dialog_event(line: &str) -> Result<DialogInfo> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let [aor, id, call_id, local_tag, remote_tag, direction, state] = fields.as_slice() else {
        return Err(NotifyError::Internal(format!(
            "dialog event needs 7 fields, got {}: {:?}",
            fields.len(),
            line
        )));
    };

    let tag = |t: &str| (t != UNDEF).then(|| t.to_string());
    Ok(DialogInfo {
        aor: aor.to_string(),
        id: id.to_string(),
        call_id: call_id.to_string(),
        local_tag: tag(*local_tag),
        remote_tag: tag(*remote_tag),
        direction: direction.parse()?,
        state: state.parse()?,
    })
}

/// Outcome of delivering one dialog event to a resource's watchers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOutReport {
    pub notified: usize,
    pub failed: usize,
    pub pruned: usize,
}

/// A dialog subscription record with its version claimed for one NOTIFY
struct ClaimedRecord {
    version: u64,
    dialog_id: String,
    subscription: Subscription,
}

/// The `dialog` event package
pub struct DialogPackage {
    kv: Arc<dyn KvStore>,
    dialogs: Arc<dyn DialogLayer>,
    config: DialogPackageConfig,
}

impl DialogPackage {
    pub fn new(kv: Arc<dyn KvStore>, dialogs: Arc<dyn DialogLayer>, config: DialogPackageConfig) -> Self {
        Self { kv, dialogs, config }
    }

    pub async fn get_dialog_info(&self, aor: &str) -> Result<Option<DialogInfo>> {
        let fields = self.kv.hgetall(&keys::dialog_info(aor)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        DialogInfo::from_fields(aor, &fields).map(Some)
    }

    /// Claim the next document version of a subscription record
    ///
    /// The counter moves exactly once per call. `None` when the record has
    /// expired; nothing is written in that case.
    async fn claim_version(&self, key: &str) -> Result<Option<ClaimedRecord>> {
        let Some(next) = self.kv.hincrby_existing(key, "version", 1).await? else {
            return Ok(None);
        };
        let fields = self.kv.hgetall(key).await?;
        let Some(dialog_id) = fields.get("dialogId").cloned() else {
            return Ok(None);
        };
        Ok(Some(ClaimedRecord {
            version: (next - 1).max(0) as u64,
            dialog_id,
            subscription: Subscription::from_fields(&fields)?,
        }))
    }

    /// Drop `member` from a watched set if its record is still gone
    ///
    /// Returns whether the member was removed.
    async fn prune_member(&self, watched_key: &str, member: &str) -> Result<bool> {
        let batch = Batch::new().guard_absent(member).srem(watched_key, member);
        match self.kv.exec(batch).await {
            Ok(pruned) => Ok(pruned),
            Err(e) => Criticality::BestEffort
                .settle("prune watched-aor member", Err(e))
                .map(|()| false),
        }
    }

    /// Apply one channel line: update the snapshot, then notify every watcher
    pub async fn handle_channel_message(&self, line: &str) -> Result<FanOutReport> {
        let info = parse_dialog_event(line)?;
        let info_key = keys::dialog_info(&info.aor);

        let batch = if info.state.is_terminal() {
            Batch::new().del(&info_key)
        } else {
            Batch::new()
                .del(&info_key)
                .hset_ex(&info_key, info.to_fields(), self.config.info_ttl_secs)
        };
        self.kv.exec(batch).await?;
        debug!("Dialog {} of {} is now {}", info.id, info.aor, info.state);

        let watched_key = keys::watched_aor(&info.aor);
        let mut report = FanOutReport::default();

        for member in self.kv.smembers(&watched_key).await? {
            let claimed = match self.claim_version(&member).await {
                Ok(Some(claimed)) => claimed,
                Ok(None) => {
                    if self.prune_member(&watched_key, &member).await? {
                        debug!("Pruned expired watcher {} of {}", member, info.aor);
                        report.pruned += 1;
                    }
                    continue;
                }
                Err(e) => {
                    warn!("Skipping watcher {} of {}: {}", member, info.aor, e);
                    report.failed += 1;
                    continue;
                }
            };

            match self.notify_watcher(&member, &claimed, &info).await {
                Ok(()) => report.notified += 1,
                Err(e) => {
                    warn!(
                        "NOTIFY to {} for {} failed: {}",
                        claimed.subscription.subscriber, info.aor, e
                    );
                    report.failed += 1;
                }
            }
        }

        info!(
            "Dialog event for {} delivered to {} watchers ({} failed, {} pruned)",
            info.aor, report.notified, report.failed, report.pruned
        );
        Ok(report)
    }

    async fn notify_watcher(&self, key: &str, claimed: &ClaimedRecord, info: &DialogInfo) -> Result<()> {
        let body = render_dialog_info(&info.aor, claimed.version, Some(info))?;
        let remaining = self.kv.ttl(key).await.ok().flatten().map(|secs| secs as u32);
        let notify = NotifyRequest {
            call_id: claimed.subscription.call_id.clone().unwrap_or_default(),
            event: claimed.subscription.event_header(),
            subscription_state: SubscriptionState::Active { expires: remaining },
            content_type: Some(CONTENT_TYPE.to_string()),
            body: Some(body),
        };
        let status = self.dialogs.send_notify(&claimed.dialog_id, notify).await?;
        if !status.is_success() {
            return Err(NotifyError::Transport(format!("NOTIFY answered {}", status)));
        }
        Ok(())
    }

    /// Subscribe to the dialog channel and process messages in order
    ///
    /// Returns once the channel subscription is in place.
    pub async fn start_listener(self: Arc<Self>) -> Result<JoinHandle<()>> {
        let mut messages = self.kv.subscribe(&self.config.channel).await?;
        info!("Dialog package listening on channel {}", self.config.channel);

        Ok(tokio::spawn(async move {
            while let Some(line) = messages.next().await {
                if let Err(e) = self.handle_channel_message(&line).await {
                    warn!("Dropping dialog event {:?}: {}", line, e);
                }
            }
            info!("Dialog channel {} closed", self.config.channel);
        }))
    }
}

#[async_trait]
impl EventPackage for DialogPackage {
    fn event_type(&self) -> &str {
        EVENT_TYPE
    }

    async fn get_event_state(&self, subscriber: &str, resource: &str) -> Result<Option<EventState>> {
        let key = keys::dialog_subscription(subscriber, resource);
        let Some(claimed) = self.claim_version(&key).await? else {
            return Ok(None);
        };
        let info = self.get_dialog_info(resource).await?;
        let content = render_dialog_info(resource, claimed.version, info.as_ref())?;

        Ok(Some(EventState {
            resource: resource.to_string(),
            event: EVENT_TYPE.to_string(),
            etag: claimed.subscription.etag.clone().unwrap_or_default(),
            content_type: CONTENT_TYPE.to_string(),
            content,
            expires: claimed.subscription.expires as u64,
        }))
    }

    async fn add_subscription(
        &self,
        dialog: &DialogHandle,
        subscription: &Subscription,
    ) -> Result<Subscription> {
        let key = keys::dialog_subscription(&subscription.subscriber, &subscription.resource);
        let mut stored = subscription.clone();
        stored.etag = Some(generate_etag());
        if stored.call_id.is_none() {
            stored.call_id = Some(dialog.call_id.clone());
        }

        let mut fields = stored.to_fields();
        fields.push(("dialogId".to_string(), dialog.id.clone()));
        fields.push(("version".to_string(), "0".to_string()));
        if let Some(transport) = &dialog.transport {
            fields.push(("transport".to_string(), transport.clone()));
        }

        let batch = Batch::new()
            .del(&key)
            .hset_ex(&key, fields, stored.expires as u64)
            .sadd(&keys::watched_aor(&stored.resource), &key);
        self.kv.exec(batch).await?;

        debug!("{} now watches dialogs of {}", stored.subscriber, stored.resource);
        Ok(stored)
    }

    async fn remove_subscription(&self, subscription: &Subscription) -> Result<()> {
        let key = keys::dialog_subscription(&subscription.subscriber, &subscription.resource);
        let batch = Batch::new()
            .srem(&keys::watched_aor(&subscription.resource), &key)
            .del(&key);
        self.kv.exec(batch).await?;
        debug!("{} stopped watching dialogs of {}", subscription.subscriber, subscription.resource);
        Ok(())
    }

    async fn find_subscriptions(&self, resource: &str) -> Result<Vec<Subscription>> {
        let watched_key = keys::watched_aor(resource);
        let mut found = Vec::new();
        for member in self.kv.smembers(&watched_key).await? {
            let fields = self.kv.hgetall(&member).await?;
            if fields.is_empty() {
                self.prune_member(&watched_key, &member).await?;
                continue;
            }
            found.push(Subscription::from_fields(&fields)?);
        }
        Ok(found)
    }
}
