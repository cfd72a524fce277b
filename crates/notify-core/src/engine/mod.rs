//! Subscription lifecycle engine
//!
//! Drives each (dialog, event type) pair through `NONE -> ACTIVE -> TERMINATED`:
//!
//! - an out-of-dialog SUBSCRIBE establishes the dialog, stores the
//!   subscription, arms the expiry timer and sends the first NOTIFY
//! - an in-dialog SUBSCRIBE with a non-zero Expires refreshes it
//! - an in-dialog SUBSCRIBE with `Expires: 0`, or the timer firing,
//!   terminates it
//!
//! All of these run while holding the dialog's guard from [`TimerContext`],
//! so a refresh and an expiry of the same dialog never interleave.

pub mod timers;

use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::error::{NotifyError, Result};
use crate::sip::{DialogHandle, DialogLayer, NotifyRequest, SipRequest, StatusCode, SubscriptionState};
use crate::store::{Criticality, StateStore};
use crate::types::Subscription;
use crate::util::{aor_from_uri, parse_event_header};

pub use timers::{ArmedTimer, DialogGuard, DialogTimers, TimerContext};

/// Termination reason when the subscription could not be stored
const REASON_NORESOURCE: &str = "noresource";
/// Termination reason when the expiry timer fired
const REASON_TIMEOUT: &str = "timeout";

/// How a SUBSCRIBE was answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOutcome {
    pub status: StatusCode,
    /// Granted lifetime, when the request was accepted
    pub expires: Option<u32>,
}

impl SubscribeOutcome {
    fn accepted(status: StatusCode, expires: u32) -> Self {
        Self {
            status,
            expires: Some(expires),
        }
    }

    fn rejected(status: StatusCode) -> Self {
        Self { status, expires: None }
    }
}

/// SUBSCRIBE handling and expiry timers
pub struct SubscriptionEngine {
    this: Weak<SubscriptionEngine>,
    config: Arc<AgentConfig>,
    store: Arc<StateStore>,
    dialogs: Arc<dyn DialogLayer>,
    timers: TimerContext,
}

impl SubscriptionEngine {
    pub fn new(config: Arc<AgentConfig>, store: Arc<StateStore>, dialogs: Arc<dyn DialogLayer>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            config,
            store,
            dialogs,
            timers: TimerContext::new(),
        })
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Handle one inbound SUBSCRIBE, sending whatever responses and
    /// NOTIFYs it calls for
    pub async fn handle_subscribe(&self, request: &SipRequest) -> SubscribeOutcome {
        let subscription = match self.validate(request) {
            Ok(subscription) => subscription,
            Err(e) => {
                let status = e.status_code();
                debug!("Rejecting SUBSCRIBE with {}: {}", status, e);
                self.respond(request, status, Vec::new()).await;
                return SubscribeOutcome::rejected(status);
            }
        };

        match (request.dialog_id.as_deref(), subscription.expires) {
            (None, 0) => {
                debug!(
                    "Out-of-dialog unsubscribe from {} for {}, nothing to do",
                    subscription.subscriber, subscription.resource
                );
                self.respond(request, StatusCode::OK, Vec::new()).await;
                SubscribeOutcome::accepted(StatusCode::OK, 0)
            }
            (None, _) => self.admit(request, subscription).await,
            (Some(dialog_id), 0) => self.unsubscribe(request, dialog_id, subscription).await,
            (Some(dialog_id), _) => self.refresh(request, dialog_id, subscription).await,
        }
    }

    /// Subscriptions with an armed timer on `dialog_id`
    pub async fn armed_timers(&self, dialog_id: &str) -> Vec<Subscription> {
        let guard = self.timers.lock(dialog_id).await;
        let armed = guard.subscriptions();
        self.timers.release(guard);
        armed
    }

    /// Number of dialogs holding at least one armed timer
    pub fn active_dialogs(&self) -> usize {
        self.timers.dialog_count()
    }

    fn validate(&self, request: &SipRequest) -> Result<Subscription> {
        let event_header = request
            .event()
            .ok_or_else(|| NotifyError::validation(StatusCode::BAD_REQUEST, "missing Event header"))?;
        let (event, id) = parse_event_header(event_header)?;
        if !self.config.is_supported(&event) {
            return Err(NotifyError::validation(
                StatusCode::BAD_EVENT,
                format!("event package {} is not supported", event),
            ));
        }

        let domain = self.config.domain.as_deref();
        let subscriber = aor_from_uri(&request.from_uri()?, domain)?;
        let resource = aor_from_uri(&request.to_uri()?, domain)?;
        let call_id = request
            .call_id()
            .ok_or_else(|| NotifyError::validation(StatusCode::BAD_REQUEST, "missing Call-ID header"))?;

        let expires = request
            .expires()
            .unwrap_or_else(|| self.config.default_expires_for(&event));

        Ok(Subscription::new(subscriber, resource, event, expires)
            .with_id(id)
            .with_call_id(call_id)
            .with_accept(request.accept().map(str::to_string)))
    }

    async fn admit(&self, request: &SipRequest, subscription: Subscription) -> SubscribeOutcome {
        let expires = subscription.expires;
        let dialog = match self.dialogs.create_dialog(request, expires_header(expires)).await {
            Ok(dialog) => dialog,
            Err(e) => {
                error!(
                    "Failed to establish {} dialog {} -> {}: {}",
                    subscription.event, subscription.subscriber, subscription.resource, e
                );
                self.respond(request, StatusCode::TEMPORARILY_UNAVAILABLE, Vec::new())
                    .await;
                return SubscribeOutcome::rejected(StatusCode::TEMPORARILY_UNAVAILABLE);
            }
        };

        let mut guard = self.timers.lock(&dialog.id).await;
        let stored = match self.store.add_subscription(&dialog, &subscription).await {
            Ok(stored) => stored,
            Err(e) => {
                error!(
                    "Failed to store {} subscription on dialog {}: {}",
                    subscription.event, dialog.id, e
                );
                self.notify_terminated(&dialog, &subscription, Some(REASON_NORESOURCE))
                    .await;
                self.timers.release(guard);
                return SubscribeOutcome::rejected(StatusCode::TEMPORARILY_UNAVAILABLE);
            }
        };

        self.arm(&mut guard, dialog.clone(), stored.clone());
        info!(
            "{} subscribed to {} of {} for {}s on dialog {}",
            stored.subscriber, stored.event, stored.resource, expires, dialog.id
        );
        self.notify_active(&dialog, &stored).await;
        self.timers.release(guard);

        SubscribeOutcome::accepted(StatusCode::OK, expires)
    }

    async fn refresh(&self, request: &SipRequest, dialog_id: &str, subscription: Subscription) -> SubscribeOutcome {
        let expires = subscription.expires;
        let mut guard = self.timers.lock(dialog_id).await;
        let Some(previous) = guard.take(&subscription.event) else {
            self.timers.release(guard);
            return self.no_such_subscription(request, dialog_id, &subscription.event).await;
        };

        let _ = self
            .store
            .remove_subscription(&previous.subscription, Criticality::BestEffort)
            .await;

        let dialog = previous.dialog;
        let stored = match self.store.add_subscription(&dialog, &subscription).await {
            Ok(stored) => stored,
            Err(e) => {
                error!(
                    "Failed to store refreshed {} subscription on dialog {}: {}",
                    subscription.event, dialog_id, e
                );
                self.respond(request, StatusCode::TEMPORARILY_UNAVAILABLE, Vec::new())
                    .await;
                self.notify_terminated(&dialog, &subscription, Some(REASON_NORESOURCE))
                    .await;
                self.timers.release(guard);
                return SubscribeOutcome::rejected(StatusCode::TEMPORARILY_UNAVAILABLE);
            }
        };

        self.arm(&mut guard, dialog.clone(), stored.clone());
        debug!("Refreshed {} subscription on dialog {} for {}s", stored.event, dialog_id, expires);
        self.respond(request, StatusCode::ACCEPTED, expires_header(expires)).await;
        self.notify_active(&dialog, &stored).await;
        self.timers.release(guard);

        SubscribeOutcome::accepted(StatusCode::ACCEPTED, expires)
    }

    async fn unsubscribe(&self, request: &SipRequest, dialog_id: &str, subscription: Subscription) -> SubscribeOutcome {
        let mut guard = self.timers.lock(dialog_id).await;
        let Some(armed) = guard.take(&subscription.event) else {
            self.timers.release(guard);
            return self.no_such_subscription(request, dialog_id, &subscription.event).await;
        };

        self.respond(request, StatusCode::OK, expires_header(0)).await;
        info!(
            "{} unsubscribed from {} of {}",
            armed.subscription.subscriber, armed.subscription.event, armed.subscription.resource
        );
        self.terminate(&armed, None).await;
        self.timers.release(guard);

        SubscribeOutcome::accepted(StatusCode::OK, 0)
    }

    async fn no_such_subscription(&self, request: &SipRequest, dialog_id: &str, event: &str) -> SubscribeOutcome {
        debug!("No {} subscription on dialog {}", event, dialog_id);
        self.respond(request, StatusCode::CALL_DOES_NOT_EXIST, Vec::new()).await;
        SubscribeOutcome::rejected(StatusCode::CALL_DOES_NOT_EXIST)
    }

    /// Arm the expiry timer for `subscription`, replacing any armed one
    fn arm(&self, guard: &mut DialogGuard, dialog: DialogHandle, subscription: Subscription) {
        let generation = self.timers.next_generation();
        let engine = self.this.clone();
        let dialog_id = dialog.id.clone();
        let event = subscription.event.clone();
        let lifetime = Duration::from_secs(u64::from(subscription.expires));

        let handle = tokio::spawn(async move {
            tokio::time::sleep(lifetime).await;
            if let Some(engine) = engine.upgrade() {
                engine.expire(&dialog_id, &event, generation).await;
            }
        });

        guard.insert(ArmedTimer {
            dialog,
            subscription,
            generation,
            handle,
        });
    }

    async fn expire(&self, dialog_id: &str, event: &str, generation: u64) {
        let mut guard = self.timers.lock(dialog_id).await;
        // a refresh or unsubscribe got the guard first
        let Some(fired) = guard.take_fired(event, generation) else {
            self.timers.release(guard);
            return;
        };

        info!(
            "{} subscription {} -> {} expired on dialog {}",
            event, fired.subscription.subscriber, fired.subscription.resource, dialog_id
        );
        self.terminate(&fired, Some(REASON_TIMEOUT)).await;
        self.timers.release(guard);
    }

    async fn terminate(&self, armed: &ArmedTimer, reason: Option<&str>) {
        self.notify_terminated(&armed.dialog, &armed.subscription, reason)
            .await;
        // the store TTL has usually removed the record already
        let _ = self
            .store
            .remove_subscription(&armed.subscription, Criticality::BestEffort)
            .await;
    }

    async fn notify_active(&self, dialog: &DialogHandle, subscription: &Subscription) {
        let state = match self
            .store
            .get_event_state(&subscription.subscriber, &subscription.resource, &subscription.event)
            .await
        {
            Ok(state) => state,
            Err(e) => {
                warn!(
                    "Sending {} NOTIFY for {} without state: {}",
                    subscription.event, subscription.resource, e
                );
                None
            }
        };

        let (content_type, body) = match state {
            Some(state) => (Some(state.content_type), Some(state.content)),
            None => (None, None),
        };
        let notify = NotifyRequest {
            call_id: dialog.call_id.clone(),
            event: subscription.event_header(),
            subscription_state: SubscriptionState::Active {
                expires: Some(subscription.expires),
            },
            content_type,
            body,
        };
        self.send_notify(dialog, notify).await;
    }

    async fn notify_terminated(&self, dialog: &DialogHandle, subscription: &Subscription, reason: Option<&str>) {
        let notify = NotifyRequest {
            call_id: dialog.call_id.clone(),
            event: subscription.event_header(),
            subscription_state: SubscriptionState::Terminated {
                reason: reason.map(str::to_string),
            },
            content_type: None,
            body: None,
        };
        self.send_notify(dialog, notify).await;
    }

    async fn send_notify(&self, dialog: &DialogHandle, notify: NotifyRequest) {
        let state = notify.subscription_state.to_string();
        match self.dialogs.send_notify(&dialog.id, notify).await {
            Ok(status) if status.is_success() => {
                debug!("NOTIFY ({}) on dialog {} answered {}", state, dialog.id, status)
            }
            Ok(status) => warn!("NOTIFY ({}) on dialog {} answered {}", state, dialog.id, status),
            Err(e) => warn!("NOTIFY ({}) on dialog {} failed: {}", state, dialog.id, e),
        }
    }

    async fn respond(&self, request: &SipRequest, status: StatusCode, headers: Vec<(String, String)>) {
        if let Err(e) = self.dialogs.respond(request, status, headers).await {
            warn!("Failed to send {} for SUBSCRIBE: {}", status, e);
        }
    }
}

fn expires_header(expires: u32) -> Vec<(String, String)> {
    vec![("Expires".to_string(), expires.to_string())]
}
