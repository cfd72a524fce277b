//! Expiry timers per subscription dialog
//!
//! Each dialog has one slot holding its armed timers, guarded by an async
//! mutex. Whoever holds a dialog's guard is the only party that may cancel,
//! re-arm or fire that dialog's timers; a timer task that wakes up takes
//! the guard too and only acts if its generation is still the armed one.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

use crate::sip::DialogHandle;
use crate::types::Subscription;

/// One armed expiry timer
#[derive(Debug)]
pub struct ArmedTimer {
    pub dialog: DialogHandle,
    pub subscription: Subscription,
    pub(crate) generation: u64,
    pub(crate) handle: JoinHandle<()>,
}

impl ArmedTimer {
    fn cancel(&self) {
        self.handle.abort();
    }
}

/// Timers armed on one dialog, at most one per event type
#[derive(Debug)]
pub struct DialogTimers {
    dialog_id: String,
    entries: Vec<ArmedTimer>,
}

impl DialogTimers {
    fn new(dialog_id: &str) -> Self {
        Self {
            dialog_id: dialog_id.to_string(),
            entries: Vec::new(),
        }
    }

    pub fn dialog_id(&self) -> &str {
        &self.dialog_id
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, event: &str) -> Option<&ArmedTimer> {
        self.entries.iter().find(|t| t.subscription.event == event)
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.entries.iter().map(|t| t.subscription.clone()).collect()
    }

    /// Arm `timer`, cancelling any timer already armed for its event
    pub fn insert(&mut self, timer: ArmedTimer) {
        if let Some(displaced) = self.take(&timer.subscription.event) {
            tracing::warn!(
                "Replacing armed {} timer on dialog {}",
                displaced.subscription.event,
                self.dialog_id
            );
        }
        self.entries.push(timer);
    }

    /// Remove and cancel the timer for `event`
    pub fn take(&mut self, event: &str) -> Option<ArmedTimer> {
        let index = self.entries.iter().position(|t| t.subscription.event == event)?;
        let timer = self.entries.swap_remove(index);
        timer.cancel();
        Some(timer)
    }

    /// Remove the timer for `event` if it is still `generation`
    ///
    /// Used by the firing task itself, so the task is not aborted.
    pub(crate) fn take_fired(&mut self, event: &str, generation: u64) -> Option<ArmedTimer> {
        let index = self
            .entries
            .iter()
            .position(|t| t.subscription.event == event && t.generation == generation)?;
        Some(self.entries.swap_remove(index))
    }
}

/// Exclusive access to one dialog's timers
pub struct DialogGuard {
    slot: Arc<Mutex<DialogTimers>>,
    guard: OwnedMutexGuard<DialogTimers>,
}

impl Deref for DialogGuard {
    type Target = DialogTimers;

    fn deref(&self) -> &DialogTimers {
        &self.guard
    }
}

impl DerefMut for DialogGuard {
    fn deref_mut(&mut self) -> &mut DialogTimers {
        &mut self.guard
    }
}

/// Map from dialog id to that dialog's timers
#[derive(Default)]
pub struct TimerContext {
    dialogs: DashMap<String, Arc<Mutex<DialogTimers>>>,
    next_generation: AtomicU64,
}

impl TimerContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive ownership of `dialog_id`'s timers
    pub async fn lock(&self, dialog_id: &str) -> DialogGuard {
        let slot = self
            .dialogs
            .entry(dialog_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(DialogTimers::new(dialog_id))))
            .clone();
        let guard = Arc::clone(&slot).lock_owned().await;
        DialogGuard { slot, guard }
    }

    /// Give up ownership, dropping the dialog's entry once it has no timers
    pub fn release(&self, guard: DialogGuard) {
        if guard.is_empty() {
            let slot = Arc::clone(&guard.slot);
            self.dialogs
                .remove_if(guard.dialog_id(), |_, current| Arc::ptr_eq(current, &slot));
        }
    }

    pub(crate) fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of dialogs with an entry in the map
    pub fn dialog_count(&self) -> usize {
        self.dialogs.len()
    }

    pub fn contains(&self, dialog_id: &str) -> bool {
        self.dialogs.contains_key(dialog_id)
    }
}
