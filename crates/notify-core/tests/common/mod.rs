//! Shared test doubles for the notify-core integration tests
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use notify_core::store::{Batch, MessageStream};
use notify_core::{
    DialogHandle, DialogLayer, KvStore, MemoryStore, NotifyError, NotifyRequest, Result, SipRequest,
    StatusCode,
};

/// A response the engine sent for a request
#[derive(Debug, Clone)]
pub struct SentResponse {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
}

impl SentResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// [`DialogLayer`] that records everything it is asked to do
#[derive(Default)]
pub struct RecordingDialogs {
    created: Mutex<Vec<(DialogHandle, Vec<(String, String)>)>>,
    responses: Mutex<Vec<SentResponse>>,
    notifies: Mutex<Vec<(String, NotifyRequest)>>,
    fail_create: AtomicBool,
    failing_dialogs: Mutex<HashSet<String>>,
    next_id: AtomicUsize,
}

impl RecordingDialogs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_dialog_creation(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    /// Answer NOTIFYs on `dialog_id` with 408
    pub fn fail_notifies_on(&self, dialog_id: &str) {
        self.failing_dialogs.lock().insert(dialog_id.to_string());
    }

    /// Dialogs created so far, with the headers of the 2xx
    pub fn created(&self) -> Vec<(DialogHandle, Vec<(String, String)>)> {
        self.created.lock().clone()
    }

    pub fn responses(&self) -> Vec<SentResponse> {
        self.responses.lock().clone()
    }

    pub fn statuses(&self) -> Vec<u16> {
        self.responses.lock().iter().map(|r| r.status.as_u16()).collect()
    }

    pub fn notifies(&self) -> Vec<(String, NotifyRequest)> {
        self.notifies.lock().clone()
    }

    pub fn notifies_on(&self, dialog_id: &str) -> Vec<NotifyRequest> {
        self.notifies
            .lock()
            .iter()
            .filter(|(id, _)| id == dialog_id)
            .map(|(_, n)| n.clone())
            .collect()
    }
}

#[async_trait]
impl DialogLayer for RecordingDialogs {
    async fn create_dialog(&self, request: &SipRequest, headers: Vec<(String, String)>) -> Result<DialogHandle> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(NotifyError::Transport("no route to subscriber".into()));
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = DialogHandle {
            id: format!("dlg-{}", n),
            call_id: request.call_id().unwrap_or_default().to_string(),
            local_tag: Some(format!("lt-{}", n)),
            remote_tag: Some("1".to_string()),
            transport: Some("udp".to_string()),
        };
        self.created.lock().push((handle.clone(), headers));
        Ok(handle)
    }

    async fn respond(&self, _request: &SipRequest, status: StatusCode, headers: Vec<(String, String)>) -> Result<()> {
        self.responses.lock().push(SentResponse { status, headers });
        Ok(())
    }

    async fn send_notify(&self, dialog_id: &str, notify: NotifyRequest) -> Result<StatusCode> {
        self.notifies.lock().push((dialog_id.to_string(), notify));
        if self.failing_dialogs.lock().contains(dialog_id) {
            return Ok(StatusCode(408));
        }
        Ok(StatusCode::OK)
    }
}

/// [`MemoryStore`] wrapper that counts writes and can be told to fail
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    writes: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Batches executed so far, failed ones included
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_read(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(NotifyError::Store("connection reset".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for FlakyStore {
    async fn exec(&self, batch: Batch) -> Result<bool> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(NotifyError::Store("READONLY replica".into()));
        }
        self.inner.exec(batch).await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        self.check_read()?;
        self.inner.hgetall(key).await
    }

    async fn hincrby_existing(&self, key: &str, field: &str, by: i64) -> Result<Option<i64>> {
        self.check_read()?;
        self.inner.hincrby_existing(key, field, by).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_read()?;
        self.inner.get(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check_read()?;
        self.inner.exists(key).await
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>> {
        self.check_read()?;
        self.inner.ttl(key).await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.check_read()?;
        self.inner.smembers(key).await
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>> {
        self.check_read()?;
        self.inner.zrange_by_score(key, min, max).await
    }

    async fn zrange_with_scores(&self, key: &str) -> Result<Vec<(String, f64)>> {
        self.check_read()?;
        self.inner.zrange_with_scores(key).await
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.check_read()?;
        self.inner.keys(pattern).await
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<usize> {
        self.inner.publish(channel, message).await
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream> {
        self.inner.subscribe(channel).await
    }
}

/// Point in a store call where a [`HookStore`] lets another writer in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// After a set's members were read
    AfterSmembers,
    /// After `exists` reported a key as absent
    AfterExistsFalse,
    /// After an existing-only increment found no key
    AfterHincrbyMissing,
}

/// [`MemoryStore`] wrapper that applies a queued batch right after a given
/// call returns, standing in for a concurrent writer
#[derive(Default)]
pub struct HookStore {
    inner: MemoryStore,
    hooks: Mutex<HashMap<HookPoint, Batch>>,
}

impl HookStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Apply `batch` once, the next time `point` is reached
    pub fn on(&self, point: HookPoint, batch: Batch) {
        self.hooks.lock().insert(point, batch);
    }

    async fn fire(&self, point: HookPoint) {
        let batch = self.hooks.lock().remove(&point);
        if let Some(batch) = batch {
            assert!(self.inner.exec(batch).await.unwrap(), "hook batch for {:?} not applied", point);
        }
    }
}

#[async_trait]
impl KvStore for HookStore {
    async fn exec(&self, batch: Batch) -> Result<bool> {
        self.inner.exec(batch).await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        self.inner.hgetall(key).await
    }

    async fn hincrby_existing(&self, key: &str, field: &str, by: i64) -> Result<Option<i64>> {
        let value = self.inner.hincrby_existing(key, field, by).await?;
        if value.is_none() {
            self.fire(HookPoint::AfterHincrbyMissing).await;
        }
        Ok(value)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let exists = self.inner.exists(key).await?;
        if !exists {
            self.fire(HookPoint::AfterExistsFalse).await;
        }
        Ok(exists)
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>> {
        self.inner.ttl(key).await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let members = self.inner.smembers(key).await?;
        self.fire(HookPoint::AfterSmembers).await;
        Ok(members)
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>> {
        self.inner.zrange_by_score(key, min, max).await
    }

    async fn zrange_with_scores(&self, key: &str) -> Result<Vec<(String, f64)>> {
        self.inner.zrange_with_scores(key).await
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.inner.keys(pattern).await
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<usize> {
        self.inner.publish(channel, message).await
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream> {
        self.inner.subscribe(channel).await
    }
}

/// A SUBSCRIBE from bob@example.com to alice@example.com
pub fn subscribe(event: Option<&str>, expires: Option<u32>) -> SipRequest {
    let mut request = SipRequest::subscribe("sip:alice@example.com")
        .with_header("From", "\"Bob\" <sip:bob@example.com>;tag=1")
        .with_header("To", "<sip:alice@example.com>")
        .with_header("Call-ID", "call-1@bob.example.com");
    if let Some(event) = event {
        request = request.with_header("Event", event);
    }
    if let Some(expires) = expires {
        request = request.with_header("Expires", expires.to_string());
    }
    request
}
