//! Chunk upload pipeline
//!
//! Capture appends chunks to an [`UploadQueue`]; one [`ChunkUploader`] task per
//! device drains it in order. The head chunk only leaves the queue once it is
//! delivered or recorded in the [`DataLossLedger`], so nothing disappears
//! silently.

use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify};
use tokio_util::sync::CancellationToken;

use crate::api::ProctorApi;
use crate::config::UploadPolicy;
use crate::context::DeviceEvent;
use crate::error::ProctorError;
use crate::types::{locked, now_ms, DataLossRisk, RecordingChunk, UploadStatus};

/// Exponential backoff for the given attempt (1-based), capped at the policy maximum
pub fn backoff_delay(policy: &UploadPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let delay = policy
        .base_backoff_ms
        .saturating_mul(1u64 << exponent)
        .min(policy.max_backoff_ms);
    Duration::from_millis(delay)
}

/// Ordered buffer of chunks waiting for delivery
#[derive(Clone)]
pub struct UploadQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    chunks: Mutex<VecDeque<RecordingChunk>>,
    notify: Notify,
    pending: watch::Sender<usize>,
    uploaded: AtomicU64,
}

impl Default for UploadQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                chunks: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                pending: watch::channel(0).0,
                uploaded: AtomicU64::new(0),
            }),
        }
    }

    pub fn enqueue(&self, chunk: RecordingChunk) {
        let mut chunks = locked(&self.inner.chunks);
        chunks.push_back(chunk);
        self.inner.pending.send_replace(chunks.len());
        drop(chunks);
        self.inner.notify.notify_one();
    }

    /// Chunks not yet delivered or written off, including the one in flight
    pub fn pending(&self) -> usize {
        *self.inner.pending.borrow()
    }

    /// Chunks acknowledged by the server so far
    pub fn uploaded(&self) -> u64 {
        self.inner.uploaded.load(Ordering::SeqCst)
    }

    fn front(&self) -> Option<RecordingChunk> {
        locked(&self.inner.chunks).front().cloned()
    }

    fn pop_front(&self, delivered: bool) {
        let mut chunks = locked(&self.inner.chunks);
        chunks.pop_front();
        if delivered {
            self.inner.uploaded.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.pending.send_replace(chunks.len());
    }

    async fn wait_for_work(&self) {
        self.inner.notify.notified().await
    }

    /// Wait until every queued chunk is delivered or written off.
    /// Returns false if the timeout elapsed first.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let mut pending = self.inner.pending.subscribe();
        let drained = matches!(
            tokio::time::timeout(timeout, pending.wait_for(|n| *n == 0)).await,
            Ok(Ok(_))
        );
        drained
    }

    /// Remove everything still queued
    pub fn take_all(&self) -> Vec<RecordingChunk> {
        let mut chunks = locked(&self.inner.chunks);
        let taken: Vec<_> = chunks.drain(..).collect();
        self.inner.pending.send_replace(0);
        taken
    }
}

/// Local record of chunks that could not be delivered, mirrored to the server
/// when it is reachable
#[derive(Clone)]
pub struct DataLossLedger {
    api: Arc<dyn ProctorApi>,
    credential: String,
    events: broadcast::Sender<DeviceEvent>,
    entries: Arc<Mutex<Vec<DataLossRisk>>>,
}

impl DataLossLedger {
    pub fn new(
        api: Arc<dyn ProctorApi>,
        credential: String,
        events: broadcast::Sender<DeviceEvent>,
    ) -> Self {
        Self {
            api,
            credential,
            events,
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn record(&self, chunk: &RecordingChunk, reason: impl Into<String>) {
        let risk = DataLossRisk {
            session_id: chunk.session_id.clone(),
            device_role: chunk.device_role,
            kind: chunk.kind,
            sequence: chunk.sequence,
            reason: reason.into(),
            recorded_at_ms: now_ms(),
        };
        warn!(
            "[Upload] Data loss risk for {} chunk #{}: {}",
            risk.kind, risk.sequence, risk.reason
        );
        locked(&self.entries).push(risk.clone());
        let _ = self.events.send(DeviceEvent::DataLoss(risk.clone()));
        if let Err(e) = self.api.report_data_loss(&self.credential, &risk).await {
            debug!("[Upload] Could not report data loss to server: {}", e);
        }
    }

    pub fn entries(&self) -> Vec<DataLossRisk> {
        locked(&self.entries).clone()
    }
}

enum Delivery {
    Delivered,
    Lost(ProctorError),
    Cancelled,
}

/// Background worker that drains an [`UploadQueue`]
pub struct ChunkUploader {
    api: Arc<dyn ProctorApi>,
    credential: String,
    queue: UploadQueue,
    policy: UploadPolicy,
    ledger: DataLossLedger,
    events: broadcast::Sender<DeviceEvent>,
}

impl ChunkUploader {
    pub fn new(
        api: Arc<dyn ProctorApi>,
        credential: String,
        queue: UploadQueue,
        policy: UploadPolicy,
        ledger: DataLossLedger,
        events: broadcast::Sender<DeviceEvent>,
    ) -> Self {
        Self {
            api,
            credential,
            queue,
            policy,
            ledger,
            events,
        }
    }

    /// Deliver chunks until cancelled. A chunk in flight at cancellation stays
    /// queued for the caller to write off.
    pub async fn run(self, cancel: CancellationToken) {
        let mut offline = false;
        loop {
            let mut chunk = match self.queue.front() {
                Some(chunk) => chunk,
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.queue.wait_for_work() => {}
                    }
                    continue;
                }
            };

            match self.deliver(&chunk, &mut offline, &cancel).await {
                Delivery::Delivered => {
                    chunk.status = UploadStatus::Uploaded;
                    debug!(
                        "[Upload] {} chunk #{} delivered ({} bytes)",
                        chunk.kind,
                        chunk.sequence,
                        chunk.payload.len()
                    );
                    self.queue.pop_front(true);
                }
                Delivery::Lost(reason) => {
                    chunk.status = UploadStatus::Lost;
                    self.ledger.record(&chunk, reason.to_string()).await;
                    self.queue.pop_front(false);
                }
                Delivery::Cancelled => break,
            }
        }
        debug!("[Upload] Worker stopped with {} chunk(s) pending", self.queue.pending());
    }

    async fn deliver(
        &self,
        chunk: &RecordingChunk,
        offline: &mut bool,
        cancel: &CancellationToken,
    ) -> Delivery {
        let mut failures = 0u32;
        let mut offline_attempts = 0u32;

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return Delivery::Cancelled,
                result = self.api.upload_chunk(&self.credential, chunk) => result,
            };

            let delay = match result {
                Ok(ack) => {
                    if *offline {
                        *offline = false;
                        info!("[Upload] Server reachable again, flushing buffered chunks");
                        let _ = self.events.send(DeviceEvent::UploadOnline);
                    }
                    if ack.is_delivered() {
                        return Delivery::Delivered;
                    }
                    return Delivery::Lost(ProctorError::UploadFailure(
                        "rejected by server".to_string(),
                    ));
                }
                Err(e) if e.is_offline() => {
                    if !*offline {
                        *offline = true;
                        warn!("[Upload] Server unreachable, buffering chunks: {}", e);
                        let _ = self.events.send(DeviceEvent::UploadOffline);
                    }
                    offline_attempts = offline_attempts.saturating_add(1);
                    backoff_delay(&self.policy, offline_attempts)
                }
                Err(e) => {
                    failures += 1;
                    if failures >= self.policy.max_attempts {
                        return Delivery::Lost(ProctorError::UploadFailure(format!(
                            "gave up after {} attempts: {}",
                            failures, e
                        )));
                    }
                    let delay = backoff_delay(&self.policy, failures);
                    warn!(
                        "[Upload] {} chunk #{} attempt {} failed: {}; retrying in {}ms",
                        chunk.kind,
                        chunk.sequence,
                        failures,
                        e,
                        delay.as_millis()
                    );
                    delay
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => return Delivery::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
