//! Media capture and time slicing
//!
//! Each acquired track gets a recorder. While recording is on, a slicer task
//! per recorder cuts the bytes produced since the previous cut into a
//! [`RecordingChunk`] every chunk interval and appends it to the upload queue.
//! Cutting, numbering and enqueueing happen under the recorder lock, so
//! sequences reach the queue in order.

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::CapturePolicy;
use crate::error::{ProctorError, Result};
use crate::upload::UploadQueue;
use crate::types::{locked, now_ms, DeviceRole, RecordingChunk, StreamKind, UploadStatus};

/// A live platform track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
    pub kind: StreamKind,
    pub track_id: String,
}

/// Platform media access
#[async_trait]
pub trait MediaBackend: Send + Sync {
    /// Ask for a track. A refusal is [`ProctorError::PermissionDenied`].
    async fn acquire(&self, kind: StreamKind) -> Result<TrackInfo>;

    /// Encoded bytes produced since the previous call. `None` once the track has ended.
    fn take_slice(&self, kind: StreamKind) -> Option<Bytes>;

    fn release(&self, kind: StreamKind);
}

/// Which tracks a device must acquire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub webcam: bool,
    pub audio: bool,
    pub screen: bool,
}

impl CaptureConstraints {
    /// Primary: camera, microphone and (per policy) screen. Secondary: camera only.
    /// The microphone is mandatory on the primary and no policy drops it.
    pub fn for_role(role: DeviceRole, policy: &CapturePolicy) -> Self {
        match role {
            DeviceRole::Primary => Self {
                webcam: true,
                audio: true,
                screen: policy.require_screen_share,
            },
            DeviceRole::Secondary => Self {
                webcam: true,
                audio: false,
                screen: false,
            },
            DeviceRole::Reviewer => Self {
                webcam: false,
                audio: false,
                screen: false,
            },
        }
    }

    pub fn kinds(&self) -> Vec<StreamKind> {
        let mut kinds = Vec::new();
        if self.webcam {
            kinds.push(StreamKind::Webcam);
        }
        if self.screen {
            kinds.push(StreamKind::Screen);
        }
        if self.audio {
            kinds.push(StreamKind::Audio);
        }
        kinds
    }
}

fn remediation(kind: StreamKind) -> &'static str {
    match kind {
        StreamKind::Webcam => "allow camera access in the browser and reload the interview",
        StreamKind::Audio => "allow microphone access in the browser and reload the interview",
        StreamKind::Screen => "share your entire screen when prompted to continue",
    }
}

struct Recorder {
    kind: StreamKind,
    state: Mutex<RecorderState>,
}

struct RecorderState {
    track_id: String,
    /// Next sequence to assign; never reset within a session
    next_sequence: u64,
    live: bool,
    slicing: bool,
    slice_started: Instant,
    slice_started_at_ms: i64,
}

impl RecorderState {
    fn restart_slice(&mut self) {
        self.slice_started = Instant::now();
        self.slice_started_at_ms = now_ms();
    }
}

pub struct MediaCaptureManager {
    backend: Arc<dyn MediaBackend>,
    session_id: String,
    role: DeviceRole,
    chunk_interval: Duration,
    queue: UploadQueue,
    recorders: Mutex<BTreeMap<StreamKind, Arc<Recorder>>>,
    recording: Mutex<Option<CancellationToken>>,
    slicers: Mutex<Vec<JoinHandle<()>>>,
}

impl MediaCaptureManager {
    pub fn new(
        backend: Arc<dyn MediaBackend>,
        session_id: String,
        role: DeviceRole,
        policy: &CapturePolicy,
        queue: UploadQueue,
    ) -> Self {
        Self {
            backend,
            session_id,
            role,
            chunk_interval: policy.chunk_interval(),
            queue,
            recorders: Mutex::new(BTreeMap::new()),
            recording: Mutex::new(None),
            slicers: Mutex::new(Vec::new()),
        }
    }

    /// Acquire every required track. A partial grant is fatal: tracks already
    /// acquired are released and the first refusal is returned.
    pub async fn request_streams(&self, constraints: CaptureConstraints) -> Result<Vec<TrackInfo>> {
        let mut acquired = Vec::new();
        for kind in constraints.kinds() {
            match self.backend.acquire(kind).await {
                Ok(track) => acquired.push(track),
                Err(e) => {
                    for track in &acquired {
                        self.backend.release(track.kind);
                    }
                    warn!("[Capture] {} acquisition failed: {}", kind, e);
                    return Err(match e {
                        ProctorError::PermissionDenied { .. } => e,
                        other => ProctorError::PermissionDenied {
                            kind,
                            remediation: format!("{} ({})", remediation(kind), other),
                        },
                    });
                }
            }
        }

        let mut recorders = locked(&self.recorders);
        for track in &acquired {
            recorders.insert(
                track.kind,
                Arc::new(Recorder {
                    kind: track.kind,
                    state: Mutex::new(RecorderState {
                        track_id: track.track_id.clone(),
                        next_sequence: 1,
                        live: true,
                        slicing: false,
                        slice_started: Instant::now(),
                        slice_started_at_ms: now_ms(),
                    }),
                }),
            );
        }
        info!(
            "[Capture] {} acquired {} track(s)",
            self.role,
            acquired.len()
        );
        Ok(acquired)
    }

    /// Tracks currently live
    pub fn tracks(&self) -> Vec<TrackInfo> {
        locked(&self.recorders)
            .values()
            .filter_map(|recorder| {
                let state = locked(&recorder.state);
                state.live.then(|| TrackInfo {
                    kind: recorder.kind,
                    track_id: state.track_id.clone(),
                })
            })
            .collect()
    }

    pub fn is_recording(&self) -> bool {
        locked(&self.recording).is_some()
    }

    fn recorder(&self, kind: StreamKind) -> Option<Arc<Recorder>> {
        locked(&self.recorders).get(&kind).cloned()
    }

    /// Cut the current slice of one recorder into a chunk.
    /// Empty slices produce nothing and keep the slice start.
    fn cut(&self, recorder: &Recorder, state: &mut RecorderState) -> bool {
        if !state.slicing || !state.live {
            return false;
        }
        let payload = match self.backend.take_slice(recorder.kind) {
            Some(payload) if !payload.is_empty() => payload,
            _ => return false,
        };
        let chunk = RecordingChunk {
            session_id: self.session_id.clone(),
            device_role: self.role,
            kind: recorder.kind,
            sequence: state.next_sequence,
            started_at_ms: state.slice_started_at_ms,
            duration_ms: state.slice_started.elapsed().as_millis() as u32,
            payload,
            status: UploadStatus::Pending,
        };
        state.next_sequence += 1;
        state.restart_slice();
        debug!(
            "[Capture] {} chunk #{} ({} bytes, {}ms)",
            chunk.kind,
            chunk.sequence,
            chunk.payload.len(),
            chunk.duration_ms
        );
        self.queue.enqueue(chunk);
        true
    }

    /// Begin slicing every live track. No-op if already recording.
    pub fn start_recording(self: &Arc<Self>) {
        let token = {
            let mut recording = locked(&self.recording);
            if recording.is_some() {
                return;
            }
            let token = CancellationToken::new();
            *recording = Some(token.clone());
            token
        };

        let recorders: Vec<_> = locked(&self.recorders).values().cloned().collect();
        let mut slicers = locked(&self.slicers);
        for recorder in recorders {
            {
                let mut state = locked(&recorder.state);
                // Bytes produced while not recording are discarded
                let _ = self.backend.take_slice(recorder.kind);
                state.slicing = true;
                state.restart_slice();
            }
            slicers.push(tokio::spawn(run_slicer(
                Arc::clone(self),
                recorder,
                token.clone(),
            )));
        }
        info!("[Capture] {} recording started", self.role);
    }

    /// Stop slicing and flush a final partial chunk per track.
    /// Returns the number of final chunks flushed.
    pub fn stop_recording(&self) -> usize {
        let Some(token) = locked(&self.recording).take() else {
            return 0;
        };
        token.cancel();

        let recorders: Vec<_> = locked(&self.recorders).values().cloned().collect();
        let mut flushed = 0;
        for recorder in recorders {
            let mut state = locked(&recorder.state);
            if self.cut(&recorder, &mut state) {
                flushed += 1;
            }
            state.slicing = false;
        }
        for slicer in locked(&self.slicers).drain(..) {
            slicer.abort();
        }
        info!(
            "[Capture] {} recording stopped ({} final chunk(s))",
            self.role, flushed
        );
        flushed
    }

    /// Mark a track as ended by the platform. Whatever it produced is flushed
    /// first. Returns false if the track was not live.
    pub fn track_ended(&self, kind: StreamKind) -> bool {
        let Some(recorder) = self.recorder(kind) else {
            return false;
        };
        let mut state = locked(&recorder.state);
        if !state.live {
            return false;
        }
        self.cut(&recorder, &mut state);
        state.live = false;
        warn!("[Capture] {} track ended", kind);
        true
    }

    /// Re-acquire an ended track. Sequence numbering continues where it stopped.
    /// A track that is still live is a [`ProctorError::Conflict`].
    pub async fn restore_track(&self, kind: StreamKind) -> Result<TrackInfo> {
        let recorder = self
            .recorder(kind)
            .ok_or_else(|| ProctorError::InvalidInput(format!("no {} track to restore", kind)))?;
        if locked(&recorder.state).live {
            return Err(ProctorError::Conflict(format!("{} track is still live", kind)));
        }
        let track = self.backend.acquire(kind).await?;

        let mut state = locked(&recorder.state);
        let _ = self.backend.take_slice(kind);
        state.track_id = track.track_id.clone();
        state.live = true;
        state.restart_slice();
        info!(
            "[Capture] {} track restored, continuing at #{}",
            kind, state.next_sequence
        );
        Ok(track)
    }

    /// Release every platform track
    pub fn release(&self) {
        self.stop_recording();
        let mut recorders = locked(&self.recorders);
        for kind in recorders.keys() {
            self.backend.release(*kind);
        }
        recorders.clear();
        debug!("[Capture] {} media released", self.role);
    }
}

async fn run_slicer(
    manager: Arc<MediaCaptureManager>,
    recorder: Arc<Recorder>,
    cancel: CancellationToken,
) {
    let period = manager.chunk_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let mut state = locked(&recorder.state);
                manager.cut(&recorder, &mut state);
            }
        }
    }
}
