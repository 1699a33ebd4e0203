//! Recording state coordination
//!
//! The server holds one recording flag per session. Every device polls it on
//! a fixed interval and edge-triggers its local recorder, so all devices
//! converge within one poll interval of a change.

use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::api::ProctorApi;
use crate::capture::MediaCaptureManager;
use crate::context::{DegradedComponent, DeviceEvent};
use crate::error::ProctorError;

/// Result of one poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The flag differs from local state
    Changed(bool),
    Unchanged,
    /// First failure of a degraded episode
    Degraded(String),
    StillDegraded,
}

/// Tracks the last known flag and the degraded episode
pub struct RecordingStatePoller {
    api: Arc<dyn ProctorApi>,
    credential: String,
    local: bool,
    degraded: bool,
}

impl RecordingStatePoller {
    pub fn new(api: Arc<dyn ProctorApi>, credential: String) -> Self {
        Self {
            api,
            credential,
            local: false,
            degraded: false,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Last known recording state; kept through failed polls
    pub fn last_known(&self) -> bool {
        self.local
    }

    pub async fn poll_once(&mut self) -> PollOutcome {
        match self.api.get_recording(&self.credential).await {
            Ok(recording) => {
                if self.degraded {
                    self.degraded = false;
                    info!("[Recording] State polling recovered");
                }
                if recording != self.local {
                    self.local = recording;
                    PollOutcome::Changed(recording)
                } else {
                    PollOutcome::Unchanged
                }
            }
            Err(e) => {
                let e = ProctorError::StatePollFailure(e.to_string());
                if self.degraded {
                    PollOutcome::StillDegraded
                } else {
                    self.degraded = true;
                    warn!("[Recording] {}; keeping last known state ({})", e, self.local);
                    PollOutcome::Degraded(e.to_string())
                }
            }
        }
    }

    /// Record a change this device made itself so the next poll does not
    /// report it again
    pub fn assume(&mut self, recording: bool) {
        self.local = recording;
    }
}

/// Apply a recording edge to the local recorder
pub fn apply_edge(capture: Option<&Arc<MediaCaptureManager>>, recording: bool) {
    if let Some(capture) = capture {
        if recording {
            capture.start_recording();
        } else {
            capture.stop_recording();
        }
    }
}

/// Poll loop. The first poll fires immediately.
pub async fn run_recording_poll(
    poller: Arc<tokio::sync::Mutex<RecordingStatePoller>>,
    capture: Option<Arc<MediaCaptureManager>>,
    state: Arc<watch::Sender<bool>>,
    events: broadcast::Sender<DeviceEvent>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let (outcome, recovered) = {
            let mut poller = poller.lock().await;
            let was_degraded = poller.is_degraded();
            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = poller.poll_once() => outcome,
            };
            (outcome, was_degraded && !poller.is_degraded())
        };
        if recovered {
            let _ = events.send(DeviceEvent::Recovered {
                component: DegradedComponent::RecordingState,
            });
        }

        match outcome {
            PollOutcome::Changed(recording) => {
                info!(
                    "[Recording] Flag changed to {}",
                    if recording { "on" } else { "off" }
                );
                apply_edge(capture.as_ref(), recording);
                state.send_replace(recording);
                let _ = events.send(DeviceEvent::RecordingChanged { recording });
            }
            PollOutcome::Degraded(reason) => {
                let _ = events.send(DeviceEvent::Degraded {
                    component: DegradedComponent::RecordingState,
                    reason,
                });
            }
            PollOutcome::Unchanged | PollOutcome::StillDegraded => {}
        }
    }
}
