//! Violation detection
//!
//! Raw platform signals go through a [`ViolationClassifier`], which keeps the
//! condition state needed to emit one violation per entry into a violating
//! condition. The [`ViolationEngine`] stamps and logs what the classifier
//! emits, pushes it to the device event channel and hands it to a reporter
//! task, so detection never waits on the network.

use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use crate::api::ProctorApi;
use crate::config::{UploadPolicy, ViolationPolicy};
use crate::context::DeviceEvent;
use crate::types::{locked, now_ms, DeviceRole, Severity, StreamKind, Violation, ViolationType};
use crate::upload::backoff_delay;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipboardAction {
    Copy,
    Cut,
    Paste,
}

/// Raw signal from the platform or from another component
#[derive(Debug, Clone, PartialEq)]
pub enum PlatformSignal {
    VisibilityChanged { hidden: bool },
    FocusChanged { focused: bool },
    FullscreenChanged { fullscreen: bool },
    DevtoolsAttempt,
    Clipboard(ClipboardAction),
    ContextMenu,
    /// Any keyboard or pointer input
    UserActivity,
    FaceCount(u32),
    /// Smoothed gaze score from the analysis loop
    Gaze(f64),
    TrackEnded(StreamKind),
    TrackRestored(StreamKind),
    LockdownUnresolved { attempts: u32 },
    CaptureTerminated { kind: StreamKind },
}

/// Classifier output before stamping
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub violation_type: ViolationType,
    pub severity: Severity,
    pub message: String,
}

impl Detection {
    fn new(violation_type: ViolationType, message: impl Into<String>) -> Self {
        Self {
            violation_type,
            severity: violation_type.default_severity(),
            message: message.into(),
        }
    }

    fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

/// Transition-based classifier
pub struct ViolationClassifier {
    policy: ViolationPolicy,
    hidden: bool,
    focused: bool,
    fullscreen: bool,
    blur_count: u32,
    multiple_faces: bool,
    empty_ticks: u32,
    looking_away: bool,
    idle: bool,
    last_activity: Instant,
    ended_tracks: HashSet<StreamKind>,
}

impl ViolationClassifier {
    pub fn new(policy: ViolationPolicy) -> Self {
        Self {
            policy,
            hidden: false,
            focused: true,
            fullscreen: false,
            blur_count: 0,
            multiple_faces: false,
            empty_ticks: 0,
            looking_away: false,
            idle: false,
            last_activity: Instant::now(),
            ended_tracks: HashSet::new(),
        }
    }

    pub fn classify(&mut self, signal: &PlatformSignal, now: Instant) -> Option<Detection> {
        match *signal {
            PlatformSignal::VisibilityChanged { hidden } => {
                let entered = hidden && !self.hidden;
                self.hidden = hidden;
                entered.then(|| Detection::new(ViolationType::TabSwitch, "Interview tab was hidden"))
            }
            PlatformSignal::FocusChanged { focused } => {
                let entered = !focused && self.focused;
                self.focused = focused;
                if !entered {
                    return None;
                }
                self.blur_count += 1;
                let detection = Detection::new(
                    ViolationType::WindowBlur,
                    format!("Interview window lost focus ({} time(s))", self.blur_count),
                );
                Some(if self.blur_count >= self.policy.blur_escalation_threshold {
                    detection.with_severity(Severity::Critical)
                } else {
                    detection
                })
            }
            PlatformSignal::FullscreenChanged { fullscreen } => {
                let exited = !fullscreen && self.fullscreen;
                self.fullscreen = fullscreen;
                exited.then(|| {
                    Detection::new(ViolationType::FullscreenExit, "Fullscreen mode was exited")
                })
            }
            PlatformSignal::DevtoolsAttempt => Some(Detection::new(
                ViolationType::DevtoolsAttempt,
                "Developer tools shortcut pressed",
            )),
            PlatformSignal::Clipboard(action) => Some(match action {
                ClipboardAction::Copy => {
                    Detection::new(ViolationType::CopyAttempt, "Copy attempt blocked")
                }
                ClipboardAction::Cut => {
                    Detection::new(ViolationType::CutAttempt, "Cut attempt blocked")
                }
                ClipboardAction::Paste => {
                    Detection::new(ViolationType::PasteAttempt, "Paste attempt blocked")
                }
            }),
            PlatformSignal::ContextMenu => Some(Detection::new(
                ViolationType::ContextMenuAttempt,
                "Context menu blocked",
            )),
            PlatformSignal::UserActivity => {
                self.last_activity = now;
                self.idle = false;
                None
            }
            PlatformSignal::FaceCount(count) => self.classify_faces(count),
            PlatformSignal::Gaze(score) => {
                let away = score < self.policy.gaze_threshold;
                let entered = away && !self.looking_away;
                self.looking_away = away;
                entered.then(|| {
                    Detection::new(
                        ViolationType::LookingAway,
                        format!("Candidate looking away from screen (gaze {:.2})", score),
                    )
                })
            }
            PlatformSignal::TrackEnded(kind) => {
                if !self.ended_tracks.insert(kind) {
                    return None;
                }
                let detection = Detection::new(
                    ViolationType::TrackEnded,
                    format!("{} track ended", kind),
                );
                Some(if kind.is_video() {
                    detection
                } else {
                    detection.with_severity(Severity::Warning)
                })
            }
            PlatformSignal::TrackRestored(kind) => {
                self.ended_tracks.remove(&kind);
                None
            }
            PlatformSignal::LockdownUnresolved { attempts } => Some(Detection::new(
                ViolationType::LockdownUnresolved,
                format!(
                    "Lockdown could not be restored after {} recovery attempt(s)",
                    attempts
                ),
            )),
            PlatformSignal::CaptureTerminated { kind } => Some(Detection::new(
                ViolationType::CaptureTerminated,
                format!("Session terminated: {} track was not restored in time", kind),
            )),
        }
    }

    /// Zero counts never reset the multiple-face condition; they only feed
    /// the face-absent run.
    fn classify_faces(&mut self, count: u32) -> Option<Detection> {
        if count == 0 {
            self.empty_ticks += 1;
            return (self.empty_ticks == self.policy.face_absent_ticks).then(|| {
                Detection::new(ViolationType::FaceAbsent, "No face visible to the camera")
            });
        }
        self.empty_ticks = 0;
        if count >= 2 {
            let entered = !self.multiple_faces;
            self.multiple_faces = true;
            entered.then(|| {
                Detection::new(
                    ViolationType::MultipleFacesDetected,
                    format!("{} faces detected", count),
                )
            })
        } else {
            self.multiple_faces = false;
            None
        }
    }

    /// Emit inactivity once per idle period
    pub fn check_inactivity(&mut self, now: Instant) -> Option<Detection> {
        let timeout = Duration::from_millis(self.policy.inactivity_timeout_ms);
        if self.idle || now.saturating_duration_since(self.last_activity) < timeout {
            return None;
        }
        self.idle = true;
        Some(Detection::new(
            ViolationType::Inactivity,
            format!("No input for {}s", timeout.as_secs()),
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReportOutcome {
    Delivered,
    Abandoned,
}

/// Stamps, logs and dispatches violations for one device
pub struct ViolationEngine {
    session_id: String,
    source: DeviceRole,
    classifier: Mutex<ViolationClassifier>,
    last_timestamp_ms: Mutex<i64>,
    log: Mutex<Vec<Violation>>,
    /// Keyed by violation id; absent while the reporter still owns it
    outcomes: Mutex<HashMap<String, ReportOutcome>>,
    events: broadcast::Sender<DeviceEvent>,
    outbox: Mutex<Option<mpsc::UnboundedSender<Violation>>>,
}

impl ViolationEngine {
    /// Build the engine and the receiving end of its report outbox
    pub fn new(
        session_id: String,
        source: DeviceRole,
        policy: ViolationPolicy,
        events: broadcast::Sender<DeviceEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<Violation>) {
        let (outbox, receiver) = mpsc::unbounded_channel();
        let engine = Self {
            session_id,
            source,
            classifier: Mutex::new(ViolationClassifier::new(policy)),
            last_timestamp_ms: Mutex::new(i64::MIN),
            log: Mutex::new(Vec::new()),
            outcomes: Mutex::new(HashMap::new()),
            events,
            outbox: Mutex::new(Some(outbox)),
        };
        (engine, receiver)
    }

    pub fn ingest(&self, signal: &PlatformSignal) -> Option<Violation> {
        let detection = locked(&self.classifier).classify(signal, Instant::now())?;
        Some(self.emit(detection))
    }

    pub fn check_inactivity(&self) -> Option<Violation> {
        let detection = locked(&self.classifier).check_inactivity(Instant::now())?;
        Some(self.emit(detection))
    }

    /// Timestamps never decrease per source, even if the wall clock steps back
    fn stamp(&self, now_ms: i64) -> i64 {
        let mut last = locked(&self.last_timestamp_ms);
        *last = now_ms.max(*last);
        *last
    }

    fn emit(&self, detection: Detection) -> Violation {
        let violation = Violation {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: self.session_id.clone(),
            timestamp_ms: self.stamp(now_ms()),
            violation_type: detection.violation_type,
            severity: detection.severity,
            message: detection.message,
            source: self.source,
        };
        match violation.severity {
            Severity::Critical => warn!(
                "[Violation] {} ({}): {}",
                violation.violation_type, violation.severity.as_str(), violation.message
            ),
            _ => info!(
                "[Violation] {} ({}): {}",
                violation.violation_type, violation.severity.as_str(), violation.message
            ),
        }

        locked(&self.log).push(violation.clone());
        let _ = self.events.send(DeviceEvent::Violation(violation.clone()));
        if let Some(outbox) = locked(&self.outbox).as_ref() {
            let _ = outbox.send(violation.clone());
        }
        violation
    }

    /// Every violation this device emitted, in order
    pub fn log(&self) -> Vec<Violation> {
        locked(&self.log).clone()
    }

    /// Stop accepting reports; the reporter finishes what is queued and exits
    pub fn close(&self) {
        locked(&self.outbox).take();
    }

    pub fn mark_delivered(&self, id: &str) {
        locked(&self.outcomes).insert(id.to_string(), ReportOutcome::Delivered);
    }

    /// Give up on delivering one violation. It stays in the log and is
    /// announced as [`DeviceEvent::ViolationUnreported`].
    pub fn abandon(&self, violation: &Violation, reason: &str) {
        {
            let mut outcomes = locked(&self.outcomes);
            if outcomes.contains_key(&violation.id) {
                return;
            }
            outcomes.insert(violation.id.clone(), ReportOutcome::Abandoned);
        }
        warn!(
            "[Violation] {} {} not reported: {}",
            violation.violation_type, violation.id, reason
        );
        let _ = self
            .events
            .send(DeviceEvent::ViolationUnreported(violation.clone()));
    }

    /// Abandon everything the reporter has not settled. Returns how many.
    pub fn abandon_pending(&self, reason: &str) -> usize {
        let pending: Vec<Violation> = {
            let outcomes = locked(&self.outcomes);
            locked(&self.log)
                .iter()
                .filter(|v| !outcomes.contains_key(&v.id))
                .cloned()
                .collect()
        };
        for violation in &pending {
            self.abandon(violation, reason);
        }
        pending.len()
    }

    /// Logged violations the server never acknowledged
    pub fn unreported(&self) -> Vec<Violation> {
        let outcomes = locked(&self.outcomes);
        locked(&self.log)
            .iter()
            .filter(|v| outcomes.get(&v.id) != Some(&ReportOutcome::Delivered))
            .cloned()
            .collect()
    }
}

/// Deliver violations to the server in order. Each report is retried with
/// backoff; offline periods do not consume the attempt budget. A report that
/// exhausts its attempts is abandoned through the engine, never dropped.
pub async fn run_violation_reporter(
    api: Arc<dyn ProctorApi>,
    credential: String,
    engine: Arc<ViolationEngine>,
    mut outbox: mpsc::UnboundedReceiver<Violation>,
    policy: UploadPolicy,
) {
    while let Some(violation) = outbox.recv().await {
        let mut failures = 0u32;
        let mut offline_attempts = 0u32;
        loop {
            match api.report_violation(&credential, &violation).await {
                Ok(()) => {
                    engine.mark_delivered(&violation.id);
                    break;
                }
                Err(e) if e.is_offline() => {
                    offline_attempts = offline_attempts.saturating_add(1);
                    tokio::time::sleep(backoff_delay(&policy, offline_attempts)).await;
                }
                Err(e) => {
                    failures += 1;
                    if failures >= policy.max_attempts {
                        engine.abandon(
                            &violation,
                            &format!("gave up after {} attempts: {}", failures, e),
                        );
                        break;
                    }
                    tokio::time::sleep(backoff_delay(&policy, failures)).await;
                }
            }
        }
    }
    debug!("[Violation] Reporter finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> ViolationClassifier {
        ViolationClassifier::new(ViolationPolicy::default())
    }

    fn types(detections: &[Detection]) -> Vec<ViolationType> {
        detections.iter().map(|d| d.violation_type).collect()
    }

    #[test]
    fn multiple_faces_fire_once_per_entry() {
        let mut classifier = classifier();
        let now = Instant::now();
        let detections: Vec<_> = [1, 1, 2, 2, 2, 1]
            .into_iter()
            .filter_map(|n| classifier.classify(&PlatformSignal::FaceCount(n), now))
            .collect();
        assert_eq!(types(&detections), vec![ViolationType::MultipleFacesDetected]);
        assert_eq!(detections[0].severity, Severity::Critical);
    }

    #[test]
    fn zero_faces_do_not_reset_multiple_faces() {
        let mut classifier = classifier();
        let now = Instant::now();
        let detections: Vec<_> = [2, 0, 2, 0, 0, 2]
            .into_iter()
            .filter_map(|n| classifier.classify(&PlatformSignal::FaceCount(n), now))
            .collect();
        assert_eq!(detections.len(), 1);
    }

    #[test]
    fn face_absent_needs_a_sustained_run() {
        let mut classifier = classifier();
        let now = Instant::now();
        let short: Vec<_> = (0..5)
            .filter_map(|_| classifier.classify(&PlatformSignal::FaceCount(0), now))
            .collect();
        assert!(short.is_empty());

        let long: Vec<_> = (0..40)
            .filter_map(|_| classifier.classify(&PlatformSignal::FaceCount(0), now))
            .collect();
        assert_eq!(types(&long), vec![ViolationType::FaceAbsent]);
    }

    #[test]
    fn blur_escalates_at_threshold() {
        let mut classifier = classifier();
        let now = Instant::now();
        let mut severities = Vec::new();
        for _ in 0..4 {
            classifier.classify(&PlatformSignal::FocusChanged { focused: true }, now);
            if let Some(d) = classifier.classify(&PlatformSignal::FocusChanged { focused: false }, now)
            {
                severities.push(d.severity);
            }
        }
        assert_eq!(
            severities,
            vec![
                Severity::Warning,
                Severity::Warning,
                Severity::Critical,
                Severity::Critical
            ]
        );
    }

    #[test]
    fn repeated_hidden_signal_is_one_tab_switch() {
        let mut classifier = classifier();
        let now = Instant::now();
        let hidden = PlatformSignal::VisibilityChanged { hidden: true };
        assert!(classifier.classify(&hidden, now).is_some());
        assert!(classifier.classify(&hidden, now).is_none());
        classifier.classify(&PlatformSignal::VisibilityChanged { hidden: false }, now);
        assert!(classifier.classify(&hidden, now).is_some());
    }

    #[test]
    fn fullscreen_exit_requires_prior_fullscreen() {
        let mut classifier = classifier();
        let now = Instant::now();
        let exit = PlatformSignal::FullscreenChanged { fullscreen: false };
        assert!(classifier.classify(&exit, now).is_none());
        classifier.classify(&PlatformSignal::FullscreenChanged { fullscreen: true }, now);
        let detection = classifier.classify(&exit, now).unwrap();
        assert_eq!(detection.violation_type, ViolationType::FullscreenExit);
        assert_eq!(detection.severity, Severity::Critical);
    }

    #[test]
    fn track_end_severity_depends_on_kind() {
        let mut classifier = classifier();
        let now = Instant::now();
        let video = classifier
            .classify(&PlatformSignal::TrackEnded(StreamKind::Screen), now)
            .unwrap();
        assert_eq!(video.severity, Severity::Critical);
        assert!(classifier
            .classify(&PlatformSignal::TrackEnded(StreamKind::Screen), now)
            .is_none());

        let audio = classifier
            .classify(&PlatformSignal::TrackEnded(StreamKind::Audio), now)
            .unwrap();
        assert_eq!(audio.severity, Severity::Warning);
    }

    #[test]
    fn gaze_violation_on_entry_only() {
        let mut classifier = classifier();
        let now = Instant::now();
        let detections: Vec<_> = [0.9, 0.2, 0.1, 0.3, 0.8, 0.2]
            .into_iter()
            .filter_map(|g| classifier.classify(&PlatformSignal::Gaze(g), now))
            .collect();
        assert_eq!(
            types(&detections),
            vec![ViolationType::LookingAway, ViolationType::LookingAway]
        );
    }

    #[test]
    fn inactivity_fires_once_per_idle_period() {
        let mut classifier = classifier();
        let start = Instant::now();
        let timeout = Duration::from_millis(ViolationPolicy::default().inactivity_timeout_ms);
        assert!(classifier.check_inactivity(start).is_none());
        assert!(classifier.check_inactivity(start + timeout).is_some());
        assert!(classifier.check_inactivity(start + timeout * 2).is_none());

        classifier.classify(&PlatformSignal::UserActivity, start + timeout * 2);
        assert!(classifier.check_inactivity(start + timeout * 3).is_some());
    }

    #[tokio::test]
    async fn engine_logs_and_publishes() {
        let (events, mut rx) = broadcast::channel(16);
        let (engine, mut outbox) = ViolationEngine::new(
            "s1".into(),
            DeviceRole::Primary,
            ViolationPolicy::default(),
            events,
        );
        let violation = engine.ingest(&PlatformSignal::ContextMenu).unwrap();
        assert_eq!(violation.severity, Severity::Info);
        assert_eq!(violation.source, DeviceRole::Primary);
        assert_eq!(engine.log().len(), 1);
        assert!(matches!(rx.recv().await.unwrap(), DeviceEvent::Violation(_)));
        assert_eq!(outbox.recv().await.unwrap().id, violation.id);

        engine.close();
        assert!(outbox.recv().await.is_none());
    }

    #[test]
    fn timestamps_hold_when_the_clock_steps_back() {
        let (events, _) = broadcast::channel(16);
        let (engine, _outbox) = ViolationEngine::new(
            "s1".into(),
            DeviceRole::Primary,
            ViolationPolicy::default(),
            events,
        );
        assert_eq!(engine.stamp(10_000), 10_000);
        // NTP correction moves the wall clock back two seconds
        assert_eq!(engine.stamp(8_000), 10_000);
        assert_eq!(engine.stamp(9_999), 10_000);
        assert_eq!(engine.stamp(10_500), 10_500);

        let first = engine.ingest(&PlatformSignal::ContextMenu).unwrap();
        let second = engine.ingest(&PlatformSignal::DevtoolsAttempt).unwrap();
        assert!(first.timestamp_ms >= 10_500);
        assert!(second.timestamp_ms >= first.timestamp_ms);
    }

    #[tokio::test]
    async fn abandoned_reports_stay_unreported_and_are_announced() {
        let (events, mut rx) = broadcast::channel(16);
        let (engine, _outbox) = ViolationEngine::new(
            "s1".into(),
            DeviceRole::Primary,
            ViolationPolicy::default(),
            events,
        );
        let delivered = engine.ingest(&PlatformSignal::ContextMenu).unwrap();
        let lost = engine.ingest(&PlatformSignal::DevtoolsAttempt).unwrap();
        while rx.try_recv().is_ok() {}

        engine.mark_delivered(&delivered.id);
        assert_eq!(engine.abandon_pending("teardown"), 1);
        assert_eq!(engine.abandon_pending("teardown"), 0);

        let unreported = engine.unreported();
        assert_eq!(unreported.len(), 1);
        assert_eq!(unreported[0].id, lost.id);
        match rx.try_recv().unwrap() {
            DeviceEvent::ViolationUnreported(v) => assert_eq!(v.id, lost.id),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }
}
