//! Device session context
//!
//! A [`SessionContext`] is one joined device. It owns every task the device
//! runs (capture slicers through the capture manager, upload worker,
//! recording poll, analysis tick, inactivity watchdog, violation reporter,
//! lockdown driver and termination countdowns) and releases all of them on
//! [`SessionContext::teardown`] or when dropped.

use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::analysis::{
    run_analysis_reporter, AnalysisLoop, BehaviorAnalyzer, LandmarkSource,
};
use crate::api::ProctorApi;
use crate::capture::{CaptureConstraints, MediaBackend, MediaCaptureManager};
use crate::error::{ProctorError, Result};
use crate::lockdown::{DisplayControl, LockdownDriver, LockdownEvent, LockdownState};
use crate::recording_state::{apply_edge, run_recording_poll, RecordingStatePoller};
use crate::relay::{LiveRelay, RoomHandle, TrackDescriptor};
use crate::types::{
    locked, Calibration, DataLossRisk, DeviceRole, JoinGrant, StreamKind, Violation,
};
use crate::upload::{ChunkUploader, DataLossLedger, UploadQueue};
use crate::violation::{run_violation_reporter, PlatformSignal, ViolationEngine};

const EVENT_CAPACITY: usize = 256;
const ANALYSIS_REPORT_CAPACITY: usize = 64;
const COUNTDOWN_STEP: Duration = Duration::from_secs(1);

/// Background component that can fall back to a degraded mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegradedComponent {
    RecordingState,
    Analysis,
    Relay,
}

/// Everything a device's UI needs to react to
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    RecordingChanged { recording: bool },
    Degraded { component: DegradedComponent, reason: String },
    Recovered { component: DegradedComponent },
    UploadOffline,
    UploadOnline,
    DataLoss(DataLossRisk),
    Violation(Violation),
    CountdownStarted { kind: StreamKind, remaining_ms: u64 },
    Countdown { kind: StreamKind, remaining_ms: u64 },
    CountdownCancelled { kind: StreamKind },
    Terminated { reason: String },
    Lockdown(LockdownState),
    Calibrated(Calibration),
    /// The server never acknowledged this violation
    ViolationUnreported(Violation),
}

/// Platform capabilities available on this device
#[derive(Clone, Default)]
pub struct DevicePlatform {
    pub media: Option<Arc<dyn MediaBackend>>,
    pub display: Option<Arc<dyn DisplayControl>>,
    pub landmarks: Option<Arc<dyn LandmarkSource>>,
    pub relay: Option<Arc<dyn LiveRelay>>,
}

/// Outcome of a teardown
#[derive(Debug, Clone)]
pub struct TeardownReport {
    /// Chunks acknowledged by the server over the whole session
    pub uploaded: u64,
    pub data_loss: Vec<DataLossRisk>,
    pub violations: usize,
    /// Logged locally but never acknowledged by the server
    pub unreported_violations: Vec<Violation>,
    /// The queue emptied within the drain bound
    pub drained: bool,
}

pub struct SessionContext {
    api: Arc<dyn ProctorApi>,
    grant: JoinGrant,
    events: broadcast::Sender<DeviceEvent>,
    cancel: CancellationToken,
    upload_cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    upload_task: Mutex<Option<JoinHandle<()>>>,
    reporter_tasks: Mutex<Vec<JoinHandle<()>>>,
    queue: UploadQueue,
    ledger: DataLossLedger,
    capture: Option<Arc<MediaCaptureManager>>,
    engine: Arc<ViolationEngine>,
    analyzer: Option<Arc<Mutex<BehaviorAnalyzer>>>,
    landmarks: Option<Arc<dyn LandmarkSource>>,
    lockdown: Option<Arc<LockdownDriver>>,
    lockdown_tx: Option<mpsc::UnboundedSender<LockdownEvent>>,
    poller: Arc<tokio::sync::Mutex<RecordingStatePoller>>,
    recording: Arc<watch::Sender<bool>>,
    countdowns: Arc<Mutex<HashMap<StreamKind, CancellationToken>>>,
    /// Tracks whose countdown ran out; they cannot come back
    expired: Arc<Mutex<HashSet<StreamKind>>>,
    room: tokio::sync::Mutex<Option<Box<dyn RoomHandle>>>,
}

impl SessionContext {
    /// Exchange a join token and start every component the device's role needs.
    ///
    /// The granted policy is validated and media is acquired before any task
    /// starts. A policy that fails validation is [`ProctorError::Config`]; a
    /// refused permission is [`ProctorError::PermissionDenied`]. Either way
    /// nothing is left running.
    pub async fn join(
        api: Arc<dyn ProctorApi>,
        token: &str,
        platform: DevicePlatform,
    ) -> Result<Self> {
        let grant = api.exchange_token(token).await?;
        let role = grant.role;
        let policy = grant.policy.clone();
        if let Err(e) = policy.validate() {
            error!("[Session] Server sent an unusable policy: {}", e);
            if let Err(e) = api.disconnect(&grant.credential).await {
                debug!("[Session] Disconnect after bad policy failed: {}", e);
            }
            return Err(e);
        }
        info!(
            "[Session] Joined session {} as {}",
            grant.session_id, role
        );

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let queue = UploadQueue::new();
        let ledger = DataLossLedger::new(Arc::clone(&api), grant.credential.clone(), events.clone());

        let capture = if role.captures() {
            let media = platform.media.clone().ok_or_else(|| {
                ProctorError::InvalidInput(format!("{} device needs a media backend", role))
            })?;
            let manager = Arc::new(MediaCaptureManager::new(
                media,
                grant.session_id.clone(),
                role,
                &policy.capture,
                queue.clone(),
            ));
            let constraints = CaptureConstraints::for_role(role, &policy.capture);
            if let Err(e) = manager.request_streams(constraints).await {
                error!("[Session] Media permission refused: {}", e);
                if let Err(e) = api.disconnect(&grant.credential).await {
                    debug!("[Session] Disconnect after refusal failed: {}", e);
                }
                return Err(e);
            }
            Some(manager)
        } else {
            None
        };

        let (engine, outbox) = ViolationEngine::new(
            grant.session_id.clone(),
            role,
            policy.violations.clone(),
            events.clone(),
        );
        let engine = Arc::new(engine);

        let analyzer = match (&platform.landmarks, role.captures()) {
            (Some(_), true) => Some(Arc::new(Mutex::new(BehaviorAnalyzer::new(
                grant.session_id.clone(),
                role,
                policy.analysis.clone(),
            )))),
            _ => None,
        };

        let mut context = Self {
            poller: Arc::new(tokio::sync::Mutex::new(RecordingStatePoller::new(
                Arc::clone(&api),
                grant.credential.clone(),
            ))),
            api,
            grant,
            events,
            cancel: CancellationToken::new(),
            upload_cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            upload_task: Mutex::new(None),
            reporter_tasks: Mutex::new(Vec::new()),
            queue,
            ledger,
            capture,
            engine,
            analyzer,
            landmarks: platform.landmarks.clone(),
            lockdown: None,
            lockdown_tx: None,
            recording: Arc::new(watch::channel(false).0),
            countdowns: Arc::new(Mutex::new(HashMap::new())),
            expired: Arc::new(Mutex::new(HashSet::new())),
            room: tokio::sync::Mutex::new(None),
        };

        context.spawn_reporter(run_violation_reporter(
            Arc::clone(&context.api),
            context.grant.credential.clone(),
            Arc::clone(&context.engine),
            outbox,
            policy.upload.clone(),
        ));
        context.start_upload_worker();
        context.start_recording_poll();
        context.start_analysis();
        if role == DeviceRole::Primary {
            context.start_inactivity_watchdog();
            if let Some(display) = platform.display.clone() {
                context.start_lockdown(display).await;
            }
        }
        if let Some(relay) = platform.relay {
            context.connect_relay(relay).await;
        }
        Ok(context)
    }

    fn spawn<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        locked(&self.tasks).push(tokio::spawn(future));
    }

    fn spawn_reporter<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        locked(&self.reporter_tasks).push(tokio::spawn(future));
    }

    fn start_upload_worker(&self) {
        let uploader = ChunkUploader::new(
            Arc::clone(&self.api),
            self.grant.credential.clone(),
            self.queue.clone(),
            self.grant.policy.upload.clone(),
            self.ledger.clone(),
            self.events.clone(),
        );
        let handle = tokio::spawn(uploader.run(self.upload_cancel.clone()));
        *locked(&self.upload_task) = Some(handle);
    }

    fn start_recording_poll(&self) {
        self.spawn(run_recording_poll(
            Arc::clone(&self.poller),
            self.capture.clone(),
            Arc::clone(&self.recording),
            self.events.clone(),
            self.grant.policy.recording.poll_interval(),
            self.cancel.clone(),
        ));
    }

    fn start_analysis(&self) {
        let (Some(analyzer), Some(source)) = (&self.analyzer, &self.landmarks) else {
            return;
        };
        let (reports, receiver) = mpsc::channel(ANALYSIS_REPORT_CAPACITY);
        self.spawn_reporter(run_analysis_reporter(
            Arc::clone(&self.api),
            self.grant.credential.clone(),
            Arc::clone(analyzer),
            self.events.clone(),
            receiver,
        ));
        let analysis = AnalysisLoop {
            analyzer: Arc::clone(analyzer),
            source: Arc::clone(source),
            engine: Arc::clone(&self.engine),
            reports,
            events: self.events.clone(),
            policy: self.grant.policy.analysis.clone(),
        };
        self.spawn(analysis.run(self.cancel.clone()));
    }

    fn start_inactivity_watchdog(&self) {
        let engine = Arc::clone(&self.engine);
        let cancel = self.cancel.clone();
        let timeout = Duration::from_millis(self.grant.policy.violations.inactivity_timeout_ms);
        let period = (timeout / 4).clamp(Duration::from_millis(100), Duration::from_secs(1));
        self.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        engine.check_inactivity();
                    }
                }
            }
        });
    }

    async fn start_lockdown(&mut self, display: Arc<dyn DisplayControl>) {
        let driver = Arc::new(LockdownDriver::new(
            self.grant.policy.lockdown.clone(),
            display,
            Some(Arc::clone(&self.engine)),
            self.events.clone(),
        ));
        driver.dispatch(LockdownEvent::Engage).await;
        let (tx, rx) = mpsc::unbounded_channel();
        self.spawn(Arc::clone(&driver).run(rx, self.cancel.clone()));
        self.lockdown = Some(driver);
        self.lockdown_tx = Some(tx);
    }

    /// Live view is best effort; a relay failure never blocks recording
    async fn connect_relay(&self, relay: Arc<dyn LiveRelay>) {
        let room = match relay
            .connect(
                &self.grant.relay_url,
                &self.grant.session_id,
                &self.grant.credential,
            )
            .await
        {
            Ok(room) => room,
            Err(e) => {
                warn!("[Session] Live relay unavailable: {}", e);
                let _ = self.events.send(DeviceEvent::Degraded {
                    component: DegradedComponent::Relay,
                    reason: e.to_string(),
                });
                return;
            }
        };
        if let Some(capture) = &self.capture {
            for track in capture.tracks() {
                let descriptor = TrackDescriptor {
                    role: self.grant.role,
                    kind: track.kind,
                    track_id: track.track_id,
                };
                if let Err(e) = room.publish(descriptor).await {
                    warn!("[Session] Could not publish {} track: {}", track.kind, e);
                }
            }
        }
        *self.room.lock().await = Some(room);
    }

    pub fn grant(&self) -> &JoinGrant {
        &self.grant
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    /// Local view of the recording flag
    pub fn recording(&self) -> watch::Receiver<bool> {
        self.recording.subscribe()
    }

    pub fn capture(&self) -> Option<&Arc<MediaCaptureManager>> {
        self.capture.as_ref()
    }

    pub fn queue(&self) -> &UploadQueue {
        &self.queue
    }

    pub fn violations(&self) -> Vec<Violation> {
        self.engine.log()
    }

    pub fn lockdown(&self) -> Option<&Arc<LockdownDriver>> {
        self.lockdown.as_ref()
    }

    pub fn data_loss(&self) -> Vec<DataLossRisk> {
        self.ledger.entries()
    }

    /// Feed a platform signal to the violation engine and the lockdown machine
    pub fn signal(&self, signal: PlatformSignal) -> Option<Violation> {
        let violation = self.engine.ingest(&signal);

        let lockdown_event = match signal {
            PlatformSignal::FullscreenChanged { fullscreen: false } => {
                Some(LockdownEvent::FullscreenLost)
            }
            PlatformSignal::FullscreenChanged { fullscreen: true } => {
                Some(LockdownEvent::FullscreenAcquired)
            }
            PlatformSignal::FocusChanged { focused: false } => Some(LockdownEvent::FocusLost),
            PlatformSignal::FocusChanged { focused: true } => Some(LockdownEvent::FocusRegained),
            _ => None,
        };
        if let (Some(event), Some(tx)) = (lockdown_event, &self.lockdown_tx) {
            let _ = tx.send(event);
        }

        if let PlatformSignal::TrackEnded(kind) = signal {
            if let Some(capture) = &self.capture {
                capture.track_ended(kind);
            }
            if kind.is_video() {
                self.start_countdown(kind);
            }
        }
        violation
    }

    fn start_countdown(&self, kind: StreamKind) {
        let token = self.cancel.child_token();
        {
            let mut countdowns = locked(&self.countdowns);
            if countdowns.contains_key(&kind) {
                return;
            }
            countdowns.insert(kind, token.clone());
        }

        let total = self.grant.policy.termination_countdown();
        warn!(
            "[Session] {} track ended; terminating in {}s unless restored",
            kind,
            total.as_secs()
        );
        let _ = self.events.send(DeviceEvent::CountdownStarted {
            kind,
            remaining_ms: total.as_millis() as u64,
        });

        let api = Arc::clone(&self.api);
        let credential = self.grant.credential.clone();
        let role = self.grant.role;
        let engine = Arc::clone(&self.engine);
        let events = self.events.clone();
        let countdowns = Arc::clone(&self.countdowns);
        let expired = Arc::clone(&self.expired);
        self.spawn(async move {
            let deadline = tokio::time::Instant::now() + total;
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + COUNTDOWN_STEP, COUNTDOWN_STEP);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep_until(deadline) => break,
                    _ = ticker.tick() => {
                        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                        let _ = events.send(DeviceEvent::Countdown {
                            kind,
                            remaining_ms: remaining.as_millis() as u64,
                        });
                    }
                }
            }
            locked(&countdowns).remove(&kind);
            locked(&expired).insert(kind);

            engine.ingest(&PlatformSignal::CaptureTerminated { kind });
            let reason = format!("{} track was not restored in time", kind);
            error!("[Session] Terminating: {}", reason);
            let _ = events.send(DeviceEvent::Terminated { reason });
            if role.controls_recording() {
                if let Err(e) = api.end_session(&credential).await {
                    warn!("[Session] Could not end session on server: {}", e);
                }
            }
        });
    }

    /// Re-acquire an ended track and cancel its termination countdown.
    /// Once the countdown has run out the track stays
    /// [`ProctorError::TrackEnded`].
    pub async fn restore_track(&self, kind: StreamKind) -> Result<()> {
        if locked(&self.expired).contains(&kind) {
            return Err(ProctorError::TrackEnded(kind));
        }
        let capture = self.capture.as_ref().ok_or_else(|| {
            ProctorError::InvalidInput(format!("{} device has no capture", self.grant.role))
        })?;
        capture.restore_track(kind).await?;
        self.engine.ingest(&PlatformSignal::TrackRestored(kind));
        if let Some(token) = locked(&self.countdowns).remove(&kind) {
            token.cancel();
            info!("[Session] {} track restored, countdown cancelled", kind);
            let _ = self.events.send(DeviceEvent::CountdownCancelled { kind });
        }
        Ok(())
    }

    /// Flip the authoritative recording flag and apply it locally right away
    pub async fn set_recording(&self, recording: bool) -> Result<()> {
        let mut poller = self.poller.lock().await;
        let stored = self
            .api
            .set_recording(&self.grant.credential, recording)
            .await?;
        if poller.last_known() != stored {
            poller.assume(stored);
            apply_edge(self.capture.as_ref(), stored);
            self.recording.send_replace(stored);
            let _ = self.events.send(DeviceEvent::RecordingChanged { recording: stored });
        }
        Ok(())
    }

    /// Capture the analysis baseline now and adopt the session baseline the
    /// server answers with. Returns `None` if this device is already
    /// calibrated or no face is visible.
    pub async fn calibrate_now(&self) -> Result<Option<Calibration>> {
        let (Some(analyzer), Some(source)) = (&self.analyzer, &self.landmarks) else {
            return Err(ProctorError::AnalysisUnavailable(
                "no landmark source on this device".to_string(),
            ));
        };
        let frame = source.latest_frame().await?;
        let Some(calibration) = locked(analyzer).calibrate(&frame) else {
            return Ok(None);
        };
        let ack = self
            .api
            .report_calibration(&self.grant.credential, &calibration)
            .await?;
        if !ack.stored {
            info!("[Session] Server kept an earlier calibration");
        }
        locked(analyzer).adopt(ack.baseline.clone());
        let _ = self.events.send(DeviceEvent::Calibrated(ack.baseline.clone()));
        Ok(Some(ack.baseline))
    }

    /// Tracks a participant currently publishes on the live relay
    pub async fn watch_participant(&self, participant: DeviceRole) -> Result<Vec<TrackDescriptor>> {
        let room = self.room.lock().await;
        let room = room.as_ref().ok_or_else(|| {
            ProctorError::InvalidInput("not connected to the live relay".to_string())
        })?;
        room.subscribe(participant).await
    }

    /// Stop everything in order: timers, recorders (final chunk), lockdown,
    /// bounded upload drain, data-loss accounting, violation flush, media and
    /// relay release, server disconnect.
    pub async fn teardown(self) -> TeardownReport {
        info!("[Session] Tearing down {} device", self.grant.role);
        self.cancel.cancel();
        let tasks: Vec<_> = locked(&self.tasks).drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        if let Some(capture) = &self.capture {
            capture.stop_recording();
        }
        if let Some(lockdown) = &self.lockdown {
            lockdown.dispatch(LockdownEvent::Teardown).await;
        }

        let drain_timeout = self.grant.policy.upload.drain_timeout();
        let drained = self.queue.drain(drain_timeout).await;
        if !drained {
            warn!(
                "[Session] Upload queue not drained within {}ms, {} chunk(s) left",
                drain_timeout.as_millis(),
                self.queue.pending()
            );
        }
        self.upload_cancel.cancel();
        let upload_task = locked(&self.upload_task).take();
        if let Some(task) = upload_task {
            let _ = task.await;
        }
        for chunk in self.queue.take_all() {
            self.ledger
                .record(&chunk, "not delivered before teardown")
                .await;
        }

        self.engine.close();
        let reporters: Vec<_> = locked(&self.reporter_tasks).drain(..).collect();
        for mut reporter in reporters {
            if tokio::time::timeout(drain_timeout, &mut reporter).await.is_err() {
                warn!("[Session] Report flush timed out");
                reporter.abort();
            }
        }
        let abandoned = self.engine.abandon_pending("not delivered before teardown");
        if abandoned > 0 {
            warn!("[Session] {} violation(s) left unreported", abandoned);
        }

        if let Some(capture) = &self.capture {
            capture.release();
        }
        if let Some(room) = self.room.lock().await.take() {
            if let Err(e) = room.leave().await {
                debug!("[Session] Relay leave failed: {}", e);
            }
        }
        if let Err(e) = self.api.disconnect(&self.grant.credential).await {
            debug!("[Session] Disconnect failed: {}", e);
        }

        let report = TeardownReport {
            uploaded: self.queue.uploaded(),
            data_loss: self.ledger.entries(),
            violations: self.engine.log().len(),
            unreported_violations: self.engine.unreported(),
            drained,
        };
        info!(
            "[Session] Teardown complete: {} uploaded, {} at risk, {} violation(s)",
            report.uploaded,
            report.data_loss.len(),
            report.violations
        );
        report
    }
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.upload_cancel.cancel();
        for task in locked(&self.tasks).drain(..) {
            task.abort();
        }
        for task in locked(&self.reporter_tasks).drain(..) {
            task.abort();
        }
        if let Some(task) = locked(&self.upload_task).take() {
            task.abort();
        }
        if let Some(capture) = &self.capture {
            capture.stop_recording();
        }
    }
}
