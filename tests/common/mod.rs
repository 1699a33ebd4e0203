//! In-memory fakes for the device-side platform traits and the server API.
//!
//! Everything here is synchronous under the hood, so tests can run with
//! paused tokio time without the clock jumping while a query is in flight.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

use proctor_engine::analysis::{FaceLandmarks, LandmarkFrame, LandmarkSource, Point};
use proctor_engine::api::ProctorApi;
use proctor_engine::capture::{MediaBackend, TrackInfo};
use proctor_engine::config::ProctorPolicy;
use proctor_engine::error::{AuthError, ProctorError, Result};
use proctor_engine::lockdown::DisplayControl;
use proctor_engine::types::{
    AnalysisSample, Calibration, CalibrationAck, DataLossRisk, DeviceRole, JoinGrant, RecordingChunk, StreamKind,
    UploadAck, Violation,
};
use proctor_engine::DevicePlatform;

pub const SESSION_ID: &str = "session-1";

pub fn token(role: DeviceRole) -> String {
    format!("token-{}", role)
}

pub fn credential(role: DeviceRole) -> String {
    format!("cred-{}", role)
}

#[derive(Default)]
struct ApiState {
    recording: bool,
    ended: bool,
    exchanged: HashSet<String>,
    chunks: BTreeMap<(DeviceRole, StreamKind), Vec<u64>>,
    violations: Vec<Violation>,
    samples: Vec<AnalysisSample>,
    calibration: Option<Calibration>,
    data_loss: Vec<DataLossRisk>,
    disconnected: Vec<DeviceRole>,
}

/// Server stand-in with the same ordering rules as the real service
pub struct FakeApi {
    policy: ProctorPolicy,
    offline: AtomicBool,
    failing_uploads: AtomicBool,
    failing_reports: AtomicBool,
    state: Mutex<ApiState>,
}

impl FakeApi {
    pub fn new(policy: ProctorPolicy) -> Arc<Self> {
        Arc::new(Self {
            policy,
            offline: AtomicBool::new(false),
            failing_uploads: AtomicBool::new(false),
            failing_reports: AtomicBool::new(false),
            state: Mutex::new(ApiState::default()),
        })
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Uploads answer with a server error while set
    pub fn set_failing_uploads(&self, failing: bool) {
        self.failing_uploads.store(failing, Ordering::SeqCst);
    }

    /// Violation reports answer with a server error while set
    pub fn set_failing_reports(&self, failing: bool) {
        self.failing_reports.store(failing, Ordering::SeqCst);
    }

    fn reachable(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ProctorError::Network("connection refused".into()));
        }
        Ok(())
    }

    fn role(&self, credential: &str) -> Result<DeviceRole> {
        credential
            .strip_prefix("cred-")
            .and_then(|role| role.parse().ok())
            .ok_or_else(|| AuthError::CredentialInvalid.into())
    }

    pub fn recording(&self) -> bool {
        self.state.lock().unwrap().recording
    }

    pub fn ended(&self) -> bool {
        self.state.lock().unwrap().ended
    }

    pub fn sequences(&self, role: DeviceRole, kind: StreamKind) -> Vec<u64> {
        self.state
            .lock()
            .unwrap()
            .chunks
            .get(&(role, kind))
            .cloned()
            .unwrap_or_default()
    }

    pub fn total_chunks(&self) -> usize {
        self.state.lock().unwrap().chunks.values().map(Vec::len).sum()
    }

    pub fn violations(&self) -> Vec<Violation> {
        self.state.lock().unwrap().violations.clone()
    }

    pub fn samples(&self) -> usize {
        self.state.lock().unwrap().samples.len()
    }

    pub fn calibration(&self) -> Option<Calibration> {
        self.state.lock().unwrap().calibration.clone()
    }

    pub fn data_loss(&self) -> Vec<DataLossRisk> {
        self.state.lock().unwrap().data_loss.clone()
    }

    pub fn disconnected(&self) -> Vec<DeviceRole> {
        self.state.lock().unwrap().disconnected.clone()
    }
}

#[async_trait]
impl ProctorApi for FakeApi {
    async fn exchange_token(&self, token: &str) -> Result<JoinGrant> {
        self.reachable()?;
        let role: DeviceRole = token
            .strip_prefix("token-")
            .and_then(|role| role.parse().ok())
            .ok_or(AuthError::TokenInvalid)?;
        let mut state = self.state.lock().unwrap();
        if state.ended {
            return Err(AuthError::SessionEnded.into());
        }
        if !state.exchanged.insert(token.to_string()) {
            return Err(AuthError::TokenUsed.into());
        }
        Ok(JoinGrant {
            relay_url: "wss://relay.test/rtc".into(),
            credential: credential(role),
            session_id: SESSION_ID.into(),
            role,
            policy: self.policy.clone(),
        })
    }

    async fn get_recording(&self, credential: &str) -> Result<bool> {
        self.reachable()?;
        self.role(credential)?;
        Ok(self.recording())
    }

    async fn set_recording(&self, credential: &str, recording: bool) -> Result<bool> {
        self.reachable()?;
        let role = self.role(credential)?;
        if !role.controls_recording() {
            return Err(AuthError::RoleNotPermitted(role.to_string()).into());
        }
        self.state.lock().unwrap().recording = recording;
        Ok(recording)
    }

    async fn upload_chunk(&self, credential: &str, chunk: &RecordingChunk) -> Result<UploadAck> {
        self.reachable()?;
        if self.failing_uploads.load(Ordering::SeqCst) {
            return Err(ProctorError::Server {
                status: 500,
                message: "storage unavailable".into(),
            });
        }
        let role = self.role(credential)?;
        let mut state = self.state.lock().unwrap();
        let sequences = state.chunks.entry((role, chunk.kind)).or_default();
        if sequences.last().is_some_and(|last| chunk.sequence <= *last) {
            return Ok(UploadAck {
                accepted: false,
                duplicate: sequences.contains(&chunk.sequence),
            });
        }
        sequences.push(chunk.sequence);
        Ok(UploadAck {
            accepted: true,
            duplicate: false,
        })
    }

    async fn report_violation(&self, credential: &str, violation: &Violation) -> Result<()> {
        self.reachable()?;
        if self.failing_reports.load(Ordering::SeqCst) {
            return Err(ProctorError::Server {
                status: 500,
                message: "violation store unavailable".into(),
            });
        }
        self.role(credential)?;
        let mut state = self.state.lock().unwrap();
        if !state.violations.iter().any(|v| v.id == violation.id) {
            state.violations.push(violation.clone());
        }
        Ok(())
    }

    async fn report_analysis(&self, credential: &str, sample: &AnalysisSample) -> Result<()> {
        self.reachable()?;
        self.role(credential)?;
        self.state.lock().unwrap().samples.push(sample.clone());
        Ok(())
    }

    async fn report_calibration(
        &self,
        credential: &str,
        calibration: &Calibration,
    ) -> Result<CalibrationAck> {
        self.reachable()?;
        self.role(credential)?;
        let mut state = self.state.lock().unwrap();
        let stored = state.calibration.is_none();
        let baseline = state
            .calibration
            .get_or_insert_with(|| calibration.clone())
            .clone();
        Ok(CalibrationAck { stored, baseline })
    }

    async fn report_data_loss(&self, credential: &str, risk: &DataLossRisk) -> Result<()> {
        self.reachable()?;
        self.role(credential)?;
        self.state.lock().unwrap().data_loss.push(risk.clone());
        Ok(())
    }

    async fn disconnect(&self, credential: &str) -> Result<()> {
        self.reachable()?;
        let role = self.role(credential)?;
        self.state.lock().unwrap().disconnected.push(role);
        Ok(())
    }

    async fn end_session(&self, credential: &str) -> Result<()> {
        self.reachable()?;
        let role = self.role(credential)?;
        if !role.controls_recording() {
            return Err(AuthError::RoleNotPermitted(role.to_string()).into());
        }
        self.state.lock().unwrap().ended = true;
        Ok(())
    }
}

/// Media backend producing 100 bytes per second of capture per track
#[derive(Default)]
pub struct FakeMedia {
    denied: Mutex<HashSet<StreamKind>>,
    ended: Mutex<HashSet<StreamKind>>,
    last_take: Mutex<HashMap<StreamKind, Instant>>,
    released: Mutex<Vec<StreamKind>>,
    acquisitions: AtomicU32,
}

impl FakeMedia {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn deny(&self, kind: StreamKind) {
        self.denied.lock().unwrap().insert(kind);
    }

    /// Simulate the platform ending a track (user stopped sharing)
    pub fn end(&self, kind: StreamKind) {
        self.ended.lock().unwrap().insert(kind);
    }

    pub fn released(&self) -> Vec<StreamKind> {
        self.released.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaBackend for FakeMedia {
    async fn acquire(&self, kind: StreamKind) -> Result<TrackInfo> {
        if self.denied.lock().unwrap().contains(&kind) {
            return Err(ProctorError::PermissionDenied {
                kind,
                remediation: "permission dismissed".into(),
            });
        }
        self.ended.lock().unwrap().remove(&kind);
        self.last_take.lock().unwrap().insert(kind, Instant::now());
        let n = self.acquisitions.fetch_add(1, Ordering::SeqCst);
        Ok(TrackInfo {
            kind,
            track_id: format!("{}-{}", kind, n),
        })
    }

    fn take_slice(&self, kind: StreamKind) -> Option<Bytes> {
        if self.ended.lock().unwrap().contains(&kind) {
            return None;
        }
        let now = Instant::now();
        let previous = self.last_take.lock().unwrap().insert(kind, now)?;
        let bytes = now.duration_since(previous).as_millis() as usize / 10;
        Some(Bytes::from(vec![0u8; bytes]))
    }

    fn release(&self, kind: StreamKind) {
        self.released.lock().unwrap().push(kind);
    }
}

/// Display that grants fullscreen until told otherwise
pub struct FakeDisplay {
    grant: AtomicBool,
    fullscreen: AtomicBool,
    blockers: AtomicBool,
    pub fullscreen_requests: AtomicU32,
}

impl FakeDisplay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            grant: AtomicBool::new(true),
            fullscreen: AtomicBool::new(false),
            blockers: AtomicBool::new(false),
            fullscreen_requests: AtomicU32::new(0),
        })
    }

    pub fn set_grant(&self, grant: bool) {
        self.grant.store(grant, Ordering::SeqCst);
    }

    /// The candidate pressed Escape
    pub fn leave_fullscreen(&self) {
        self.fullscreen.store(false, Ordering::SeqCst);
    }

    pub fn blockers_attached(&self) -> bool {
        self.blockers.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> u32 {
        self.fullscreen_requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DisplayControl for FakeDisplay {
    async fn request_fullscreen(&self) -> bool {
        self.fullscreen_requests.fetch_add(1, Ordering::SeqCst);
        let granted = self.grant.load(Ordering::SeqCst);
        if granted {
            self.fullscreen.store(true, Ordering::SeqCst);
        }
        granted
    }

    async fn request_focus(&self) -> bool {
        true
    }

    fn is_fullscreen(&self) -> bool {
        self.fullscreen.load(Ordering::SeqCst)
    }

    fn attach_blockers(&self) {
        self.blockers.store(true, Ordering::SeqCst);
    }

    fn detach_blockers(&self) {
        self.blockers.store(false, Ordering::SeqCst);
    }

    async fn exit_fullscreen(&self) {
        self.fullscreen.store(false, Ordering::SeqCst);
    }
}

/// Landmark source returning whatever frame was last set
#[derive(Default)]
pub struct FakeLandmarks {
    frame: Mutex<LandmarkFrame>,
    broken: AtomicBool,
}

impl FakeLandmarks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_faces(&self, count: usize) {
        self.set_face(frontal_face(), count);
    }

    /// Show `count` copies of one face
    pub fn set_face(&self, face: FaceLandmarks, count: usize) {
        self.frame.lock().unwrap().faces = vec![face; count];
    }

    pub fn set_broken(&self, broken: bool) {
        self.broken.store(broken, Ordering::SeqCst);
    }
}

pub fn frontal_face() -> FaceLandmarks {
    FaceLandmarks {
        left_eye: Point::new(100.0, 100.0),
        right_eye: Point::new(200.0, 100.0),
        nose_tip: Point::new(150.0, 155.0),
    }
}

/// Head turned well to one side
pub fn turned_face() -> FaceLandmarks {
    FaceLandmarks {
        nose_tip: Point::new(195.0, 155.0),
        ..frontal_face()
    }
}

#[async_trait]
impl LandmarkSource for FakeLandmarks {
    async fn latest_frame(&self) -> Result<LandmarkFrame> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(ProctorError::AnalysisUnavailable("detector crashed".into()));
        }
        Ok(self.frame.lock().unwrap().clone())
    }

    fn audio_window(&self, len: usize) -> Option<Vec<f32>> {
        Some(vec![0.1; len])
    }
}

pub fn platform(media: &Arc<FakeMedia>) -> DevicePlatform {
    DevicePlatform {
        media: Some(media.clone()),
        ..Default::default()
    }
}
