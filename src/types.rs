//! Shared data model for server and device halves

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::config::ProctorPolicy;
use crate::error::ProctorError;

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Lock a mutex, recovering the data if a holder panicked
pub(crate) fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Role a device plays within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    /// Candidate's main machine: webcam, microphone, screen
    Primary,
    /// Phone joined through the QR token, side-angle camera
    Secondary,
    /// Read-only live view; may toggle recording
    Reviewer,
}

impl DeviceRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceRole::Primary => "primary",
            DeviceRole::Secondary => "secondary",
            DeviceRole::Reviewer => "reviewer",
        }
    }

    /// Roles that produce media
    pub fn captures(&self) -> bool {
        matches!(self, DeviceRole::Primary | DeviceRole::Secondary)
    }

    /// Roles allowed to flip the authoritative recording flag
    pub fn controls_recording(&self) -> bool {
        matches!(self, DeviceRole::Primary | DeviceRole::Reviewer)
    }
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceRole {
    type Err = ProctorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary" => Ok(DeviceRole::Primary),
            "secondary" => Ok(DeviceRole::Secondary),
            "reviewer" => Ok(DeviceRole::Reviewer),
            other => Err(ProctorError::InvalidInput(format!(
                "unknown device role '{}'",
                other
            ))),
        }
    }
}

/// Kind of captured media stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Webcam,
    Screen,
    Audio,
}

impl StreamKind {
    pub const ALL: [StreamKind; 3] = [StreamKind::Webcam, StreamKind::Screen, StreamKind::Audio];

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Webcam => "webcam",
            StreamKind::Screen => "screen",
            StreamKind::Audio => "audio",
        }
    }

    /// Wire code used by the chunk frame
    pub fn code(&self) -> u8 {
        match self {
            StreamKind::Webcam => 1,
            StreamKind::Screen => 2,
            StreamKind::Audio => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(StreamKind::Webcam),
            2 => Some(StreamKind::Screen),
            3 => Some(StreamKind::Audio),
            _ => None,
        }
    }

    /// Video tracks ending mid-session are critical
    pub fn is_video(&self) -> bool {
        matches!(self, StreamKind::Webcam | StreamKind::Screen)
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamKind {
    type Err = ProctorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "webcam" => Ok(StreamKind::Webcam),
            "screen" => Ok(StreamKind::Screen),
            "audio" => Ok(StreamKind::Audio),
            other => Err(ProctorError::InvalidInput(format!(
                "unknown stream kind '{}'",
                other
            ))),
        }
    }
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Active,
    Ended,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Active => "active",
            SessionState::Ended => "ended",
        }
    }
}

impl FromStr for SessionState {
    type Err = ProctorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionState::Active),
            "ended" => Ok(SessionState::Ended),
            other => Err(ProctorError::InvalidInput(format!(
                "unknown session state '{}'",
                other
            ))),
        }
    }
}

/// Which optional roles get a join token at session creation
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RoleConfig {
    #[serde(default)]
    pub secondary: bool,
    #[serde(default = "default_true")]
    pub reviewer: bool,
}

fn default_true() -> bool {
    true
}

impl Default for RoleConfig {
    fn default() -> Self {
        Self {
            secondary: false,
            reviewer: true,
        }
    }
}

/// Join token minted for one role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleToken {
    pub role: DeviceRole,
    pub token: String,
    pub expires_at_ms: i64,
}

/// Result of creating a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedSession {
    pub session_id: String,
    pub created_at_ms: i64,
    pub join_tokens: Vec<RoleToken>,
}

impl CreatedSession {
    pub fn token_for(&self, role: DeviceRole) -> Option<&str> {
        self.join_tokens
            .iter()
            .find(|t| t.role == role)
            .map(|t| t.token.as_str())
    }
}

/// Result of exchanging a join token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinGrant {
    pub relay_url: String,
    pub credential: String,
    pub session_id: String,
    pub role: DeviceRole,
    pub policy: ProctorPolicy,
}

/// Delivery state of a chunk on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    Uploaded,
    Lost,
}

/// One time slice of a continuous capture
#[derive(Debug, Clone)]
pub struct RecordingChunk {
    pub session_id: String,
    pub device_role: DeviceRole,
    pub kind: StreamKind,
    pub sequence: u64,
    pub started_at_ms: i64,
    pub duration_ms: u32,
    pub payload: Bytes,
    pub status: UploadStatus,
}

/// Server answer to a chunk upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadAck {
    pub accepted: bool,
    #[serde(default)]
    pub duplicate: bool,
}

impl UploadAck {
    /// The chunk is durably stored, by this request or an earlier one
    pub fn is_delivered(&self) -> bool {
        self.accepted || self.duplicate
    }
}

/// Stored chunk without its payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkManifestEntry {
    pub device_role: DeviceRole,
    pub kind: StreamKind,
    pub sequence: u64,
    pub started_at_ms: i64,
    pub duration_ms: u32,
    pub size_bytes: u64,
}

/// Violation severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = ProctorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            other => Err(ProctorError::InvalidInput(format!(
                "unknown severity '{}'",
                other
            ))),
        }
    }
}

/// Integrity violation taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationType {
    TabSwitch,
    WindowBlur,
    FullscreenExit,
    DevtoolsAttempt,
    CopyAttempt,
    CutAttempt,
    PasteAttempt,
    ContextMenuAttempt,
    MultipleFacesDetected,
    TrackEnded,
    Inactivity,
    LookingAway,
    FaceAbsent,
    LockdownUnresolved,
    CaptureTerminated,
}

impl ViolationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationType::TabSwitch => "tab_switch",
            ViolationType::WindowBlur => "window_blur",
            ViolationType::FullscreenExit => "fullscreen_exit",
            ViolationType::DevtoolsAttempt => "devtools_attempt",
            ViolationType::CopyAttempt => "copy_attempt",
            ViolationType::CutAttempt => "cut_attempt",
            ViolationType::PasteAttempt => "paste_attempt",
            ViolationType::ContextMenuAttempt => "context_menu_attempt",
            ViolationType::MultipleFacesDetected => "multiple_faces_detected",
            ViolationType::TrackEnded => "track_ended",
            ViolationType::Inactivity => "inactivity",
            ViolationType::LookingAway => "looking_away",
            ViolationType::FaceAbsent => "face_absent",
            ViolationType::LockdownUnresolved => "lockdown_unresolved",
            ViolationType::CaptureTerminated => "capture_terminated",
        }
    }

    /// Default severity; window_blur escalation is applied by the classifier
    pub fn default_severity(&self) -> Severity {
        match self {
            ViolationType::TabSwitch
            | ViolationType::FullscreenExit
            | ViolationType::MultipleFacesDetected
            | ViolationType::TrackEnded
            | ViolationType::LockdownUnresolved
            | ViolationType::CaptureTerminated => Severity::Critical,
            ViolationType::WindowBlur
            | ViolationType::DevtoolsAttempt
            | ViolationType::CopyAttempt
            | ViolationType::CutAttempt
            | ViolationType::PasteAttempt
            | ViolationType::Inactivity
            | ViolationType::LookingAway
            | ViolationType::FaceAbsent => Severity::Warning,
            ViolationType::ContextMenuAttempt => Severity::Info,
        }
    }

    /// Types derived from gaze scoring
    pub fn is_gaze_related(&self) -> bool {
        matches!(self, ViolationType::LookingAway)
    }
}

impl fmt::Display for ViolationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ViolationType {
    type Err = ProctorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| ProctorError::InvalidInput(format!("unknown violation type '{}'", s)))
    }
}

/// A classified, severity-tagged integrity event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub id: String,
    pub session_id: String,
    pub timestamp_ms: i64,
    #[serde(rename = "type")]
    pub violation_type: ViolationType,
    pub severity: Severity,
    pub message: String,
    pub source: DeviceRole,
}

/// One behavioral analysis tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSample {
    pub session_id: String,
    pub source: DeviceRole,
    pub timestamp_ms: i64,
    pub gaze_score: f64,
    pub head_stability_score: f64,
    pub attention_score: f64,
    /// 0..=100
    pub audio_level: f64,
    pub face_count: u32,
}

/// Baseline geometry captured once per session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub session_id: String,
    pub nose_offset_x: f64,
    pub nose_offset_y: f64,
    pub yaw_deg: f64,
    pub pitch_deg: f64,
    pub roll_rad: f64,
    pub captured_at_ms: i64,
}

/// Server answer to a calibration report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationAck {
    /// This report became the session baseline
    pub stored: bool,
    /// The session baseline, whichever device captured it
    pub baseline: Calibration,
}

/// A chunk that could not be delivered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataLossRisk {
    pub session_id: String,
    pub device_role: DeviceRole,
    pub kind: StreamKind,
    pub sequence: u64,
    pub reason: String,
    pub recorded_at_ms: i64,
}

/// Events pushed to the reviewer live feed
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FeedEvent {
    Violation(Violation),
    Analysis(AnalysisSample),
    RecordingChanged { recording: bool },
    DataLoss(DataLossRisk),
    DeviceJoined { role: DeviceRole },
    DeviceLeft { role: DeviceRole },
    SessionEnded,
}

/// Integrity summary for one session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: String,
    pub state: SessionState,
    pub recording: bool,
    pub violations_by_severity: BTreeMap<String, u64>,
    pub chunks_by_stream: BTreeMap<String, u64>,
    pub data_loss_risks: u64,
    pub calibrated: bool,
    /// Any critical violation was recorded
    pub flagged: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn violation_type_names_round_trip_through_serde() {
        for t in [
            ViolationType::TabSwitch,
            ViolationType::MultipleFacesDetected,
            ViolationType::ContextMenuAttempt,
            ViolationType::LockdownUnresolved,
        ] {
            let json = serde_json::to_string(&t).unwrap();
            assert_eq!(json, format!("\"{}\"", t.as_str()));
            assert_eq!(t.as_str().parse::<ViolationType>().unwrap(), t);
        }
    }

    #[test]
    fn default_severities_follow_taxonomy() {
        assert_eq!(ViolationType::TabSwitch.default_severity(), Severity::Critical);
        assert_eq!(ViolationType::WindowBlur.default_severity(), Severity::Warning);
        assert_eq!(ViolationType::ContextMenuAttempt.default_severity(), Severity::Info);
        assert_eq!(ViolationType::TrackEnded.default_severity(), Severity::Critical);
    }

    #[test]
    fn stream_kind_codes_are_stable() {
        for kind in StreamKind::ALL {
            assert_eq!(StreamKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(StreamKind::from_code(0), None);
    }

    #[test]
    fn duplicate_ack_counts_as_delivered() {
        let ack = UploadAck {
            accepted: false,
            duplicate: true,
        };
        assert!(ack.is_delivered());
        assert!(!UploadAck {
            accepted: false,
            duplicate: false
        }
        .is_delivered());
    }
}
