use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ProctorError, Result};

fn default_port() -> u16 {
    3000
}

fn default_database_path() -> PathBuf {
    PathBuf::from("proctor.sqlite")
}

fn default_relay_url() -> String {
    "wss://relay.localhost/rtc".to_string()
}

fn default_token_ttl_secs() -> u64 {
    15 * 60
}

fn default_feed_capacity() -> usize {
    256
}

/// Server configuration file structure
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// API server port (default: 3000)
    #[serde(default = "default_port")]
    pub port: u16,
    /// SQLite database file (default: proctor.sqlite)
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Live relay endpoint handed to devices on join
    #[serde(default = "default_relay_url")]
    pub relay_url: String,
    /// Externally reachable base URL of this server, embedded in QR join links
    pub public_url: Option<String>,
    /// Join token lifetime in seconds (default: 15 minutes)
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
    /// Buffered events per live feed subscriber
    #[serde(default = "default_feed_capacity")]
    pub feed_capacity: usize,
    /// Policy distributed to every device on join (maps to [policy] in TOML)
    #[serde(default)]
    pub policy: ProctorPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            database_path: default_database_path(),
            relay_url: default_relay_url(),
            public_url: None,
            token_ttl_secs: default_token_ttl_secs(),
            feed_capacity: default_feed_capacity(),
            policy: ProctorPolicy::default(),
        }
    }
}

impl ServerConfig {
    /// Load and validate a TOML config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ServerConfig = toml::from_str(&content).map_err(|e| {
            ProctorError::Config(format!("failed to parse '{}': {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.relay_url)
            .map_err(|e| ProctorError::Config(format!("invalid relay_url: {}", e)))?;
        if let Some(public_url) = &self.public_url {
            url::Url::parse(public_url)
                .map_err(|e| ProctorError::Config(format!("invalid public_url: {}", e)))?;
        }
        if self.token_ttl_secs == 0 {
            return Err(ProctorError::Config(
                "token_ttl_secs must be greater than zero".to_string(),
            ));
        }
        if self.feed_capacity == 0 {
            return Err(ProctorError::Config(
                "feed_capacity must be greater than zero".to_string(),
            ));
        }
        self.policy.validate()
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }
}

/// Thresholds and cadences shared by every device of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProctorPolicy {
    pub capture: CapturePolicy,
    pub upload: UploadPolicy,
    pub recording: RecordingPolicy,
    pub violations: ViolationPolicy,
    pub analysis: AnalysisPolicy,
    pub lockdown: LockdownPolicy,
    /// Grace period after a capture track ends before forced termination
    pub termination_countdown_ms: u64,
}

impl Default for ProctorPolicy {
    fn default() -> Self {
        Self {
            capture: CapturePolicy::default(),
            upload: UploadPolicy::default(),
            recording: RecordingPolicy::default(),
            violations: ViolationPolicy::default(),
            analysis: AnalysisPolicy::default(),
            lockdown: LockdownPolicy::default(),
            termination_countdown_ms: 30_000,
        }
    }
}

impl ProctorPolicy {
    pub fn validate(&self) -> Result<()> {
        let slice = self.capture.chunk_interval_ms;
        if !(1_000..=10_000).contains(&slice) {
            return Err(ProctorError::Config(format!(
                "capture.chunk_interval_ms must be within 1000..=10000, got {}",
                slice
            )));
        }
        if self.upload.max_attempts == 0 {
            return Err(ProctorError::Config(
                "upload.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.upload.base_backoff_ms == 0
            || self.upload.max_backoff_ms < self.upload.base_backoff_ms
        {
            return Err(ProctorError::Config(
                "upload backoff must satisfy 0 < base_backoff_ms <= max_backoff_ms".to_string(),
            ));
        }
        if self.recording.poll_interval_ms == 0 {
            return Err(ProctorError::Config(
                "recording.poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.violations.blur_escalation_threshold == 0 {
            return Err(ProctorError::Config(
                "violations.blur_escalation_threshold must be at least 1".to_string(),
            ));
        }
        let alpha = self.analysis.smoothing;
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(ProctorError::Config(format!(
                "analysis.smoothing must be within (0, 1], got {}",
                alpha
            )));
        }
        if self.analysis.tick_ms == 0 || self.analysis.audio_window == 0 {
            return Err(ProctorError::Config(
                "analysis.tick_ms and analysis.audio_window must be greater than zero".to_string(),
            ));
        }
        if self.lockdown.max_recovery_attempts == 0 || self.lockdown.watchdog_ms == 0 {
            return Err(ProctorError::Config(
                "lockdown.max_recovery_attempts and lockdown.watchdog_ms must be greater than zero"
                    .to_string(),
            ));
        }
        Ok(())
    }

    pub fn termination_countdown(&self) -> Duration {
        Duration::from_millis(self.termination_countdown_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CapturePolicy {
    /// Time slice per chunk (1-10s)
    pub chunk_interval_ms: u64,
    /// Primary device must share its screen. Camera and microphone are
    /// always captured.
    pub require_screen_share: bool,
}

impl Default for CapturePolicy {
    fn default() -> Self {
        Self {
            chunk_interval_ms: 2_000,
            require_screen_share: true,
        }
    }
}

impl CapturePolicy {
    pub fn chunk_interval(&self) -> Duration {
        Duration::from_millis(self.chunk_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadPolicy {
    /// Attempts per chunk against an answering server
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Bounded wait for the queue to drain on teardown
    pub drain_timeout_ms: u64,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 500,
            max_backoff_ms: 8_000,
            drain_timeout_ms: 10_000,
        }
    }
}

impl UploadPolicy {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingPolicy {
    /// Staleness bound of the shared recording flag
    pub poll_interval_ms: u64,
}

impl Default for RecordingPolicy {
    fn default() -> Self {
        Self {
            poll_interval_ms: 3_000,
        }
    }
}

impl RecordingPolicy {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViolationPolicy {
    /// The Nth window blur in a session and every one after it is critical
    pub blur_escalation_threshold: u32,
    /// No user input for this long raises an inactivity warning
    pub inactivity_timeout_ms: u64,
    /// Consecutive empty analysis ticks before a face_absent warning
    pub face_absent_ticks: u32,
    /// Smoothed gaze score below this is looking away
    pub gaze_threshold: f64,
}

impl Default for ViolationPolicy {
    fn default() -> Self {
        Self {
            blur_escalation_threshold: 3,
            inactivity_timeout_ms: 60_000,
            face_absent_ticks: 20,
            gaze_threshold: 0.35,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisPolicy {
    pub tick_ms: u64,
    /// Exponential smoothing factor applied to each new raw score
    pub smoothing: f64,
    /// Automatic calibration after this delay if not triggered manually
    pub calibration_delay_ms: u64,
    /// Samples per RMS window
    pub audio_window: usize,
}

impl Default for AnalysisPolicy {
    fn default() -> Self {
        Self {
            tick_ms: 500,
            smoothing: 0.3,
            calibration_delay_ms: 5_000,
            audio_window: 1024,
        }
    }
}

impl AnalysisPolicy {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn calibration_delay(&self) -> Duration {
        Duration::from_millis(self.calibration_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockdownPolicy {
    pub max_recovery_attempts: u32,
    /// Fixed spacing between recovery attempts
    pub recovery_spacing_ms: u64,
    /// Focus loss lasting this long is a breach
    pub focus_loss_grace_ms: u64,
    pub watchdog_ms: u64,
}

impl Default for LockdownPolicy {
    fn default() -> Self {
        Self {
            max_recovery_attempts: 3,
            recovery_spacing_ms: 1_000,
            focus_loss_grace_ms: 3_000,
            watchdog_ms: 1_000,
        }
    }
}

impl LockdownPolicy {
    pub fn recovery_spacing(&self) -> Duration {
        Duration::from_millis(self.recovery_spacing_ms)
    }

    pub fn focus_loss_grace(&self) -> Duration {
        Duration::from_millis(self.focus_loss_grace_ms)
    }

    pub fn watchdog(&self) -> Duration {
        Duration::from_millis(self.watchdog_ms)
    }
}
