//! Behavioral analysis
//!
//! Scores are computed from face landmark geometry only. The nose tip offset
//! from the eye midpoint, normalized by inter-ocular distance, approximates
//! head yaw and pitch; the eye-line angle approximates roll. Raw scores are
//! smoothed with an exponential moving average before they are reported.

use async_trait::async_trait;
use log::{debug, info, warn};
use std::f64::consts::PI;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::api::ProctorApi;
use crate::config::AnalysisPolicy;
use crate::context::{DegradedComponent, DeviceEvent};
use crate::error::Result;
use crate::types::{locked, now_ms, AnalysisSample, Calibration, DeviceRole};
use crate::violation::{PlatformSignal, ViolationEngine};

/// Nose offset of a frontal face when no calibration exists
const NEUTRAL_OFFSET: (f64, f64) = (0.0, 0.55);
const GAZE_RANGE: f64 = 0.35;
const ATTENTION_RANGE: f64 = 0.5;
/// Radians of eye-line tilt that zero the stability score
const ROLL_RANGE: f64 = 0.5;
const DEGREES_PER_OFFSET: f64 = 90.0;
/// dBFS mapped to an audio level of 0
const AUDIO_FLOOR_DB: f64 = -60.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// The three landmarks the heuristic needs, in image coordinates (y down)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceLandmarks {
    pub left_eye: Point,
    pub right_eye: Point,
    pub nose_tip: Point,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LandmarkFrame {
    pub faces: Vec<FaceLandmarks>,
}

/// Face detector and microphone access on the device
#[async_trait]
pub trait LandmarkSource: Send + Sync {
    /// Landmarks of the most recent camera frame.
    /// A detector failure is [`crate::error::ProctorError::AnalysisUnavailable`].
    async fn latest_frame(&self) -> Result<LandmarkFrame>;

    /// Most recent `len` microphone samples in [-1, 1]
    fn audio_window(&self, len: usize) -> Option<Vec<f32>>;
}

/// Head pose relative to the eye line
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeadPose {
    pub offset_x: f64,
    pub offset_y: f64,
    pub roll: f64,
}

impl HeadPose {
    /// `None` when the eyes coincide and no scale can be derived
    pub fn from_landmarks(face: &FaceLandmarks) -> Option<Self> {
        let dx = face.right_eye.x - face.left_eye.x;
        let dy = face.right_eye.y - face.left_eye.y;
        let distance = dx.hypot(dy);
        if distance < f64::EPSILON {
            return None;
        }
        let mid_x = (face.left_eye.x + face.right_eye.x) / 2.0;
        let mid_y = (face.left_eye.y + face.right_eye.y) / 2.0;
        Some(Self {
            offset_x: (face.nose_tip.x - mid_x) / distance,
            offset_y: (face.nose_tip.y - mid_y) / distance,
            roll: dy.atan2(dx),
        })
    }
}

fn clamp_unit(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

/// Tilt between two eye-line angles. The eye line has no direction, so the
/// difference folds into [0, π/2] whichever eye the detector lists first.
fn roll_difference(a: f64, b: f64) -> f64 {
    let d = (a - b).rem_euclid(PI);
    d.min(PI - d)
}

/// RMS of a sample window mapped to 0..=100
pub fn audio_level(samples: &[f32]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mean_square =
        samples.iter().map(|s| f64::from(*s).powi(2)).sum::<f64>() / samples.len() as f64;
    let rms = mean_square.sqrt();
    if rms <= 0.0 {
        return 0.0;
    }
    let db = 20.0 * rms.log10();
    ((db - AUDIO_FLOOR_DB) / -AUDIO_FLOOR_DB * 100.0).clamp(0.0, 100.0)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scores {
    pub gaze: f64,
    pub head_stability: f64,
    pub attention: f64,
}

impl Default for Scores {
    fn default() -> Self {
        Self {
            gaze: 1.0,
            head_stability: 1.0,
            attention: 1.0,
        }
    }
}

/// Per-device scoring state
pub struct BehaviorAnalyzer {
    session_id: String,
    source: DeviceRole,
    policy: AnalysisPolicy,
    calibration: Option<Calibration>,
    scores: Scores,
}

impl BehaviorAnalyzer {
    pub fn new(session_id: String, source: DeviceRole, policy: AnalysisPolicy) -> Self {
        Self {
            session_id,
            source,
            policy,
            calibration: None,
            scores: Scores::default(),
        }
    }

    pub fn scores(&self) -> Scores {
        self.scores
    }

    pub fn calibration(&self) -> Option<&Calibration> {
        self.calibration.as_ref()
    }

    fn baseline(&self) -> (f64, f64, f64) {
        match &self.calibration {
            Some(c) => (c.nose_offset_x, c.nose_offset_y, c.roll_rad),
            None => (NEUTRAL_OFFSET.0, NEUTRAL_OFFSET.1, 0.0),
        }
    }

    fn raw_scores(&self, pose: &HeadPose) -> Scores {
        let (base_x, base_y, base_roll) = self.baseline();
        let deviation = (pose.offset_x - base_x).hypot(pose.offset_y - base_y);
        let head_stability = clamp_unit(1.0 - roll_difference(pose.roll, base_roll) / ROLL_RANGE);
        Scores {
            gaze: clamp_unit(1.0 - deviation / GAZE_RANGE),
            head_stability,
            attention: 0.7 * clamp_unit(1.0 - deviation / ATTENTION_RANGE)
                + 0.3 * head_stability,
        }
    }

    /// Score one frame. Without a usable face the smoothed scores are kept.
    pub fn observe(&mut self, frame: &LandmarkFrame, audio: Option<&[f32]>) -> AnalysisSample {
        if let Some(pose) = frame.faces.first().and_then(HeadPose::from_landmarks) {
            let raw = self.raw_scores(&pose);
            let alpha = self.policy.smoothing;
            let smooth = |prev: f64, next: f64| alpha * next + (1.0 - alpha) * prev;
            self.scores = Scores {
                gaze: smooth(self.scores.gaze, raw.gaze),
                head_stability: smooth(self.scores.head_stability, raw.head_stability),
                attention: smooth(self.scores.attention, raw.attention),
            };
        }
        AnalysisSample {
            session_id: self.session_id.clone(),
            source: self.source,
            timestamp_ms: now_ms(),
            gaze_score: self.scores.gaze,
            head_stability_score: self.scores.head_stability,
            attention_score: self.scores.attention,
            audio_level: audio.map(audio_level).unwrap_or(0.0),
            face_count: frame.faces.len() as u32,
        }
    }

    /// Capture the baseline from a frame. Returns `None` if already calibrated
    /// or no usable face is visible.
    pub fn calibrate(&mut self, frame: &LandmarkFrame) -> Option<Calibration> {
        if self.calibration.is_some() {
            return None;
        }
        let pose = frame.faces.first().and_then(HeadPose::from_landmarks)?;
        let calibration = Calibration {
            session_id: self.session_id.clone(),
            nose_offset_x: pose.offset_x,
            nose_offset_y: pose.offset_y,
            yaw_deg: DEGREES_PER_OFFSET * (pose.offset_x - NEUTRAL_OFFSET.0),
            pitch_deg: DEGREES_PER_OFFSET * (pose.offset_y - NEUTRAL_OFFSET.1),
            roll_rad: pose.roll,
            captured_at_ms: now_ms(),
        };
        info!(
            "[Analysis] Calibrated (yaw {:.1}°, pitch {:.1}°)",
            calibration.yaw_deg, calibration.pitch_deg
        );
        self.calibration = Some(calibration.clone());
        Some(calibration)
    }

    /// Replace the local baseline with the session one, which may have been
    /// captured on another device
    pub fn adopt(&mut self, calibration: Calibration) {
        if self.calibration.as_ref() != Some(&calibration) {
            debug!(
                "[Analysis] Adopting session baseline (yaw {:.1}°, pitch {:.1}°)",
                calibration.yaw_deg, calibration.pitch_deg
            );
        }
        self.calibration = Some(calibration);
    }
}

pub enum AnalysisReport {
    Sample(AnalysisSample),
    Calibration(Calibration),
}

/// Forward analysis output to the server. Samples are best effort.
///
/// The server answers a calibration with the session baseline; the analyzer
/// adopts it so every device scores against the same reference. Offline, the
/// local baseline stays.
pub async fn run_analysis_reporter(
    api: Arc<dyn ProctorApi>,
    credential: String,
    analyzer: Arc<Mutex<BehaviorAnalyzer>>,
    events: broadcast::Sender<DeviceEvent>,
    mut reports: mpsc::Receiver<AnalysisReport>,
) {
    while let Some(report) = reports.recv().await {
        match report {
            AnalysisReport::Sample(sample) => {
                if let Err(e) = api.report_analysis(&credential, &sample).await {
                    debug!("[Analysis] Sample not reported: {}", e);
                }
            }
            AnalysisReport::Calibration(calibration) => {
                let baseline = match api.report_calibration(&credential, &calibration).await {
                    Ok(ack) => {
                        if ack.stored {
                            debug!("[Analysis] Calibration stored");
                        } else {
                            info!("[Analysis] Session already calibrated, adopting its baseline");
                        }
                        locked(&analyzer).adopt(ack.baseline.clone());
                        ack.baseline
                    }
                    Err(e) => {
                        warn!("[Analysis] Calibration not reported: {}", e);
                        calibration
                    }
                };
                let _ = events.send(DeviceEvent::Calibrated(baseline));
            }
        }
    }
}

/// Everything the analysis tick needs
pub struct AnalysisLoop {
    pub analyzer: Arc<Mutex<BehaviorAnalyzer>>,
    pub source: Arc<dyn LandmarkSource>,
    pub engine: Arc<ViolationEngine>,
    pub reports: mpsc::Sender<AnalysisReport>,
    pub events: broadcast::Sender<DeviceEvent>,
    pub policy: AnalysisPolicy,
}

impl AnalysisLoop {
    pub async fn run(self, cancel: CancellationToken) {
        let started = Instant::now();
        let mut ticker = tokio::time::interval(self.policy.tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut degraded = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = self.source.latest_frame() => frame,
            };
            let frame = match frame {
                Ok(frame) => {
                    if degraded {
                        degraded = false;
                        info!("[Analysis] Landmark detector available again");
                        let _ = self.events.send(DeviceEvent::Recovered {
                            component: DegradedComponent::Analysis,
                        });
                    }
                    frame
                }
                Err(e) => {
                    if !degraded {
                        degraded = true;
                        warn!("[Analysis] {}; continuing without samples", e);
                        let _ = self.events.send(DeviceEvent::Degraded {
                            component: DegradedComponent::Analysis,
                            reason: e.to_string(),
                        });
                    }
                    continue;
                }
            };

            self.tick(&frame, started.elapsed() >= self.policy.calibration_delay());
        }
        debug!("[Analysis] Loop stopped");
    }

    fn tick(&self, frame: &LandmarkFrame, calibration_due: bool) {
        let audio = self.source.audio_window(self.policy.audio_window);
        let (sample, calibration) = {
            let mut analyzer = locked(&self.analyzer);
            let calibration = if calibration_due {
                analyzer.calibrate(frame)
            } else {
                None
            };
            (analyzer.observe(frame, audio.as_deref()), calibration)
        };

        if let Some(calibration) = calibration {
            if let Err(e) = self.reports.try_send(AnalysisReport::Calibration(calibration)) {
                warn!("[Analysis] Report channel full, calibration not sent");
                if let AnalysisReport::Calibration(calibration) = e.into_inner() {
                    let _ = self.events.send(DeviceEvent::Calibrated(calibration));
                }
            }
        }

        self.engine.ingest(&PlatformSignal::FaceCount(sample.face_count));
        if sample.face_count > 0 {
            self.engine.ingest(&PlatformSignal::Gaze(sample.gaze_score));
        }
        if self.reports.try_send(AnalysisReport::Sample(sample)).is_err() {
            debug!("[Analysis] Report channel full, sample dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frontal() -> FaceLandmarks {
        FaceLandmarks {
            left_eye: Point::new(100.0, 100.0),
            right_eye: Point::new(200.0, 100.0),
            nose_tip: Point::new(150.0, 155.0),
        }
    }

    fn turned() -> FaceLandmarks {
        FaceLandmarks {
            nose_tip: Point::new(195.0, 155.0),
            ..frontal()
        }
    }

    fn analyzer() -> BehaviorAnalyzer {
        BehaviorAnalyzer::new("s".into(), DeviceRole::Primary, AnalysisPolicy::default())
    }

    #[test]
    fn frontal_face_matches_neutral_offset() {
        let pose = HeadPose::from_landmarks(&frontal()).unwrap();
        assert!((pose.offset_x - 0.0).abs() < 1e-9);
        assert!((pose.offset_y - 0.55).abs() < 1e-9);
        assert!(pose.roll.abs() < 1e-9);
    }

    #[test]
    fn degenerate_eyes_have_no_pose() {
        let face = FaceLandmarks {
            left_eye: Point::new(1.0, 1.0),
            right_eye: Point::new(1.0, 1.0),
            nose_tip: Point::new(1.0, 2.0),
        };
        assert!(HeadPose::from_landmarks(&face).is_none());
    }

    #[test]
    fn no_face_ticks_keep_scores() {
        let mut analyzer = analyzer();
        analyzer.observe(&LandmarkFrame { faces: vec![turned()] }, None);
        let before = analyzer.scores();
        for _ in 0..5 {
            let sample = analyzer.observe(&LandmarkFrame::default(), None);
            assert_eq!(sample.face_count, 0);
        }
        assert_eq!(analyzer.scores(), before);
    }

    #[test]
    fn turning_away_lowers_gaze_gradually() {
        let mut analyzer = analyzer();
        let frame = LandmarkFrame { faces: vec![turned()] };
        let first = analyzer.observe(&frame, None).gaze_score;
        let second = analyzer.observe(&frame, None).gaze_score;
        // raw gaze is 0 for a 0.45 offset; EMA with alpha 0.3 from 1.0
        assert!((first - 0.7).abs() < 1e-9);
        assert!((second - 0.49).abs() < 1e-9);
    }

    #[test]
    fn calibration_is_taken_once() {
        let mut analyzer = analyzer();
        assert!(analyzer.calibrate(&LandmarkFrame::default()).is_none());

        let calibration = analyzer
            .calibrate(&LandmarkFrame { faces: vec![turned()] })
            .unwrap();
        assert!((calibration.yaw_deg - 40.5).abs() < 1e-9);
        assert!(calibration.pitch_deg.abs() < 1e-9);
        assert!(analyzer
            .calibrate(&LandmarkFrame { faces: vec![frontal()] })
            .is_none());

        // the turned pose is now the reference
        let sample = analyzer.observe(&LandmarkFrame { faces: vec![turned()] }, None);
        assert!((sample.gaze_score - 1.0).abs() < 1e-9);
    }

    /// Eyes listed right to left put the eye line along -x, where atan2 flips
    /// between +π and -π on a one degree tilt
    fn mirrored(tilt_deg: f64) -> FaceLandmarks {
        let rise = 100.0 * tilt_deg.to_radians().tan();
        FaceLandmarks {
            left_eye: Point::new(200.0, 100.0),
            right_eye: Point::new(100.0, 100.0 + rise),
            nose_tip: Point::new(150.0, 155.0),
        }
    }

    #[test]
    fn roll_near_half_turn_is_a_small_tilt() {
        let up = HeadPose::from_landmarks(&mirrored(1.0)).unwrap();
        let down = HeadPose::from_landmarks(&mirrored(-1.0)).unwrap();
        assert!(up.roll > 3.0);
        assert!(down.roll < -3.0);

        let uncalibrated = analyzer();
        assert!(uncalibrated.raw_scores(&up).head_stability > 0.9);
        assert!(uncalibrated.raw_scores(&down).head_stability > 0.9);

        let mut calibrated = analyzer();
        calibrated
            .calibrate(&LandmarkFrame { faces: vec![mirrored(1.0)] })
            .unwrap();
        // two degrees apart across the ±π seam
        let stability = calibrated.raw_scores(&down).head_stability;
        assert!((stability - (1.0 - 2f64.to_radians() / ROLL_RANGE)).abs() < 1e-6);
    }

    #[test]
    fn adopted_baseline_replaces_local_one() {
        let mut primary = analyzer();
        let session = primary
            .calibrate(&LandmarkFrame { faces: vec![frontal()] })
            .unwrap();

        let mut secondary = analyzer();
        secondary
            .calibrate(&LandmarkFrame { faces: vec![turned()] })
            .unwrap();
        secondary.adopt(session.clone());
        assert_eq!(secondary.calibration(), Some(&session));

        // the frontal pose is the reference again
        let scores = secondary.raw_scores(&HeadPose::from_landmarks(&frontal()).unwrap());
        assert!((scores.gaze - 1.0).abs() < 1e-9);
    }

    #[test]
    fn audio_level_maps_decibels() {
        assert_eq!(audio_level(&[]), 0.0);
        assert_eq!(audio_level(&[0.0; 64]), 0.0);
        assert!((audio_level(&[1.0, -1.0, 1.0, -1.0]) - 100.0).abs() < 1e-9);
        // -20 dBFS
        let level = audio_level(&[0.1, -0.1, 0.1, -0.1]);
        assert!((level - 200.0 / 3.0).abs() < 1e-6);
        assert_eq!(audio_level(&[0.0001; 16]), 0.0);
    }
}
