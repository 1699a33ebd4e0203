use sea_query::{Expr, OnConflict, Query, SqliteQueryBuilder};

use crate::schema::{AnalysisSamples, Calibrations};
use crate::types::{AnalysisSample, Calibration};

/// INSERT INTO analysis_samples (session_id, source, timestamp_ms, gaze_score, ...) VALUES (...)
pub fn insert_sample(sample: &AnalysisSample) -> String {
    Query::insert()
        .into_table(AnalysisSamples::Table)
        .columns([
            AnalysisSamples::SessionId,
            AnalysisSamples::Source,
            AnalysisSamples::TimestampMs,
            AnalysisSamples::GazeScore,
            AnalysisSamples::HeadStabilityScore,
            AnalysisSamples::AttentionScore,
            AnalysisSamples::AudioLevel,
            AnalysisSamples::FaceCount,
        ])
        .values_panic([
            sample.session_id.as_str().into(),
            sample.source.as_str().into(),
            sample.timestamp_ms.into(),
            sample.gaze_score.into(),
            sample.head_stability_score.into(),
            sample.attention_score.into(),
            sample.audio_level.into(),
            (sample.face_count as i64).into(),
        ])
        .to_string(SqliteQueryBuilder)
}

/// INSERT INTO calibrations (...) VALUES (...) ON CONFLICT DO NOTHING
///
/// The first calibration of a session wins; later ones are ignored.
pub fn insert_calibration_or_ignore(calibration: &Calibration) -> String {
    Query::insert()
        .into_table(Calibrations::Table)
        .columns([
            Calibrations::SessionId,
            Calibrations::NoseOffsetX,
            Calibrations::NoseOffsetY,
            Calibrations::YawDeg,
            Calibrations::PitchDeg,
            Calibrations::RollRad,
            Calibrations::CapturedAtMs,
        ])
        .values_panic([
            calibration.session_id.as_str().into(),
            calibration.nose_offset_x.into(),
            calibration.nose_offset_y.into(),
            calibration.yaw_deg.into(),
            calibration.pitch_deg.into(),
            calibration.roll_rad.into(),
            calibration.captured_at_ms.into(),
        ])
        .on_conflict(OnConflict::new().do_nothing().to_owned())
        .to_string(SqliteQueryBuilder)
}

/// SELECT ... FROM calibrations WHERE session_id = ?
pub fn select_calibration(session_id: &str) -> String {
    Query::select()
        .columns([
            Calibrations::SessionId,
            Calibrations::NoseOffsetX,
            Calibrations::NoseOffsetY,
            Calibrations::YawDeg,
            Calibrations::PitchDeg,
            Calibrations::RollRad,
            Calibrations::CapturedAtMs,
        ])
        .from(Calibrations::Table)
        .and_where(Expr::col(Calibrations::SessionId).eq(session_id))
        .to_string(SqliteQueryBuilder)
}
