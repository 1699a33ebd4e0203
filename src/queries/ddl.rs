use sea_query::{ColumnDef, ForeignKey, ForeignKeyAction, Index, SqliteQueryBuilder, Table};

use crate::schema::{
    AnalysisSamples, Calibrations, Chunks, DataLossRisks, Devices, JoinTokens, Metadata, Sessions,
    Violations,
};

/// CREATE TABLE IF NOT EXISTS metadata (key TEXT PRIMARY KEY, value TEXT NOT NULL)
pub fn create_metadata_table() -> String {
    Table::create()
        .table(Metadata::Table)
        .if_not_exists()
        .col(ColumnDef::new(Metadata::Key).string().primary_key())
        .col(ColumnDef::new(Metadata::Value).string().not_null())
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS sessions (
///     id TEXT PRIMARY KEY,
///     created_at_ms INTEGER NOT NULL,
///     recording INTEGER NOT NULL DEFAULT 0,
///     state TEXT NOT NULL,
///     ended_at_ms INTEGER
/// )
pub fn create_sessions_table() -> String {
    Table::create()
        .table(Sessions::Table)
        .if_not_exists()
        .col(ColumnDef::new(Sessions::Id).string().primary_key())
        .col(ColumnDef::new(Sessions::CreatedAtMs).big_integer().not_null())
        .col(
            ColumnDef::new(Sessions::Recording)
                .integer()
                .not_null()
                .default(0),
        )
        .col(ColumnDef::new(Sessions::State).string().not_null())
        .col(ColumnDef::new(Sessions::EndedAtMs).big_integer())
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS join_tokens (
///     token TEXT PRIMARY KEY,
///     session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
///     role TEXT NOT NULL,
///     expires_at_ms INTEGER NOT NULL,
///     used_at_ms INTEGER
/// )
pub fn create_join_tokens_table() -> String {
    Table::create()
        .table(JoinTokens::Table)
        .if_not_exists()
        .col(ColumnDef::new(JoinTokens::Token).string().primary_key())
        .col(ColumnDef::new(JoinTokens::SessionId).string().not_null())
        .col(ColumnDef::new(JoinTokens::Role).string().not_null())
        .col(
            ColumnDef::new(JoinTokens::ExpiresAtMs)
                .big_integer()
                .not_null(),
        )
        .col(ColumnDef::new(JoinTokens::UsedAtMs).big_integer())
        .foreign_key(
            ForeignKey::create()
                .from(JoinTokens::Table, JoinTokens::SessionId)
                .to(Sessions::Table, Sessions::Id)
                .on_delete(ForeignKeyAction::Cascade),
        )
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS devices (
///     credential TEXT PRIMARY KEY,
///     session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
///     role TEXT NOT NULL,
///     connected_at_ms INTEGER NOT NULL,
///     last_seen_ms INTEGER NOT NULL
/// )
pub fn create_devices_table() -> String {
    Table::create()
        .table(Devices::Table)
        .if_not_exists()
        .col(ColumnDef::new(Devices::Credential).string().primary_key())
        .col(ColumnDef::new(Devices::SessionId).string().not_null())
        .col(ColumnDef::new(Devices::Role).string().not_null())
        .col(
            ColumnDef::new(Devices::ConnectedAtMs)
                .big_integer()
                .not_null(),
        )
        .col(ColumnDef::new(Devices::LastSeenMs).big_integer().not_null())
        .foreign_key(
            ForeignKey::create()
                .from(Devices::Table, Devices::SessionId)
                .to(Sessions::Table, Sessions::Id)
                .on_delete(ForeignKeyAction::Cascade),
        )
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS chunks (
///     session_id TEXT NOT NULL, device_role TEXT NOT NULL, kind TEXT NOT NULL,
///     sequence INTEGER NOT NULL, started_at_ms INTEGER NOT NULL, duration_ms INTEGER NOT NULL,
///     checksum INTEGER NOT NULL, payload BLOB NOT NULL, received_at_ms INTEGER NOT NULL,
///     PRIMARY KEY (session_id, device_role, kind, sequence)
/// )
pub fn create_chunks_table() -> String {
    Table::create()
        .table(Chunks::Table)
        .if_not_exists()
        .col(ColumnDef::new(Chunks::SessionId).string().not_null())
        .col(ColumnDef::new(Chunks::DeviceRole).string().not_null())
        .col(ColumnDef::new(Chunks::Kind).string().not_null())
        .col(ColumnDef::new(Chunks::Sequence).big_integer().not_null())
        .col(ColumnDef::new(Chunks::StartedAtMs).big_integer().not_null())
        .col(ColumnDef::new(Chunks::DurationMs).integer().not_null())
        .col(ColumnDef::new(Chunks::Checksum).big_integer().not_null())
        .col(ColumnDef::new(Chunks::Payload).blob().not_null())
        .col(
            ColumnDef::new(Chunks::ReceivedAtMs)
                .big_integer()
                .not_null(),
        )
        .primary_key(
            Index::create()
                .col(Chunks::SessionId)
                .col(Chunks::DeviceRole)
                .col(Chunks::Kind)
                .col(Chunks::Sequence),
        )
        .foreign_key(
            ForeignKey::create()
                .from(Chunks::Table, Chunks::SessionId)
                .to(Sessions::Table, Sessions::Id)
                .on_delete(ForeignKeyAction::Cascade),
        )
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS violations (...)
pub fn create_violations_table() -> String {
    Table::create()
        .table(Violations::Table)
        .if_not_exists()
        .col(ColumnDef::new(Violations::Id).string().primary_key())
        .col(ColumnDef::new(Violations::SessionId).string().not_null())
        .col(
            ColumnDef::new(Violations::TimestampMs)
                .big_integer()
                .not_null(),
        )
        .col(ColumnDef::new(Violations::ViolationType).string().not_null())
        .col(ColumnDef::new(Violations::Severity).string().not_null())
        .col(ColumnDef::new(Violations::Message).string().not_null())
        .col(ColumnDef::new(Violations::Source).string().not_null())
        .foreign_key(
            ForeignKey::create()
                .from(Violations::Table, Violations::SessionId)
                .to(Sessions::Table, Sessions::Id)
                .on_delete(ForeignKeyAction::Cascade),
        )
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS analysis_samples (...)
pub fn create_analysis_samples_table() -> String {
    Table::create()
        .table(AnalysisSamples::Table)
        .if_not_exists()
        .col(
            ColumnDef::new(AnalysisSamples::Id)
                .integer()
                .primary_key()
                .auto_increment(),
        )
        .col(ColumnDef::new(AnalysisSamples::SessionId).string().not_null())
        .col(ColumnDef::new(AnalysisSamples::Source).string().not_null())
        .col(
            ColumnDef::new(AnalysisSamples::TimestampMs)
                .big_integer()
                .not_null(),
        )
        .col(ColumnDef::new(AnalysisSamples::GazeScore).double().not_null())
        .col(
            ColumnDef::new(AnalysisSamples::HeadStabilityScore)
                .double()
                .not_null(),
        )
        .col(
            ColumnDef::new(AnalysisSamples::AttentionScore)
                .double()
                .not_null(),
        )
        .col(ColumnDef::new(AnalysisSamples::AudioLevel).double().not_null())
        .col(ColumnDef::new(AnalysisSamples::FaceCount).integer().not_null())
        .foreign_key(
            ForeignKey::create()
                .from(AnalysisSamples::Table, AnalysisSamples::SessionId)
                .to(Sessions::Table, Sessions::Id)
                .on_delete(ForeignKeyAction::Cascade),
        )
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS calibrations (session_id TEXT PRIMARY KEY, ...)
pub fn create_calibrations_table() -> String {
    Table::create()
        .table(Calibrations::Table)
        .if_not_exists()
        .col(ColumnDef::new(Calibrations::SessionId).string().primary_key())
        .col(ColumnDef::new(Calibrations::NoseOffsetX).double().not_null())
        .col(ColumnDef::new(Calibrations::NoseOffsetY).double().not_null())
        .col(ColumnDef::new(Calibrations::YawDeg).double().not_null())
        .col(ColumnDef::new(Calibrations::PitchDeg).double().not_null())
        .col(ColumnDef::new(Calibrations::RollRad).double().not_null())
        .col(
            ColumnDef::new(Calibrations::CapturedAtMs)
                .big_integer()
                .not_null(),
        )
        .foreign_key(
            ForeignKey::create()
                .from(Calibrations::Table, Calibrations::SessionId)
                .to(Sessions::Table, Sessions::Id)
                .on_delete(ForeignKeyAction::Cascade),
        )
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS data_loss_risks (...)
pub fn create_data_loss_risks_table() -> String {
    Table::create()
        .table(DataLossRisks::Table)
        .if_not_exists()
        .col(
            ColumnDef::new(DataLossRisks::Id)
                .integer()
                .primary_key()
                .auto_increment(),
        )
        .col(ColumnDef::new(DataLossRisks::SessionId).string().not_null())
        .col(ColumnDef::new(DataLossRisks::DeviceRole).string().not_null())
        .col(ColumnDef::new(DataLossRisks::Kind).string().not_null())
        .col(ColumnDef::new(DataLossRisks::Sequence).big_integer().not_null())
        .col(ColumnDef::new(DataLossRisks::Reason).string().not_null())
        .col(
            ColumnDef::new(DataLossRisks::RecordedAtMs)
                .big_integer()
                .not_null(),
        )
        .foreign_key(
            ForeignKey::create()
                .from(DataLossRisks::Table, DataLossRisks::SessionId)
                .to(Sessions::Table, Sessions::Id)
                .on_delete(ForeignKeyAction::Cascade),
        )
        .to_string(SqliteQueryBuilder)
}

/// CREATE INDEX IF NOT EXISTS idx_violations_session ON violations(session_id, timestamp_ms)
pub fn create_violations_session_index() -> String {
    Index::create()
        .if_not_exists()
        .name("idx_violations_session")
        .table(Violations::Table)
        .col(Violations::SessionId)
        .col(Violations::TimestampMs)
        .to_string(SqliteQueryBuilder)
}

/// CREATE INDEX IF NOT EXISTS idx_devices_session ON devices(session_id)
pub fn create_devices_session_index() -> String {
    Index::create()
        .if_not_exists()
        .name("idx_devices_session")
        .table(Devices::Table)
        .col(Devices::SessionId)
        .to_string(SqliteQueryBuilder)
}

/// All schema statements in dependency order
pub fn all_statements() -> Vec<String> {
    vec![
        create_metadata_table(),
        create_sessions_table(),
        create_join_tokens_table(),
        create_devices_table(),
        create_chunks_table(),
        create_violations_table(),
        create_analysis_samples_table(),
        create_calibrations_table(),
        create_data_loss_risks_table(),
        create_violations_session_index(),
        create_devices_session_index(),
    ]
}
