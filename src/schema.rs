use sea_query::Iden;

/// Metadata table - key-value store for database configuration
#[derive(Iden)]
pub enum Metadata {
    Table,
    Key,
    Value,
}

/// Sessions table - one row per proctored interview
#[derive(Iden)]
pub enum Sessions {
    Table,
    Id,
    CreatedAtMs,
    Recording,
    State,
    EndedAtMs,
}

/// Join tokens - single-use, time-limited, one per role
#[derive(Iden)]
pub enum JoinTokens {
    Table,
    Token,
    SessionId,
    Role,
    ExpiresAtMs,
    UsedAtMs,
}

/// Devices - created on token exchange, removed on disconnect
#[derive(Iden)]
pub enum Devices {
    Table,
    Credential,
    SessionId,
    Role,
    ConnectedAtMs,
    LastSeenMs,
}

/// Chunks table - individual media slices keyed by (session, role, kind, sequence)
#[derive(Iden)]
pub enum Chunks {
    Table,
    SessionId,
    DeviceRole,
    Kind,
    Sequence,
    StartedAtMs,
    DurationMs,
    Checksum,
    Payload,
    ReceivedAtMs,
}

/// Violations table - append-only integrity log
#[derive(Iden)]
pub enum Violations {
    Table,
    Id,
    SessionId,
    TimestampMs,
    ViolationType,
    Severity,
    Message,
    Source,
}

/// Analysis samples table
#[derive(Iden)]
pub enum AnalysisSamples {
    Table,
    Id,
    SessionId,
    Source,
    TimestampMs,
    GazeScore,
    HeadStabilityScore,
    AttentionScore,
    AudioLevel,
    FaceCount,
}

/// Calibrations table - at most one row per session
#[derive(Iden)]
pub enum Calibrations {
    Table,
    SessionId,
    NoseOffsetX,
    NoseOffsetY,
    YawDeg,
    PitchDeg,
    RollRad,
    CapturedAtMs,
}

/// Data loss risks - chunks a device could not deliver
#[derive(Iden)]
pub enum DataLossRisks {
    Table,
    Id,
    SessionId,
    DeviceRole,
    Kind,
    Sequence,
    Reason,
    RecordedAtMs,
}
