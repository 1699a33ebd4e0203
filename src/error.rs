//! Error types for the proctoring engine

use thiserror::Error;

use crate::types::StreamKind;

/// Join and credential failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("join token is not recognized")]
    TokenInvalid,

    #[error("join token has expired")]
    TokenExpired,

    #[error("join token has already been used")]
    TokenUsed,

    #[error("device credential is not recognized")]
    CredentialInvalid,

    #[error("role '{0}' is not permitted to perform this operation")]
    RoleNotPermitted(String),

    #[error("session has already ended")]
    SessionEnded,
}

/// Errors that can occur across the engine
#[derive(Debug, Error)]
pub enum ProctorError {
    #[error("{kind} permission denied: {remediation}")]
    PermissionDenied {
        kind: StreamKind,
        remediation: String,
    },

    #[error("{0} track ended")]
    TrackEnded(StreamKind),

    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("chunk upload failed: {0}")]
    UploadFailure(String),

    #[error("recording state poll failed: {0}")]
    StatePollFailure(String),

    #[error("behavioral analysis unavailable: {0}")]
    AnalysisUnavailable(String),

    #[error("network unreachable: {0}")]
    Network(String),

    #[error("server returned {status}: {message}")]
    Server { status: u16, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProctorError {
    /// True when the failure means the server could not be reached at all,
    /// as opposed to the server answering with an error.
    pub fn is_offline(&self) -> bool {
        matches!(self, ProctorError::Network(_))
    }
}

impl From<reqwest::Error> for ProctorError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            ProctorError::Server {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else if err.is_decode() {
            ProctorError::InvalidInput(err.to_string())
        } else {
            ProctorError::Network(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, ProctorError>;
