use thiserror::Error;

/// Result type alias for upstream operations
pub type Result<T, E = ApiError> = std::result::Result<T, E>;

/// Errors surfaced by the request orchestration layer.
///
/// Cloneable so that single-flight joiners can all observe the same failure.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApiError {
    /// The signing oracle produced empty or unusable output. Never retried
    /// internally; an unsigned request would only trip risk control faster.
    #[error("signing failed: {0}")]
    SigningFailed(String),

    #[error("upstream timeout: {0}")]
    Timeout(String),

    #[error("upstream transport error: {0}")]
    Transport(String),

    /// The upstream answered with a non-zero business code.
    #[error("upstream error {code}: {message}")]
    Upstream { code: i64, message: String },

    #[error("upstream did not return search_id")]
    MissingSearchId,

    /// Fails the affected chapter only, never a whole batch.
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),

    /// An in-flight computation was dropped before broadcasting its outcome.
    #[error("in-flight request dropped before completion")]
    FlightDropped,

    #[error("shutting down")]
    Shutdown,
}

impl ApiError {
    /// Numeric code for the response envelope. Upstream business errors keep
    /// the upstream's own code; local failures map to stable negative codes.
    pub fn code(&self) -> i64 {
        match self {
            ApiError::Upstream { code, .. } => *code,
            ApiError::SigningFailed(_) => -2,
            ApiError::Timeout(_) | ApiError::Transport(_) => -3,
            ApiError::MissingSearchId => -4,
            ApiError::DecryptionFailed(_) => -5,
            ApiError::InvalidResponse(_) => -6,
            ApiError::FlightDropped => -7,
            ApiError::Shutdown => -8,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout(err.to_string())
        } else {
            ApiError::Transport(err.to_string())
        }
    }
}
