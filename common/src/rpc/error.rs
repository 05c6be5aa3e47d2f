use serde_json::Error as SerdeError;
use thiserror::Error;

// JSON-RPC error code returned by providers enforcing request quotas
pub const RATE_LIMITED_CODE: i64 = 429;

#[derive(Error, Debug)]
pub enum JsonRpcError {
    #[error("Invalid JSON response: {}", _0)]
    ParseResponse(#[from] SerdeError),

    #[error("Server returned no result and no error")]
    MissingResult,

    #[error("Invalid value in response: {0}")]
    InvalidValue(String),

    #[error("Expected json_rpc set to '2.0'")]
    InvalidVersion,

    #[error("Server error {}: {}", code, message)]
    Server { code: i64, message: String },

    #[error("Provider rate limited the request")]
    RateLimited,

    #[error("Transport error: {}", _0)]
    Transport(#[from] reqwest::Error),
}

impl JsonRpcError {
    // Providers signal quota pressure either with HTTP 429 or with a
    // JSON-RPC error carrying the same code
    pub fn is_rate_limited(&self) -> bool {
        match self {
            Self::RateLimited => true,
            Self::Server { code, .. } => *code == RATE_LIMITED_CODE,
            Self::Transport(e) => e
                .status()
                .is_some_and(|s| s == reqwest::StatusCode::TOO_MANY_REQUESTS),
            _ => false,
        }
    }

    // Whether a retry with the same payload may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            _ => self.is_rate_limited(),
        }
    }
}
