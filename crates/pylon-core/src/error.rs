use thiserror::Error;

#[derive(Debug, Error)]
pub enum PylonError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Invalid channel name: {0}")]
    InvalidChannel(String),

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Too many subscriptions: {count} requested (max {max})")]
    TooManySubscriptions { count: usize, max: usize },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Server at connection capacity ({max})")]
    ServerCapacity { max: usize },

    #[error("Bad command: {0}")]
    BadCommand(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PylonError {
    /// Short error code string sent to callers in wire replies.
    ///
    /// Distinct codes let clients branch on cause without string matching.
    pub fn code(&self) -> &'static str {
        match self {
            PylonError::Config(_) => "config-error",
            PylonError::AuthFailed(_) => "auth-failed",
            PylonError::InvalidChannel(_) => "invalid-channel",
            PylonError::InvalidFilter(_) => "invalid-filter",
            PylonError::TooManySubscriptions { .. } => "too-many-subscriptions",
            PylonError::Unauthorized(_) => "unauthorized",
            PylonError::ServerCapacity { .. } => "server-capacity",
            PylonError::BadCommand(_) => "bad-command",
            PylonError::Serialization(_) => "bad-command",
            PylonError::Io(_) => "io-error",
            PylonError::Internal(_) => "internal-error",
        }
    }
}

pub type Result<T> = std::result::Result<T, PylonError>;
