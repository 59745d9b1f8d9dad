use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Command rejected ({code}): {message}")]
    Rejected { code: String, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, ClientError>;
