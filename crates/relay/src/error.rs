use thiserror::Error;

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("invalid feed url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("connection closed")]
    ConnectionClosed,
}

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("endpoint returned status {status}")]
    Status { status: u16 },
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}
