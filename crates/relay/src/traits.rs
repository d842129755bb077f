use async_trait::async_trait;

use crate::error::{DeliveryError, FeedError};
use crate::message::BatchPayload;

/// One live subscription to the upstream feed
#[async_trait]
pub trait FeedSession: Send {
    /// Wait for the next text frame. Returns an error once the transport closes or fails.
    async fn next_frame(&mut self) -> Result<String, FeedError>;

    /// Send a liveness probe
    async fn heartbeat(&mut self) -> Result<(), FeedError>;

    /// Close the connection
    async fn close(&mut self) -> Result<(), FeedError>;
}

/// Opens feed sessions (WebSocket in production, scripted in tests)
#[async_trait]
pub trait FeedConnector: Send + Sync {
    type Session: FeedSession;

    /// Open a connection already subscribed to the configured stream set
    async fn connect(&self) -> Result<Self::Session, FeedError>;
}

/// Delivery trait for downstream endpoints (webhook POST in production)
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, endpoint: &str, payload: &BatchPayload) -> Result<(), DeliveryError>;
}
