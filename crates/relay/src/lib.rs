//! tickrelay: Market price relay runtime components
//!
//! Connects to a combined ticker stream, downsamples ticks per symbol, batches the survivors
//! into short time windows and posts each batch to the configured webhook targets.

pub mod batcher;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod filter;
pub mod message;
pub mod metrics;
pub mod pipeline;
pub mod scheduler;
pub mod server;
pub mod shutdown;
pub mod traits;
pub mod websocket;

pub use batcher::BatchAccumulator;
pub use connection::{ConnectionManager, ConnectionPhase, ConnectionState};
pub use dispatcher::{DeliveryOutcome, Dispatcher, HttpDelivery};
pub use error::{DeliveryError, FeedError};
pub use filter::AdmissionFilter;
pub use message::{AdmittedItem, BatchPayload, Candle, PayloadItem, Tick};
pub use pipeline::Pipeline;
pub use scheduler::{FlushScheduler, OneShot};
pub use server::{create_router, run_server, ServerState};
pub use traits::{Delivery, FeedConnector, FeedSession};
pub use websocket::{BinanceConnector, BinanceSocket};
