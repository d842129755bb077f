//! tickrelay-config: Static configuration record for the relay

pub mod error;
pub mod interval;
pub mod relay;

pub use error::ConfigError;
pub use interval::Interval;
pub use relay::{
    BatchConfig, DeliveryConfig, FeedConfig, FilterConfig, RelayConfig, ServerConfig, StreamKind,
    TargetConfig,
};
