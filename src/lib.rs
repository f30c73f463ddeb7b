//! Arrakis Transport - Discord gateway sessions and rate-limited REST
//!
//! - Sharded gateway sessions over zlib-stream websockets, with heartbeats,
//!   resume and zombie detection
//! - A bucket rate limiter shared by the REST executor
//! - A per-shard command throttle
//! - Optional NATS publishing of dispatched events

pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod http;
pub mod metrics;
pub mod nats;
pub mod ratelimit;
pub mod shard;

pub use codec::{GatewayPayload, Inflater, OpCode};
pub use config::GatewayConfig;
pub use error::{GatewayError, HttpError};
pub use events::{EventDispatcher, EventRouter};
pub use http::{HttpConfig, RequestExecutor, Route};
pub use ratelimit::{CommandThrottle, Discriminator, RateLimiter};
pub use shard::{Shard, ShardConfig, ShardManager};
