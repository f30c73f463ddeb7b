//! Rate-limit coordination
//!
//! `RateLimiter` is the bucket registry shared by the REST executor (and
//! anything else that learns cooldowns from the server). `CommandThrottle`
//! is the degenerate single-discriminator form used per shard for outbound
//! gateway commands.

mod bucket;
mod throttle;

pub use bucket::{Discriminator, RateLimiter};
pub use throttle::{CommandThrottle, COMMAND_WINDOW, DEFAULT_COMMAND_LIMIT};
