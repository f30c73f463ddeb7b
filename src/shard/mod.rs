//! Shard management module
//!
//! One `Shard` per gateway session, grouped into pools of
//! `SHARDS_PER_POOL` under a `ShardManager`.

mod connection;
mod pool;
pub mod session;
mod state;

pub use connection::{Shard, ShardConfig, ShardNotice};
pub use pool::{shard_for_guild, shard_range, ShardManager, SHARDS_PER_POOL};
pub use session::{Phase, SessionState};
pub use state::{ShardHealth, ShardState, ShardSummary};
