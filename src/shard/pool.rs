//! Shard pool implementation
//!
//! The `ShardManager` owns every shard of one pool, connects them, and
//! decides what happens after each disconnect notice: reconnect with
//! backoff, or leave the shard down.

use crate::error::GatewayError;
use crate::events::EventRouter;
use crate::metrics::GatewayMetrics;
use crate::shard::connection::{Shard, ShardConfig, ShardNotice};
use crate::shard::session::NORMAL_CLOSE;
use crate::shard::state::{ShardHealth, ShardState};

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Number of shards per gateway process (pool)
pub const SHARDS_PER_POOL: u64 = 25;

/// Consecutive failed connects or sessions before a shard is given up on
const MAX_CONSECUTIVE_ERRORS: u32 = 10;

const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Shard ids owned by `pool_id`
pub fn shard_range(pool_id: u64, total_shards: u64) -> Range<u64> {
    let start = (pool_id * SHARDS_PER_POOL).min(total_shards);
    let end = ((pool_id + 1) * SHARDS_PER_POOL).min(total_shards);
    start..end
}

/// Shard that receives events for `guild_id`
pub fn shard_for_guild(guild_id: u64, total_shards: u32) -> u32 {
    ((guild_id >> 22) % u64::from(total_shards.max(1))) as u32
}

/// Consecutive failures per shard. A socket counts as a failure until it
/// reaches READY or RESUMED; a successful TCP/websocket connect alone does not
/// reset the count.
#[derive(Debug, Default)]
struct Failures(HashMap<u32, u32>);

impl Failures {
    /// Count one more failure and return the streak length
    fn record(&mut self, shard_id: u32) -> u32 {
        let count = self.0.entry(shard_id).or_insert(0);
        *count += 1;
        *count
    }

    fn clear(&mut self, shard_id: u32) {
        self.0.remove(&shard_id);
    }
}

/// Delay before the `attempt`-th reconnect in a row. The first is immediate.
fn backoff(attempt: u32) -> Duration {
    match attempt {
        0 => Duration::ZERO,
        n => Duration::from_secs(1u64 << (n - 1).min(6)).min(MAX_BACKOFF),
    }
}

/// Pool of shards for one gateway process
pub struct ShardManager {
    pool_id: u32,
    total_shards: u32,
    shards: HashMap<u32, Arc<Shard>>,
    notices: mpsc::UnboundedReceiver<ShardNotice>,
    state: ShardState,
    metrics: Arc<GatewayMetrics>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ShardManager {
    /// Create a new shard pool
    ///
    /// # Arguments
    /// * `pool_id` - Pool identifier (0, 1, 2, ...)
    /// * `total_shards` - Total shards across all pools
    /// * `config` - Settings shared by every shard
    /// * `router` - Where decoded events go
    /// * `metrics` - Prometheus metrics
    pub fn new(
        pool_id: u64,
        total_shards: u64,
        config: Arc<ShardConfig>,
        router: Arc<EventRouter>,
        metrics: Arc<GatewayMetrics>,
    ) -> Result<Self, GatewayError> {
        let range = shard_range(pool_id, total_shards);

        info!(
            pool_id,
            start_shard = range.start,
            end_shard = range.end,
            shard_count = range.end - range.start,
            "Creating shard pool"
        );

        let pool_id_u32 =
            u32::try_from(pool_id).map_err(|_| GatewayError::ShardIdOverflow { value: pool_id })?;
        let total_shards_u32 = u32::try_from(total_shards)
            .map_err(|_| GatewayError::ShardIdOverflow { value: total_shards })?;

        let mut shard_ids = Vec::with_capacity((range.end - range.start) as usize);
        for shard_id in range {
            shard_ids.push(
                u32::try_from(shard_id)
                    .map_err(|_| GatewayError::ShardIdOverflow { value: shard_id })?,
            );
        }

        let state = ShardState::new(pool_id_u32, shard_ids.iter().copied(), total_shards_u32);
        let (notice_tx, notices) = mpsc::unbounded_channel();

        let mut shards = HashMap::with_capacity(shard_ids.len());
        for shard_id in shard_ids {
            let shard = Shard::new(
                shard_id,
                total_shards_u32,
                Arc::clone(&config),
                Arc::clone(&router),
                notice_tx.clone(),
                state.clone(),
                Arc::clone(&metrics),
            )?;
            shards.insert(shard_id, shard);
        }

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            pool_id: pool_id_u32,
            total_shards: total_shards_u32,
            shards,
            notices,
            state,
            metrics,
            shutdown_tx,
        })
    }

    /// Get the pool ID
    pub fn pool_id(&self) -> u32 {
        self.pool_id
    }

    /// Get shared state (for health checks)
    pub fn state(&self) -> ShardState {
        self.state.clone()
    }

    /// Shard owned by this pool
    pub fn shard(&self, shard_id: u32) -> Option<Arc<Shard>> {
        self.shards.get(&shard_id).cloned()
    }

    /// Shard in this pool responsible for `guild_id`, if this pool owns it
    pub fn shard_for(&self, guild_id: u64) -> Option<Arc<Shard>> {
        self.shard(shard_for_guild(guild_id, self.total_shards))
    }

    /// Sender that stops `run` when signalled
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Connect every shard and supervise them until shutdown, or until
    /// every shard is permanently down.
    pub async fn run(mut self) -> Result<(), GatewayError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut attempts: JoinSet<(u32, Result<(), GatewayError>)> = JoinSet::new();
        let mut failures = Failures::default();

        for shard in self.shards.values() {
            attempts.spawn(connect_after(Arc::clone(shard), Duration::ZERO));
        }

        while self.state.dead_shards() < self.shards.len() {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(pool_id = self.pool_id, "Shard pool received shutdown signal");
                    break;
                }
                Some(notice) = self.notices.recv() => {
                    if !notice.reconnect {
                        info!(shard_id = notice.shard_id, "Shard stopped, not reconnecting");
                        self.state.set_health(notice.shard_id, ShardHealth::Dead);
                    } else if notice.established {
                        self.state.record_reconnect(notice.shard_id);
                        failures.clear(notice.shard_id);
                        if let Some(shard) = self.shards.get(&notice.shard_id) {
                            attempts.spawn(connect_after(Arc::clone(shard), Duration::ZERO));
                        }
                    } else {
                        self.state.record_reconnect(notice.shard_id);
                        self.retry(notice.shard_id, "session ended before READY or RESUMED", &mut failures, &mut attempts);
                    }
                }
                Some(joined) = attempts.join_next(), if !attempts.is_empty() => {
                    let (shard_id, result) = match joined {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            error!(error = %e, "Connect task failed");
                            continue;
                        }
                    };
                    self.on_connect_result(shard_id, result, &mut failures, &mut attempts);
                }
            }

            self.metrics
                .set_shards_ready(self.pool_id, self.state.ready_shards());
        }

        attempts.shutdown().await;
        for shard in self.shards.values() {
            shard.disconnect(NORMAL_CLOSE, false).await;
        }
        self.metrics.set_shards_ready(self.pool_id, 0);

        info!(pool_id = self.pool_id, "Shard pool shut down");
        Ok(())
    }

    fn on_connect_result(
        &self,
        shard_id: u32,
        result: Result<(), GatewayError>,
        failures: &mut Failures,
        attempts: &mut JoinSet<(u32, Result<(), GatewayError>)>,
    ) {
        // the streak only ends once the new socket reaches READY or RESUMED
        let Err(e) = result else {
            return;
        };

        self.metrics.record_error(shard_id, e.error_type_label());
        self.retry(shard_id, &e.to_string(), failures, attempts);
    }

    /// Schedule the next attempt after a failure, or give up on the shard
    fn retry(
        &self,
        shard_id: u32,
        reason: &str,
        failures: &mut Failures,
        attempts: &mut JoinSet<(u32, Result<(), GatewayError>)>,
    ) {
        let count = failures.record(shard_id);

        // Circuit breaker: too many failures in a row
        if count >= MAX_CONSECUTIVE_ERRORS {
            error!(shard_id, consecutive = count, %reason, "Shard dead: consecutive failures");
            self.state.set_health(shard_id, ShardHealth::Dead);
            return;
        }

        let delay = backoff(count);
        warn!(shard_id, consecutive = count, ?delay, %reason, "Retrying shard");
        if let Some(shard) = self.shards.get(&shard_id) {
            attempts.spawn(connect_after(Arc::clone(shard), delay));
        }
    }
}

async fn connect_after(shard: Arc<Shard>, delay: Duration) -> (u32, Result<(), GatewayError>) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    (shard.id(), shard.reconnect().await)
}
