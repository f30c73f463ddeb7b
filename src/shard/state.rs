//! Shard state tracking
//!
//! Health snapshot of every shard in a pool, shared with the health
//! endpoints. The authoritative protocol state lives in each shard's
//! `SessionState`; this is the read-mostly view.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Health status for a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardHealth {
    /// Shard is connecting
    Connecting,
    /// Shard is ready and receiving events
    Ready,
    /// Shard is resuming after disconnect
    Resuming,
    /// Shard is disconnected and will reconnect
    Disconnected,
    /// Shard was shut down and will not reconnect
    Dead,
}

impl ShardHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShardHealth::Connecting => "connecting",
            ShardHealth::Ready => "ready",
            ShardHealth::Resuming => "resuming",
            ShardHealth::Disconnected => "disconnected",
            ShardHealth::Dead => "dead",
        }
    }

    /// Returns true if the shard is healthy
    pub fn is_healthy(&self) -> bool {
        matches!(self, ShardHealth::Ready | ShardHealth::Resuming)
    }

    /// Returns true if the shard is ready to receive events
    pub fn is_ready(&self) -> bool {
        matches!(self, ShardHealth::Ready)
    }
}

/// State for a single shard
#[derive(Debug)]
pub struct ShardStateEntry {
    pub health: ShardHealth,
    pub guilds: u64,
    pub events_received: AtomicU64,
    pub reconnects: AtomicU64,
    pub last_heartbeat_ack: Option<Instant>,
    pub connected_at: Option<Instant>,
}

impl Default for ShardStateEntry {
    fn default() -> Self {
        Self {
            health: ShardHealth::Connecting,
            guilds: 0,
            events_received: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            last_heartbeat_ack: None,
            connected_at: None,
        }
    }
}

/// Point-in-time view of one shard
#[derive(Debug, Clone, Serialize)]
pub struct ShardSummary {
    pub shard_id: u32,
    pub status: &'static str,
    pub guilds: u64,
    pub events_received: u64,
    pub reconnects: u64,
    pub connected_secs: Option<u64>,
}

/// Shared state across all shards in a pool
#[derive(Debug, Clone)]
pub struct ShardState {
    inner: Arc<ShardStateInner>,
}

#[derive(Debug)]
struct ShardStateInner {
    pool_id: u32,
    shards: DashMap<u32, ShardStateEntry>,
    total_shards: u32,
}

impl ShardState {
    /// Create a new shard state tracker
    pub fn new(pool_id: u32, shard_ids: impl Iterator<Item = u32>, total_shards: u32) -> Self {
        let shards = DashMap::new();
        for shard_id in shard_ids {
            shards.insert(shard_id, ShardStateEntry::default());
        }

        Self {
            inner: Arc::new(ShardStateInner {
                pool_id,
                shards,
                total_shards,
            }),
        }
    }

    /// Get the pool ID
    pub fn pool_id(&self) -> u32 {
        self.inner.pool_id
    }

    /// Get total shards across the cluster
    pub fn total_shards(&self) -> u32 {
        self.inner.total_shards
    }

    /// Update shard health
    pub fn set_health(&self, shard_id: u32, health: ShardHealth) {
        if let Some(mut entry) = self.inner.shards.get_mut(&shard_id) {
            entry.health = health;
            match health {
                ShardHealth::Ready => {
                    if entry.connected_at.is_none() {
                        entry.connected_at = Some(Instant::now());
                    }
                }
                ShardHealth::Disconnected | ShardHealth::Dead => entry.connected_at = None,
                _ => {}
            }
        }
    }

    /// Update shard guild count
    pub fn set_guilds(&self, shard_id: u32, count: u64) {
        if let Some(mut entry) = self.inner.shards.get_mut(&shard_id) {
            entry.guilds = count;
        }
    }

    /// Increment event received counter
    pub fn record_event(&self, shard_id: u32) {
        if let Some(entry) = self.inner.shards.get(&shard_id) {
            entry.events_received.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Increment reconnect counter
    pub fn record_reconnect(&self, shard_id: u32) {
        if let Some(entry) = self.inner.shards.get(&shard_id) {
            entry.reconnects.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record heartbeat ack
    pub fn record_heartbeat_ack(&self, shard_id: u32) {
        if let Some(mut entry) = self.inner.shards.get_mut(&shard_id) {
            entry.last_heartbeat_ack = Some(Instant::now());
        }
    }

    /// Get health for a specific shard
    pub fn get_health(&self, shard_id: u32) -> Option<ShardHealth> {
        self.inner.shards.get(&shard_id).map(|e| e.health)
    }

    /// Get total events received across all shards
    pub fn total_events_received(&self) -> u64 {
        self.inner
            .shards
            .iter()
            .map(|e| e.events_received.load(Ordering::Relaxed))
            .sum()
    }

    /// Get total guilds across all shards
    pub fn total_guilds(&self) -> u64 {
        self.inner.shards.iter().map(|e| e.guilds).sum()
    }

    /// Get count of ready shards
    pub fn ready_shards(&self) -> usize {
        self.inner
            .shards
            .iter()
            .filter(|e| e.health.is_ready())
            .count()
    }

    /// Get count of healthy shards (ready or resuming)
    pub fn healthy_shards(&self) -> usize {
        self.inner
            .shards
            .iter()
            .filter(|e| e.health.is_healthy())
            .count()
    }

    /// Get count of shards that will not come back
    pub fn dead_shards(&self) -> usize {
        self.inner
            .shards
            .iter()
            .filter(|e| e.health == ShardHealth::Dead)
            .count()
    }

    /// Get total shard count in this pool
    pub fn shard_count(&self) -> usize {
        self.inner.shards.len()
    }

    /// Per-shard summaries, ordered by shard id
    pub fn snapshot(&self) -> Vec<ShardSummary> {
        let mut shards: Vec<ShardSummary> = self
            .inner
            .shards
            .iter()
            .map(|e| ShardSummary {
                shard_id: *e.key(),
                status: e.health.as_str(),
                guilds: e.guilds,
                events_received: e.events_received.load(Ordering::Relaxed),
                reconnects: e.reconnects.load(Ordering::Relaxed),
                connected_secs: e.connected_at.map(|at| at.elapsed().as_secs()),
            })
            .collect();
        shards.sort_by_key(|s| s.shard_id);
        shards
    }

    /// Check if pool is ready (at least one shard ready)
    pub fn is_ready(&self) -> bool {
        self.ready_shards() > 0
    }
}
