//! Bucket registry
//!
//! Buckets are learned from the server only after a request completes, so
//! matching is deliberately conservative: a pending request waits on any
//! active cooldown for its known bucket, any cooldown sharing a channel,
//! guild or webhook identifier with it, and any global cooldown.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

/// How long a learned route -> bucket mapping survives without being seen
pub const ROUTE_TTL: Duration = Duration::from_secs(60 * 60);

/// Minimum spacing between sweeps of expired route mappings
const ROUTE_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// What a request (or gateway command) is about, for affinity matching
/// before the server has told us its bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Discriminator {
    /// Path template, e.g. `/channels/{channel_id}/messages`
    pub route: String,
    /// Concrete path with identifiers substituted
    pub path: String,
    pub channel_id: Option<String>,
    pub guild_id: Option<String>,
    pub webhook_id: Option<String>,
    pub webhook_token: Option<String>,
}

impl Discriminator {
    /// Key under which a server-reported bucket is remembered: the route
    /// template plus its major parameter, since limits are partitioned by it.
    pub fn affinity_key(&self) -> String {
        let major = self
            .channel_id
            .as_deref()
            .or(self.guild_id.as_deref())
            .or(self.webhook_id.as_deref())
            .unwrap_or("");
        format!("{}:{major}", self.route)
    }

    /// True when the two share a concrete path or any identifier that both
    /// actually carry.
    pub fn overlaps(&self, other: &Discriminator) -> bool {
        fn same(a: &Option<String>, b: &Option<String>) -> bool {
            matches!((a, b), (Some(a), Some(b)) if a == b)
        }

        (!self.path.is_empty() && self.path == other.path)
            || same(&self.channel_id, &other.channel_id)
            || same(&self.guild_id, &other.guild_id)
            || same(&self.webhook_id, &other.webhook_id)
            || same(&self.webhook_token, &other.webhook_token)
    }
}

/// One active cooldown
#[derive(Debug)]
struct Cooldown {
    bucket: String,
    scope: Discriminator,
    global: bool,
    until: Instant,
    released: watch::Receiver<bool>,
}

impl Cooldown {
    /// Suspend until the cooldown's expiry task releases it. Dropping the
    /// returned future deregisters the waiter.
    async fn wait(&self) {
        let mut released = self.released.clone();
        // a dropped sender means the runtime is going away; treat as released
        let _ = released.wait_for(|done| *done).await;
    }
}

/// Bucket id the server reported for a route, and when it last did
#[derive(Debug)]
struct LearnedRoute {
    bucket: String,
    seen: Instant,
}

impl LearnedRoute {
    fn is_live(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.seen) < ROUTE_TTL
    }
}

/// Shared cooldown coordinator
#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    inner: Arc<RateLimiterInner>,
}

#[derive(Debug, Default)]
struct RateLimiterInner {
    /// bucket id -> active cooldown (at most one per id)
    buckets: DashMap<String, Arc<Cooldown>>,
    /// affinity key -> bucket id reported by the server; entries expire
    /// after `ROUTE_TTL` and are swept on `learn`
    routes: DashMap<String, LearnedRoute>,
    last_sweep: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Proceed immediately, or suspend until every cooldown matching `key`
    /// has cleared.
    pub async fn acquire(&self, key: &Discriminator) {
        while let Some(cooldown) = self.find_blocking(key) {
            if cooldown.global {
                debug!(path = %key.path, "Blocking request due to global rate limit");
            } else {
                debug!(bucket = %cooldown.bucket, path = %key.path, "Blocking request to bucket prematurely");
            }
            cooldown.wait().await;
        }
    }

    /// Register (or join) a cooldown for `bucket` and suspend the caller
    /// until it clears.
    pub async fn report_limited(
        &self,
        key: &Discriminator,
        bucket: &str,
        reset_after: Duration,
        global: bool,
    ) {
        self.learn(key, bucket);

        let (cooldown, sender) = match self.inner.buckets.entry(bucket.to_string()) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), None),
            Entry::Vacant(entry) => {
                let (tx, rx) = watch::channel(false);
                let cooldown = Arc::new(Cooldown {
                    bucket: bucket.to_string(),
                    scope: key.clone(),
                    global,
                    until: Instant::now() + reset_after,
                    released: rx,
                });
                entry.insert(Arc::clone(&cooldown));
                (cooldown, Some(tx))
            }
        };

        match sender {
            Some(tx) => {
                debug!(bucket, ?reset_after, global, "Blocking bucket after rate limit");
                self.schedule_expiry(Arc::clone(&cooldown), tx);
            }
            None => debug!(bucket, "Bucket already cooling down, waiting on it"),
        }

        cooldown.wait().await;
    }

    /// Remember which bucket a route belongs to
    pub fn learn(&self, key: &Discriminator, bucket: &str) {
        if key.route.is_empty() {
            return;
        }
        let now = Instant::now();
        self.sweep_routes(now);

        match self.inner.routes.entry(key.affinity_key()) {
            Entry::Occupied(mut entry) => {
                let learned = entry.get_mut();
                if learned.bucket != bucket {
                    learned.bucket = bucket.to_string();
                }
                learned.seen = now;
            }
            Entry::Vacant(entry) => {
                entry.insert(LearnedRoute { bucket: bucket.to_string(), seen: now });
            }
        }
    }

    /// Bucket id learned for a request, if any and not expired
    pub fn bucket_for(&self, key: &Discriminator) -> Option<String> {
        let now = Instant::now();
        self.inner
            .routes
            .get(&key.affinity_key())
            .filter(|learned| learned.is_live(now))
            .map(|learned| learned.bucket.clone())
    }

    /// Number of route mappings currently held, expired ones included until
    /// the next sweep
    pub fn learned_routes(&self) -> usize {
        self.inner.routes.len()
    }

    /// Number of cooldowns currently registered
    pub fn active_buckets(&self) -> usize {
        self.inner.buckets.len()
    }

    /// True when `acquire(key)` would suspend right now
    pub fn is_limited(&self, key: &Discriminator) -> bool {
        self.find_blocking(key).is_some()
    }

    fn find_blocking(&self, key: &Discriminator) -> Option<Arc<Cooldown>> {
        if let Some(bucket) = self.bucket_for(key) {
            if let Some(cooldown) = self.inner.buckets.get(&bucket) {
                return Some(Arc::clone(cooldown.value()));
            }
        }

        let overlapping = self
            .inner
            .buckets
            .iter()
            .find(|entry| entry.scope.overlaps(key))
            .map(|entry| Arc::clone(entry.value()));
        if overlapping.is_some() {
            return overlapping;
        }

        self.inner
            .buckets
            .iter()
            .find(|entry| entry.global)
            .map(|entry| Arc::clone(entry.value()))
    }

    fn sweep_routes(&self, now: Instant) {
        {
            let mut last = self.inner.last_sweep.lock().unwrap_or_else(PoisonError::into_inner);
            match *last {
                Some(at) if now.saturating_duration_since(at) < ROUTE_SWEEP_INTERVAL => return,
                _ => *last = Some(now),
            }
        }

        let before = self.inner.routes.len();
        self.inner.routes.retain(|_, learned| learned.is_live(now));
        let swept = before.saturating_sub(self.inner.routes.len());
        if swept > 0 {
            debug!(swept, "Dropped expired route bucket mappings");
        }
    }

    fn schedule_expiry(&self, cooldown: Arc<Cooldown>, released: watch::Sender<bool>) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep_until(cooldown.until).await;
            inner
                .buckets
                .remove_if(&cooldown.bucket, |_, active| Arc::ptr_eq(active, &cooldown));
            let _ = released.send(true);
            debug!(bucket = %cooldown.bucket, "Rate limit cooldown cleared");
        });
    }
}
