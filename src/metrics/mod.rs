//! Prometheus metrics module
//!
//! Recording goes through the `metrics` facade, so shards and the REST
//! executor can record unconditionally; without an installed recorder (tests,
//! embedding applications) the calls are no-ops.

use metrics::{counter, describe_counter, describe_gauge, gauge, Unit};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;

/// Gateway metrics collector
#[derive(Clone, Default)]
pub struct GatewayMetrics {
    handle: Option<Arc<PrometheusHandle>>,
}

impl GatewayMetrics {
    /// Install the Prometheus recorder and return a rendering handle
    pub fn install() -> Result<Self, BuildError> {
        let handle = PrometheusBuilder::new().install_recorder()?;

        Self::register_metrics();

        Ok(Self {
            handle: Some(Arc::new(handle)),
        })
    }

    /// Collector that records into whatever recorder is installed, if any
    pub fn noop() -> Self {
        Self::default()
    }

    /// Register metric descriptions
    fn register_metrics() {
        describe_counter!(
            "gateway_events_received_total",
            Unit::Count,
            "Total dispatch events received from Discord"
        );
        describe_counter!(
            "gateway_reconnects_total",
            Unit::Count,
            "Shard reconnects by reason"
        );
        describe_counter!(
            "gateway_commands_total",
            Unit::Count,
            "Gateway commands sent, by opcode"
        );
        describe_counter!(
            "gateway_commands_throttled_total",
            Unit::Count,
            "Gateway commands that waited for the command window to reset"
        );
        describe_counter!(
            "gateway_errors_total",
            Unit::Count,
            "Total gateway errors"
        );
        describe_counter!(
            "http_requests_total",
            Unit::Count,
            "REST requests by status"
        );
        describe_counter!(
            "http_rate_limited_total",
            Unit::Count,
            "REST 429 responses"
        );

        describe_gauge!(
            "gateway_shards_ready",
            Unit::Count,
            "Number of shards in ready state"
        );
        describe_gauge!(
            "gateway_last_heartbeat_ack_timestamp",
            Unit::Seconds,
            "Unix time of the last heartbeat ack per shard"
        );
    }

    /// Record a dispatch event received
    pub fn record_event(&self, shard_id: u32, event_type: &str) {
        counter!(
            "gateway_events_received_total",
            "shard_id" => shard_id.to_string(),
            "event_type" => event_type.to_ascii_lowercase()
        )
        .increment(1);
    }

    /// Record an outbound gateway command
    pub fn record_command(&self, shard_id: u32, op: u8) {
        counter!(
            "gateway_commands_total",
            "shard_id" => shard_id.to_string(),
            "op" => op.to_string()
        )
        .increment(1);
    }

    /// Record a command held back by the per-shard command cap
    pub fn record_command_throttled(&self, shard_id: u32) {
        counter!(
            "gateway_commands_throttled_total",
            "shard_id" => shard_id.to_string()
        )
        .increment(1);
    }

    /// Record a reconnect and why it happened
    pub fn record_reconnect(&self, shard_id: u32, reason: &'static str) {
        counter!(
            "gateway_reconnects_total",
            "shard_id" => shard_id.to_string(),
            "reason" => reason
        )
        .increment(1);
    }

    /// Record gateway error
    pub fn record_error(&self, shard_id: u32, error_type: &'static str) {
        counter!(
            "gateway_errors_total",
            "shard_id" => shard_id.to_string(),
            "error_type" => error_type
        )
        .increment(1);
    }

    /// Record heartbeat ack
    pub fn record_heartbeat_ack(&self, shard_id: u32) {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        gauge!(
            "gateway_last_heartbeat_ack_timestamp",
            "shard_id" => shard_id.to_string()
        )
        .set(now);
    }

    /// Record a completed REST call
    pub fn record_http(&self, method: &str, status: u16) {
        counter!(
            "http_requests_total",
            "method" => method.to_string(),
            "status" => status.to_string()
        )
        .increment(1);
    }

    /// Record a REST 429
    pub fn record_rate_limited(&self, bucket: &str, global: bool) {
        counter!(
            "http_rate_limited_total",
            "bucket" => bucket.to_string(),
            "global" => global.to_string()
        )
        .increment(1);
    }

    /// Set shards ready count
    pub fn set_shards_ready(&self, pool_id: u32, count: usize) {
        gauge!(
            "gateway_shards_ready",
            "pool_id" => pool_id.to_string()
        )
        .set(count as f64);
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle
            .as_ref()
            .map(|handle| handle.render())
            .unwrap_or_default()
    }
}
