//! Domain error types for the Arrakis transport core
//!
//! Two surfaces, two enums: `GatewayError` for shard sessions and
//! `HttpError` for the REST executor. Both carry structured context so
//! callers can match on the failure mode instead of parsing messages.
//!
//! main.rs is the ONLY module allowed to use anyhow::Result (process boundary).

use thiserror::Error;

/// Gateway (shard session) errors
///
/// Transport anomalies such as a corrupt compressed frame are absorbed
/// inside the shard and only show up here when a caller asks for them
/// directly (e.g. `Shard::send` on a closed socket).
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration error (environment variable missing or invalid, or a
    /// gateway operation on a state that is not gateway enabled)
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed or corrupt frame
    #[error("protocol error on shard {shard_id}: {reason}")]
    Protocol { shard_id: u32, reason: String },

    /// Server invalidated the session
    #[error("session invalidated on shard {shard_id} (resumable: {resumable})")]
    SessionInvalidated { shard_id: u32, resumable: bool },

    /// Socket dropped by peer or network
    #[error("connection lost on shard {shard_id}")]
    ConnectionLost { shard_id: u32 },

    /// Command issued while the shard has no open socket
    #[error("shard {shard_id} is not connected")]
    NotConnected { shard_id: u32 },

    /// Websocket transport failure
    #[error("websocket error on shard {shard_id}")]
    WebSocket {
        shard_id: u32,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },

    /// Payload could not be encoded or decoded
    #[error("payload serialization failed")]
    Serialization(#[from] serde_json::Error),

    /// Shard ID overflow: u64 value exceeds u32::MAX
    #[error("shard ID overflow: {value} exceeds u32::MAX")]
    ShardIdOverflow { value: u64 },

    /// NATS connection failed
    #[error("NATS connection failed")]
    NatsConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// NATS publish or stream setup failed
    #[error("NATS publish to '{subject}' failed")]
    NatsPublishFailed {
        subject: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl GatewayError {
    /// Returns a static label string suitable for Prometheus metrics.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Protocol { .. } => "protocol",
            Self::SessionInvalidated { .. } => "session_invalidated",
            Self::ConnectionLost { .. } => "connection_lost",
            Self::NotConnected { .. } => "not_connected",
            Self::WebSocket { .. } => "websocket",
            Self::Serialization(_) => "serialization",
            Self::ShardIdOverflow { .. } => "shard_overflow",
            Self::NatsConnectionFailed(_) => "nats_connection",
            Self::NatsPublishFailed { .. } => "nats_publish",
        }
    }
}

/// REST request errors
///
/// Everything except `RateLimited` is terminal for the single request that
/// produced it; the executor never retries them.
#[derive(Error, Debug)]
pub enum HttpError {
    /// 429 persisted past the retry bound
    #[error("rate limited on bucket '{bucket}' after {retries} attempts")]
    RateLimited { bucket: String, retries: u32 },

    #[error("401 Unauthorized")]
    Unauthorized,

    #[error("403 Forbidden")]
    Forbidden,

    #[error("404 Not Found")]
    NotFound,

    /// Any other status >= 400
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// Connection, TLS or body read failure
    #[error("HTTP transport failure")]
    Transport(#[from] reqwest::Error),

    /// Request or response JSON could not be processed
    #[error("HTTP payload serialization failed")]
    Serialization(#[from] serde_json::Error),

    /// Token, user agent or audit-log reason is not a valid header value
    #[error("invalid header value")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),
}

impl HttpError {
    /// Returns a static label string suitable for Prometheus metrics.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::Status { .. } => "http_exception",
            Self::Transport(_) => "transport",
            Self::Serialization(_) => "serialization",
            Self::InvalidHeader(_) => "invalid_header",
        }
    }

    /// Map a non-429 error status to its error kind.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            _ => Self::Status { status, body },
        }
    }
}
