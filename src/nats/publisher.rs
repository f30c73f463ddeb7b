//! NATS event publisher
//!
//! Publishes serialized dispatch envelopes to NATS JetStream.

use crate::error::GatewayError;
use crate::events::serialize::GatewayEvent;
use async_nats::jetstream::{self, Context as JsContext};
use async_nats::Client;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Stream names
pub mod streams {
    /// Commands stream for interactions
    pub const COMMANDS: &str = "COMMANDS";
    /// Events stream for everything else
    pub const EVENTS: &str = "EVENTS";
}

/// Subject prefixes for routing
pub mod subjects {
    pub const COMMANDS: &str = "commands";
    /// Guild lifecycle: events.guild.{join,leave,update}
    pub const GUILD_EVENTS: &str = "events.guild";
    /// Members: events.member.{join,leave,update}
    pub const MEMBER_EVENTS: &str = "events.member";
    pub const EVENTS: &str = "events";
}

/// Subject an envelope of `event_type` is published on
pub fn route_subject(event_type: &str) -> String {
    match event_type {
        "interaction.create" => format!("{}.interaction", subjects::COMMANDS),

        "guild.create" => format!("{}.join", subjects::GUILD_EVENTS),
        "guild.delete" => format!("{}.leave", subjects::GUILD_EVENTS),
        "guild.update" => format!("{}.update", subjects::GUILD_EVENTS),

        "guild.member.add" => format!("{}.join", subjects::MEMBER_EVENTS),
        "guild.member.remove" => format!("{}.leave", subjects::MEMBER_EVENTS),
        "guild.member.update" => format!("{}.update", subjects::MEMBER_EVENTS),

        other => format!("{}.{}", subjects::EVENTS, other.replace('.', "_")),
    }
}

/// NATS publisher for gateway events
pub struct NatsPublisher {
    client: Client,
    jetstream: JsContext,
    connected: AtomicBool,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
}

impl NatsPublisher {
    /// Connect to NATS server(s), comma-separated
    pub async fn connect(servers: &str) -> Result<Arc<Self>, GatewayError> {
        info!(servers, "Connecting to NATS");

        let client = async_nats::connect(servers)
            .await
            .map_err(|e| GatewayError::NatsConnectionFailed(Box::new(e)))?;

        let jetstream = jetstream::new(client.clone());

        info!("Connected to NATS JetStream");

        Ok(Arc::new(Self {
            client,
            jetstream,
            connected: AtomicBool::new(true),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
        }))
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
            && self.client.connection_state() == async_nats::connection::State::Connected
    }

    /// Get total messages published
    pub fn messages_published(&self) -> u64 {
        self.messages_published.load(Ordering::Relaxed)
    }

    /// Get total publish failures
    pub fn publish_failures(&self) -> u64 {
        self.publish_failures.load(Ordering::Relaxed)
    }

    pub fn jetstream(&self) -> &JsContext {
        &self.jetstream
    }

    /// Publish a gateway event and wait for the stream ack
    pub async fn publish_event(&self, event: &GatewayEvent) -> Result<(), GatewayError> {
        let subject = route_subject(&event.event_type);
        let payload = serde_json::to_vec(event)?;

        debug!(
            event_type = %event.event_type,
            subject,
            event_id = %event.event_id,
            "Publishing event"
        );

        let published = match self.jetstream.publish(subject.clone(), payload.into()).await {
            Ok(ack) => ack.await.map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
            Err(e) => Err(Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
        };

        match published {
            Ok(ack) => {
                self.messages_published.fetch_add(1, Ordering::Relaxed);
                debug!(subject, stream = %ack.stream, seq = ack.sequence, "Event published");
                Ok(())
            }
            Err(source) => {
                self.publish_failures.fetch_add(1, Ordering::Relaxed);
                warn!(subject, error = %source, "Failed to publish event");
                Err(GatewayError::NatsPublishFailed { subject, source })
            }
        }
    }

    /// Graceful shutdown
    pub async fn close(&self) {
        info!("Closing NATS connection");
        self.connected.store(false, Ordering::SeqCst);
        if let Err(e) = self.client.flush().await {
            warn!(error = %e, "Failed to flush NATS connection");
        }
    }
}

/// Ensure streams exist with correct configuration
pub async fn ensure_streams(js: &JsContext) -> Result<(), GatewayError> {
    use async_nats::jetstream::stream::{Config, RetentionPolicy, StorageType};

    let configs = [
        // interactions expire fast: a stale command is useless
        (streams::COMMANDS, "commands.>", 60),
        (streams::EVENTS, "events.>", 300),
    ];

    for (name, filter, max_age_secs) in configs {
        let config = Config {
            name: name.to_string(),
            subjects: vec![filter.to_string()],
            retention: RetentionPolicy::Limits,
            max_age: std::time::Duration::from_secs(max_age_secs),
            storage: StorageType::Memory,
            ..Default::default()
        };

        match js.create_stream(config).await {
            Ok(_) => info!(stream = name, "Created stream"),
            Err(e) if e.to_string().contains("already in use") => {
                debug!(stream = name, "Stream already exists");
            }
            Err(e) => {
                error!(stream = name, error = %e, "Failed to create stream");
                return Err(GatewayError::NatsPublishFailed {
                    subject: filter.to_string(),
                    source: Box::new(e),
                });
            }
        }
    }

    info!("NATS streams configured");
    Ok(())
}
