//! Event serialization for message broker
//!
//! Converts raw gateway dispatches to JSON envelopes for NATS publishing.

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// Generic gateway event payload
#[derive(Debug, Clone, Serialize)]
pub struct GatewayEvent {
    pub event_id: String,
    pub event_type: String,
    pub timestamp: u64,
    pub guild_id: Option<String>,
    pub channel_id: Option<String>,
    pub user_id: Option<String>,
    pub data: Value,
}

/// Events we don't forward: session bookkeeping and transport noise
const SKIPPED: &[&str] = &["ready", "resumed", "presence_update", "typing_start"];

/// Serialize a raw dispatch (`raw_*` name) to a GatewayEvent payload
///
/// Returns None for specialized names, whole frames, and events we don't
/// forward.
pub fn serialize_event(event: &str, data: &Value) -> Option<GatewayEvent> {
    let event_type = event.strip_prefix("raw_")?;
    if SKIPPED.contains(&event_type) {
        return None;
    }

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();

    Some(GatewayEvent {
        event_id: Uuid::new_v4().to_string(),
        event_type: event_type.replace('_', "."),
        timestamp,
        guild_id: guild_id(event_type, data),
        channel_id: string_field(data, "channel_id"),
        user_id: user_id(data),
        data: data.clone(),
    })
}

fn string_field(data: &Value, key: &str) -> Option<String> {
    data.get(key).and_then(Value::as_str).map(str::to_string)
}

fn guild_id(event_type: &str, data: &Value) -> Option<String> {
    string_field(data, "guild_id").or_else(|| {
        // GUILD_CREATE/UPDATE/DELETE carry the guild itself
        if event_type.starts_with("guild_") && !event_type.starts_with("guild_member") {
            string_field(data, "id")
        } else {
            None
        }
    })
}

fn user_id(data: &Value) -> Option<String> {
    ["user", "author"]
        .iter()
        .find_map(|key| data.get(*key).and_then(|u| string_field(u, "id")))
        .or_else(|| {
            data.get("member")
                .and_then(|m| m.get("user"))
                .and_then(|u| string_field(u, "id"))
        })
}
