//! Event fan-out
//!
//! The core never interprets dispatch payloads itself. It hands them to an
//! `EventDispatcher` owned by the embedding application, under the raw
//! event name and, when a handler is registered for the event type, under
//! the handler's specialized name as well.

use crate::codec::GatewayPayload;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Name used for every decoded frame, before opcode handling
pub const FRAME_EVENT: &str = "websocket_message_receive";

/// Sink for decoded gateway events
pub trait EventDispatcher: Send + Sync {
    fn dispatch(&self, event: &str, payload: &Value);
}

/// Hook run before a specialized event is dispatched
pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

struct Registered {
    name: String,
    hook: Option<Handler>,
}

/// Explicit event-type → handler table, resolved once at startup
pub struct EventRouter {
    sink: Arc<dyn EventDispatcher>,
    handlers: HashMap<String, Registered>,
}

impl EventRouter {
    /// Router with the built-in `READY` → `ready` mapping
    pub fn new(sink: Arc<dyn EventDispatcher>) -> Self {
        let mut handlers = HashMap::new();
        handlers.insert("READY".to_string(), Registered { name: "ready".to_string(), hook: None });
        Self { sink, handlers }
    }

    /// Dispatch `event_type` under its lowercased name too, running `hook`
    /// first.
    pub fn on<F>(mut self, event_type: &str, hook: F) -> Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.handlers.insert(
            event_type.to_string(),
            Registered {
                name: event_type.to_ascii_lowercase(),
                hook: Some(Arc::new(hook)),
            },
        );
        self
    }

    /// Dispatch `event_type` under `name` without a hook
    pub fn alias(mut self, event_type: &str, name: &str) -> Self {
        self.handlers.insert(
            event_type.to_string(),
            Registered { name: name.to_string(), hook: None },
        );
        self
    }

    pub fn has_handler(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    /// Forward a whole decoded frame
    pub fn frame(&self, payload: &GatewayPayload) {
        match serde_json::to_value(payload) {
            Ok(value) => self.sink.dispatch(FRAME_EVENT, &value),
            Err(e) => debug!(error = %e, "Could not re-encode frame for dispatch"),
        }
    }

    /// Forward one dispatch event
    pub fn dispatch(&self, event_type: &str, data: &Value) {
        let raw = format!("raw_{}", event_type.to_ascii_lowercase());
        self.sink.dispatch(&raw, data);

        if let Some(registered) = self.handlers.get(event_type) {
            if let Some(hook) = &registered.hook {
                hook(data);
            }
            self.sink.dispatch(&registered.name, data);
        }
    }
}

/// Dispatcher that only logs; used when no broker is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDispatcher;

impl EventDispatcher for TracingDispatcher {
    fn dispatch(&self, event: &str, _payload: &Value) {
        debug!(event, "Dispatched event");
    }
}
