//! NATS JetStream integration
//!
//! Optional event sink: dispatches are wrapped in envelopes and published
//! to JetStream subjects.

mod dispatcher;
mod publisher;

pub use dispatcher::NatsDispatcher;
pub use publisher::{ensure_streams, route_subject, NatsPublisher};
