//! Event handling module
//!
//! Routes decoded dispatches to the embedding application and serializes
//! them for the message broker.

pub mod dispatcher;
pub mod serialize;

pub use dispatcher::{EventDispatcher, EventRouter, Handler, TracingDispatcher, FRAME_EVENT};
pub use serialize::{serialize_event, GatewayEvent};
