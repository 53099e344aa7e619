//! Client protocol
//!
//! JSON envelopes exchanged over the WebSocket and the event type that
//! flows through the fan-out layer.

mod envelope;
mod error;
mod event;

pub use envelope::{
    ErrorBody, ErrorEnvelope, EventEnvelope, Request, Response, STATUS_OK,
};
pub use error::{ClientError, ErrorKind};
pub use event::{kinds, Broadcast, Event};
