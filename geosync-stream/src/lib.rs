//! GEOSYNC Stream - push updates over a persistent WebSocket
//!
//! [`StreamConnection`] owns one connection at a time and moves through
//! `Disconnected → Connecting → Connected`, dropping to `Reconnecting` on an
//! abnormal close when reconnection is configured. Everything that happens
//! on the wire is reported as a [`StreamEvent`].

pub mod connection;
pub mod event;

pub use connection::{ConnectionState, StreamConnection};
pub use event::{close_reason, StreamEvent, StreamEventKind, StreamMessage};
