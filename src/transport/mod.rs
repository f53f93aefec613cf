//! Duplex connection to the conversational backend
//!
//! - `messages`: JSON event framing in both directions
//! - `client`: one WebSocket connection owned by a background task
//! - `backoff`: reconnect schedule

pub mod backoff;
pub mod client;
pub mod messages;

pub use backoff::{ReconnectPolicy, ReconnectState};
pub use client::{
    check_backend, CloseReason, Connection, ConnectionEvent, Generation, TransportEvent,
    MEDIA_QUEUE_FRAMES,
};
pub use messages::{
    ClientMessage, MediaChunk, ServerMessage, SessionStatusReport, Speaker, TranscriptionEvent,
};
