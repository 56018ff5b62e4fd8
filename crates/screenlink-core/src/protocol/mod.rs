//! Wire protocol for the ScreenLink relay connection.
//!
//! Two message families share one socket:
//!
//! - **Control** (`messages`) — JSON text frames, discriminated by a `"type"`
//!   field: authentication handshake, heartbeats, and heartbeat
//!   acknowledgments carrying the server's reconnect directive. Unknown
//!   types decode to an explicit passthrough variant, never silently.
//! - **Frames** (`frames`) — binary envelopes carrying encoded video
//!   payloads, with a compact big-endian header.

use thiserror::Error;

pub mod frames;
pub mod messages;

/// Errors that can occur while encoding or decoding control messages.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// A control message could not be serialized to JSON.
    #[error("failed to encode control message: {0}")]
    Encode(String),

    /// Inbound text was not valid JSON, or a known message type carried a
    /// malformed body.
    #[error("failed to decode control message: {0}")]
    Decode(String),

    /// The inbound JSON object has no `"type"` discriminant.
    #[error("control message is missing the \"type\" field")]
    MissingType,
}
