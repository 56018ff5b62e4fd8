//! # screenlink-core
//!
//! Shared library for ScreenLink containing the relay wire protocol, the
//! connection-lifecycle domain rules, and the adaptive streaming policy.
//!
//! This crate is used by the agent binary and by integration tests.  It has
//! zero dependencies on OS APIs, sockets, or the async runtime.
//!
//! # Architecture overview (for beginners)
//!
//! ScreenLink keeps a kiosk device's screen mirrored to a remote relay over
//! a single long-lived WebSocket.  The hard part is not the happy path; it
//! is surviving flaky Wi-Fi, captive portals, server-side maintenance
//! windows, and hours of unattended operation without ever needing a human
//! to press "reconnect".
//!
//! This crate (`screenlink-core`) is the pure foundation.  It defines:
//!
//! - **`protocol`** – How bytes travel over the relay socket.  Control
//!   traffic (authentication, heartbeats, directives) is JSON text frames
//!   discriminated by a `"type"` field; video travels as binary envelopes
//!   with a compact big-endian header.
//!
//! - **`domain`** – Pure lifecycle logic with no OS dependencies: the
//!   connection state machine vocabulary, network-stability debouncing,
//!   rolling health metrics, the adaptive quality ladder, and the backoff /
//!   circuit-breaker arithmetic.  Everything takes `Instant` values from
//!   the caller, so it all unit-tests without a runtime.
//!
//! The `screenlink-agent` crate supplies the tokio tasks, the real socket,
//! and the real clock around these types.

// Declare the two top-level modules.  Rust will look for each in a
// subdirectory with the same name (e.g., src/protocol/mod.rs).
pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `screenlink_core::ConnectionState` instead of spelling out the full path.
pub use domain::backoff::{BackoffConfig, CircuitBreaker, CircuitBreakerConfig};
pub use domain::health::{HealthConfig, HealthLevel, HealthMetrics, HealthMonitor};
pub use domain::network::{
    NetworkStatus, StabilityConfig, StabilityEvent, StabilityTracker, TransportKind,
};
pub use domain::quality::{
    select_level, QualityConfig, QualityController, QualityLevel, QualityProfile,
};
pub use domain::runtime::{CadenceConfig, HeartbeatCadence, PowerState, RuntimeMode};
pub use domain::state::{ConnectionState, ConnectionStatus, DisconnectReason};
pub use protocol::frames::{decode_frame, encode_frame, FrameCodecError, FrameEnvelope};
pub use protocol::messages::{
    decode_control, ControlMessage, DeviceMetrics, HeartbeatDirective, InboundControl, PeerRole,
};
pub use protocol::ProtocolError;
