//! Domain logic for the connection lifecycle.
//!
//! This module contains pure business rules with no infrastructure
//! dependencies: no sockets, no timers, no async runtime.  Every type here is
//! driven by caller-supplied [`std::time::Instant`] values, which is what
//! makes the retry arithmetic, debounce windows, and hysteresis rules
//! unit-testable without a runtime or real clocks.
//!
//! The infrastructure layer (in `screenlink-agent`) wraps these types in
//! tokio tasks and supplies the real clock; the domain never knows the
//! difference.

/// Reconnect backoff curve and the consecutive-failure circuit breaker.
pub mod backoff;
/// Rolling latency, jitter, throughput, and stall accounting.
pub mod health;
/// Raw network observations, debouncing, and the derived stability signal.
pub mod network;
/// Adaptive quality ladder and its hysteresis controller.
pub mod quality;
/// Runtime mode and heartbeat cadence arithmetic.
pub mod runtime;
/// The connection state machine's vocabulary.
pub mod state;
