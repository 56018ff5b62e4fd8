//! # screenlink-agent
//!
//! The ScreenLink kiosk agent: owns the relay connection lifecycle and the
//! adaptive screen stream.
//!
//! # Layer map
//!
//! ```text
//! screenlink-agent
//!   application/     Use cases with trait seams (frame capture, input routing)
//!   infrastructure/
//!     network/       Relay transport, network observer, connection manager
//!     streaming/     Bounded frame queue and paced transmitter
//!     storage/       TOML config and device credential persistence
//! ```
//!
//! Dependency rule: `application` depends only on `screenlink-core` and its
//! own trait seams; `infrastructure` depends on everything plus `tokio` and
//! `tokio-tungstenite`. Pure lifecycle rules (state machine, backoff,
//! health, quality, stability) live in `screenlink-core` and are consumed
//! here, never duplicated.

pub mod application;
pub mod infrastructure;
