//! Storage infrastructure: configuration and credential persistence.
//!
//! This module provides a thin adapter between the application and the
//! file system:
//!
//! - `config` reads and writes the agent's TOML configuration from the
//!   platform-appropriate directory, with sensible defaults on first run.
//! - `token` persists the device credential issued by the relay after the
//!   first successful authentication.
//!
//! Keeping storage concerns here — rather than scattered throughout the
//! application — means we can change the file format or location without
//! touching any other part of the codebase.

pub mod config;
pub mod token;
