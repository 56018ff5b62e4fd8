//! Infrastructure layer: everything that touches sockets, clocks, or disk.

pub mod network;
pub mod storage;
pub mod streaming;
