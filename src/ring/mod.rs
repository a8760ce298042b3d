//! Ring node: topology, mutual-TLS transport, wire codec and the per-node
//! round engine.

pub mod codec;
pub mod config;
pub mod engine;
pub mod node;
pub mod stats;
pub mod transport;
pub mod types;
