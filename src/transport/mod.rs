//! Connector implementations.
//!
//! This module provides concrete implementations of the domain-level
//! `Connector` and `Session` traits. Protocol-backed connectors are hidden
//! behind feature flags.
//!
//! Domain code must not depend on connector-specific types.

mod amqp;
mod memory;

#[cfg(feature = "transport_lapin")]
pub use amqp::LapinConnector;

pub use memory::MemoryBroker;
