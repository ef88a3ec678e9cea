//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the feed multiplexer service and the port
//! interfaces that define how it interacts with external systems.

/// Port interfaces for external systems (transport, codec, clock, sinks).
pub mod ports;

/// Application services for feed multiplexing.
pub mod services;
