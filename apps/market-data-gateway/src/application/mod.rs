//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the stream registry and the port interfaces
//! that define how it interacts with the feed and client sessions.

/// Port interfaces for the upstream feed, sessions, auth and fan-out.
pub mod ports;

/// Application services: the stream subscription registry.
pub mod services;
