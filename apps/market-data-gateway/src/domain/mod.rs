//! Domain Layer - Core fan-out types and business logic.
//!
//! This layer contains the stream types, the ref-counted subscription
//! table and the threshold gate. Nothing here performs I/O or owns a
//! lock; the application layer serialises access.

/// Stream identifiers, data frames and tick values.
pub mod streaming;

/// Ref-counted subscription tracking.
pub mod subscription;

/// Change filter comparing ticks against the last forwarded value.
pub mod threshold;
