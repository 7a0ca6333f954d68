//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `StreamRegistry`: ref-counts client subscriptions, drives upstream
//!   SUBSCRIBE/UNSUBSCRIBE transitions and routes gated ticks to sessions

mod registry;

pub use registry::{DispatchOutcome, RegistryStats, StreamRegistry};
