//! Helio Core - shared domain types for the shade panel hub
//!
//! This crate provides the domain types shared between the daemon (heliod)
//! and any transport layer: job identifiers, discovery progress and events,
//! action definitions, and execution records.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()` in production paths.

pub mod action;
pub mod discovery;
pub mod error;
pub mod job;

// Re-exports for convenience
pub use action::{ActionDefinition, ExecutionRecord, ExecutionState, Stage};
pub use discovery::{
    AddressClassification, DiscoveryEvent, DiscoveryPhase, DiscoveryProgress, DiscoveryStats,
    PanelSummary, PhaseTiming, ScanRange,
};
pub use error::{InvalidActionError, ValidationError};
pub use job::JobId;
