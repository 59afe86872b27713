//! Helio Daemon - panel discovery and action execution engine
//!
//! This crate provides the server-owned job engine of the helio hub:
//! - `registry` - epoch-guarded table of discovered panels
//! - `progress` - progress store for the active scan and all executions
//! - `subscribers` - per-job listener fan-out that never blocks a writer
//! - `discovery` - multi-phase IP-range scan engine (singleton)
//! - `executor` - multi-stage action executor (many concurrent executions)
//! - `ops` - device-operation seam with a default TCP implementation
//! - `hub` - explicitly constructed context wiring the components together
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        heliod                                │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌────────────────┐      ┌────────────────┐                  │
//! │  │ DiscoveryEngine│─────▶│ PanelRegistry  │  (epoch-guarded) │
//! │  │  (scan task)   │      └────────────────┘                  │
//! │  └───────┬────────┘                                          │
//! │          │                ┌────────────────┐                 │
//! │          ├───────────────▶│ ProgressStore  │◀──────┐         │
//! │          │                └────────────────┘       │         │
//! │   DiscoveryEvent stream                            │         │
//! │          ▼                ┌────────────────┐  ┌────┴──────┐  │
//! │  attached transport       │ SubscriberMux  │◀─│ Action    │  │
//! │                           │ (per-job sinks)│  │ Executor  │  │
//! │                           └────────────────┘  └───────────┘  │
//! │                                                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Jobs are decoupled from the requests that start them: the starting call
//! returns a job id immediately and the job task keeps running after the
//! client disconnects. Cancellation is cooperative, checked at stage and
//! address boundaries.
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod config;
pub mod discovery;
pub mod executor;
pub mod hub;
pub mod ops;
pub mod progress;
pub mod registry;
pub mod subscribers;
