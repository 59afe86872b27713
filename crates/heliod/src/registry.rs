//! Epoch-guarded registry of discovered panels.
//!
//! The registry holds the panels found by the current discovery run, keyed
//! by address. Every `reset()` starts a new epoch: the table is emptied
//! atomically and writes carrying a superseded epoch are dropped rather
//! than applied, so a cancelled scan that is still draining in-flight
//! probes can never pollute the next run's table.
//!
//! Lock discipline: the inner mutex guards short, non-async critical
//! sections only; it is never held across an await point.

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use helio_core::PanelSummary;

/// Identifies one registry lifetime between two `reset()` calls.
///
/// Writes must present the epoch they were issued under; a mismatch means
/// the write belongs to a superseded scan and is discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Epoch(u64);

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Health of the control connection to a panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// The panel answered its identification handshake this epoch.
    Connected,
    /// A later operation against the panel failed.
    Unreachable,
}

/// One registry entry: a discovered panel and its connection state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PanelEntry {
    /// Panel metadata from the identification banner.
    pub summary: PanelSummary,
    /// Control connection health.
    pub connection: ConnectionState,
    /// When the panel last answered.
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    epoch: u64,
    entries: HashMap<Ipv4Addr, PanelEntry>,
}

/// Resettable table of discovered panels.
///
/// Explicitly constructed (no ambient global state) so tests can run
/// multiple independent instances.
#[derive(Debug, Default)]
pub struct PanelRegistry {
    inner: Mutex<RegistryInner>,
}

impl PanelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current epoch without modifying the table.
    pub fn current_epoch(&self) -> Epoch {
        Epoch(self.lock().epoch)
    }

    /// Empties the table and starts a new epoch.
    ///
    /// All epochs issued earlier become stale: their `upsert`s will be
    /// dropped. Idempotent in the sense that resetting an already-empty
    /// registry is harmless (it still bumps the epoch).
    pub fn reset(&self) -> Epoch {
        let mut inner = self.lock();
        let discarded = inner.entries.len();
        inner.entries.clear();
        inner.epoch += 1;

        info!(
            epoch = inner.epoch,
            discarded_entries = discarded,
            "Panel registry reset"
        );
        Epoch(inner.epoch)
    }

    /// Inserts or overwrites the entry for `address`, iff `epoch` is still
    /// current. Returns whether the write was applied.
    pub fn upsert(&self, epoch: Epoch, address: Ipv4Addr, summary: PanelSummary) -> bool {
        let mut inner = self.lock();
        if inner.epoch != epoch.0 {
            debug!(
                %address,
                write_epoch = %epoch,
                current_epoch = inner.epoch,
                "Dropping stale registry write from superseded scan"
            );
            return false;
        }

        inner.entries.insert(
            address,
            PanelEntry {
                summary,
                connection: ConnectionState::Connected,
                last_seen: Utc::now(),
            },
        );
        true
    }

    /// Marks the panel at `address` unreachable, iff `epoch` is current and
    /// the entry exists. Returns whether anything changed.
    pub fn mark_unreachable(&self, epoch: Epoch, address: Ipv4Addr) -> bool {
        let mut inner = self.lock();
        if inner.epoch != epoch.0 {
            return false;
        }
        match inner.entries.get_mut(&address) {
            Some(entry) => {
                entry.connection = ConnectionState::Unreachable;
                true
            }
            None => false,
        }
    }

    /// Returns the entry for `address`, if present in the current epoch.
    pub fn get(&self, address: Ipv4Addr) -> Option<PanelEntry> {
        self.lock().entries.get(&address).cloned()
    }

    /// Returns all entries of the current epoch, ordered by address.
    pub fn all(&self) -> Vec<PanelEntry> {
        let inner = self.lock();
        let mut entries: Vec<_> = inner.entries.values().cloned().collect();
        entries.sort_by_key(|e| e.summary.address);
        entries
    }

    /// Number of panels in the current epoch.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        // A poisoned lock means a panic mid-write; the table contents are
        // still structurally valid, so recover the guard.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
