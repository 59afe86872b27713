//! Process-wide progress store for all running and recently finished jobs.
//!
//! Holds the singleton discovery snapshot and one execution record per
//! action execution, keyed by job id. Mutation is single-writer per job:
//! only the task owning a job calls the mutating methods for that job's
//! record; everything else polls cloned snapshots.
//!
//! Terminal execution records are retained for later polling up to a
//! configurable cap; the oldest terminal record is evicted first. Running
//! records are never evicted.
//!
//! Lock discipline: the inner mutex guards short, non-async critical
//! sections only; it is never held across an await point.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tracing::{debug, warn};

use helio_core::{DiscoveryProgress, ExecutionRecord, ExecutionState, JobId};

use crate::config::DEFAULT_TERMINAL_RETENTION;

#[derive(Debug)]
struct StoreInner {
    discovery: DiscoveryProgress,
    /// Scan task currently owning the discovery slot. Writes from any other
    /// job id are stale (their scan was superseded) and are dropped.
    discovery_owner: Option<JobId>,
    executions: HashMap<JobId, ExecutionRecord>,
    /// Terminal record ids in the order they finished, oldest first.
    terminal_order: VecDeque<JobId>,
}

/// Progress store shared by the discovery engine and action executor.
#[derive(Debug)]
pub struct ProgressStore {
    inner: Mutex<StoreInner>,
    terminal_retention: usize,
}

impl ProgressStore {
    /// Creates a store retaining up to `terminal_retention` finished records.
    pub fn new(terminal_retention: usize) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                discovery: DiscoveryProgress::idle(),
                discovery_owner: None,
                executions: HashMap::new(),
                terminal_order: VecDeque::new(),
            }),
            terminal_retention,
        }
    }

    // ========================================================================
    // Discovery (singleton)
    // ========================================================================

    /// Returns the current discovery snapshot. Always succeeds; idle when
    /// no scan has run.
    pub fn discovery_snapshot(&self) -> DiscoveryProgress {
        self.lock().discovery.clone()
    }

    /// Replaces the discovery state with a fresh running snapshot owned by
    /// `owner`, discarding whatever the previous scan left behind. The
    /// previous owner (if any) loses write access from this point on.
    pub fn begin_discovery(&self, owner: JobId, total_ips: u32) {
        let mut inner = self.lock();
        inner.discovery = DiscoveryProgress::begin(total_ips);
        inner.discovery_owner = Some(owner);
    }

    /// Applies a mutation to the discovery state, iff `owner` still owns the
    /// slot. Returns whether the write was applied; a superseded scan's
    /// writes are dropped, not merged.
    pub fn update_discovery(
        &self,
        owner: JobId,
        mutate: impl FnOnce(&mut DiscoveryProgress),
    ) -> bool {
        let mut inner = self.lock();
        if inner.discovery_owner != Some(owner) {
            debug!(job_id = %owner, "Dropping discovery update from superseded scan");
            return false;
        }
        mutate(&mut inner.discovery);
        true
    }

    /// Marks the discovery state finished, keeping its counters visible
    /// until the next scan starts. Dropped if `owner` was superseded.
    pub fn finish_discovery(&self, owner: JobId) -> bool {
        let mut inner = self.lock();
        if inner.discovery_owner != Some(owner) {
            return false;
        }
        inner.discovery.finish();
        true
    }

    // ========================================================================
    // Executions
    // ========================================================================

    /// Registers a new execution record.
    pub fn insert_execution(&self, record: ExecutionRecord) {
        let mut inner = self.lock();
        let id = record.execution_id;
        if inner.executions.insert(id, record).is_some() {
            // Job ids are random UUIDs; a collision would be a bug upstream.
            warn!(execution_id = %id, "Replaced existing execution record");
        }
    }

    /// Applies a mutation to the record for `id` and returns the resulting
    /// snapshot, or `None` if no such record exists.
    ///
    /// Only the execution task owning `id` may call this (single-writer
    /// rule). When the mutation makes the record terminal, retention
    /// bookkeeping runs and the oldest terminal records beyond the cap are
    /// evicted.
    pub fn update_execution(
        &self,
        id: JobId,
        mutate: impl FnOnce(&mut ExecutionRecord),
    ) -> Option<ExecutionRecord> {
        let mut inner = self.lock();

        let snapshot = {
            let record = inner.executions.get_mut(&id)?;
            let was_terminal = record.is_terminal();
            mutate(record);
            if record.is_terminal() && !was_terminal {
                let snapshot = record.clone();
                inner.terminal_order.push_back(id);
                Some(snapshot)
            } else {
                Some(record.clone())
            }
        };

        self.evict_over_cap(&mut inner);
        snapshot
    }

    /// Returns the record for `id`, if it exists (running or retained).
    pub fn get_execution(&self, id: JobId) -> Option<ExecutionRecord> {
        self.lock().executions.get(&id).cloned()
    }

    /// Returns all records currently in the `Running` state.
    pub fn running_executions(&self) -> Vec<ExecutionRecord> {
        let inner = self.lock();
        let mut running: Vec<_> = inner
            .executions
            .values()
            .filter(|r| r.state == ExecutionState::Running)
            .cloned()
            .collect();
        running.sort_by_key(|r| r.started_at);
        running
    }

    /// Number of records currently held (running plus retained terminal).
    pub fn execution_count(&self) -> usize {
        self.lock().executions.len()
    }

    fn evict_over_cap(&self, inner: &mut StoreInner) {
        while inner.terminal_order.len() > self.terminal_retention {
            let Some(oldest) = inner.terminal_order.pop_front() else {
                break;
            };
            if inner.executions.remove(&oldest).is_some() {
                debug!(execution_id = %oldest, "Evicted terminal execution record");
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for ProgressStore {
    fn default() -> Self {
        Self::new(DEFAULT_TERMINAL_RETENTION)
    }
}
