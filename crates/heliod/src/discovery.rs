//! Multi-phase panel discovery engine.
//!
//! A scan walks a host-octet range in two ordered phases (liveness probe,
//! then panel identification) with a bounded worker pool per phase so a
//! scan cannot saturate the local link. Results stream incrementally as
//! each address's classification settles; the stream is always terminated
//! by exactly one `Complete` event carrying the aggregated stats, even when
//! the scan is cancelled or a probe worker dies.
//!
//! The engine is a singleton: at most one scan is active per process.
//! Starting a new scan resets the panel registry (opening a new epoch) and
//! cancels the previous scan; anything the superseded scan still has in
//! flight is dropped at the registry and progress store, never merged.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use helio_core::{
    AddressClassification, DiscoveryEvent, DiscoveryPhase, DiscoveryProgress, DiscoveryStats,
    JobId, PanelSummary, PhaseTiming, ScanRange, ValidationError,
};

use crate::config::DiscoverySettings;
use crate::ops::{DeviceOps, IdentifyOutcome, ProbeOutcome};
use crate::progress::ProgressStore;
use crate::registry::{Epoch, PanelRegistry};

/// Handle to a running scan, returned by [`DiscoveryEngine::start`].
///
/// The scan keeps running if this handle is dropped; dropping `events`
/// merely detaches the stream (the progress store still tracks the scan).
pub struct ScanHandle {
    /// Identifier of the scan job.
    pub job_id: JobId,
    /// Registry epoch opened for this scan.
    pub epoch: Epoch,
    /// Lazy event stream, terminated by exactly one `Complete`.
    pub events: mpsc::Receiver<DiscoveryEvent>,
    /// Cooperative cancellation signal for this scan.
    pub cancel: CancellationToken,
    /// The scan task itself; yields the final stats.
    pub task: JoinHandle<DiscoveryStats>,
}

/// Shared collaborators a scan task needs.
struct ScanContext {
    ops: Arc<dyn DeviceOps>,
    registry: Arc<PanelRegistry>,
    store: Arc<ProgressStore>,
    settings: DiscoverySettings,
}

struct ActiveScan {
    job_id: JobId,
    cancel: CancellationToken,
}

/// Singleton discovery engine.
pub struct DiscoveryEngine {
    ctx: Arc<ScanContext>,
    active: Mutex<Option<ActiveScan>>,
}

impl DiscoveryEngine {
    pub fn new(
        ops: Arc<dyn DeviceOps>,
        registry: Arc<PanelRegistry>,
        store: Arc<ProgressStore>,
        settings: DiscoverySettings,
    ) -> Self {
        Self {
            ctx: Arc::new(ScanContext {
                ops,
                registry,
                store,
                settings,
            }),
            active: Mutex::new(None),
        }
    }

    /// Starts a scan over `[start_octet, end_octet]` of `base_prefix`.
    ///
    /// Validates the range before any engine work begins, supersedes a
    /// previous scan (cancelling it and opening a new registry epoch), and
    /// returns immediately with a handle; the scan runs as a detached task.
    ///
    /// # Errors
    ///
    /// `ValidationError` for a malformed prefix or out-of-range/inverted
    /// octets. No state is touched for a rejected request.
    pub fn start(
        &self,
        base_prefix: &str,
        start_octet: u8,
        end_octet: u8,
    ) -> Result<ScanHandle, ValidationError> {
        let range = ScanRange::new(base_prefix, start_octet, end_octet)?;

        let job_id = JobId::new();
        let cancel = CancellationToken::new();
        {
            let mut active = self.lock_active();
            if let Some(previous) = active.take() {
                info!(
                    superseded = %previous.job_id,
                    job_id = %job_id,
                    "New scan supersedes the previous one"
                );
                previous.cancel.cancel();
            }
            *active = Some(ActiveScan {
                job_id,
                cancel: cancel.clone(),
            });
        }

        // Reset before the first probe so every code path observes a fresh
        // registry for this run. Store ownership is claimed here, not in the
        // scan task, so a superseded scan can never outrace its successor.
        let epoch = self.ctx.registry.reset();
        self.ctx.store.begin_discovery(job_id, range.total_ips());
        let (events_tx, events_rx) = mpsc::channel(self.ctx.settings.event_buffer.max(1));
        let ctx = Arc::clone(&self.ctx);
        let scan_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            run_scan(ctx, job_id, epoch, range, scan_cancel, events_tx).await
        });

        Ok(ScanHandle {
            job_id,
            epoch,
            events: events_rx,
            cancel,
            task,
        })
    }

    /// Returns the current discovery progress snapshot. Always succeeds;
    /// idle when nothing has run.
    pub fn progress(&self) -> DiscoveryProgress {
        self.ctx.store.discovery_snapshot()
    }

    /// Requests cancellation of the active scan, if any. Returns whether a
    /// scan slot existed to signal.
    pub fn cancel_active(&self) -> bool {
        let active = self.lock_active();
        match active.as_ref() {
            Some(scan) => {
                info!(job_id = %scan.job_id, "Cancelling active scan");
                scan.cancel.cancel();
                true
            }
            None => false,
        }
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<ActiveScan>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// ============================================================================
// Scan task
// ============================================================================

/// Local tally of this scan's own outcomes.
///
/// The terminal stats are built from here, not from the progress store, so
/// a superseded scan still reports honest numbers for its own stream while
/// its store writes are being dropped.
#[derive(Debug, Default)]
struct Tally {
    panels_found: u32,
    not_panels: u32,
    no_response: u32,
    errors: u32,
}

impl Tally {
    fn scanned(&self) -> u32 {
        self.panels_found + self.not_panels + self.no_response + self.errors
    }
}

async fn run_scan(
    ctx: Arc<ScanContext>,
    job_id: JobId,
    epoch: Epoch,
    range: ScanRange,
    cancel: CancellationToken,
    events: mpsc::Sender<DiscoveryEvent>,
) -> DiscoveryStats {
    let scan_started = Instant::now();
    let total_ips = range.total_ips();

    info!(
        job_id = %job_id,
        %epoch,
        prefix = range.base_prefix(),
        total_ips,
        "Discovery scan starting"
    );

    let mut tally = Tally::default();
    let mut phases = Vec::new();

    // Phase 1: liveness probe over the whole range.
    let phase_started = Instant::now();
    let responsive = liveness_sweep(&ctx, job_id, &range, &cancel, &events, &mut tally).await;
    phases.push(PhaseTiming {
        phase: DiscoveryPhase::Liveness,
        duration_ms: phase_started.elapsed().as_millis() as u64,
    });

    // Phase 2: identification of responsive addresses. Skipped entirely
    // when the scan was cancelled during phase 1.
    if !cancel.is_cancelled() {
        ctx.store
            .update_discovery(job_id, |p| p.enter_phase(DiscoveryPhase::Identify));
        try_emit(
            &events,
            DiscoveryEvent::PhaseChange {
                phase: DiscoveryPhase::Identify,
                scanned_count: tally.scanned(),
                panels_found: tally.panels_found,
            },
        );

        let phase_started = Instant::now();
        identify_sweep(&ctx, job_id, epoch, responsive, &cancel, &events, &mut tally).await;
        phases.push(PhaseTiming {
            phase: DiscoveryPhase::Identify,
            duration_ms: phase_started.elapsed().as_millis() as u64,
        });
    }

    // Terminal aggregation. This point is reached on every path (normal
    // completion, cancellation, absorbed worker faults), so the stream
    // always ends with exactly one Complete event.
    let stats = DiscoveryStats {
        total_ips,
        panels_found: tally.panels_found,
        non_panels: tally.not_panels,
        no_response: tally.no_response,
        errors: tally.errors,
        phases,
        total_duration_ms: scan_started.elapsed().as_millis() as u64,
    };
    ctx.store.finish_discovery(job_id);

    // Unlike per-address results, the terminal event waits for buffer space
    // so an attached stream cannot miss it; a dropped receiver just means
    // nobody is watching any more.
    if events
        .send(DiscoveryEvent::Complete {
            stats: stats.clone(),
        })
        .await
        .is_err()
    {
        debug!(job_id = %job_id, "No attached stream for terminal scan event");
    }

    info!(
        job_id = %job_id,
        cancelled = cancel.is_cancelled(),
        scanned = tally.scanned(),
        panels_found = stats.panels_found,
        no_response = stats.no_response,
        errors = stats.errors,
        duration_ms = stats.total_duration_ms,
        "Discovery scan finished"
    );

    stats
}

/// Probes every address in the range for liveness, streaming terminal
/// classifications (`no-response`, `error`) as they settle. Returns the
/// addresses that responded and move on to identification.
async fn liveness_sweep(
    ctx: &Arc<ScanContext>,
    job_id: JobId,
    range: &ScanRange,
    cancel: &CancellationToken,
    events: &mpsc::Sender<DiscoveryEvent>,
    tally: &mut Tally,
) -> Vec<Ipv4Addr> {
    let semaphore = Arc::new(Semaphore::new(ctx.settings.worker_budget.max(1)));
    let mut workers = JoinSet::new();
    let mut responsive = Vec::new();

    for address in range.addresses() {
        // Cancellation is checked between probes: stop issuing new ones and
        // let whatever is in flight finish or time out.
        if cancel.is_cancelled() {
            debug!(job_id = %job_id, "Scan cancelled, no further probes issued");
            break;
        }

        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break; // semaphore closed; cannot happen while we hold it
        };
        // Cancellation may have arrived while waiting for a permit.
        if cancel.is_cancelled() {
            break;
        }

        // Drain already-settled probes so results stream while we spawn.
        while let Some(joined) = workers.try_join_next() {
            settle_probe(ctx, job_id, events, tally, &mut responsive, joined);
        }

        let ops = Arc::clone(&ctx.ops);
        let probe_timeout = ctx.settings.probe_timeout();
        workers.spawn(async move {
            let _permit = permit;
            let outcome = match timeout(probe_timeout, ops.probe(address)).await {
                Ok(outcome) => outcome,
                Err(_) => ProbeOutcome::NoResponse,
            };
            (address, outcome)
        });
    }

    while let Some(joined) = workers.join_next().await {
        settle_probe(ctx, job_id, events, tally, &mut responsive, joined);
    }

    responsive
}

fn settle_probe(
    ctx: &Arc<ScanContext>,
    job_id: JobId,
    events: &mpsc::Sender<DiscoveryEvent>,
    tally: &mut Tally,
    responsive: &mut Vec<Ipv4Addr>,
    joined: Result<(Ipv4Addr, ProbeOutcome), tokio::task::JoinError>,
) {
    match joined {
        Ok((address, ProbeOutcome::Responsive)) => responsive.push(address),
        Ok((address, ProbeOutcome::NoResponse)) => {
            record_result(
                ctx,
                job_id,
                events,
                tally,
                address,
                AddressClassification::NoResponse,
                None,
            );
        }
        Ok((address, ProbeOutcome::Error(message))) => {
            warn!(job_id = %job_id, %address, error = %message, "Probe failed");
            record_result(
                ctx,
                job_id,
                events,
                tally,
                address,
                AddressClassification::Error,
                None,
            );
        }
        Err(join_error) => {
            // A worker died. Absorb it into the error counter so the
            // terminal stats still account for every spawned probe, and the
            // stream still terminates instead of hanging.
            error!(job_id = %job_id, error = %join_error, "Probe worker failed");
            tally.errors += 1;
            ctx.store.update_discovery(job_id, |p| {
                p.record_outcome(AddressClassification::Error, None)
            });
        }
    }
}

/// Attempts panel identification on every responsive address, registering
/// panels into the current epoch and streaming terminal classifications.
async fn identify_sweep(
    ctx: &Arc<ScanContext>,
    job_id: JobId,
    epoch: Epoch,
    responsive: Vec<Ipv4Addr>,
    cancel: &CancellationToken,
    events: &mpsc::Sender<DiscoveryEvent>,
    tally: &mut Tally,
) {
    let semaphore = Arc::new(Semaphore::new(ctx.settings.worker_budget.max(1)));
    let mut workers = JoinSet::new();

    for address in responsive {
        if cancel.is_cancelled() {
            debug!(job_id = %job_id, "Scan cancelled, skipping remaining identifications");
            break;
        }

        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };
        if cancel.is_cancelled() {
            break;
        }

        while let Some(joined) = workers.try_join_next() {
            settle_identify(ctx, job_id, epoch, events, tally, joined);
        }

        let ops = Arc::clone(&ctx.ops);
        let identify_timeout = ctx.settings.identify_timeout();
        workers.spawn(async move {
            let _permit = permit;
            let outcome = match timeout(identify_timeout, ops.identify(address)).await {
                Ok(outcome) => outcome,
                // A device that answered the probe but stalls the handshake
                // is responsive-but-not-a-panel.
                Err(_) => IdentifyOutcome::NotPanel,
            };
            (address, outcome)
        });
    }

    while let Some(joined) = workers.join_next().await {
        settle_identify(ctx, job_id, epoch, events, tally, joined);
    }
}

fn settle_identify(
    ctx: &Arc<ScanContext>,
    job_id: JobId,
    epoch: Epoch,
    events: &mpsc::Sender<DiscoveryEvent>,
    tally: &mut Tally,
    joined: Result<(Ipv4Addr, IdentifyOutcome), tokio::task::JoinError>,
) {
    match joined {
        Ok((address, IdentifyOutcome::Panel(summary))) => {
            if !ctx.registry.upsert(epoch, address, summary.clone()) {
                // The registry moved on to a newer epoch; this scan is
                // superseded and its panels must not leak into the new table.
                debug!(job_id = %job_id, %address, "Discarding panel from superseded scan");
            }
            info!(
                job_id = %job_id,
                %address,
                model = %summary.model,
                "Panel discovered"
            );
            record_result(
                ctx,
                job_id,
                events,
                tally,
                address,
                AddressClassification::Panel,
                Some(summary),
            );
        }
        Ok((address, IdentifyOutcome::NotPanel)) => {
            record_result(
                ctx,
                job_id,
                events,
                tally,
                address,
                AddressClassification::NotPanel,
                None,
            );
        }
        Err(join_error) => {
            error!(job_id = %job_id, error = %join_error, "Identify worker failed");
            tally.errors += 1;
            ctx.store.update_discovery(job_id, |p| {
                p.record_outcome(AddressClassification::Error, None)
            });
        }
    }
}

/// Records one address's terminal classification: local tally, progress
/// store (dropped if this scan was superseded), and the event stream.
fn record_result(
    ctx: &Arc<ScanContext>,
    job_id: JobId,
    events: &mpsc::Sender<DiscoveryEvent>,
    tally: &mut Tally,
    address: Ipv4Addr,
    classification: AddressClassification,
    panel: Option<PanelSummary>,
) {
    match classification {
        AddressClassification::Panel => tally.panels_found += 1,
        AddressClassification::NotPanel => tally.not_panels += 1,
        AddressClassification::NoResponse => tally.no_response += 1,
        AddressClassification::Error => tally.errors += 1,
    }

    ctx.store.update_discovery(job_id, |p| {
        p.record_outcome(classification, panel.clone());
    });

    try_emit(
        events,
        DiscoveryEvent::Result {
            address,
            classification,
            panel,
        },
    );
}

/// Best-effort event emission: per-address results are advisory (the store
/// holds the truth), so a full buffer drops the event rather than stalling
/// the sweep, and a closed receiver means nobody is watching.
fn try_emit(events: &mpsc::Sender<DiscoveryEvent>, event: DiscoveryEvent) {
    match events.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(event)) => {
            debug!(?event, "Event buffer full, dropping scan event");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}
