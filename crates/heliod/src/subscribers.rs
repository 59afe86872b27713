//! Per-job progress listener fan-out.
//!
//! The multiplexer maps each job id to a set of sinks, one per observer
//! (e.g. one live stream connection). Delivery is best-effort and
//! non-blocking per sink: notifying N listeners costs N `try_send`
//! attempts, never a wait on the slowest one, so a stuck observer cannot
//! stall the job task that is publishing. Sinks whose channel has closed
//! are pruned on the spot.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::debug;

use helio_core::{ExecutionRecord, JobId};

/// A listener's receiving end handle, as registered by the transport layer.
pub type ProgressSink = mpsc::Sender<ExecutionRecord>;

/// Handle identifying one registered sink, so the transport can tear down
/// exactly its own subscription on disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, Default)]
struct MuxInner {
    sinks: HashMap<JobId, HashMap<u64, ProgressSink>>,
    next_id: u64,
}

/// Per-job set of progress listeners with best-effort fan-out.
#[derive(Debug, Default)]
pub struct SubscriberMux {
    inner: Mutex<MuxInner>,
}

impl SubscriberMux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `sink` as a listener for `job_id`.
    ///
    /// Subscribing to an unknown or already-finished job is permitted; the
    /// sink simply never receives anything (the caller can still fetch the
    /// final snapshot by polling).
    pub fn subscribe(&self, job_id: JobId, sink: ProgressSink) -> SubscriptionId {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.sinks.entry(job_id).or_default().insert(id, sink);

        debug!(%job_id, subscription = id, "Progress listener added");
        SubscriptionId(id)
    }

    /// Removes one subscription. No-op if the job or the subscription is
    /// already gone.
    pub fn unsubscribe(&self, job_id: JobId, subscription: SubscriptionId) {
        let mut inner = self.lock();
        if let Some(sinks) = inner.sinks.get_mut(&job_id) {
            if sinks.remove(&subscription.0).is_some() {
                debug!(%job_id, subscription = subscription.0, "Progress listener removed");
            }
            if sinks.is_empty() {
                inner.sinks.remove(&job_id);
            }
        }
    }

    /// Delivers `snapshot` to every listener of `job_id`, best-effort.
    ///
    /// A closed sink is pruned immediately; a full sink drops this one
    /// notification (the observer can re-sync from the progress store).
    /// Returns the number of successful deliveries.
    pub fn notify(&self, job_id: JobId, snapshot: &ExecutionRecord) -> usize {
        let mut inner = self.lock();
        let Some(sinks) = inner.sinks.get_mut(&job_id) else {
            return 0;
        };

        let mut delivered = 0;
        let mut closed = Vec::new();

        for (id, sink) in sinks.iter() {
            match sink.try_send(snapshot.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(
                        %job_id,
                        subscription = id,
                        "Listener channel full, dropping notification"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    closed.push(*id);
                }
            }
        }

        for id in closed {
            sinks.remove(&id);
            debug!(%job_id, subscription = id, "Pruned closed listener");
        }
        if sinks.is_empty() {
            inner.sinks.remove(&job_id);
        }

        delivered
    }

    /// Drops every listener of `job_id` (used after the terminal snapshot
    /// has been delivered; late subscribers poll the store instead).
    pub fn drop_job(&self, job_id: JobId) {
        let mut inner = self.lock();
        if let Some(sinks) = inner.sinks.remove(&job_id) {
            if !sinks.is_empty() {
                debug!(%job_id, listeners = sinks.len(), "Dropped listeners of finished job");
            }
        }
    }

    /// Number of listeners currently registered for `job_id`.
    pub fn listener_count(&self, job_id: JobId) -> usize {
        self.lock().sinks.get(&job_id).map_or(0, |sinks| sinks.len())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MuxInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use helio_core::{ActionDefinition, Stage};

    fn test_snapshot() -> ExecutionRecord {
        let action = Arc::new(ActionDefinition::new(
            "evening",
            vec![Stage::new("lower-shades", 100)],
        ));
        ExecutionRecord::new(JobId::new(), 1, action)
    }

    #[tokio::test]
    async fn test_notify_reaches_all_listeners() {
        let mux = SubscriberMux::new();
        let job_id = JobId::new();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        mux.subscribe(job_id, tx_a);
        mux.subscribe(job_id, tx_b);

        let snapshot = test_snapshot();
        assert_eq!(mux.notify(job_id, &snapshot), 2);

        assert_eq!(
            rx_a.recv().await.expect("delivery").execution_id,
            snapshot.execution_id
        );
        assert_eq!(
            rx_b.recv().await.expect("delivery").execution_id,
            snapshot.execution_id
        );
    }

    #[tokio::test]
    async fn test_closed_sink_is_pruned() {
        let mux = SubscriberMux::new();
        let job_id = JobId::new();
        let (tx_open, _rx_open) = mpsc::channel(4);
        let (tx_closed, rx_closed) = mpsc::channel(4);
        mux.subscribe(job_id, tx_open);
        mux.subscribe(job_id, tx_closed);
        drop(rx_closed);

        assert_eq!(mux.notify(job_id, &test_snapshot()), 1);
        assert_eq!(mux.listener_count(job_id), 1);
    }

    #[tokio::test]
    async fn test_full_sink_drops_notification_without_pruning() {
        let mux = SubscriberMux::new();
        let job_id = JobId::new();
        let (tx, mut rx) = mpsc::channel(1);
        mux.subscribe(job_id, tx);

        assert_eq!(mux.notify(job_id, &test_snapshot()), 1);
        // Channel is now full: the next notification is dropped, but the
        // listener stays registered.
        assert_eq!(mux.notify(job_id, &test_snapshot()), 0);
        assert_eq!(mux.listener_count(job_id), 1);

        // After draining, delivery resumes.
        let _ = rx.recv().await;
        assert_eq!(mux.notify(job_id, &test_snapshot()), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_targeted_and_idempotent() {
        let mux = SubscriberMux::new();
        let job_id = JobId::new();
        let (tx_a, _rx_a) = mpsc::channel(4);
        let (tx_b, _rx_b) = mpsc::channel(4);
        let sub_a = mux.subscribe(job_id, tx_a);
        let _sub_b = mux.subscribe(job_id, tx_b);

        mux.unsubscribe(job_id, sub_a);
        assert_eq!(mux.listener_count(job_id), 1);

        // Removing again, or removing from an unknown job, is a no-op.
        mux.unsubscribe(job_id, sub_a);
        mux.unsubscribe(JobId::new(), sub_a);
        assert_eq!(mux.listener_count(job_id), 1);
    }

    #[tokio::test]
    async fn test_notify_without_listeners() {
        let mux = SubscriberMux::new();
        assert_eq!(mux.notify(JobId::new(), &test_snapshot()), 0);
    }

    #[tokio::test]
    async fn test_drop_job_clears_listeners() {
        let mux = SubscriberMux::new();
        let job_id = JobId::new();
        let (tx, _rx) = mpsc::channel(4);
        mux.subscribe(job_id, tx);

        mux.drop_job(job_id);
        assert_eq!(mux.listener_count(job_id), 0);
    }
}
