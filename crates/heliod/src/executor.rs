//! Multi-stage action executor.
//!
//! Each execution runs as one detached task, decoupled from the request
//! that started it. The task is the sole writer of its execution record:
//! it advances stage-by-stage, checks its stop flag before every stage (and
//! once more before declaring completion), and publishes a snapshot to the
//! subscriber multiplexer after every state-affecting change. Stopping is
//! cooperative: `stop_action` only raises the flag; the owning task runs
//! the optional compensating halt and finalizes the record itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use helio_core::{ActionDefinition, ExecutionRecord, InvalidActionError, JobId};

use crate::config::ExecutorSettings;
use crate::ops::{DeviceOps, StageError};
use crate::progress::ProgressStore;
use crate::subscribers::{ProgressSink, SubscriberMux, SubscriptionId};

/// Per-execution stop request.
///
/// `compensate` must be set before the token is cancelled so the execution
/// task observes both together.
struct StopFlag {
    token: CancellationToken,
    compensate: AtomicBool,
}

struct ExecutorContext {
    ops: Arc<dyn DeviceOps>,
    store: Arc<ProgressStore>,
    subscribers: Arc<SubscriberMux>,
    settings: ExecutorSettings,
    stops: Mutex<HashMap<JobId, Arc<StopFlag>>>,
}

impl ExecutorContext {
    fn lock_stops(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, Arc<StopFlag>>> {
        match self.stops.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Executor for named, multi-stage device-control actions.
///
/// Supports any number of concurrent executions; each gets its own id,
/// record, and stop flag.
pub struct ActionExecutor {
    ctx: Arc<ExecutorContext>,
}

impl ActionExecutor {
    pub fn new(
        ops: Arc<dyn DeviceOps>,
        store: Arc<ProgressStore>,
        subscribers: Arc<SubscriberMux>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            ctx: Arc::new(ExecutorContext {
                ops,
                store,
                subscribers,
                settings,
                stops: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Starts executing `action` against `profile_id`.
    ///
    /// Returns the execution id immediately; progress is observed via
    /// [`get_progress`](Self::get_progress) or a listener subscription, not
    /// via this call.
    ///
    /// # Errors
    ///
    /// `InvalidActionError` if the definition has no stages. No record is
    /// created for a rejected action.
    pub fn start_action(
        &self,
        profile_id: i64,
        action: ActionDefinition,
    ) -> Result<JobId, InvalidActionError> {
        action.validate()?;

        let execution_id = JobId::new();
        let action = Arc::new(action);
        let record = ExecutionRecord::new(execution_id, profile_id, Arc::clone(&action));
        let flag = Arc::new(StopFlag {
            token: CancellationToken::new(),
            compensate: AtomicBool::new(false),
        });

        self.ctx.store.insert_execution(record);
        self.ctx
            .lock_stops()
            .insert(execution_id, Arc::clone(&flag));

        info!(
            %execution_id,
            profile_id,
            action = %action.name,
            stages = action.stages.len(),
            "Action execution started"
        );

        let ctx = Arc::clone(&self.ctx);
        tokio::spawn(run_execution(ctx, execution_id, action, profile_id, flag));

        Ok(execution_id)
    }

    /// Requests that a running execution stop before its next stage.
    ///
    /// Returns `false` when the id is unknown or the execution has already
    /// reached a terminal state; callers cannot distinguish the two. With
    /// `compensate` set, the execution task runs one compensating halt
    /// (stopping any actuator the interrupted stage left mid-motion) before
    /// finalizing; without it, physical actuation is left to finish on its
    /// own. Returns `true` once the stop has been requested.
    pub fn stop_action(&self, execution_id: JobId, compensate: bool) -> bool {
        let flag = self.ctx.lock_stops().get(&execution_id).cloned();
        let Some(flag) = flag else {
            return false;
        };

        // The flag can outlive the record's terminal transition briefly;
        // a stop after that point must still report "already finished".
        match self.ctx.store.get_execution(execution_id) {
            Some(record) if !record.is_terminal() => {
                if compensate {
                    flag.compensate.store(true, Ordering::SeqCst);
                }
                flag.token.cancel();
                info!(%execution_id, compensate, "Stop requested");
                true
            }
            _ => false,
        }
    }

    /// Returns the record for `execution_id`, running or retained.
    pub fn get_progress(&self, execution_id: JobId) -> Option<ExecutionRecord> {
        self.ctx.store.get_execution(execution_id)
    }

    /// Returns every execution currently running, for reconnect/resume UX.
    pub fn running_actions(&self) -> Vec<ExecutionRecord> {
        self.ctx.store.running_executions()
    }

    /// Registers a progress listener for `execution_id`.
    ///
    /// The sink receives a snapshot after every state-affecting change,
    /// ending with the terminal one. A listener attached after termination
    /// receives nothing; the final snapshot stays available via
    /// [`get_progress`](Self::get_progress).
    pub fn add_progress_listener(
        &self,
        execution_id: JobId,
        sink: ProgressSink,
    ) -> SubscriptionId {
        self.ctx.subscribers.subscribe(execution_id, sink)
    }

    /// Tears down one listener subscription. No-op if the execution or the
    /// subscription is already gone.
    pub fn remove_progress_listener(&self, execution_id: JobId, subscription: SubscriptionId) {
        self.ctx.subscribers.unsubscribe(execution_id, subscription);
    }
}

// ============================================================================
// Execution task
// ============================================================================

async fn run_execution(
    ctx: Arc<ExecutorContext>,
    execution_id: JobId,
    action: Arc<ActionDefinition>,
    profile_id: i64,
    flag: Arc<StopFlag>,
) {
    // Index of the last stage that actually issued device commands; the
    // compensating halt targets this stage's actuators.
    let mut last_run: Option<usize> = None;

    for (index, stage) in action.stages.iter().enumerate() {
        // Cooperative cancellation, checked before each stage.
        if flag.token.is_cancelled() {
            finish_stopped(&ctx, execution_id, profile_id, &action, last_run, &flag).await;
            return;
        }

        if index > 0 {
            if let Some(snapshot) = ctx
                .store
                .update_execution(execution_id, |r| r.advance_stage(index))
            {
                ctx.subscribers.notify(execution_id, &snapshot);
            }
        }

        debug!(
            %execution_id,
            stage = %stage.name,
            index,
            "Running stage"
        );

        // A stage is bounded by its own expected duration plus a grace
        // allowance; device operations are not aborted mid-call otherwise.
        let budget = Duration::from_millis(stage.expected_duration_ms) + ctx.settings.stage_grace();
        let result = match timeout(budget, ctx.ops.run_stage(profile_id, stage)).await {
            Ok(result) => result,
            Err(_) => Err(StageError::new(format!(
                "stage {:?} exceeded its {}ms budget",
                stage.name,
                budget.as_millis()
            ))),
        };

        if let Err(error) = result {
            warn!(
                %execution_id,
                stage = %stage.name,
                error = %error,
                "Stage failed, aborting remaining stages"
            );
            finalize(&ctx, execution_id, |r| r.fail(error.to_string()));
            return;
        }

        last_run = Some(index);
    }

    // A stop that landed during the final stage still wins over completion.
    if flag.token.is_cancelled() {
        finish_stopped(&ctx, execution_id, profile_id, &action, last_run, &flag).await;
        return;
    }

    finalize(&ctx, execution_id, |r| r.complete());
}

/// Runs the compensating halt when requested, then finalizes as `Stopped`.
async fn finish_stopped(
    ctx: &Arc<ExecutorContext>,
    execution_id: JobId,
    profile_id: i64,
    action: &ActionDefinition,
    last_run: Option<usize>,
    flag: &StopFlag,
) {
    if flag.compensate.load(Ordering::SeqCst) {
        let interrupted = last_run.and_then(|index| action.stages.get(index));
        debug!(
            %execution_id,
            interrupted = interrupted.map(|s| s.name.as_str()),
            "Running compensating halt"
        );
        if let Err(error) = ctx.ops.halt(profile_id, interrupted).await {
            // The stop itself still succeeds; the actuator just keeps
            // moving until its own controller finishes.
            warn!(%execution_id, error = %error, "Compensating halt failed");
        }
    }

    finalize(ctx, execution_id, |r| r.stop());
}

/// Applies the terminal transition, emits the final snapshot, and releases
/// the execution's listeners and stop flag.
fn finalize(
    ctx: &Arc<ExecutorContext>,
    execution_id: JobId,
    mutate: impl FnOnce(&mut ExecutionRecord),
) {
    if let Some(snapshot) = ctx.store.update_execution(execution_id, mutate) {
        info!(
            %execution_id,
            state = %snapshot.state,
            stage = snapshot.current_stage_index,
            "Execution finished"
        );
        ctx.subscribers.notify(execution_id, &snapshot);
        ctx.subscribers.drop_job(execution_id);
    }
    ctx.lock_stops().remove(&execution_id);
}
