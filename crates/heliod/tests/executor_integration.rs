//! Integration tests for the action executor, driven through a full Hub.
//!
//! These exercise the executor as a complete system: detached execution
//! tasks, stop semantics, compensating halts, and listener fan-out.
//!
//! Tests may use `.unwrap()` and `.expect()`; production code may not.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use helio_core::{ActionDefinition, ExecutionRecord, ExecutionState, JobId, Stage};
use heliod::config::HubConfig;
use heliod::hub::Hub;
use heliod::ops::{DeviceOps, IdentifyOutcome, ProbeOutcome, StageError};

// ============================================================================
// Test Helpers
// ============================================================================

/// Scripted device layer: every stage sleeps `stage_delay_ms`, the stage
/// named `fail_stage` fails, and halts are counted.
#[derive(Debug, Default)]
struct ScriptedOps {
    stage_delay_ms: u64,
    fail_stage: Option<&'static str>,
    ran: Mutex<Vec<String>>,
    halts: AtomicUsize,
}

#[async_trait]
impl DeviceOps for ScriptedOps {
    async fn probe(&self, _address: std::net::Ipv4Addr) -> ProbeOutcome {
        ProbeOutcome::NoResponse
    }

    async fn identify(&self, _address: std::net::Ipv4Addr) -> IdentifyOutcome {
        IdentifyOutcome::NotPanel
    }

    async fn run_stage(&self, _profile_id: i64, stage: &Stage) -> Result<(), StageError> {
        self.ran.lock().expect("lock").push(stage.name.clone());
        if self.stage_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.stage_delay_ms)).await;
        }
        if self.fail_stage == Some(stage.name.as_str()) {
            return Err(StageError::new("panel rejected the command"));
        }
        Ok(())
    }

    async fn halt(
        &self,
        _profile_id: i64,
        _interrupted: Option<&Stage>,
    ) -> Result<(), StageError> {
        self.halts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn hub_with(ops: Arc<ScriptedOps>) -> Hub {
    Hub::new(HubConfig::default(), ops)
}

fn action(name: &str, stages: &[&str]) -> ActionDefinition {
    ActionDefinition::new(
        name,
        stages.iter().map(|stage| Stage::new(*stage, 20)).collect(),
    )
}

async fn wait_for_terminal(hub: &Hub, id: JobId) -> ExecutionRecord {
    for _ in 0..400 {
        if let Some(record) = hub.executor().get_progress(id) {
            if record.is_terminal() {
                return record;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("execution {id} did not reach a terminal state");
}

/// Drains a listener channel to its last snapshot (the terminal one).
async fn last_snapshot(mut events: mpsc::Receiver<ExecutionRecord>) -> ExecutionRecord {
    let mut last = None;
    while let Some(snapshot) = events.recv().await {
        last = Some(snapshot);
    }
    last.expect("listener should have received at least the terminal snapshot")
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_every_stage_count_reaches_completed() {
    for stage_count in 1..=4 {
        let ops = Arc::new(ScriptedOps::default());
        let hub = hub_with(Arc::clone(&ops));

        let names: Vec<String> = (0..stage_count).map(|i| format!("stage-{i}")).collect();
        let stages: Vec<Stage> = names.iter().map(|n| Stage::new(n.clone(), 10)).collect();
        let id = hub
            .executor()
            .start_action(1, ActionDefinition::new("sweep", stages))
            .expect("start");

        let record = wait_for_terminal(&hub, id).await;
        assert_eq!(record.state, ExecutionState::Completed);
        assert_eq!(record.current_stage_index, stage_count - 1);
        assert!(record.finished_at.is_some());
        assert_eq!(ops.ran.lock().expect("lock").len(), stage_count);
    }
}

#[tokio::test]
async fn test_start_returns_before_execution_finishes() {
    let ops = Arc::new(ScriptedOps {
        stage_delay_ms: 60,
        ..Default::default()
    });
    let hub = hub_with(ops);

    let id = hub
        .executor()
        .start_action(1, action("evening", &["lower", "tilt"]))
        .expect("start");

    // The call returned while the execution is still running.
    let record = hub.executor().get_progress(id).expect("record");
    assert_eq!(record.state, ExecutionState::Running);
    assert!(hub
        .executor()
        .running_actions()
        .iter()
        .any(|r| r.execution_id == id));

    let record = wait_for_terminal(&hub, id).await;
    assert_eq!(record.state, ExecutionState::Completed);
    assert!(hub.executor().running_actions().is_empty());
}

#[tokio::test]
async fn test_unknown_id_polls_as_not_found() {
    let hub = hub_with(Arc::new(ScriptedOps::default()));
    assert!(hub.executor().get_progress(JobId::new()).is_none());
}

#[tokio::test]
async fn test_terminal_record_stays_pollable() {
    let hub = hub_with(Arc::new(ScriptedOps::default()));
    let id = hub
        .executor()
        .start_action(7, action("evening", &["lower"]))
        .expect("start");

    wait_for_terminal(&hub, id).await;

    // Long after completion the record is still there for late pollers.
    let record = hub.executor().get_progress(id).expect("retained record");
    assert_eq!(record.state, ExecutionState::Completed);
    assert_eq!(record.profile_id, 7);
}

// ============================================================================
// Stop semantics
// ============================================================================

#[tokio::test]
async fn test_scenario_immediate_stop_with_compensation() {
    // startAction(1, {evening, [A, B]}) -> X; stopAction(X, true) -> true;
    // X eventually reports stopped with stage index <= 1.
    let ops = Arc::new(ScriptedOps {
        stage_delay_ms: 50,
        ..Default::default()
    });
    let hub = hub_with(Arc::clone(&ops));

    let id = hub
        .executor()
        .start_action(1, action("evening", &["a", "b"]))
        .expect("start");
    assert!(hub.executor().stop_action(id, true));

    let record = wait_for_terminal(&hub, id).await;
    assert_eq!(record.state, ExecutionState::Stopped);
    assert!(record.current_stage_index <= 1);
    assert!(record.finished_at.is_some());
    assert_eq!(ops.halts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stop_never_existed_and_already_finished() {
    let hub = hub_with(Arc::new(ScriptedOps::default()));

    // Never existed.
    assert!(!hub.executor().stop_action(JobId::new(), false));

    // Already finished: indistinguishable from never-existed.
    let id = hub
        .executor()
        .start_action(1, action("evening", &["lower"]))
        .expect("start");
    wait_for_terminal(&hub, id).await;
    assert!(!hub.executor().stop_action(id, true));
}

#[tokio::test]
async fn test_stop_without_compensation_leaves_actuators_alone() {
    let ops = Arc::new(ScriptedOps {
        stage_delay_ms: 50,
        ..Default::default()
    });
    let hub = hub_with(Arc::clone(&ops));

    let id = hub
        .executor()
        .start_action(1, action("evening", &["a", "b", "c"]))
        .expect("start");
    assert!(hub.executor().stop_action(id, false));

    let record = wait_for_terminal(&hub, id).await;
    assert_eq!(record.state, ExecutionState::Stopped);
    assert_eq!(ops.halts.load(Ordering::SeqCst), 0);
}

// ============================================================================
// Failure handling
// ============================================================================

#[tokio::test]
async fn test_failure_stops_advancing_and_records_message() {
    let ops = Arc::new(ScriptedOps {
        fail_stage: Some("tilt"),
        ..Default::default()
    });
    let hub = hub_with(Arc::clone(&ops));

    let id = hub
        .executor()
        .start_action(1, action("evening", &["lower", "tilt", "lock"]))
        .expect("start");

    let record = wait_for_terminal(&hub, id).await;
    assert_eq!(record.state, ExecutionState::Failed);
    assert_eq!(
        record.error_message.as_deref(),
        Some("panel rejected the command")
    );
    // The failing stage was the last one to run.
    let ran = ops.ran.lock().expect("lock").clone();
    assert_eq!(ran, vec!["lower", "tilt"]);
}

// ============================================================================
// Listeners
// ============================================================================

#[tokio::test]
async fn test_two_listeners_observe_the_same_terminal_state() {
    let ops = Arc::new(ScriptedOps {
        stage_delay_ms: 40,
        fail_stage: Some("tilt"),
        ..Default::default()
    });
    let hub = hub_with(ops);

    let id = hub
        .executor()
        .start_action(1, action("evening", &["lower", "tilt"]))
        .expect("start");

    let (sink_a, events_a) = mpsc::channel(16);
    let (sink_b, events_b) = mpsc::channel(16);
    hub.executor().add_progress_listener(id, sink_a);
    hub.executor().add_progress_listener(id, sink_b);

    let final_a = last_snapshot(events_a).await;
    let final_b = last_snapshot(events_b).await;

    assert_eq!(final_a.state, ExecutionState::Failed);
    assert_eq!(final_b.state, ExecutionState::Failed);
    assert_eq!(final_a.error_message, final_b.error_message);
}

#[tokio::test]
async fn test_listener_added_after_termination_uses_polling() {
    let hub = hub_with(Arc::new(ScriptedOps::default()));
    let id = hub
        .executor()
        .start_action(1, action("evening", &["lower"]))
        .expect("start");
    wait_for_terminal(&hub, id).await;

    // Late subscription receives nothing...
    let (sink, mut events) = mpsc::channel(4);
    hub.executor().add_progress_listener(id, sink);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err());

    // ...but the final snapshot is still available by polling.
    let record = hub.executor().get_progress(id).expect("final snapshot");
    assert_eq!(record.state, ExecutionState::Completed);
}

#[tokio::test]
async fn test_removed_listener_stops_receiving() {
    let ops = Arc::new(ScriptedOps {
        stage_delay_ms: 40,
        ..Default::default()
    });
    let hub = hub_with(ops);

    let id = hub
        .executor()
        .start_action(1, action("evening", &["a", "b", "c"]))
        .expect("start");
    let (sink, mut events) = mpsc::channel(16);
    let subscription = hub.executor().add_progress_listener(id, sink);
    hub.executor().remove_progress_listener(id, subscription);

    wait_for_terminal(&hub, id).await;
    // The channel closed without ever delivering (sender was dropped on
    // removal or job teardown).
    assert!(events.recv().await.is_none());
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test]
async fn test_many_concurrent_executions_progress_independently() {
    let ops = Arc::new(ScriptedOps {
        stage_delay_ms: 30,
        ..Default::default()
    });
    let hub = hub_with(ops);

    let ids: Vec<JobId> = (1..=8)
        .map(|profile| {
            hub.executor()
                .start_action(profile, action("evening", &["lower", "tilt"]))
                .expect("start")
        })
        .collect();

    // Stop a couple of them mid-flight.
    assert!(hub.executor().stop_action(ids[1], false));
    assert!(hub.executor().stop_action(ids[5], true));

    for (index, id) in ids.iter().enumerate() {
        let record = wait_for_terminal(&hub, *id).await;
        let expected = if index == 1 || index == 5 {
            ExecutionState::Stopped
        } else {
            ExecutionState::Completed
        };
        assert_eq!(record.state, expected, "execution {index}");
        assert_eq!(record.profile_id, index as i64 + 1);
    }

    assert!(hub.executor().running_actions().is_empty());
}

// ============================================================================
// Session token
// ============================================================================

#[tokio::test]
async fn test_session_token_distinguishes_instances() {
    // A restarted daemon is a new Hub: its token must differ so clients
    // can detect that in-memory job state was lost.
    let first = hub_with(Arc::new(ScriptedOps::default()));
    let second = hub_with(Arc::new(ScriptedOps::default()));

    assert!(!first.session_token().is_empty());
    assert_ne!(first.session_token(), second.session_token());
}
