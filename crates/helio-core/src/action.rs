//! Action definitions and execution records.
//!
//! An action is an ordered list of stages; each stage is an opaque unit of
//! device operations with an expected duration. The engine sequences stages
//! and tracks the execution's lifecycle, but never interprets stage content.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::InvalidActionError;
use crate::job::JobId;

// ============================================================================
// Action Definition
// ============================================================================

/// One ordered sub-step of an action.
///
/// The payload is owned by the caller and handed verbatim to the
/// device-operation layer; the engine only sequences stages and bounds each
/// one by its expected duration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    /// Human-readable stage name (e.g. `"lower-shades"`).
    pub name: String,
    /// How long the stage's device operations are expected to take.
    pub expected_duration_ms: u64,
    /// Opaque device commands, uninterpreted by the engine.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Stage {
    /// Convenience constructor with an empty payload.
    pub fn new(name: impl Into<String>, expected_duration_ms: u64) -> Self {
        Self {
            name: name.into(),
            expected_duration_ms,
            payload: serde_json::Value::Null,
        }
    }
}

/// A named, ordered sequence of stages. Must contain at least one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDefinition {
    /// Action name (e.g. `"evening"`).
    pub name: String,
    /// Stages in execution order.
    pub stages: Vec<Stage>,
}

impl ActionDefinition {
    pub fn new(name: impl Into<String>, stages: Vec<Stage>) -> Self {
        Self {
            name: name.into(),
            stages,
        }
    }

    /// Rejects definitions the executor cannot run.
    ///
    /// # Errors
    ///
    /// `InvalidActionError::EmptyStages` if the stage list is empty.
    pub fn validate(&self) -> Result<(), InvalidActionError> {
        if self.stages.is_empty() {
            return Err(InvalidActionError::EmptyStages {
                name: self.name.clone(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Execution State
// ============================================================================

/// Lifecycle state of one action execution.
///
/// `Running` is the only non-terminal state. Terminal states admit no
/// further transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    /// The execution task is advancing through stages.
    Running,
    /// All stages ran without cancellation or failure.
    Completed,
    /// The execution was cancelled before exhausting its stages.
    Stopped,
    /// A stage failed unrecoverably.
    Failed,
}

impl ExecutionState {
    /// Whether this state admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionState::Running)
    }

    /// Stable label used in snapshots and log lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Running => "running",
            ExecutionState::Completed => "completed",
            ExecutionState::Stopped => "stopped",
            ExecutionState::Failed => "failed",
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Execution Record
// ============================================================================

/// Live record of one action execution.
///
/// Created on `start_action` and mutated exclusively by the execution task
/// that owns the id; observers receive cloned snapshots. Once the state is
/// terminal the record never changes again; the transition methods below
/// silently refuse to regress a terminal record.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    /// Identifier minted at start.
    pub execution_id: JobId,
    /// Profile the action runs against (validated by the caller layer).
    pub profile_id: i64,
    /// The definition being executed, shared read-only.
    pub action: Arc<ActionDefinition>,
    /// Lifecycle state.
    pub state: ExecutionState,
    /// Index of the stage currently (or last) being executed.
    pub current_stage_index: usize,
    /// When execution started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the state became terminal.
    pub finished_at: Option<DateTime<Utc>>,
    /// Failure detail, set only when `state == Failed`.
    pub error_message: Option<String>,
}

impl ExecutionRecord {
    /// Creates a running record positioned at the first stage.
    pub fn new(execution_id: JobId, profile_id: i64, action: Arc<ActionDefinition>) -> Self {
        Self {
            execution_id,
            profile_id,
            action,
            state: ExecutionState::Running,
            current_stage_index: 0,
            started_at: Some(Utc::now()),
            finished_at: None,
            error_message: None,
        }
    }

    /// Number of stages in the underlying definition.
    pub fn stage_count(&self) -> usize {
        self.action.stages.len()
    }

    /// Whether the record is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Advances to `index`. Ignored once terminal.
    pub fn advance_stage(&mut self, index: usize) {
        if self.is_terminal() {
            debug!(
                execution_id = %self.execution_id,
                state = %self.state,
                "Ignoring stage advance on terminal record"
            );
            return;
        }
        self.current_stage_index = index;
    }

    /// Transitions to `Completed`. Ignored once terminal.
    pub fn complete(&mut self) {
        self.finalize(ExecutionState::Completed, None);
    }

    /// Transitions to `Stopped`. Ignored once terminal.
    pub fn stop(&mut self) {
        self.finalize(ExecutionState::Stopped, None);
    }

    /// Transitions to `Failed` with a failure message. Ignored once terminal.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.finalize(ExecutionState::Failed, Some(message.into()));
    }

    fn finalize(&mut self, state: ExecutionState, error_message: Option<String>) {
        if self.is_terminal() {
            debug!(
                execution_id = %self.execution_id,
                current = %self.state,
                attempted = %state,
                "Ignoring transition on terminal record"
            );
            return;
        }
        self.state = state;
        self.error_message = error_message;
        self.finished_at = Some(Utc::now());
    }
}
