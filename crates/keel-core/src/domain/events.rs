//! Events - observability records emitted by the executor and breakers.
//!
//! These are data only; they are consumed by `EventSink`s and are never
//! required for correctness.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ExecutorId, OperationId};
use super::state::CircuitState;

/// One circuit breaker state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub breaker: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: DateTime<Utc>,
}

impl StateTransition {
    pub fn new(breaker: impl Into<String>, from: CircuitState, to: CircuitState) -> Self {
        Self {
            breaker: breaker.into(),
            from,
            to,
            at: Utc::now(),
        }
    }
}

/// How an operation ended on the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum OperationOutcome {
    Succeeded,
    Failed(String),
    Panicked(String),
    DeadlineExceeded,
    /// Cancelled after being dequeued but before it started.
    Cancelled,
    /// Discarded by a non-draining shutdown; never started.
    Discarded,
}

impl OperationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, OperationOutcome::Succeeded)
    }
}

/// Per-operation timing record.
///
/// `started_at` is `None` when the operation never ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub operation_id: OperationId,
    pub executor: String,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: DateTime<Utc>,
    pub outcome: OperationOutcome,
}

/// Everything an `EventSink` can receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    Transition(StateTransition),
    Operation(OperationRecord),
    ExecutorStopped { executor: ExecutorId, name: String },
}
