//! State - executor と circuit breaker の状態

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a `TaskExecutor`.
///
/// State transitions:
/// - Running -> Draining (shutdown requested, queue closed)
/// - Draining -> Stopped (queue empty, worker exited)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorState {
    /// Accepting submissions.
    Running,

    /// No new submissions; queued operations still run (unless discarded).
    Draining,

    /// Worker loop has exited.
    Stopped,
}

impl ExecutorState {
    pub fn accepts_work(self) -> bool {
        matches!(self, ExecutorState::Running)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutorState::Stopped)
    }
}

/// State of a circuit breaker.
///
/// - Closed -> Open (failure threshold or failure rate reached)
/// - Open -> HalfOpen (reset timeout elapsed, one probe admitted)
/// - HalfOpen -> Closed (success threshold reached)
/// - HalfOpen -> Open (any failure)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
