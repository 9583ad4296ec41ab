//! EventSink 実装
//!
//! - `TracingSink`: `tracing` にログとして出す（デフォルト）
//! - `MemorySink`: イベントをメモリに貯める（テスト・デモ用）
//! - `BroadcastSink`: tokio broadcast で購読者に配る
//! - `SinkSet`: 複数の sink へのファンアウト

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::domain::{Event, OperationOutcome, OperationRecord, StateTransition};
use crate::ports::EventSink;

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: &Event) {}
}

/// Writes events as structured log lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &Event) {
        match event {
            Event::Transition(t) => info!(
                breaker = %t.breaker,
                from = %t.from,
                to = %t.to,
                at = %t.at,
                "circuit breaker transition"
            ),
            Event::Operation(record) => log_operation(record),
            Event::ExecutorStopped { executor, name } => {
                info!(executor = %executor, name = %name, "executor stopped")
            }
        }
    }
}

fn log_operation(record: &OperationRecord) {
    let queued_ms = record
        .started_at
        .map(|started| (started - record.enqueued_at).num_milliseconds());
    let total_ms = (record.completed_at - record.enqueued_at).num_milliseconds();

    match &record.outcome {
        OperationOutcome::Succeeded => debug!(
            operation_id = %record.operation_id,
            executor = %record.executor,
            queued_ms = ?queued_ms,
            total_ms,
            "operation succeeded"
        ),
        outcome => warn!(
            operation_id = %record.operation_id,
            executor = %record.executor,
            queued_ms = ?queued_ms,
            total_ms,
            outcome = ?outcome,
            "operation did not succeed"
        ),
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn transitions(&self) -> Vec<StateTransition> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Transition(t) => Some(t),
                _ => None,
            })
            .collect()
    }

    pub fn operations(&self) -> Vec<OperationRecord> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Operation(r) => Some(r),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &Event) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

/// Fans events out to `tokio::sync::broadcast` subscribers.
///
/// Slow subscribers lag and lose the oldest events; emitters never wait.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<Event>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: &Event) {
        // No subscribers is fine.
        let _ = self.tx.send(event.clone());
    }
}

/// A list of sinks that all receive every event.
#[derive(Clone, Default)]
pub struct SinkSet {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl SinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventSink for SinkSet {
    fn emit(&self, event: &Event) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}
