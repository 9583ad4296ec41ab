//! Impls - ports の実装

pub mod sinks;

pub use sinks::{BroadcastSink, MemorySink, NoopSink, SinkSet, TracingSink};
