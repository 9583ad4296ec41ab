//! Ports - 抽象化レイヤー
//!
//! executor / breaker が外部に依存する部分（イベント出力、ID 生成）を
//! trait として切り出しています。実装は `impls` にあります。

pub mod event_sink;
pub mod id_generator;

pub use self::event_sink::EventSink;
pub use self::id_generator::{IdGenerator, UlidGenerator};
