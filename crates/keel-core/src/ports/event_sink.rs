//! EventSink port - observability 出力の抽象化
//!
//! Executors and breakers push `Event`s here. A sink must be cheap and must
//! not block: it is called from the worker loop and from breaker call paths.
//! Sinks never influence correctness.

use crate::domain::Event;

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &Event);
}

impl<S: EventSink + ?Sized> EventSink for std::sync::Arc<S> {
    fn emit(&self, event: &Event) {
        (**self).emit(event)
    }
}
