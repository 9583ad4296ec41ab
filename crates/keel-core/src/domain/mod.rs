//! Domain model (ids, lifecycle states, observability events).

pub mod events;
pub mod ids;
pub mod state;

pub use events::{Event, OperationOutcome, OperationRecord, StateTransition};
pub use ids::{ExecutorId, Id, IdMarker, OperationId};
pub use state::{CircuitState, ExecutorState};
