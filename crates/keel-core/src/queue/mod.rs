//! Queue module: the FIFO that sits between submitters and the worker.

mod memory;

pub use memory::{PushError, WorkQueue};
