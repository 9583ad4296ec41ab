//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: monotonic ULID（同じミリ秒内でも生成順にソートできる）

use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use ulid::{Generator, Ulid};

use crate::domain::{ExecutorId, OperationId};

pub trait IdGenerator: Send + Sync {
    fn operation_id(&self) -> OperationId;

    fn executor_id(&self) -> ExecutorId;
}

/// ULID generator whose output increases strictly within one process, so
/// operation ids sort in submission order.
pub struct UlidGenerator {
    inner: Mutex<Generator>,
}

impl UlidGenerator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Generator::new()),
        }
    }

    fn next(&self) -> Ulid {
        let mut generator = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        // Monotonic overflow needs 2^80 ids in one millisecond; fall back to
        // a plain random ULID rather than failing.
        generator.generate().unwrap_or_else(|_| {
            let timestamp_ms = Utc::now().timestamp_millis() as u64;
            Ulid::from_parts(timestamp_ms, rand::random())
        })
    }
}

impl Default for UlidGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator for UlidGenerator {
    fn operation_id(&self) -> OperationId {
        OperationId::from_ulid(self.next())
    }

    fn executor_id(&self) -> ExecutorId {
        ExecutorId::from_ulid(self.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_increasing() {
        let id_gen = UlidGenerator::new();

        let ids: Vec<OperationId> = (0..100).map(|_| id_gen.operation_id()).collect();

        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn different_id_kinds_have_different_prefixes() {
        let id_gen = UlidGenerator::new();

        assert!(id_gen.operation_id().to_string().starts_with("op-"));
        assert!(id_gen.executor_id().to_string().starts_with("exec-"));
    }
}
