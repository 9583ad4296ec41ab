//! Domain identifiers (strongly-typed IDs).
//!
//! ULID ベースの ID を Phantom type で型付けしています。
//! - 生成順にソートできる（ログを時系列で追いやすい）
//! - `OperationId` と `ExecutorId` は別の型なので混同できない

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// Marker trait for each id kind. Supplies the display prefix.
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic ULID-backed identifier.
///
/// `T` only exists at compile time; `Id<T>` is exactly as large as a `Ulid`.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Marker for submitted operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operation {}

impl IdMarker for Operation {
    fn prefix() -> &'static str {
        "op-"
    }
}

/// Marker for executor instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Executor {}

impl IdMarker for Executor {
    fn prefix() -> &'static str {
        "exec-"
    }
}

/// Identifier of one submitted operation.
pub type OperationId = Id<Operation>;

/// Identifier of a `TaskExecutor` instance.
pub type ExecutorId = Id<Executor>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_uses_kind_prefix() {
        let op = OperationId::from_ulid(Ulid::new());
        let exec = ExecutorId::from_ulid(Ulid::new());

        assert!(op.to_string().starts_with("op-"));
        assert!(exec.to_string().starts_with("exec-"));
        // let _: OperationId = exec; // <- does not compile
    }

    #[test]
    fn ids_sort_by_creation_time() {
        let id1 = OperationId::from_ulid(Ulid::new());
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = OperationId::from_ulid(Ulid::new());

        assert!(id1 < id2);
    }

    #[test]
    fn serializes_with_ulid_text() {
        let ulid = Ulid::new();
        let id = OperationId::from_ulid(ulid);

        let json = serde_json::to_string(&id).unwrap();
        assert!(json.contains(&ulid.to_string()));

        let back: OperationId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn phantom_marker_costs_nothing() {
        assert_eq!(std::mem::size_of::<OperationId>(), std::mem::size_of::<Ulid>());
    }
}
