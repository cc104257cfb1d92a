//! KvBackend port - トランザクショナルな key-value ストア
//!
//! # 設計原則
//! - 書き込みは WriteBatch 単位で all-or-nothing
//! - WriteBatch の guard（読んだ値が変わっていないこと）は apply の中で検証する
//!   → 楽観的トランザクションの commit 判定はバックエンドの原子性に任せる
//! - scan は開始時点で一貫したスナップショットを返す
//!
//! # 実装
//! - SledBackend: 永続化（sled, memory-mapped）
//! - MemoryBackend: テスト・一時利用

use std::time::Duration;

use crate::domain::{CoordError, WatchEvent};

/// A read-set entry: the value a transaction observed for `key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guard {
    /// `key` must still hold exactly `value`.
    Equals { key: String, value: Vec<u8> },

    /// `key` must still be absent.
    Absent { key: String },
}

impl Guard {
    pub fn key(&self) -> &str {
        match self {
            Guard::Equals { key, .. } | Guard::Absent { key } => key,
        }
    }

    pub fn holds(&self, current: Option<&[u8]>) -> bool {
        match (self, current) {
            (Guard::Equals { value, .. }, Some(current)) => value.as_slice() == current,
            (Guard::Absent { .. }, None) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl WriteOp {
    pub fn key(&self) -> &str {
        match self {
            WriteOp::Put { key, .. } | WriteOp::Delete { key } => key,
        }
    }
}

/// Guards plus writes, applied atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    guards: Vec<Guard>,
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guard(&mut self, guard: Guard) -> &mut Self {
        self.guards.push(guard);
        self
    }

    pub fn put(&mut self, key: impl Into<String>, value: Vec<u8>) -> &mut Self {
        self.ops.push(WriteOp::Put {
            key: key.into(),
            value,
        });
        self
    }

    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(WriteOp::Delete { key: key.into() });
        self
    }

    pub fn guards(&self) -> &[Guard] {
        &self.guards
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn is_read_only(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Result of a successful apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    /// Strictly greater than every earlier revision of the same store.
    /// A read-only batch reports the latest revision instead of minting one.
    pub revision: u64,

    /// One event per key that actually changed, in op order.
    pub events: Vec<WatchEvent>,
}

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("guard failed on {key}")]
    Conflict { key: String },

    #[error("store lock not acquired within {0:?}")]
    LockTimeout(Duration),

    #[error("backend: {0}")]
    Backend(String),
}

pub trait KvBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    /// At most `limit` entries under `prefix` ordered by key, starting
    /// strictly after `start_after` when given. Consistent as of one point
    /// in time.
    fn scan_page(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, Vec<u8>)>, KvError>;

    /// Every entry under `prefix`, as one snapshot.
    fn scan_prefix(
        &self,
        prefix: &str,
        start_after: Option<&str>,
    ) -> Result<Vec<(String, Vec<u8>)>, KvError> {
        self.scan_page(prefix, start_after, usize::MAX)
    }

    /// Validate every guard and apply every op, or do nothing.
    fn apply(&self, batch: &WriteBatch) -> Result<Commit, KvError>;

    fn flush(&self) -> Result<(), KvError>;
}

impl From<KvError> for CoordError {
    fn from(err: KvError) -> Self {
        match &err {
            KvError::Conflict { .. } | KvError::LockTimeout(_) => {
                CoordError::ClaimConflict(err.to_string())
            }
            KvError::Backend(msg) => CoordError::StoreUnavailable(msg.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_compare_observed_values() {
        let equals = Guard::Equals {
            key: "k".into(),
            value: b"v1".to_vec(),
        };
        assert!(equals.holds(Some(b"v1")));
        assert!(!equals.holds(Some(b"v2")));
        assert!(!equals.holds(None));

        let absent = Guard::Absent { key: "k".into() };
        assert!(absent.holds(None));
        assert!(!absent.holds(Some(b"v1")));
    }

    #[test]
    fn conflicts_surface_as_retryable_claim_conflicts() {
        let err: CoordError = KvError::Conflict {
            key: "pending/high/x".into(),
        }
        .into();
        assert!(err.is_retryable());

        let err: CoordError = KvError::Backend("disk full".into()).into();
        assert!(matches!(err, CoordError::StoreUnavailable(_)));
    }
}
