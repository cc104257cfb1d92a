//! Errors - エラー型と分類
//!
//! # 分類
//! - Transient: 競合に負けた / 依存待ち（リトライ推奨）
//! - Permanent: 呼び出し側の誤り（リトライ無意味）
//! - Infrastructure: ストアの障害

use super::{GuardViolation, TaskId, TaskStatus};

/// ErrorKind は運用上の分類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

/// CoordError は coordination store のエラー
///
/// どの失敗も store をトランザクション開始前の状態のまま残す。
#[derive(Debug, thiserror::Error)]
pub enum CoordError {
    #[error("task {id} not found")]
    NotFound { id: TaskId },

    #[error("task {id} already exists")]
    AlreadyExists { id: TaskId },

    #[error("invalid transition for task {id}: {from} -> {to} ({reason})")]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
        reason: GuardViolation,
    },

    #[error("claim conflict: {0}")]
    ClaimConflict(String),

    #[error("task {id} is waiting on {} unfinished dependencies", .waiting_on.len())]
    DependencyUnmet { id: TaskId, waiting_on: Vec<TaskId> },

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("corrupt record at {key}")]
    CorruptRecord {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("record at {key} is misplaced: {reason}")]
    MisplacedRecord { key: String, reason: String },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl CoordError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoordError::ClaimConflict(_) | CoordError::DependencyUnmet { .. } => {
                ErrorKind::Transient
            }
            CoordError::NotFound { .. }
            | CoordError::AlreadyExists { .. }
            | CoordError::InvalidTransition { .. }
            | CoordError::InvalidTask(_) => ErrorKind::Permanent,
            CoordError::CorruptRecord { .. }
            | CoordError::MisplacedRecord { .. }
            | CoordError::StoreUnavailable(_) => ErrorKind::Infrastructure,
        }
    }

    /// A stored record that cannot be turned into a task where it lies.
    pub fn is_unreadable_record(&self) -> bool {
        matches!(
            self,
            CoordError::CorruptRecord { .. } | CoordError::MisplacedRecord { .. }
        )
    }

    /// Worth retrying the same operation later.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn contention_is_transient() {
        let id = TaskId::from_ulid(Ulid::new());
        assert!(CoordError::ClaimConflict("pending/high/x".into()).is_retryable());
        assert!(
            CoordError::DependencyUnmet {
                id,
                waiting_on: vec![id]
            }
            .is_retryable()
        );
        assert_eq!(
            CoordError::StoreUnavailable("io".into()).kind(),
            ErrorKind::Infrastructure
        );
    }

    #[test]
    fn invalid_transition_names_both_statuses() {
        let id = TaskId::from_ulid(Ulid::new());
        let err = CoordError::InvalidTransition {
            id,
            from: TaskStatus::Pending,
            to: TaskStatus::Completed,
            reason: GuardViolation::NotAllowed,
        };
        assert!(!err.is_retryable());
        let msg = err.to_string();
        assert!(msg.contains("pending -> completed"), "{msg}");
    }
}
