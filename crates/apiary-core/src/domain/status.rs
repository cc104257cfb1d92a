//! Status - タスクの状態
//!
//! # 状態遷移
//! - (none) -> pending: 作成
//! - pending -> in_progress: claim（依存がすべて completed のときのみ）
//! - in_progress -> completed / failed: assignee による終了（failed は lease 切れでも）
//! - in_progress -> pending: assignee による release
//! - failed -> pending: retry policy が許可したとき
//!
//! completed からの遷移は存在しない（absorbing）。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed.
    Pending,

    /// Claimed by exactly one worker.
    InProgress,

    /// Finished successfully.
    Completed,

    /// Finished unsuccessfully (worker failure or expired lease).
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    /// Namespace segment used in storage keys.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Is the edge `self -> to` present in the transition table?
    ///
    /// Guards (assignee, dependencies, lease, retry budget) are checked separately.
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, InProgress)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Pending)
                | (Failed, Pending)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown status {0:?}")]
pub struct ParseStatusError(pub String);

impl FromStr for TaskStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseStatusError(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use TaskStatus::*;

    #[rstest]
    #[case(Pending, InProgress, true)]
    #[case(InProgress, Completed, true)]
    #[case(InProgress, Failed, true)]
    #[case(InProgress, Pending, true)]
    #[case(Failed, Pending, true)]
    #[case(Pending, Completed, false)]
    #[case(Pending, Failed, false)]
    #[case(Completed, Pending, false)]
    #[case(Completed, InProgress, false)]
    #[case(Failed, InProgress, false)]
    #[case(Failed, Completed, false)]
    #[case(Pending, Pending, false)]
    fn transition_table(#[case] from: TaskStatus, #[case] to: TaskStatus, #[case] allowed: bool) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn completed_is_absorbing() {
        for to in TaskStatus::ALL {
            assert!(!Completed.can_transition_to(to));
        }
    }

    #[test]
    fn status_names_round_trip() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert_eq!(
            serde_json::to_string(&InProgress).unwrap(),
            "\"in_progress\""
        );
    }
}
