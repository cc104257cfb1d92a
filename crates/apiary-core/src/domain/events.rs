//! Events - store の変更通知

use serde::{Deserialize, Serialize};

use super::Task;

/// What happened to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

impl EventKind {
    /// Merge a queued change with a newer change to the same key.
    ///
    /// The merged kind describes the move from the state before `self` to the
    /// state after `next`.
    pub fn coalesce(self, next: EventKind) -> EventKind {
        match (self, next) {
            (_, EventKind::Deleted) => EventKind::Deleted,
            (EventKind::Created, _) => EventKind::Created,
            (EventKind::Deleted, _) => EventKind::Updated,
            (EventKind::Updated, _) => EventKind::Updated,
        }
    }
}

/// One mutation observed on a watched prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub key: String,
    pub kind: EventKind,
    /// New value; None for deletions.
    pub value: Option<Vec<u8>>,
    /// Commit revision. Strictly increasing per key.
    pub revision: u64,
}

impl WatchEvent {
    /// Decode the value as a task record.
    pub fn task(&self) -> Option<Result<Task, serde_json::Error>> {
        self.value.as_deref().map(serde_json::from_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use EventKind::*;

    #[rstest]
    #[case(Created, Updated, Created)]
    #[case(Created, Deleted, Deleted)]
    #[case(Updated, Updated, Updated)]
    #[case(Updated, Deleted, Deleted)]
    #[case(Deleted, Created, Updated)]
    fn coalesce_keeps_the_net_effect(
        #[case] queued: EventKind,
        #[case] next: EventKind,
        #[case] merged: EventKind,
    ) {
        assert_eq!(queued.coalesce(next), merged);
    }

    #[test]
    fn deletions_carry_no_task() {
        let event = WatchEvent {
            key: "pending/high/x".into(),
            kind: Deleted,
            value: None,
            revision: 7,
        };
        assert!(event.task().is_none());
    }
}
