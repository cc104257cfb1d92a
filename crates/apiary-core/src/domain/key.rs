//! Key layout for task records.
//!
//! - pending:     `pending/{priority}/{id}`
//! - other state: `{status}/{id}`
//!
//! The key carries the status, so a status change is always a delete of the
//! old key plus a write of the new one.

use std::fmt;

use super::{Priority, TaskId, TaskStatus};

/// Storage key of one task record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskKey {
    status: TaskStatus,
    /// Only meaningful for `Pending`.
    priority: Option<Priority>,
    id: TaskId,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed task key {0:?}")]
pub struct KeyParseError(pub String);

impl TaskKey {
    pub fn new(status: TaskStatus, priority: Priority, id: TaskId) -> Self {
        let priority = (status == TaskStatus::Pending).then_some(priority);
        Self {
            status,
            priority,
            id,
        }
    }

    pub fn pending(priority: Priority, id: TaskId) -> Self {
        Self::new(TaskStatus::Pending, priority, id)
    }

    pub fn in_progress(id: TaskId) -> Self {
        Self::new(TaskStatus::InProgress, Priority::default(), id)
    }

    pub fn completed(id: TaskId) -> Self {
        Self::new(TaskStatus::Completed, Priority::default(), id)
    }

    pub fn failed(id: TaskId) -> Self {
        Self::new(TaskStatus::Failed, Priority::default(), id)
    }

    /// Every key under which a record for `id` may live.
    pub fn all_for(id: TaskId) -> [TaskKey; 6] {
        [
            Self::pending(Priority::High, id),
            Self::pending(Priority::Medium, id),
            Self::pending(Priority::Low, id),
            Self::in_progress(id),
            Self::completed(id),
            Self::failed(id),
        ]
    }

    pub fn parse(key: &str) -> Result<Self, KeyParseError> {
        let err = || KeyParseError(key.to_string());
        let mut parts = key.split('/');
        let status: TaskStatus = parts.next().ok_or_else(err)?.parse().map_err(|_| err())?;
        let key = if status == TaskStatus::Pending {
            let priority: Priority = parts.next().ok_or_else(err)?.parse().map_err(|_| err())?;
            let id: TaskId = parts.next().ok_or_else(err)?.parse().map_err(|_| err())?;
            Self::pending(priority, id)
        } else {
            let id: TaskId = parts.next().ok_or_else(err)?.parse().map_err(|_| err())?;
            Self::new(status, Priority::default(), id)
        };
        if parts.next().is_some() {
            return Err(err());
        }
        Ok(key)
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn priority(&self) -> Option<Priority> {
        self.priority
    }

    pub fn id(&self) -> TaskId {
        self.id
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.priority {
            Some(priority) => write!(f, "{}/{}/{}", self.status, priority, self.id),
            None => write!(f, "{}/{}", self.status, self.id),
        }
    }
}

/// `{status}/`: every record in one status.
pub fn status_prefix(status: TaskStatus) -> String {
    format!("{status}/")
}

/// `pending/{priority}/`: one claim band.
pub fn band_prefix(priority: Priority) -> String {
    format!("{}/{priority}/", TaskStatus::Pending)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn id() -> TaskId {
        TaskId::from_ulid(Ulid::new())
    }

    #[test]
    fn pending_keys_carry_the_band() {
        let id = id();
        let key = TaskKey::pending(Priority::High, id);
        assert_eq!(key.to_string(), format!("pending/high/{id}"));
        assert!(key.to_string().starts_with(&band_prefix(Priority::High)));
        assert_eq!(TaskKey::parse(&key.to_string()).unwrap(), key);
    }

    #[test]
    fn other_statuses_omit_the_band() {
        let id = id();
        let key = TaskKey::new(TaskStatus::InProgress, Priority::Low, id);
        assert_eq!(key.to_string(), format!("in_progress/{id}"));
        assert_eq!(key.priority(), None);
        assert_eq!(TaskKey::parse(&key.to_string()).unwrap(), key);
    }

    #[test]
    fn all_for_covers_each_namespace_once() {
        let keys = TaskKey::all_for(id());
        let rendered: std::collections::HashSet<String> =
            keys.iter().map(ToString::to_string).collect();
        assert_eq!(rendered.len(), 6);
    }

    #[test]
    fn rejects_malformed_keys() {
        let id = id();
        for bad in [
            String::new(),
            "pending".to_string(),
            format!("pending/{id}"),
            format!("done/{id}"),
            format!("failed/{id}/extra"),
            "completed/xyz".to_string(),
        ] {
            assert!(TaskKey::parse(&bad).is_err(), "{bad} should not parse");
        }
    }
}
