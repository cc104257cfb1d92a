//! Status - ボードの集計ビュー

use serde::{Deserialize, Serialize};

use crate::domain::{Priority, Task, TaskStatus};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandCounts {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl BandCounts {
    pub fn get(&self, priority: Priority) -> usize {
        match priority {
            Priority::High => self.high,
            Priority::Medium => self.medium,
            Priority::Low => self.low,
        }
    }

    pub fn total(&self) -> usize {
        self.high + self.medium + self.low
    }
}

/// Number of tasks per status, pending split by band.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardCounts {
    pub pending: BandCounts,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
}

impl BoardCounts {
    pub fn record(&mut self, task: &Task) {
        match task.status {
            TaskStatus::Pending => match task.priority {
                Priority::High => self.pending.high += 1,
                Priority::Medium => self.pending.medium += 1,
                Priority::Low => self.pending.low += 1,
            },
            TaskStatus::InProgress => self.in_progress += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
        }
    }

    pub fn status(&self, status: TaskStatus) -> usize {
        match status {
            TaskStatus::Pending => self.pending.total(),
            TaskStatus::InProgress => self.in_progress,
            TaskStatus::Completed => self.completed,
            TaskStatus::Failed => self.failed,
        }
    }

    pub fn total(&self) -> usize {
        TaskStatus::ALL.iter().map(|s| self.status(*s)).sum()
    }
}
