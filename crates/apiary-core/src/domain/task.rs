//! Task record: the durable unit of work.
//!
//! Design:
//! - The store owns the record; copies held by workers are snapshots.
//! - Every state change goes through a method here, which checks the
//!   transition table and the guards that need no other records.
//!   Dependency readiness and the retry policy are checked by the caller.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use super::{Actor, GuardViolation, Priority, TaskId, TaskKey, TaskStatus, WorkerId};

/// What a producer submits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl NewTask {
    pub fn new(id: TaskId, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            description: String::new(),
            priority: Priority::default(),
            dependencies: BTreeSet::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, id: TaskId) -> Self {
        self.dependencies.insert(id);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub status: TaskStatus,
    pub assignee: Option<WorkerId>,

    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    /// When this instance finished, successfully or not.
    pub completed_at: Option<DateTime<Utc>>,

    pub dependencies: BTreeSet<TaskId>,
    pub metadata: BTreeMap<String, serde_json::Value>,

    /// Number of successful claims.
    #[serde(default)]
    pub attempts: u32,

    /// Number of transitions into `failed`.
    #[serde(default)]
    pub failures: u32,

    #[serde(default)]
    pub last_error: Option<String>,
}

impl Task {
    pub fn from_new(new: NewTask, now: DateTime<Utc>) -> Self {
        Self {
            id: new.id,
            title: new.title,
            description: new.description,
            priority: new.priority,
            status: TaskStatus::Pending,
            assignee: None,
            created_at: now,
            claimed_at: None,
            completed_at: None,
            dependencies: new.dependencies,
            metadata: new.metadata,
            attempts: 0,
            failures: 0,
            last_error: None,
        }
    }

    /// Where this record lives in the store right now.
    pub fn key(&self) -> TaskKey {
        TaskKey::new(self.status, self.priority, self.id)
    }

    /// When the current claim stops being valid, if there is one.
    pub fn lease_expires_at(&self, lease_timeout: Duration) -> Option<DateTime<Utc>> {
        let claimed_at = self.claimed_at?;
        let lease = TimeDelta::from_std(lease_timeout).ok()?;
        claimed_at.checked_add_signed(lease)
    }

    pub fn is_lease_expired(&self, lease_timeout: Duration, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::InProgress
            && self
                .lease_expires_at(lease_timeout)
                .is_some_and(|expires_at| expires_at <= now)
    }

    fn check_edge(&self, to: TaskStatus) -> Result<(), GuardViolation> {
        if self.status.can_transition_to(to) {
            Ok(())
        } else {
            Err(GuardViolation::NotAllowed)
        }
    }

    fn check_assignee(&self, worker: &WorkerId) -> Result<(), GuardViolation> {
        if self.assignee.as_ref() == Some(worker) {
            Ok(())
        } else {
            Err(GuardViolation::NotAssignee {
                caller: Actor::Worker(worker.clone()),
            })
        }
    }

    /// pending -> in_progress. Dependencies must already be verified.
    pub fn claim(&mut self, worker: &WorkerId, now: DateTime<Utc>) -> Result<(), GuardViolation> {
        self.check_edge(TaskStatus::InProgress)?;
        if let Some(holder) = &self.assignee {
            return Err(GuardViolation::AlreadyAssigned(holder.clone()));
        }
        self.status = TaskStatus::InProgress;
        self.assignee = Some(worker.clone());
        self.claimed_at = Some(now.max(self.created_at));
        self.completed_at = None;
        self.attempts += 1;
        Ok(())
    }

    /// in_progress -> completed, by the assignee.
    pub fn complete(&mut self, worker: &WorkerId, now: DateTime<Utc>) -> Result<(), GuardViolation> {
        self.check_edge(TaskStatus::Completed)?;
        self.check_assignee(worker)?;
        self.finish(TaskStatus::Completed, now);
        Ok(())
    }

    /// in_progress -> failed, by the assignee or by the reaper once the lease ran out.
    pub fn fail(
        &mut self,
        actor: &Actor,
        reason: Option<String>,
        lease_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), GuardViolation> {
        self.check_edge(TaskStatus::Failed)?;
        match actor {
            Actor::Worker(worker) => self.check_assignee(worker)?,
            Actor::Reaper => {
                if !self.is_lease_expired(lease_timeout, now) {
                    let until = self.lease_expires_at(lease_timeout).unwrap_or(now);
                    return Err(GuardViolation::LeaseActive(until));
                }
            }
            Actor::Operator => return Err(GuardViolation::WrongActor(actor.clone())),
        }
        self.finish(TaskStatus::Failed, now);
        self.failures += 1;
        self.last_error = reason;
        Ok(())
    }

    /// in_progress -> pending, by the assignee giving the task back.
    pub fn release(&mut self, worker: &WorkerId) -> Result<(), GuardViolation> {
        self.check_edge(TaskStatus::Pending)?;
        if self.status != TaskStatus::InProgress {
            return Err(GuardViolation::NotAllowed);
        }
        self.check_assignee(worker)?;
        self.status = TaskStatus::Pending;
        self.assignee = None;
        self.claimed_at = None;
        Ok(())
    }

    /// failed -> pending. The retry policy must already have agreed.
    pub fn requeue(&mut self, actor: &Actor) -> Result<(), GuardViolation> {
        self.check_edge(TaskStatus::Pending)?;
        if self.status != TaskStatus::Failed {
            return Err(GuardViolation::NotAllowed);
        }
        if let Actor::Worker(_) = actor {
            return Err(GuardViolation::WrongActor(actor.clone()));
        }
        self.status = TaskStatus::Pending;
        self.assignee = None;
        self.claimed_at = None;
        self.completed_at = None;
        Ok(())
    }

    fn finish(&mut self, status: TaskStatus, now: DateTime<Utc>) {
        let floor = self.claimed_at.unwrap_or(self.created_at);
        self.status = status;
        self.assignee = None;
        self.completed_at = Some(now.max(floor));
    }
}
