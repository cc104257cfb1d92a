//! TaskBoard - タスクレコードに対する操作の入口
//!
//! # 原則
//! - すべての変更は 1 トランザクション（読んだレコードは guard になる）
//! - 状態遷移の可否は domain の Task メソッドが判定する
//! - 依存の完了チェックと retry policy はここで行う（他レコードを読む必要があるため）
//! - 失敗時は store を一切変更しない

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::status::BoardCounts;
use crate::config::ApiaryConfig;
use crate::domain::{
    Actor, CoordError, GuardViolation, NewTask, Priority, RetryPolicy, Task, TaskId, TaskKey,
    TaskStatus, WorkerId, band_prefix, status_prefix,
};
use crate::ports::{Clock, KvError};
use crate::store::{KvStore, Transaction};
use crate::watch::Subscription;

/// Re-runs of a transaction body after losing an optimistic race.
const MAX_TX_ATTEMPTS: usize = 8;

/// `last_error` written by the reaper.
pub const LEASE_EXPIRED: &str = "lease expired";

pub struct TaskBoard {
    store: KvStore,
    clock: Arc<dyn Clock>,
    lease_timeout: Duration,
    retry: RetryPolicy,
}

impl TaskBoard {
    pub fn new(store: KvStore, clock: Arc<dyn Clock>, config: &ApiaryConfig) -> Self {
        Self {
            store,
            clock,
            lease_timeout: config.lease.timeout(),
            retry: config.retry.clone(),
        }
    }

    pub fn store(&self) -> &KvStore {
        &self.store
    }

    pub fn lease_timeout(&self) -> Duration {
        self.lease_timeout
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Insert a new pending task.
    ///
    /// Dependencies must already exist. Records are never removed, so
    /// checking them outside the transaction is safe.
    pub fn create(&self, new: NewTask) -> Result<Task, CoordError> {
        if new.title.trim().is_empty() {
            return Err(CoordError::InvalidTask("title must not be empty".into()));
        }
        if new.dependencies.contains(&new.id) {
            return Err(CoordError::InvalidTask(format!(
                "task {} depends on itself",
                new.id
            )));
        }
        for dep in &new.dependencies {
            if self.find(*dep)?.is_none() {
                return Err(CoordError::NotFound { id: *dep });
            }
        }

        let task = self.run(|tx| {
            for key in TaskKey::all_for(new.id) {
                if tx.get(&key.to_string())?.is_some() {
                    return Err(CoordError::AlreadyExists { id: new.id });
                }
            }
            let task = Task::from_new(new.clone(), self.clock.now());
            tx.put(task.key().to_string(), encode(&task)?);
            Ok(task)
        })?;

        info!(
            task_id = %task.id,
            priority = %task.priority,
            dependencies = task.dependencies.len(),
            "task created"
        );
        Ok(task)
    }

    pub fn get(&self, id: TaskId) -> Result<Task, CoordError> {
        self.find(id)?.ok_or(CoordError::NotFound { id })
    }

    /// Like `get`, but absence is not an error.
    pub fn find(&self, id: TaskId) -> Result<Option<Task>, CoordError> {
        self.run(|tx| Ok(locate(tx, id)?.map(|(_, task)| task)))
    }

    /// Decoded records under `prefix`, in key order.
    pub fn scan(&self, prefix: &str) -> Result<Vec<Task>, CoordError> {
        self.store
            .scan(prefix)?
            .into_iter()
            .map(|(key, value)| decode(&key, &value))
            .collect()
    }

    /// Decoded records under `prefix`, read lazily a page at a time.
    pub fn iter(&self, prefix: &str) -> impl Iterator<Item = Result<Task, CoordError>> {
        self.store.scan_lazy(prefix).map(|entry| {
            let (key, value) = entry?;
            decode(&key, &value)
        })
    }

    /// All tasks, or the tasks in one status.
    pub fn list(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, CoordError> {
        match status {
            Some(status) => self.scan(&status_prefix(status)),
            None => self.scan(""),
        }
    }

    /// Pending tasks of one band, oldest first.
    ///
    /// Unreadable records are logged and skipped so one bad entry cannot
    /// stall every claim.
    pub fn candidates(&self, band: Priority) -> Result<Vec<Task>, CoordError> {
        let mut tasks = Vec::new();
        for (key, value) in self.store.scan(&band_prefix(band))? {
            match decode(&key, &value) {
                Ok(task) => tasks.push(task),
                Err(err) if err.is_unreadable_record() => {
                    warn!(%key, error = %err, "skipping unreadable pending record");
                }
                Err(err) => return Err(err),
            }
        }
        tasks.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(tasks)
    }

    pub fn counts(&self) -> Result<BoardCounts, CoordError> {
        let mut counts = BoardCounts::default();
        for task in self.iter("") {
            counts.record(&task?);
        }
        Ok(counts)
    }

    pub fn watch(&self, prefix: impl Into<String>) -> Subscription {
        self.store.watch(prefix)
    }

    /// Claim one specific task.
    pub fn claim_task(&self, id: TaskId, worker: &WorkerId) -> Result<Task, CoordError> {
        let task = self.get(id)?;
        if task.status != TaskStatus::Pending {
            let reason = match &task.assignee {
                Some(holder) => GuardViolation::AlreadyAssigned(holder.clone()),
                None => GuardViolation::NotAllowed,
            };
            return Err(CoordError::InvalidTransition {
                id,
                from: task.status,
                to: TaskStatus::InProgress,
                reason,
            });
        }
        self.claim_at(&task.key(), worker)
    }

    /// One claim attempt on the record at `key`.
    ///
    /// The pending record and every dependency's `completed/` key are read
    /// inside the transaction, so a concurrent claim or a dependency that
    /// has not finished makes the attempt fail without writing.
    pub(crate) fn claim_at(&self, key: &TaskKey, worker: &WorkerId) -> Result<Task, CoordError> {
        let raw_key = key.to_string();
        let mut tx = self.store.begin();

        let Some(bytes) = tx.get(&raw_key)? else {
            return Err(CoordError::ClaimConflict(format!("{raw_key} already taken")));
        };
        let mut task = decode(&raw_key, &bytes)?;

        let mut waiting_on = Vec::new();
        for dep in &task.dependencies {
            if tx.get(&TaskKey::completed(*dep).to_string())?.is_none() {
                waiting_on.push(*dep);
            }
        }
        if !waiting_on.is_empty() {
            return Err(CoordError::DependencyUnmet {
                id: task.id,
                waiting_on,
            });
        }

        let from = task.status;
        task.claim(worker, self.clock.now())
            .map_err(|reason| CoordError::InvalidTransition {
                id: task.id,
                from,
                to: TaskStatus::InProgress,
                reason,
            })?;
        tx.delete(raw_key);
        tx.put(task.key().to_string(), encode(&task)?);
        tx.commit()?;

        info!(task_id = %task.id, worker = %worker, attempt = task.attempts, "task claimed");
        Ok(task)
    }

    /// Move `id` to `to` on behalf of `actor`.
    pub fn transition(
        &self,
        id: TaskId,
        to: TaskStatus,
        actor: &Actor,
    ) -> Result<Task, CoordError> {
        match (to, actor) {
            (TaskStatus::InProgress, Actor::Worker(worker)) => self.claim_task(id, worker),
            (TaskStatus::Completed, Actor::Worker(worker)) => self.complete(id, worker),
            (TaskStatus::Failed, actor) => self.fail(id, actor, None),
            (TaskStatus::Pending, actor) => self.apply(id, to, |task, now| match task.status {
                TaskStatus::Failed => self.check_requeue(task, actor, now),
                _ => match actor {
                    Actor::Worker(worker) => task.release(worker),
                    _ if task.status.can_transition_to(to) => {
                        Err(GuardViolation::WrongActor(actor.clone()))
                    }
                    _ => Err(GuardViolation::NotAllowed),
                },
            }),
            (to, actor) => self.apply(id, to, |task, _| {
                if task.status.can_transition_to(to) {
                    Err(GuardViolation::WrongActor(actor.clone()))
                } else {
                    Err(GuardViolation::NotAllowed)
                }
            }),
        }
    }

    pub fn complete(&self, id: TaskId, worker: &WorkerId) -> Result<Task, CoordError> {
        let task = self.apply(id, TaskStatus::Completed, |task, now| {
            task.complete(worker, now)
        })?;
        info!(task_id = %id, worker = %worker, "task completed");
        Ok(task)
    }

    /// in_progress -> failed, by the assignee or the reaper.
    pub fn fail(
        &self,
        id: TaskId,
        actor: &Actor,
        reason: Option<String>,
    ) -> Result<Task, CoordError> {
        let task = self.apply(id, TaskStatus::Failed, |task, now| {
            task.fail(actor, reason.clone(), self.lease_timeout, now)
        })?;
        info!(
            task_id = %id,
            actor = %actor,
            failures = task.failures,
            reason = task.last_error.as_deref().unwrap_or(""),
            "task failed"
        );
        Ok(task)
    }

    /// Give a claimed task back to the pending pool.
    pub fn release(&self, id: TaskId, worker: &WorkerId) -> Result<Task, CoordError> {
        let task = self.apply(id, TaskStatus::Pending, |task, _| task.release(worker))?;
        info!(task_id = %id, worker = %worker, "task released");
        Ok(task)
    }

    /// failed -> pending, if the retry policy permits it now.
    pub fn retry(&self, id: TaskId, actor: &Actor) -> Result<Task, CoordError> {
        let task = self.apply(id, TaskStatus::Pending, |task, now| {
            self.check_requeue(task, actor, now)
        })?;
        info!(task_id = %id, actor = %actor, failures = task.failures, "task requeued");
        Ok(task)
    }

    fn check_requeue(
        &self,
        task: &mut Task,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<(), GuardViolation> {
        if task.status != TaskStatus::Failed {
            return Err(GuardViolation::NotAllowed);
        }
        if let Actor::Worker(_) = actor {
            return Err(GuardViolation::WrongActor(actor.clone()));
        }
        self.retry.check(task, now)?;
        task.requeue(actor)
    }

    /// Locate `id`, let `change` move it, and write it back under its new key.
    fn apply<F>(&self, id: TaskId, to: TaskStatus, change: F) -> Result<Task, CoordError>
    where
        F: Fn(&mut Task, DateTime<Utc>) -> Result<(), GuardViolation>,
    {
        self.run(|tx| {
            let (old_key, mut task) = locate(tx, id)?.ok_or(CoordError::NotFound { id })?;
            let from = task.status;
            change(&mut task, self.clock.now()).map_err(|reason| {
                CoordError::InvalidTransition {
                    id,
                    from,
                    to,
                    reason,
                }
            })?;

            let new_key = task.key();
            if new_key != old_key {
                tx.delete(old_key.to_string());
            }
            tx.put(new_key.to_string(), encode(&task)?);
            debug!(task_id = %id, from = %from, to = %task.status, "task moved");
            Ok(task)
        })
    }

    /// Run `body` in a fresh transaction, again on conflict.
    ///
    /// An error from `body` drops the transaction unwritten.
    fn run<T>(
        &self,
        mut body: impl FnMut(&mut Transaction) -> Result<T, CoordError>,
    ) -> Result<T, CoordError> {
        let mut attempt = 1;
        loop {
            let mut tx = self.store.begin();
            let value = body(&mut tx)?;
            match tx.commit() {
                Ok(_) => return Ok(value),
                Err(KvError::Conflict { key }) if attempt < MAX_TX_ATTEMPTS => {
                    debug!(key = %key, attempt, "transaction lost a race, re-running");
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// The record for `id` and the key it lives under, read inside `tx`.
fn locate(tx: &mut Transaction, id: TaskId) -> Result<Option<(TaskKey, Task)>, CoordError> {
    for key in TaskKey::all_for(id) {
        let raw_key = key.to_string();
        if let Some(bytes) = tx.get(&raw_key)? {
            return Ok(Some((key, decode(&raw_key, &bytes)?)));
        }
    }
    Ok(None)
}

fn encode(task: &Task) -> Result<Vec<u8>, CoordError> {
    serde_json::to_vec(task).map_err(|e| CoordError::InvalidTask(e.to_string()))
}

/// The record must parse and must live under the key its own fields name.
fn decode(key: &str, bytes: &[u8]) -> Result<Task, CoordError> {
    let task: Task = serde_json::from_slice(bytes).map_err(|source| CoordError::CorruptRecord {
        key: key.to_string(),
        source,
    })?;
    let misplaced = |reason: String| CoordError::MisplacedRecord {
        key: key.to_string(),
        reason,
    };
    let parsed = TaskKey::parse(key).map_err(|err| misplaced(err.to_string()))?;
    if parsed != task.key() {
        return Err(misplaced(format!("record belongs at {}", task.key())));
    }
    Ok(task)
}
