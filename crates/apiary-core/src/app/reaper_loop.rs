//! ReaperLoop - Lease 期限切れの回収
//!
//! # フロー（1 sweep）
//! 1. `in_progress/` を scan して lease 切れ（claimed_at + timeout <= now）を探す
//! 2. Reaper として in_progress → failed（assignee をクリア、last_error = "lease expired"）
//! 3. requeue_expired なら retry policy が許すものを failed → pending
//!    - backoff 中のものは次回以降の sweep で再評価
//!
//! worker が途中で消えても、タスクは「静かに失われる」のではなく
//! 観測可能な failed 遷移として回収される。

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::TaskBoard;
use super::board::LEASE_EXPIRED;
use crate::config::LeaseConfig;
use crate::domain::{Actor, CoordError, TaskId, TaskStatus, status_prefix};

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub reaped: Vec<TaskId>,
    pub requeued: Vec<TaskId>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.reaped.is_empty() && self.requeued.is_empty()
    }
}

pub struct ReaperLoop {
    board: Arc<TaskBoard>,
    interval: Duration,
    requeue_expired: bool,
}

impl ReaperLoop {
    pub fn new(board: Arc<TaskBoard>, config: &LeaseConfig) -> Self {
        Self {
            board,
            interval: config.reaper_interval(),
            requeue_expired: config.requeue_expired,
        }
    }

    pub fn sweep(&self) -> Result<SweepReport, CoordError> {
        let mut report = SweepReport::default();
        let lease = self.board.lease_timeout();
        let now = self.board.now();

        for task in self.board.iter(&status_prefix(TaskStatus::InProgress)) {
            let task = task?;
            if !task.is_lease_expired(lease, now) {
                continue;
            }
            match self
                .board
                .fail(task.id, &Actor::Reaper, Some(LEASE_EXPIRED.to_string()))
            {
                Ok(_) => report.reaped.push(task.id),
                // 別の誰かが先に動かした（complete / release など）
                Err(err @ (CoordError::InvalidTransition { .. } | CoordError::ClaimConflict(_))) => {
                    debug!(task_id = %task.id, error = %err, "task moved before it could be reaped");
                }
                Err(err) => return Err(err),
            }
        }

        if self.requeue_expired {
            for task in self.board.iter(&status_prefix(TaskStatus::Failed)) {
                let task = task?;
                if task.last_error.as_deref() != Some(LEASE_EXPIRED) {
                    continue;
                }
                match self.board.retry(task.id, &Actor::Reaper) {
                    Ok(_) => report.requeued.push(task.id),
                    Err(err @ (CoordError::InvalidTransition { .. } | CoordError::ClaimConflict(_))) => {
                        debug!(task_id = %task.id, reason = %err, "not requeued");
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        if !report.is_empty() {
            info!(
                reaped = report.reaped.len(),
                requeued = report.requeued.len(),
                "reaper sweep"
            );
        }
        Ok(report)
    }

    /// Sweep every interval until `shutdown` turns true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    // sender が drop されたら止める
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }
            if let Err(err) = self.sweep() {
                warn!(error = %err, "reaper sweep failed");
            }
        }
        debug!("reaper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiaryConfig;
    use crate::domain::{NewTask, Priority, RetryPolicy, WorkerId};
    use crate::ports::{Clock, FixedClock};
    use crate::store::KvStore;
    use chrono::{TimeZone, Utc};
    use ulid::Ulid;

    const LEASE_MS: u64 = 60_000;

    fn setup(requeue: bool, retry: RetryPolicy) -> (Arc<TaskBoard>, Arc<FixedClock>, ReaperLoop) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 2, 1, 8, 0, 0).unwrap(),
        ));
        let mut config = ApiaryConfig::default();
        config.lease.timeout_ms = LEASE_MS;
        config.lease.reaper_interval_ms = 10;
        config.lease.requeue_expired = requeue;
        config.retry = retry;
        let board = Arc::new(TaskBoard::new(KvStore::in_memory(), clock.clone(), &config));
        let reaper = ReaperLoop::new(Arc::clone(&board), &config.lease);
        (board, clock, reaper)
    }

    fn claimed(board: &TaskBoard) -> TaskId {
        let task = board
            .create(NewTask::new(TaskId::from_ulid(Ulid::new()), "long job").priority(Priority::High))
            .unwrap();
        board
            .claim_task(task.id, &WorkerId::new("ghost").unwrap())
            .unwrap();
        task.id
    }

    #[test]
    fn sweep_after_lease_fails_and_unassigns() {
        let (board, clock, reaper) = setup(false, RetryPolicy::default());
        let id = claimed(&board);

        clock.advance(Duration::from_millis(LEASE_MS - 1));
        assert!(reaper.sweep().unwrap().is_empty());
        assert_eq!(board.get(id).unwrap().status, TaskStatus::InProgress);

        // t + L + ε
        clock.advance(Duration::from_millis(2));
        let report = reaper.sweep().unwrap();
        assert_eq!(report.reaped, vec![id]);
        assert!(report.requeued.is_empty());

        let task = board.get(id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.assignee, None);
        assert_eq!(task.last_error.as_deref(), Some(LEASE_EXPIRED));
        assert_eq!(task.completed_at, Some(clock.now()));
    }

    #[test]
    fn requeue_follows_the_retry_policy() {
        let retry = RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 1_000,
            multiplier: 1.0,
            max_delay_ms: 1_000,
        };
        let (board, clock, reaper) = setup(true, retry);
        let id = claimed(&board);

        clock.advance(Duration::from_millis(LEASE_MS + 1));
        let report = reaper.sweep().unwrap();
        assert_eq!(report.reaped, vec![id]);
        // backoff 中
        assert!(report.requeued.is_empty());

        clock.advance(Duration::from_millis(1_000));
        let report = reaper.sweep().unwrap();
        assert_eq!(report.requeued, vec![id]);
        assert_eq!(board.get(id).unwrap().status, TaskStatus::Pending);

        // 2 回目の lease 切れで予算切れ
        board
            .claim_task(id, &WorkerId::new("ghost").unwrap())
            .unwrap();
        clock.advance(Duration::from_millis(LEASE_MS + 1_001));
        let report = reaper.sweep().unwrap();
        assert_eq!(report.reaped, vec![id]);
        assert!(report.requeued.is_empty());
        assert_eq!(board.get(id).unwrap().status, TaskStatus::Failed);
    }

    #[test]
    fn worker_failures_are_left_to_the_operator() {
        let (board, _clock, reaper) = setup(true, RetryPolicy::immediate(5));
        let id = claimed(&board);
        board
            .fail(
                id,
                &Actor::Worker(WorkerId::new("ghost").unwrap()),
                Some("bad input".into()),
            )
            .unwrap();

        assert!(reaper.sweep().unwrap().is_empty());
        assert_eq!(board.get(id).unwrap().status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (board, clock, reaper) = setup(false, RetryPolicy::default());
        let id = claimed(&board);
        clock.advance(Duration::from_millis(LEASE_MS + 1));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(reaper.run(rx));

        let mut reaped = false;
        for _ in 0..200 {
            if board.get(id).unwrap().status == TaskStatus::Failed {
                reaped = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(reaped);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
