//! WorkerGroup - claim → handler → complete / fail のループ
//!
//! # フロー（1 ワーカー）
//! 1. ClaimCoordinator::claim_next() で 1 件取得
//! 2. TaskHandler 実行
//! 3. Ok → complete、Err → fail（理由は last_error に残る）
//! 4. 何も取れなければ idle_poll だけ待って再試行

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::ClaimCoordinator;
use crate::domain::{Actor, Task, WorkerId};

/// Work performed on a claimed task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Err(reason) fails the task with that reason.
    async fn handle(&self, worker: &WorkerId, task: &Task) -> Result<(), String>;
}

/// Worker group handle.
/// - `request_shutdown()` で新しい claim を止める（実行中の handler は最後まで走る）
/// - `shutdown_and_join()` で全ワーカーの終了を待てる
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn `n` workers named `{prefix}-{i}`.
    pub fn spawn(
        n: usize,
        prefix: &str,
        coordinator: Arc<ClaimCoordinator>,
        handler: Arc<dyn TaskHandler>,
        idle_poll: Duration,
    ) -> Result<Self, crate::domain::IdParseError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        for i in 0..n {
            let worker = WorkerId::new(format!("{prefix}-{i}"))?;
            let coordinator = Arc::clone(&coordinator);
            let handler = Arc::clone(&handler);
            let mut rx = shutdown_rx.clone();

            joins.push(tokio::spawn(async move {
                worker_loop(worker, coordinator, handler, idle_poll, &mut rx).await;
            }));
        }

        Ok(Self { shutdown_tx, joins })
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(err) = join.await {
                warn!(error = %err, "worker task panicked");
            }
        }
    }
}

async fn worker_loop(
    worker: WorkerId,
    coordinator: Arc<ClaimCoordinator>,
    handler: Arc<dyn TaskHandler>,
    idle_poll: Duration,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    let board = Arc::clone(coordinator.board());
    debug!(worker = %worker, "worker started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let task = match coordinator.claim_next(&worker).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                tokio::select! {
                    _ = shutdown_rx.changed() => {}
                    _ = tokio::time::sleep(idle_poll) => {}
                }
                continue;
            }
            Err(err) => {
                warn!(worker = %worker, error = %err, "claim failed");
                tokio::select! {
                    _ = shutdown_rx.changed() => {}
                    _ = tokio::time::sleep(idle_poll) => {}
                }
                continue;
            }
        };

        // ここから handler 実行。store のロックは持っていない
        let result = match handler.handle(&worker, &task).await {
            Ok(()) => board.complete(task.id, &worker),
            Err(reason) => {
                warn!(worker = %worker, task_id = %task.id, %reason, "handler failed");
                board.fail(task.id, &Actor::Worker(worker.clone()), Some(reason))
            }
        };
        if let Err(err) = result {
            // lease 切れで reaper に回収された場合など
            warn!(worker = %worker, task_id = %task.id, error = %err, "could not record outcome");
        }
    }

    debug!(worker = %worker, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::TaskBoard;
    use crate::config::{ApiaryConfig, ClaimConfig};
    use crate::domain::{NewTask, TaskId, TaskStatus};
    use crate::ports::SystemClock;
    use crate::store::KvStore;
    use parking_lot::Mutex;
    use ulid::Ulid;

    /// Fails tasks whose title starts with "bad".
    struct Recorder {
        seen: Mutex<Vec<(WorkerId, TaskId)>>,
    }

    #[async_trait]
    impl TaskHandler for Recorder {
        async fn handle(&self, worker: &WorkerId, task: &Task) -> Result<(), String> {
            self.seen.lock().push((worker.clone(), task.id));
            tokio::task::yield_now().await;
            if task.title.starts_with("bad") {
                Err(format!("cannot process {}", task.title))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn group_drains_the_board() {
        let board = Arc::new(TaskBoard::new(
            KvStore::in_memory(),
            Arc::new(SystemClock),
            &ApiaryConfig::default(),
        ));
        let mut bad = Vec::new();
        for i in 0..20 {
            let title = if i % 5 == 0 { format!("bad-{i}") } else { format!("ok-{i}") };
            let task = board
                .create(NewTask::new(TaskId::from_ulid(Ulid::new()), title))
                .unwrap();
            if i % 5 == 0 {
                bad.push(task.id);
            }
        }

        let coordinator = Arc::new(ClaimCoordinator::new(
            Arc::clone(&board),
            ClaimConfig::default(),
        ));
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let group = WorkerGroup::spawn(
            4,
            "test",
            coordinator,
            recorder.clone(),
            Duration::from_millis(5),
        )
        .unwrap();
        assert_eq!(group.len(), 4);

        for _ in 0..400 {
            if board.counts().unwrap().pending.total() == 0
                && board.counts().unwrap().in_progress == 0
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        group.shutdown_and_join().await;

        let counts = board.counts().unwrap();
        assert_eq!(counts.completed, 16);
        assert_eq!(counts.failed, 4);
        assert_eq!(recorder.seen.lock().len(), 20);

        for id in bad {
            let task = board.get(id).unwrap();
            assert_eq!(task.status, TaskStatus::Failed);
            assert!(task.last_error.unwrap().starts_with("cannot process bad"));
        }
    }

    #[tokio::test]
    async fn idle_group_shuts_down_promptly() {
        let board = Arc::new(TaskBoard::new(
            KvStore::in_memory(),
            Arc::new(SystemClock),
            &ApiaryConfig::default(),
        ));
        let coordinator = Arc::new(ClaimCoordinator::new(board, ClaimConfig::default()));
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let group = WorkerGroup::spawn(
            2,
            "idle",
            coordinator,
            recorder,
            Duration::from_secs(60),
        )
        .unwrap();

        tokio::time::timeout(Duration::from_secs(2), group.shutdown_and_join())
            .await
            .unwrap();
    }
}
