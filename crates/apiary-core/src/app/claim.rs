//! ClaimCoordinator - 優先度順・FIFO の競合安全な claim
//!
//! # フロー（1 sweep）
//! 1. 設定された band 順（既定 high → medium → low）に `pending/{band}/` を scan
//! 2. band 内は (created_at, id) の昇順
//! 3. 候補ごとに 1 トランザクションで claim を試す
//!    - 負けた（ClaimConflict）/ 依存未完了（DependencyUnmet）→ 次の候補へ
//! 4. 候補はあったが全部負けた → backoff して再 sweep（max_sweeps まで）
//! 5. claim 可能な候補がそもそも無い → 即 None

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, trace};

use super::TaskBoard;
use crate::config::ClaimConfig;
use crate::domain::{CoordError, Priority, Task, WorkerId};

/// Result of one pass over the bands.
#[derive(Debug)]
enum Sweep {
    Claimed(Task),
    /// Saw candidates but lost every race.
    Contended,
    /// Nothing claimable right now.
    Empty,
}

pub struct ClaimCoordinator {
    board: Arc<TaskBoard>,
    config: ClaimConfig,
}

impl ClaimCoordinator {
    pub fn new(board: Arc<TaskBoard>, config: ClaimConfig) -> Self {
        Self { board, config }
    }

    pub fn board(&self) -> &Arc<TaskBoard> {
        &self.board
    }

    /// Claim the first available task, trying `bands` in order.
    ///
    /// Retries lost sweeps with backoff. None when nothing is claimable or
    /// the pool stayed contended for `max_sweeps` sweeps.
    pub async fn claim(
        &self,
        worker: &WorkerId,
        bands: &[Priority],
    ) -> Result<Option<Task>, CoordError> {
        for sweep in 1..=self.config.max_sweeps {
            match self.sweep(worker, bands)? {
                Sweep::Claimed(task) => return Ok(Some(task)),
                Sweep::Empty => return Ok(None),
                Sweep::Contended => {
                    if sweep == self.config.max_sweeps {
                        break;
                    }
                    let delay = self.backoff(sweep);
                    debug!(worker = %worker, sweep, ?delay, "every candidate was taken, backing off");
                    tokio::time::sleep(delay).await;
                }
            }
        }
        debug!(worker = %worker, sweeps = self.config.max_sweeps, "pool stayed contended");
        Ok(None)
    }

    /// `claim` over the configured band order.
    pub async fn claim_next(&self, worker: &WorkerId) -> Result<Option<Task>, CoordError> {
        self.claim(worker, &self.config.bands).await
    }

    fn sweep(&self, worker: &WorkerId, bands: &[Priority]) -> Result<Sweep, CoordError> {
        let mut contended = false;
        for band in bands {
            for candidate in self.board.candidates(*band)? {
                match self.board.claim_at(&candidate.key(), worker) {
                    Ok(task) => return Ok(Sweep::Claimed(task)),
                    Err(CoordError::ClaimConflict(reason)) => {
                        trace!(task_id = %candidate.id, worker = %worker, %reason, "lost claim race");
                        contended = true;
                    }
                    Err(CoordError::DependencyUnmet { id, waiting_on }) => {
                        trace!(task_id = %id, waiting = waiting_on.len(), "dependencies unfinished");
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(if contended {
            Sweep::Contended
        } else {
            Sweep::Empty
        })
    }

    /// Full jitter: uniform in [0, backoff].
    fn backoff(&self, sweep: u32) -> Duration {
        let cap = self.config.backoff(sweep);
        if cap.is_zero() {
            return cap;
        }
        let ms = rand::thread_rng().gen_range(0..=cap.as_millis() as u64);
        Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiaryConfig;
    use crate::domain::{NewTask, TaskId, TaskStatus};
    use crate::ports::FixedClock;
    use crate::impls::SledBackend;
    use crate::store::KvStore;
    use crate::watch::WatchHub;
    use chrono::{TimeDelta, TimeZone, Utc};
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use rstest::rstest;
    use std::collections::{HashMap, HashSet};
    use ulid::Ulid;

    fn sled_store() -> KvStore {
        KvStore::new(
            Arc::new(SledBackend::temporary().unwrap()),
            WatchHub::new(1024),
        )
    }

    fn setup() -> (Arc<TaskBoard>, Arc<FixedClock>) {
        setup_on(KvStore::in_memory())
    }

    fn setup_on(store: KvStore) -> (Arc<TaskBoard>, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
        ));
        let board = TaskBoard::new(store, clock.clone(), &ApiaryConfig::default());
        (Arc::new(board), clock)
    }

    fn coordinator(board: &Arc<TaskBoard>) -> ClaimCoordinator {
        let config = ClaimConfig {
            backoff_base_ms: 1,
            backoff_max_ms: 5,
            max_sweeps: 50,
            ..ClaimConfig::default()
        };
        ClaimCoordinator::new(Arc::clone(board), config)
    }

    fn worker(name: &str) -> WorkerId {
        WorkerId::new(name).unwrap()
    }

    fn create_at(
        board: &TaskBoard,
        clock: &FixedClock,
        at: i64,
        title: &str,
        priority: Priority,
    ) -> Task {
        clock.set(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + TimeDelta::seconds(at));
        board
            .create(NewTask::new(TaskId::from_ulid(Ulid::new()), title).priority(priority))
            .unwrap()
    }

    #[tokio::test]
    async fn priority_first_then_oldest_first() {
        let (board, clock) = setup();
        let c = create_at(&board, &clock, 0, "C", Priority::Low);
        let a = create_at(&board, &clock, 1, "A", Priority::High);
        let b = create_at(&board, &clock, 2, "B", Priority::High);
        let coord = coordinator(&board);
        let w = worker("w");

        let order: Vec<TaskId> = [
            coord.claim_next(&w).await.unwrap(),
            coord.claim_next(&w).await.unwrap(),
            coord.claim_next(&w).await.unwrap(),
        ]
        .into_iter()
        .map(|t| t.unwrap().id)
        .collect();
        assert_eq!(order, vec![a.id, b.id, c.id]);
        assert!(coord.claim_next(&w).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fifo_uses_created_at_not_insertion_order() {
        let (board, clock) = setup();
        let late = create_at(&board, &clock, 50, "late", Priority::Medium);
        let early = create_at(&board, &clock, 10, "early", Priority::Medium);
        let coord = coordinator(&board);

        let first = coord.claim_next(&worker("w")).await.unwrap().unwrap();
        assert_eq!(first.id, early.id);
        assert_ne!(first.id, late.id);
    }

    #[tokio::test]
    async fn explicit_bands_skip_the_others() {
        let (board, clock) = setup();
        create_at(&board, &clock, 0, "urgent", Priority::High);
        let low = create_at(&board, &clock, 1, "chore", Priority::Low);
        let coord = coordinator(&board);

        let claimed = coord
            .claim(&worker("w"), &[Priority::Low])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, low.id);
    }

    #[tokio::test]
    async fn blocked_tasks_are_skipped_without_backoff() {
        let (board, clock) = setup();
        let dep = create_at(&board, &clock, 0, "dep", Priority::Low);
        clock.advance(std::time::Duration::from_secs(1));
        board
            .create(
                NewTask::new(TaskId::from_ulid(Ulid::new()), "child")
                    .priority(Priority::High)
                    .depends_on(dep.id),
            )
            .unwrap();
        let coord = coordinator(&board);

        // high の child は依存待ちなので low の dep が先に取れる
        let first = coord.claim_next(&worker("w")).await.unwrap().unwrap();
        assert_eq!(first.id, dep.id);
        assert!(coord.claim_next(&worker("w")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unreadable_record_does_not_block_other_bands() {
        let (board, clock) = setup();
        let medium = create_at(&board, &clock, 0, "medium", Priority::Medium);
        let mut tx = board.store().begin();
        tx.put(
            format!("pending/high/{}", TaskId::from_ulid(Ulid::new())),
            b"\x00garbage".to_vec(),
        );
        tx.commit().unwrap();

        let claimed = coordinator(&board)
            .claim_next(&worker("w"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, medium.id);
    }

    #[rstest]
    #[case::memory(KvStore::in_memory as fn() -> KvStore)]
    #[case::sled(sled_store as fn() -> KvStore)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn eight_workers_never_share_a_task(#[case] open: fn() -> KvStore) {
        let (board, clock) = setup_on(open());
        let mut ids = HashSet::new();
        for i in 0..64 {
            let priority = Priority::ALL[i % 3];
            ids.insert(create_at(&board, &clock, i as i64, "job", priority).id);
        }
        let coord = Arc::new(coordinator(&board));

        let mut handles = Vec::new();
        for n in 0..8 {
            let coord = Arc::clone(&coord);
            handles.push(tokio::spawn(async move {
                let me = worker(&format!("w{n}"));
                let mut mine = Vec::new();
                while let Some(task) = coord.claim_next(&me).await.unwrap() {
                    assert_eq!(task.assignee.as_ref(), Some(&me));
                    mine.push(task.id);
                }
                (me, mine)
            }));
        }

        let mut owner: HashMap<TaskId, WorkerId> = HashMap::new();
        for handle in handles {
            let (me, mine) = handle.await.unwrap();
            for id in mine {
                if let Some(other) = owner.insert(id, me.clone()) {
                    panic!("{id} claimed by both {other} and {me}");
                }
            }
        }
        assert_eq!(owner.keys().copied().collect::<HashSet<_>>(), ids);

        for task in board.list(Some(TaskStatus::InProgress)).unwrap() {
            assert_eq!(owner.get(&task.id), task.assignee.as_ref());
        }
        assert!(board.list(Some(TaskStatus::Pending)).unwrap().is_empty());
    }

    #[rstest]
    #[case::memory(KvStore::in_memory as fn() -> KvStore)]
    #[case::sled(sled_store as fn() -> KvStore)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn dependencies_hold_under_random_ordering(#[case] open: fn() -> KvStore) {
        for seed in 0..5u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let (board, clock) = setup_on(open());

            // 各タスクはそれ以前のタスクのいくつかに依存する（DAG）
            let mut created: Vec<Task> = Vec::new();
            for i in 0..24 {
                let mut new = NewTask::new(TaskId::from_ulid(Ulid::new()), format!("t{i}"))
                    .priority(*Priority::ALL.choose(&mut rng).unwrap());
                for dep in created.choose_multiple(&mut rng, created.len().min(2)) {
                    if rng.gen_bool(0.5) {
                        new = new.depends_on(dep.id);
                    }
                }
                clock.advance(std::time::Duration::from_millis(rng.gen_range(0..1_000)));
                created.push(board.create(new).unwrap());
            }

            let coord = Arc::new(coordinator(&board));
            let mut handles = Vec::new();
            for n in 0..4 {
                let coord = Arc::clone(&coord);
                let board = Arc::clone(&board);
                handles.push(tokio::spawn(async move {
                    let me = worker(&format!("w{n}"));
                    let mut idle = 0;
                    while idle < 20 {
                        match coord.claim_next(&me).await.unwrap() {
                            Some(task) => {
                                idle = 0;
                                for dep in &task.dependencies {
                                    assert_eq!(
                                        board.get(*dep).unwrap().status,
                                        TaskStatus::Completed,
                                        "{} started before {dep}",
                                        task.id
                                    );
                                }
                                tokio::task::yield_now().await;
                                board.complete(task.id, &me).unwrap();
                            }
                            None => {
                                idle += 1;
                                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                            }
                        }
                    }
                }));
            }
            for handle in handles {
                handle.await.unwrap();
            }

            let counts = board.counts().unwrap();
            assert_eq!(counts.completed, created.len(), "seed {seed}");
        }
    }
}
