//! AppBuilder - ストア・ボード・コーディネータのワイヤリング
//!
//! # Fail-fast 設計
//! - build() 時に設定を検証（不正な band 指定や 0 の lease など）
//! - ストアを開けなければその場で BuildError

use std::sync::Arc;
use std::time::Duration;

use super::{ClaimCoordinator, ReaperLoop, TaskBoard, TaskHandler, WorkerGroup};
use crate::config::{ApiaryConfig, ConfigError};
use crate::domain::IdParseError;
use crate::ports::{Clock, KvError, SystemClock};
use crate::store::KvStore;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot open store: {0}")]
    Store(#[from] KvError),
}

/// # 使用例
/// ```ignore
/// let app = AppBuilder::new(config).build()?;
/// let task = app.board().create(NewTask::new(id, "index"))?;
/// ```
pub struct AppBuilder {
    config: ApiaryConfig,
    clock: Arc<dyn Clock>,
    store: Option<KvStore>,
}

impl AppBuilder {
    pub fn new(config: ApiaryConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            store: None,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use an already opened store instead of `storage.*`.
    pub fn store(mut self, store: KvStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Result<App, BuildError> {
        self.config.validate()?;
        let store = match self.store {
            Some(store) => store,
            None => KvStore::open(&self.config)?,
        };
        let board = Arc::new(TaskBoard::new(store, self.clock, &self.config));
        let coordinator = Arc::new(ClaimCoordinator::new(
            Arc::clone(&board),
            self.config.claim.clone(),
        ));
        Ok(App {
            config: self.config,
            board,
            coordinator,
        })
    }
}

/// Wired-up coordination core.
pub struct App {
    config: ApiaryConfig,
    board: Arc<TaskBoard>,
    coordinator: Arc<ClaimCoordinator>,
}

impl App {
    pub fn config(&self) -> &ApiaryConfig {
        &self.config
    }

    pub fn board(&self) -> &Arc<TaskBoard> {
        &self.board
    }

    pub fn coordinator(&self) -> &Arc<ClaimCoordinator> {
        &self.coordinator
    }

    pub fn reaper(&self) -> ReaperLoop {
        ReaperLoop::new(Arc::clone(&self.board), &self.config.lease)
    }

    pub fn spawn_workers(
        &self,
        n: usize,
        prefix: &str,
        handler: Arc<dyn TaskHandler>,
        idle_poll: Duration,
    ) -> Result<WorkerGroup, IdParseError> {
        WorkerGroup::spawn(n, prefix, Arc::clone(&self.coordinator), handler, idle_poll)
    }
}
