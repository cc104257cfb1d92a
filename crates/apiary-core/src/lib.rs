//! apiary-core
//!
//! Shared task coordination store: workers race to claim prioritised tasks
//! out of one durable key-value store, and watchers follow changes by key
//! prefix.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, priority, status, task, transition, key, retry, errors, events）
//! - **ports**: 抽象化レイヤー（KvBackend, Clock, IdGenerator）
//! - **impls**: KvBackend の実装（SledBackend: 永続化、MemoryBackend: テスト用）
//! - **store**: KvStore / Transaction（楽観的トランザクション + 変更通知）
//! - **watch**: prefix 単位の購読（coalescing mailbox）
//! - **app**: TaskBoard, ClaimCoordinator, ReaperLoop, WorkerGroup, AppBuilder
//! - **config**: TOML 設定
//!
//! # キー空間
//! - `pending/{priority}/{id}`
//! - `in_progress/{id}`, `completed/{id}`, `failed/{id}`

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod store;
pub mod watch;

pub use app::{App, AppBuilder, ClaimCoordinator, TaskBoard};
pub use config::ApiaryConfig;
pub use domain::{CoordError, NewTask, Priority, Task, TaskId, TaskStatus, WorkerId};
