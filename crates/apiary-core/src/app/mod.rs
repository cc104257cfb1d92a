//! App - アプリケーション層
//!
//! ports / store を組み合わせて coordination のロジックを実装する。
//!
//! # 主要コンポーネント
//! - **TaskBoard**: create / get / scan / transition / watch の入口
//! - **ClaimCoordinator**: 優先度順・FIFO の claim（競合時は backoff）
//! - **ReaperLoop**: Lease 期限切れの回収
//! - **WorkerGroup**: claim → handler → complete/fail
//! - **AppBuilder**: 設定からのワイヤリング

pub mod board;
pub mod builder;
pub mod claim;
pub mod reaper_loop;
pub mod status;
pub mod worker_loop;

pub use self::board::{LEASE_EXPIRED, TaskBoard};
pub use self::builder::{App, AppBuilder, BuildError};
pub use self::claim::ClaimCoordinator;
pub use self::reaper_loop::{ReaperLoop, SweepReport};
pub use self::status::{BandCounts, BoardCounts};
pub use self::worker_loop::{TaskHandler, WorkerGroup};
