//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」。
//! - KvBackend: 正本（source of truth）となる key-value ストア
//! - Clock: 時刻
//! - IdGenerator: TaskId 生成

pub mod clock;
pub mod id_generator;
pub mod kv_backend;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::kv_backend::{Commit, Guard, KvBackend, KvError, WriteBatch, WriteOp};
