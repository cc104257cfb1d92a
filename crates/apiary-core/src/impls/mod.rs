//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **SledBackend**: 永続化される正本（本番用）
//! - **MemoryBackend**: 開発用・テスト用

pub mod memory_backend;
pub mod sled_backend;

pub use self::memory_backend::MemoryBackend;
pub use self::sled_backend::SledBackend;
