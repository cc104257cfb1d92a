//! KvStore - KvBackend の上に立つストアアダプタ
//!
//! # 責務
//! - 読み取り（get / scan）はバックエンドへ直接
//! - 書き込みは必ず Transaction 経由（all-or-nothing）
//! - commit で発生した変更を WatchHub に配信（commit と配信は順序ロックの中で行い、
//!   購読者には常に revision 順に届く）

mod scan;
mod transaction;

pub use self::scan::PrefixScan;
pub use self::transaction::Transaction;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::info;

use crate::config::ApiaryConfig;
use crate::impls::{MemoryBackend, SledBackend};
use crate::ports::{KvBackend, KvError};
use crate::watch::{Subscription, WatchHub};

#[derive(Clone)]
pub struct KvStore {
    backend: Arc<dyn KvBackend>,
    hub: WatchHub,
    /// Held across apply and publish by every writing commit.
    order: Arc<Mutex<()>>,
    page_size: usize,
}

const DEFAULT_PAGE_SIZE: usize = 256;

impl KvStore {
    pub fn new(backend: Arc<dyn KvBackend>, hub: WatchHub) -> Self {
        Self {
            backend,
            hub,
            order: Arc::new(Mutex::new(())),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Entries per backend read in `scan_lazy`.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Sled at `storage.path`, or an in-memory store when no path is set.
    pub fn open(config: &ApiaryConfig) -> Result<Self, KvError> {
        let storage = &config.storage;
        let backend: Arc<dyn KvBackend> = match &storage.path {
            Some(path) => {
                info!(path = %path.display(), tree = %storage.tree, "opening sled store");
                Arc::new(SledBackend::open(
                    path,
                    &storage.tree,
                    storage.flush_on_commit,
                )?)
            }
            None => Arc::new(MemoryBackend::new(Duration::from_millis(
                storage.lock_timeout_ms,
            ))),
        };
        Ok(Self::new(backend, WatchHub::new(config.watch.mailbox_capacity))
            .with_page_size(storage.scan_page_size))
    }

    /// Ephemeral store for tests and one-off runs.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::default()), WatchHub::new(1024))
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        self.backend.get(key)
    }

    /// Every entry under `prefix`, in key order, as of one point in time.
    pub fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, KvError> {
        self.backend.scan_prefix(prefix, None)
    }

    /// Entries under `prefix`, read one page at a time as the iterator advances.
    pub fn scan_lazy(&self, prefix: &str) -> PrefixScan {
        PrefixScan::new(
            Arc::clone(&self.backend),
            prefix.to_string(),
            None,
            self.page_size,
        )
    }

    /// Resume a scan strictly after `after`.
    pub fn scan_after(
        &self,
        prefix: &str,
        after: &str,
    ) -> Result<Vec<(String, Vec<u8>)>, KvError> {
        self.backend.scan_prefix(prefix, Some(after))
    }

    pub fn begin(&self) -> Transaction {
        Transaction::new(
            Arc::clone(&self.backend),
            self.hub.clone(),
            Arc::clone(&self.order),
        )
    }

    /// Subscribe to changes under `prefix`. Only commits after this call are seen.
    pub fn watch(&self, prefix: impl Into<String>) -> Subscription {
        self.hub.subscribe(prefix)
    }

    pub fn flush(&self) -> Result<(), KvError> {
        self.backend.flush()
    }
}
