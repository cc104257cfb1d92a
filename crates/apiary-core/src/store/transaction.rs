//! Optimistic transaction over a KvBackend.
//!
//! 読んだ値はすべて guard として記録し、commit 時にバックエンドが
//! 原子的に検証する。途中で誰かが同じキーを書き換えていれば Conflict。

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::ports::{Guard, KvBackend, KvError, WriteBatch, WriteOp};
use crate::watch::WatchHub;

/// Buffered writes plus the read set. Dropping it without `commit` writes nothing.
pub struct Transaction {
    backend: Arc<dyn KvBackend>,
    hub: WatchHub,
    order: Arc<Mutex<()>>,
    reads: BTreeMap<String, Guard>,
    writes: Vec<WriteOp>,
}

impl Transaction {
    pub(super) fn new(backend: Arc<dyn KvBackend>, hub: WatchHub, order: Arc<Mutex<()>>) -> Self {
        Self {
            backend,
            hub,
            order,
            reads: BTreeMap::new(),
            writes: Vec::new(),
        }
    }

    /// Read `key`, seeing this transaction's own writes first.
    ///
    /// The first backend read of a key pins the observed value; later reads
    /// of the same key return it again.
    pub fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        if let Some(op) = self.writes.iter().rev().find(|op| op.key() == key) {
            return Ok(match op {
                WriteOp::Put { value, .. } => Some(value.clone()),
                WriteOp::Delete { .. } => None,
            });
        }
        if let Some(guard) = self.reads.get(key) {
            return Ok(match guard {
                Guard::Equals { value, .. } => Some(value.clone()),
                Guard::Absent { .. } => None,
            });
        }

        let value = self.backend.get(key)?;
        let guard = match &value {
            Some(value) => Guard::Equals {
                key: key.to_string(),
                value: value.clone(),
            },
            None => Guard::Absent {
                key: key.to_string(),
            },
        };
        self.reads.insert(key.to_string(), guard);
        Ok(value)
    }

    pub fn put(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.writes.push(WriteOp::Put {
            key: key.into(),
            value,
        });
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.writes.push(WriteOp::Delete { key: key.into() });
    }

    pub fn is_read_only(&self) -> bool {
        self.writes.is_empty()
    }

    /// Apply atomically and notify watchers. Returns the commit revision.
    ///
    /// A read-only transaction still validates its read set, which makes it
    /// a consistent multi-key read.
    pub fn commit(self) -> Result<u64, KvError> {
        let mut batch = WriteBatch::new();
        for guard in self.reads.into_values() {
            batch.guard(guard);
        }
        for op in self.writes {
            match op {
                WriteOp::Put { key, value } => batch.put(key, value),
                WriteOp::Delete { key } => batch.delete(key),
            };
        }

        if batch.is_read_only() {
            return Ok(self.backend.apply(&batch)?.revision);
        }

        let _order = self.order.lock();
        let commit = self.backend.apply(&batch)?;
        trace!(
            revision = commit.revision,
            changes = commit.events.len(),
            "transaction committed"
        );
        self.hub.publish(&commit.events);
        Ok(commit.revision)
    }
}
