//! SledBackend - 永続化される KvBackend
//!
//! # 実装詳細
//! - guard の検証と書き込みを 1 つの sled トランザクションで行う
//!   （sled は競合したトランザクションをクロージャごと再実行するので、
//!   再実行時に guard が崩れていれば Abort → KvError::Conflict）
//! - revision は `generate_id` で採番（再起動後も単調増加）
//! - 読み取りだけの batch は採番も commit カウンタも動かさない
//! - scan は commit カウンタで楽観的に検証し、競合し続けたら commit gate を取る

use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::RwLock;
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult, TransactionError};
use tracing::{debug, warn};

use crate::domain::{EventKind, WatchEvent};
use crate::ports::{Commit, KvBackend, KvError, WriteBatch, WriteOp};

const OPTIMISTIC_SCAN_ATTEMPTS: usize = 8;

impl From<sled::Error> for KvError {
    fn from(err: sled::Error) -> Self {
        KvError::Backend(err.to_string())
    }
}

pub struct SledBackend {
    db: sled::Db,
    tree: sled::Tree,
    flush_on_commit: bool,
    /// Commits share it; a scan that keeps losing takes it exclusively.
    gate: RwLock<()>,
    commits: AtomicU64,
    in_flight: AtomicUsize,
    /// Highest revision written through this handle.
    last_revision: AtomicU64,
}

/// Marks a commit as in flight for as long as it lives.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SledBackend {
    /// Open (or create) the database at `path` and use the named tree.
    pub fn open(path: impl AsRef<Path>, tree: &str, flush_on_commit: bool) -> Result<Self, KvError> {
        let path = path.as_ref();
        let db = sled::Config::new().path(path).open()?;
        debug!(path = %path.display(), tree, "opened sled store");
        Self::from_db(db, tree, flush_on_commit)
    }

    /// Database that lives only as long as this value.
    pub fn temporary() -> Result<Self, KvError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db, "tasks", false)
    }

    fn from_db(db: sled::Db, tree: &str, flush_on_commit: bool) -> Result<Self, KvError> {
        let tree = db.open_tree(tree)?;
        Ok(Self {
            db,
            tree,
            flush_on_commit,
            gate: RwLock::new(()),
            commits: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            last_revision: AtomicU64::new(0),
        })
    }

    fn collect(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, Vec<u8>)>, KvError> {
        let items = match start_after {
            Some(after) if after >= prefix => self
                .tree
                .range::<&[u8], _>((Bound::Excluded(after.as_bytes()), Bound::Unbounded)),
            _ => self.tree.scan_prefix(prefix),
        };
        let mut entries = Vec::new();
        for item in items {
            if entries.len() >= limit {
                break;
            }
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            let key = String::from_utf8(key.to_vec())
                .map_err(|e| KvError::Backend(format!("non-utf8 key: {e}")))?;
            entries.push((key, value.to_vec()));
        }
        Ok(entries)
    }
}

impl KvBackend for SledBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.tree.get(key)?.map(|value| value.to_vec()))
    }

    fn scan_page(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, Vec<u8>)>, KvError> {
        for _ in 0..OPTIMISTIC_SCAN_ATTEMPTS {
            if self.in_flight.load(Ordering::SeqCst) > 0 {
                std::thread::yield_now();
                continue;
            }
            let before = self.commits.load(Ordering::SeqCst);
            let entries = self.collect(prefix, start_after, limit)?;
            if self.in_flight.load(Ordering::SeqCst) == 0
                && self.commits.load(Ordering::SeqCst) == before
            {
                return Ok(entries);
            }
        }

        warn!(prefix, "scan kept racing commits; taking the commit gate");
        let _gate = self.gate.write();
        self.collect(prefix, start_after, limit)
    }

    fn apply(&self, batch: &WriteBatch) -> Result<Commit, KvError> {
        let read_only = batch.is_read_only();
        let _gate = (!read_only).then(|| self.gate.read());
        let _in_flight = (!read_only).then(|| InFlight::enter(&self.in_flight));

        let result = self.tree.transaction(
            |tx| -> ConflictableTransactionResult<(u64, Vec<WatchEvent>), String> {
                for guard in batch.guards() {
                    let current = tx.get(guard.key())?;
                    if !guard.holds(current.as_deref()) {
                        return Err(ConflictableTransactionError::Abort(guard.key().to_string()));
                    }
                }

                let revision = if read_only { 0 } else { tx.generate_id()? };
                let mut events = Vec::with_capacity(batch.ops().len());
                for op in batch.ops() {
                    match op {
                        WriteOp::Put { key, value } => {
                            let previous = tx.insert(key.as_bytes(), value.as_slice())?;
                            let kind = if previous.is_some() {
                                EventKind::Updated
                            } else {
                                EventKind::Created
                            };
                            events.push(WatchEvent {
                                key: key.clone(),
                                kind,
                                value: Some(value.clone()),
                                revision,
                            });
                        }
                        WriteOp::Delete { key } => {
                            if tx.remove(key.as_bytes())?.is_some() {
                                events.push(WatchEvent {
                                    key: key.clone(),
                                    kind: EventKind::Deleted,
                                    value: None,
                                    revision,
                                });
                            }
                        }
                    }
                }
                Ok((revision, events))
            },
        );

        let (revision, events) = match result {
            Ok(applied) => applied,
            Err(TransactionError::Abort(key)) => return Err(KvError::Conflict { key }),
            Err(TransactionError::Storage(err)) => return Err(err.into()),
        };
        if read_only {
            return Ok(Commit {
                revision: self.last_revision.load(Ordering::SeqCst),
                events,
            });
        }
        self.last_revision.fetch_max(revision, Ordering::SeqCst);
        self.commits.fetch_add(1, Ordering::SeqCst);

        if self.flush_on_commit {
            self.tree.flush()?;
        }
        Ok(Commit { revision, events })
    }

    fn flush(&self) -> Result<(), KvError> {
        self.db.flush()?;
        Ok(())
    }
}
