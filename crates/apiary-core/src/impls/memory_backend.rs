//! MemoryBackend - 開発用・テスト用の KvBackend
//!
//! # 実装詳細
//! - BTreeMap<String, Vec<u8>> を 1 つの Mutex で保護（キー順の scan が自然にできる）
//! - ロック取得は lock_timeout で打ち切る → KvError::LockTimeout（リトライ可能）
//! - プロセス終了で内容は消える（永続化が必要なら SledBackend）

use std::collections::BTreeMap;
use std::ops::Bound;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use crate::domain::{EventKind, WatchEvent};
use crate::ports::{Commit, KvBackend, KvError, WriteBatch, WriteOp};

#[derive(Default)]
struct MemoryState {
    entries: BTreeMap<String, Vec<u8>>,
    revision: u64,
}

pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    lock_timeout: Duration,
}

impl MemoryBackend {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            lock_timeout,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, KvError> {
        self.state
            .try_lock_for(self.lock_timeout)
            .ok_or(KvError::LockTimeout(self.lock_timeout))
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl KvBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.lock()?.entries.get(key).cloned())
    }

    fn scan_page(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, Vec<u8>)>, KvError> {
        let lower = match start_after {
            Some(after) if after >= prefix => Bound::Excluded(after.to_string()),
            _ => Bound::Included(prefix.to_string()),
        };
        let state = self.lock()?;
        Ok(state
            .entries
            .range((lower, Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .take(limit)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn apply(&self, batch: &WriteBatch) -> Result<Commit, KvError> {
        let mut state = self.lock()?;

        for guard in batch.guards() {
            let current = state.entries.get(guard.key()).map(Vec::as_slice);
            if !guard.holds(current) {
                return Err(KvError::Conflict {
                    key: guard.key().to_string(),
                });
            }
        }

        if batch.is_read_only() {
            return Ok(Commit {
                revision: state.revision,
                events: Vec::new(),
            });
        }

        state.revision += 1;
        let revision = state.revision;
        let mut events = Vec::with_capacity(batch.ops().len());
        for op in batch.ops() {
            match op {
                WriteOp::Put { key, value } => {
                    let previous = state.entries.insert(key.clone(), value.clone());
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
                    if state.entries.remove(key).is_some() {
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

        Ok(Commit { revision, events })
    }

    fn flush(&self) -> Result<(), KvError> {
        Ok(())
    }
}
