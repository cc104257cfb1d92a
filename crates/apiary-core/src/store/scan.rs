//! Lazy prefix scan.
//!
//! 1 ページ分だけ読み、尽きたら最後のキーの直後から次のページを読む。
//! ページ内は一貫したスナップショットだが、ページをまたぐと途中の commit が見える。

use std::collections::VecDeque;
use std::sync::Arc;

use crate::ports::{KvBackend, KvError};

/// Entries under one prefix in key order, fetched a page at a time.
pub struct PrefixScan {
    backend: Arc<dyn KvBackend>,
    prefix: String,
    page_size: usize,
    buffered: VecDeque<(String, Vec<u8>)>,
    cursor: Option<String>,
    exhausted: bool,
}

impl PrefixScan {
    pub(super) fn new(
        backend: Arc<dyn KvBackend>,
        prefix: String,
        cursor: Option<String>,
        page_size: usize,
    ) -> Self {
        Self {
            backend,
            prefix,
            page_size: page_size.max(1),
            buffered: VecDeque::new(),
            cursor,
            exhausted: false,
        }
    }

    /// Last key handed out; pass it to `scan_after` to resume elsewhere.
    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    fn fill(&mut self) -> Result<(), KvError> {
        let page = self
            .backend
            .scan_page(&self.prefix, self.cursor.as_deref(), self.page_size)?;
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        self.buffered.extend(page);
        Ok(())
    }
}

impl Iterator for PrefixScan {
    type Item = Result<(String, Vec<u8>), KvError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffered.is_empty()
            && !self.exhausted
            && let Err(err) = self.fill()
        {
            // 同じエラーを繰り返さない
            self.exhausted = true;
            return Some(Err(err));
        }
        let (key, value) = self.buffered.pop_front()?;
        self.cursor = Some(key.clone());
        Some(Ok((key, value)))
    }
}

#[cfg(test)]
mod tests {
    use crate::store::KvStore;

    fn seeded(keys: &[&str]) -> KvStore {
        let store = KvStore::in_memory().with_page_size(2);
        let mut tx = store.begin();
        for key in keys {
            tx.put(*key, key.as_bytes().to_vec());
        }
        tx.commit().unwrap();
        store
    }

    #[test]
    fn walks_every_page_in_key_order() {
        let store = seeded(&["p/1", "p/2", "p/3", "p/4", "p/5", "q/1"]);
        let keys: Vec<String> = store
            .scan_lazy("p/")
            .map(|entry| entry.unwrap().0)
            .collect();
        assert_eq!(keys, ["p/1", "p/2", "p/3", "p/4", "p/5"]);
    }

    #[test]
    fn later_pages_see_commits_made_between_them() {
        let store = seeded(&["p/1", "p/2", "p/3"]);
        let mut scan = store.scan_lazy("p/");
        assert_eq!(scan.next().unwrap().unwrap().0, "p/1");
        assert_eq!(scan.cursor(), Some("p/1"));

        let mut tx = store.begin();
        tx.delete("p/3");
        tx.put("p/4", b"new".to_vec());
        tx.commit().unwrap();

        let rest: Vec<String> = scan.map(|entry| entry.unwrap().0).collect();
        assert_eq!(rest, ["p/2", "p/4"]);
    }
}
