//! Per-subscription event queue.
//!
//! - 容量未満: すべてのイベントを順に積む
//! - 容量到達後: 同じキーのイベントが既に積まれていれば最後のものに合流させる
//!   （最新値は必ず残る。新しいキーのイベントは容量を超えても積む）
//! - 既に見た revision より古いイベントは捨てる（store は revision 順に配信するので、
//!   保持するのは最大 revision 1 つだけでよい）

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::domain::WatchEvent;

#[derive(Default)]
struct MailboxState {
    queue: VecDeque<WatchEvent>,
    high_water: u64,
    closed: bool,
}

pub(crate) struct Mailbox {
    state: Mutex<MailboxState>,
    notify: Notify,
    capacity: usize,
}

impl Mailbox {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(MailboxState::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn push(&self, event: WatchEvent) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            if event.revision < state.high_water {
                return;
            }
            state.high_water = event.revision;

            if state.queue.len() >= self.capacity
                && let Some(queued) = state.queue.iter_mut().rev().find(|q| q.key == event.key)
            {
                queued.kind = queued.kind.coalesce(event.kind);
                queued.value = event.value;
                queued.revision = event.revision;
                return;
            }
            state.queue.push_back(event);
        }
        self.notify.notify_one();
    }

    pub(crate) fn try_recv(&self) -> Option<WatchEvent> {
        self.state.lock().queue.pop_front()
    }

    /// Next event, or None once closed and drained.
    pub(crate) async fn recv(&self) -> Option<WatchEvent> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(event) = state.queue.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            // notify_one は待ち手がいなければ permit を残すので取りこぼさない
            self.notify.notified().await;
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Drop everything queued and wake the receiver.
    pub(crate) fn close(&self) {
        {
            let mut state = self.state.lock();
            state.closed = true;
            state.queue.clear();
        }
        self.notify.notify_one();
    }
}
