//! WatchHub - prefix 単位の購読と配信

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use super::mailbox::Mailbox;
use crate::domain::WatchEvent;

struct Subscriber {
    prefix: String,
    mailbox: Arc<Mailbox>,
}

struct HubInner {
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl HubInner {
    fn detach(&self, id: u64) {
        // hub のロック内で close するので、戻った時点でこの購読への配信は止まっている
        if let Some(subscriber) = self.subscribers.lock().remove(&id) {
            subscriber.mailbox.close();
            debug!(subscription = id, prefix = %subscriber.prefix, "watch cancelled");
        }
    }
}

impl Drop for HubInner {
    fn drop(&mut self) {
        for subscriber in self.subscribers.get_mut().values() {
            subscriber.mailbox.close();
        }
    }
}

/// Fan-out point between committed changes and subscriptions.
#[derive(Clone)]
pub struct WatchHub {
    inner: Arc<HubInner>,
}

impl WatchHub {
    /// `capacity` is the soft per-subscription queue length before coalescing starts.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                capacity,
            }),
        }
    }

    pub fn subscribe(&self, prefix: impl Into<String>) -> Subscription {
        let prefix = prefix.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mailbox = Arc::new(Mailbox::new(self.inner.capacity));
        self.inner.subscribers.lock().insert(
            id,
            Subscriber {
                prefix: prefix.clone(),
                mailbox: Arc::clone(&mailbox),
            },
        );
        debug!(subscription = id, prefix = %prefix, "watch registered");
        Subscription {
            id,
            prefix,
            mailbox,
            hub: Arc::downgrade(&self.inner),
        }
    }

    pub fn publish(&self, events: &[WatchEvent]) {
        if events.is_empty() {
            return;
        }
        let subscribers = self.inner.subscribers.lock();
        for subscriber in subscribers.values() {
            for event in events.iter().filter(|e| e.key.starts_with(&subscriber.prefix)) {
                subscriber.mailbox.push(event.clone());
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }
}

/// A standing subscription to one key prefix.
///
/// Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    prefix: String,
    mailbox: Arc<Mailbox>,
    hub: Weak<HubInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Wait for the next event. None after unsubscribe.
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        self.mailbox.recv().await
    }

    pub fn try_recv(&mut self) -> Option<WatchEvent> {
        self.mailbox.try_recv()
    }

    /// Number of events waiting.
    pub fn pending(&self) -> usize {
        self.mailbox.len()
    }

    pub fn unsubscribe(self) {
        // Drop does the work
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        match self.hub.upgrade() {
            Some(hub) => hub.detach(self.id),
            None => self.mailbox.close(),
        }
    }
}
