use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

/// Identifies one cache instance on the bus so it can skip its own messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invalidation {
    pub origin: CacheId,
    pub path: String,
}

pub type InvalidationReceiver = broadcast::Receiver<Invalidation>;

/// Process-wide publish/subscribe channel shared by every cache of the
/// application. Delivery is fire-and-forget; invalidation is idempotent so
/// duplicates are harmless.
#[derive(Clone)]
pub struct InvalidationBus {
    tx: broadcast::Sender<Invalidation>,
    next_id: Arc<AtomicU64>,
}

impl InvalidationBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn register(&self) -> CacheId {
        CacheId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn subscribe(&self) -> InvalidationReceiver {
        self.tx.subscribe()
    }

    pub fn publish(&self, origin: CacheId, path: &str) {
        let _ = self.tx.send(Invalidation {
            origin,
            path: path.to_string(),
        });
    }
}

impl Default for InvalidationBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
