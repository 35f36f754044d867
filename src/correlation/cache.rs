use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use super::CorrelationId;

struct CacheInner {
    entries: HashMap<CorrelationId, bool>,
    order: VecDeque<CorrelationId>,
}

/// Bounded memo of `correlation id -> created by this system`. Entries are
/// evicted oldest-first once `capacity` is reached and must be invalidated
/// on every write to the record they describe. The store stays the source
/// of truth; a miss always falls through to it.
pub struct CorrelationCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

impl CorrelationCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn get(&self, id: &CorrelationId) -> Option<bool> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.get(id).copied()
    }

    pub fn insert(&self, id: CorrelationId, created_by_system: bool) {
        if self.capacity == 0 {
            return;
        }
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.entries.insert(id.clone(), created_by_system).is_none() {
            inner.order.push_back(id);
        }
        while inner.entries.len() > self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    pub fn invalidate(&self, id: &CorrelationId) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.entries.remove(id).is_some() {
            inner.order.retain(|queued| queued != id);
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
