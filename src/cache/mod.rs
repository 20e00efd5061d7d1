//! Bounded LRU over URL → cached response.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use crate::http::Response;

/// Fixed-capacity response cache with least-recently-used eviction.
///
/// Every operation runs under one exclusive lock per cache instance, and the
/// lock only ever covers map and recency-list manipulation. Callers get
/// by-value copies out of `get` so they can stream to clients without
/// holding the lock.
pub struct ResponseCache {
    inner: Mutex<Inner>,
}

struct Inner {
    capacity: usize,
    entries: HashMap<String, Response>,
    // front = least recently used, back = most recently used
    recency: VecDeque<String>,
}

impl ResponseCache {
    pub fn new(capacity: usize) -> ResponseCache {
        ResponseCache {
            inner: Mutex::new(Inner {
                capacity,
                entries: HashMap::with_capacity(capacity),
                recency: VecDeque::with_capacity(capacity),
            }),
        }
    }

    pub fn exists(&self, url: &str) -> bool {
        self.lock().entries.contains_key(url)
    }

    /// Fetch a copy of the cached response and promote it to most recently
    /// used. Absent keys are a miss, not an error.
    pub fn get(&self, url: &str) -> Option<Response> {
        let mut inner = self.lock();
        if !inner.entries.contains_key(url) {
            return None;
        }
        inner.touch(url);
        inner.entries.get(url).cloned()
    }

    /// Insert or replace. A replaced entry is promoted; a new entry evicts
    /// the least-recently-used one first when the cache is full.
    pub fn put(&self, url: &str, response: Response) {
        let mut inner = self.lock();
        if inner.capacity == 0 {
            return;
        }
        if inner.entries.contains_key(url) {
            inner.entries.insert(url.to_string(), response);
            inner.touch(url);
            return;
        }
        if inner.entries.len() == inner.capacity {
            if let Some(evicted) = inner.recency.pop_front() {
                inner.entries.remove(&evicted);
            }
        }
        inner.entries.insert(url.to_string(), response);
        inner.recency.push_back(url.to_string());
    }

    /// Drop both the mapping and the recency record; no-op when absent.
    pub fn remove(&self, url: &str) {
        let mut inner = self.lock();
        if inner.entries.remove(url).is_some() {
            inner.recency.retain(|entry| entry != url);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A handler that panicked cannot leave the map and recency list out
        // of step, so a poisoned lock is still usable.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Inner {
    fn touch(&mut self, url: &str) {
        if let Some(idx) = self.recency.iter().position(|entry| entry == url) {
            self.recency.remove(idx);
        }
        self.recency.push_back(url.to_string());
    }
}
