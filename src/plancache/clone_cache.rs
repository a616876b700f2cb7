// # Plan Clone Cache
//
// Per-entry lists of pre-decoded plan trees plus a process-wide LRU over
// returned clones. Checkout pops from the entry's list and decodes only on
// a miss; return pushes the clone back and appends the entry to the LRU
// tail, freeing the head's oldest clone once the LRU is full.

use crate::error::Result;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

struct CloneInner<T> {
    lists: HashMap<usize, Vec<Box<T>>>,
    lru: VecDeque<usize>,
}

pub struct CloneCache<T> {
    inner: Mutex<CloneInner<T>>,
    capacity: usize,
}

impl<T> CloneCache<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CloneInner {
                lists: HashMap::new(),
                lru: VecDeque::new(),
            }),
            capacity,
        }
    }

    /// Pop a cached clone for `entry`, or build one with `decode`.
    pub fn checkout(
        &self,
        entry: usize,
        decode: impl FnOnce() -> Result<Box<T>>,
    ) -> Result<Box<T>> {
        let cached = {
            let mut inner = self.inner.lock();
            let clone = inner.lists.get_mut(&entry).and_then(|list| list.pop());
            if clone.is_some() {
                remove_one(&mut inner.lru, entry);
            }
            clone
        };
        match cached {
            Some(clone) => Ok(clone),
            None => decode(),
        }
    }

    /// Push a clone back onto its entry's list and the LRU tail.
    pub fn give_back(&self, entry: usize, clone: Box<T>) {
        let mut inner = self.inner.lock();
        inner.lists.entry(entry).or_default().push(clone);
        inner.lru.push_back(entry);
        while inner.lru.len() > self.capacity {
            if let Some(victim) = inner.lru.pop_front() {
                if let Some(list) = inner.lists.get_mut(&victim) {
                    // Free the oldest clone of the LRU head's entry
                    if !list.is_empty() {
                        list.remove(0);
                    }
                    if list.is_empty() {
                        inner.lists.remove(&victim);
                    }
                }
            }
        }
    }

    /// Drop every clone belonging to a freed entry.
    pub fn purge(&self, entry: usize) {
        let mut inner = self.inner.lock();
        inner.lists.remove(&entry);
        inner.lru.retain(|e| *e != entry);
    }

    pub fn cached_count(&self, entry: usize) -> usize {
        self.inner
            .lock()
            .lists
            .get(&entry)
            .map(|l| l.len())
            .unwrap_or(0)
    }
}

fn remove_one(lru: &mut VecDeque<usize>, entry: usize) {
    if let Some(idx) = lru.iter().position(|e| *e == entry) {
        lru.remove(idx);
    }
}
