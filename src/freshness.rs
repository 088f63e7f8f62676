//! # Bounded Freshness List
//!
//! Fixed-capacity list kept sorted by freshness, freshest first. Broadcast
//! keeps its backup neighbour candidates here: inserting into a full list
//! pushes out the stalest entry, and healing walks the list from the front.

use std::collections::VecDeque;
use std::future::Future;

/// Anything with a comparable freshness. Greater is fresher.
pub trait Freshness {
    fn freshness(&self) -> i64;
}

#[derive(Debug, Clone)]
pub struct BoundedFreshnessList<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T: Freshness> BoundedFreshnessList<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Insert `item` at its sorted position, ahead of entries that are
    /// equally fresh.
    ///
    /// Returns the entry that did not fit: the stalest existing entry when
    /// the list overflowed, or `item` itself when it would land past the end
    /// of a full list.
    pub fn insert(&mut self, item: T) -> Option<T> {
        let f = item.freshness();
        let index = self.entries.partition_point(|e| e.freshness() > f);
        if index >= self.capacity {
            return Some(item);
        }
        self.entries.insert(index, item);
        if self.entries.len() > self.capacity {
            self.entries.pop_back()
        } else {
            None
        }
    }

    /// Visit entries freshest first, removing each one visited, until `f`
    /// yields a value. Entries after the successful one stay in the list.
    pub async fn until_first<R, F, Fut>(&mut self, mut f: F) -> Option<R>
    where
        F: FnMut(T) -> Fut,
        Fut: Future<Output = Option<R>>,
    {
        while let Some(item) = self.entries.pop_front() {
            if let Some(found) = f(item).await {
                return Some(found);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
