//! # Expiring Set
//!
//! A membership set whose entries disappear a fixed TTL after insertion.
//! Used by broadcast to suppress duplicate message ids.
//!
//! Because every entry has the same TTL, entries expire in insertion order.
//! A single reaper task sleeps until the front entry's deadline, evicts it,
//! and exits once the set is empty; the next insertion starts a new one.
//! `has` also checks the deadline itself, so a late reaper never extends an
//! entry's lifetime. [`ExpiringSet::clear`] empties the set and aborts the
//! reaper, which is how an owner stops it without waiting out the TTL.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::trace;

struct Inner<T> {
    order: VecDeque<(Instant, T)>,
    members: HashMap<T, Instant>,
    /// Generation and handle of the running reaper, if any.
    reaper: Option<(u64, AbortHandle)>,
    next_reaper: u64,
}

#[derive(Clone)]
pub struct ExpiringSet<T> {
    inner: Arc<RwLock<Inner<T>>>,
    ttl: Duration,
}

impl<T> ExpiringSet<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                order: VecDeque::new(),
                members: HashMap::new(),
                reaper: None,
                next_reaper: 0,
            })),
            ttl,
        }
    }

    /// Insert `value` unless it is already present. Returns `true` when the
    /// value was newly inserted. The check and the insert happen under one
    /// write lock.
    pub async fn insert(&self, value: T) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        if let Some(&inserted) = inner.members.get(&value)
            && now < inserted + self.ttl
        {
            return false;
        }
        self.push_locked(&mut *inner, now, value);
        true
    }

    /// Insert `value`, restarting its lifetime if it was already present.
    pub async fn add(&self, value: T) {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        self.push_locked(&mut *inner, now, value);
    }

    pub async fn has(&self, value: &T) -> bool {
        let inner = self.inner.read().await;
        match inner.members.get(value) {
            Some(&inserted) => Instant::now() < inserted + self.ttl,
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.members.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Forget every entry and stop the reaper.
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.order.clear();
        inner.members.clear();
        if let Some((_, reaper)) = inner.reaper.take() {
            reaper.abort();
        }
    }

    fn push_locked(&self, inner: &mut Inner<T>, now: Instant, value: T) {
        inner.members.insert(value.clone(), now);
        inner.order.push_back((now, value));
        if inner.reaper.is_none() {
            let generation = inner.next_reaper;
            inner.next_reaper += 1;
            let task = tokio::spawn(reap(Arc::downgrade(&self.inner), self.ttl, generation));
            inner.reaper = Some((generation, task.abort_handle()));
        }
    }
}

async fn reap<T>(inner: Weak<RwLock<Inner<T>>>, ttl: Duration, generation: u64)
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    loop {
        let Some(strong) = inner.upgrade() else {
            return;
        };
        let front = strong.read().await.order.front().map(|(inserted, _)| *inserted);
        let deadline = match front {
            Some(inserted) => inserted + ttl,
            None => {
                let mut guard = strong.write().await;
                if guard.order.is_empty() {
                    retire(&mut guard, generation);
                    return;
                }
                continue;
            }
        };
        drop(strong);

        tokio::time::sleep_until(deadline).await;

        let Some(strong) = inner.upgrade() else {
            return;
        };
        let mut guard = strong.write().await;
        if !guard.reaper.as_ref().is_some_and(|(g, _)| *g == generation) {
            // Replaced after a clear.
            return;
        }
        let now = Instant::now();
        while let Some((inserted, _)) = guard.order.front() {
            if now < *inserted + ttl {
                break;
            }
            if let Some((inserted, value)) = guard.order.pop_front() {
                // A re-added value has a newer timestamp in `members`; keep it.
                if guard.members.get(&value) == Some(&inserted) {
                    guard.members.remove(&value);
                }
            }
        }
        trace!(remaining = guard.order.len(), "expired dedup entries");
        if guard.order.is_empty() {
            retire(&mut guard, generation);
            return;
        }
    }
}

fn retire<T>(inner: &mut Inner<T>, generation: u64) {
    if inner.reaper.as_ref().is_some_and(|(g, _)| *g == generation) {
        inner.reaper = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test]
    async fn present_before_ttl_and_absent_after() {
        let set = ExpiringSet::new(Duration::from_millis(10));
        set.add("foo").await;

        sleep(Duration::from_millis(5)).await;
        assert!(set.has(&"foo").await);

        sleep(Duration::from_millis(15)).await;
        assert!(!set.has(&"foo").await);
    }

    #[tokio::test]
    async fn insert_reports_duplicates() {
        let set = ExpiringSet::new(Duration::from_secs(60));
        assert!(set.insert([1u8; 32]).await);
        assert!(!set.insert([1u8; 32]).await);
        assert!(set.insert([2u8; 32]).await);
        assert_eq!(set.len().await, 2);
    }

    #[tokio::test]
    async fn reaper_drains_and_restarts() {
        let set = ExpiringSet::new(Duration::from_millis(10));
        set.add(1u32).await;
        set.add(2u32).await;

        sleep(Duration::from_millis(40)).await;
        assert!(set.is_empty().await);
        assert!(set.inner.read().await.reaper.is_none());

        set.add(3u32).await;
        assert!(set.has(&3).await);
        sleep(Duration::from_millis(40)).await;
        assert!(set.is_empty().await);
    }

    #[tokio::test]
    async fn readding_extends_lifetime() {
        let set = ExpiringSet::new(Duration::from_millis(30));
        set.add("bar").await;
        sleep(Duration::from_millis(20)).await;
        set.add("bar").await;
        sleep(Duration::from_millis(20)).await;
        assert!(set.has(&"bar").await);
    }

    #[tokio::test]
    async fn expired_value_can_be_inserted_again() {
        let set = ExpiringSet::new(Duration::from_millis(10));
        assert!(set.insert("baz").await);
        sleep(Duration::from_millis(30)).await;
        assert!(set.insert("baz").await);
    }

    #[tokio::test]
    async fn clear_empties_and_stops_reaper() {
        let metrics = tokio::runtime::Handle::current().metrics();
        let base = metrics.num_alive_tasks();

        let set = ExpiringSet::new(Duration::from_secs(60));
        set.add(1u32).await;
        assert_eq!(metrics.num_alive_tasks(), base + 1);

        set.clear().await;
        assert!(set.is_empty().await);
        assert!(!set.has(&1).await);

        let deadline = Instant::now() + Duration::from_secs(1);
        while metrics.num_alive_tasks() != base && Instant::now() < deadline {
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(metrics.num_alive_tasks(), base, "reaper outlived clear");

        assert!(set.insert(1u32).await);
        assert!(set.inner.read().await.reaper.is_some());
    }
}
