//! # Bounded Overflow Relay
//!
//! A single-producer/single-consumer queue whose producer never waits.
//! When the buffer is full, pushing a new item silently drops the oldest
//! undelivered one, so a slow consumer always sees the most recent
//! `capacity` items.
//!
//! Closing the producer (explicitly or by dropping it) discards whatever is
//! still buffered: the consumer's next `recv` returns `None` even if items
//! were pending.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

struct Shared<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    capacity: usize,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        // A panic while holding the lock cannot leave the queue half-updated.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct State<T> {
    queue: VecDeque<T>,
    closed: bool,
}

/// Create a relay holding at most `capacity` undelivered items (minimum 1).
pub fn channel<T>(capacity: usize) -> (OverflowSender<T>, OverflowReceiver<T>) {
    let capacity = capacity.max(1);
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            queue: VecDeque::with_capacity(capacity),
            closed: false,
        }),
        notify: Notify::new(),
        capacity,
    });
    (
        OverflowSender { shared: shared.clone() },
        OverflowReceiver { shared },
    )
}

pub struct OverflowSender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> OverflowSender<T> {
    /// Enqueue without blocking. Returns the item that was dropped to make
    /// room, if any. Pushing into a closed relay returns the item itself.
    pub fn push(&self, item: T) -> Option<T> {
        let dropped = {
            let mut state = self.shared.lock();
            if state.closed {
                return Some(item);
            }
            let dropped = if state.queue.len() >= self.shared.capacity {
                state.queue.pop_front()
            } else {
                None
            };
            state.queue.push_back(item);
            dropped
        };
        self.shared.notify.notify_one();
        dropped
    }

    /// Close the relay and discard anything still buffered.
    pub fn close(&self) {
        {
            let mut state = self.shared.lock();
            state.closed = true;
            state.queue.clear();
        }
        self.shared.notify.notify_one();
    }
}

impl<T> Drop for OverflowSender<T> {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct OverflowReceiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> OverflowReceiver<T> {
    /// Next item, or `None` once the relay is closed.
    ///
    /// Cancel safe: an item is only removed from the queue when it is returned.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut state = self.shared.lock();
                if let Some(item) = state.queue.pop_front() {
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn try_recv(&mut self) -> Option<T> {
        let mut state = self.shared.lock();
        state.queue.pop_front()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}
