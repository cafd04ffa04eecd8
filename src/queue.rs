//! Bounded receiver-to-assembler queue with drop-oldest overflow.
//!
//! The receive path must never stall on a slow assembler, so instead of
//! blocking the producer this queue displaces its oldest entry when full
//! and hands it back to the caller for accounting. Shutdown is signalled
//! in-band: a sentinel pushed behind the remaining entries lets the
//! consumer drain everything queued before it stops.
//!
//! Single producer, single consumer. The producer side is synchronous and
//! lock-only (safe inside the receive loop); only `pop` awaits.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

enum Entry<T> {
    Item(T),
    Sentinel,
}

/// Bounded FIFO that drops its oldest entry instead of blocking.
pub struct DropOldestQueue<T> {
    inner: Mutex<VecDeque<Entry<T>>>,
    notify: Notify,
    capacity: usize,
}

impl<T> DropOldestQueue<T> {
    /// Create a queue holding at most `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero; configuration validates this earlier.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Push an item, displacing the oldest queued item when full.
    ///
    /// Returns the displaced item, if any, so the caller can count and log
    /// the drop.
    pub fn push(&self, item: T) -> Option<T> {
        let displaced;
        {
            let mut queue = self.inner.lock();
            displaced = if self.item_count(&queue) >= self.capacity {
                match queue.pop_front() {
                    Some(Entry::Item(old)) => Some(old),
                    // Sentinel at the front means shutdown already started;
                    // keep it first.
                    Some(Entry::Sentinel) => {
                        queue.push_front(Entry::Sentinel);
                        None
                    }
                    None => None,
                }
            } else {
                None
            };
            queue.push_back(Entry::Item(item));
        }
        self.notify.notify_one();
        displaced
    }

    /// Push the shutdown sentinel behind all queued items.
    ///
    /// The consumer drains everything already queued, then sees the
    /// sentinel and stops.
    pub fn push_sentinel(&self) {
        self.inner.lock().push_back(Entry::Sentinel);
        self.notify.notify_one();
    }

    /// Pop the next item, waiting for one if the queue is empty.
    ///
    /// Returns `None` once the sentinel is reached.
    pub async fn pop(&self) -> Option<T> {
        loop {
            // Register for notification before checking, so a push between
            // the check and the await is not lost.
            let notified = self.notify.notified();
            {
                let mut queue = self.inner.lock();
                match queue.pop_front() {
                    Some(Entry::Item(item)) => return Some(item),
                    Some(Entry::Sentinel) => {
                        // Stay terminal for any further pop.
                        queue.push_front(Entry::Sentinel);
                        return None;
                    }
                    None => {}
                }
            }
            notified.await;
        }
    }

    /// Number of queued items (sentinel excluded).
    pub fn len(&self) -> usize {
        self.item_count(&self.inner.lock())
    }

    /// Check if no items are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn item_count(&self, queue: &VecDeque<Entry<T>>) -> usize {
        queue
            .iter()
            .filter(|e| matches!(e, Entry::Item(_)))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = DropOldestQueue::new(8);
        queue.push(1);
        queue.push(2);
        queue.push(3);

        assert_eq!(queue.pop().await, Some(1));
        assert_eq!(queue.pop().await, Some(2));
        assert_eq!(queue.pop().await, Some(3));
    }

    #[test]
    fn test_drop_oldest_on_overflow() {
        let queue = DropOldestQueue::new(2);
        assert_eq!(queue.push(1), None);
        assert_eq!(queue.push(2), None);

        // Full: pushing 3 displaces 1.
        assert_eq!(queue.push(3), Some(1));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_overflow_keeps_newest() {
        let queue = DropOldestQueue::new(2);
        queue.push(1);
        queue.push(2);
        queue.push(3);

        assert_eq!(queue.pop().await, Some(2));
        assert_eq!(queue.pop().await, Some(3));
    }

    #[tokio::test]
    async fn test_sentinel_terminates_after_drain() {
        let queue = DropOldestQueue::new(8);
        queue.push(1);
        queue.push_sentinel();

        assert_eq!(queue.pop().await, Some(1));
        assert_eq!(queue.pop().await, None);
        // Terminal: further pops keep returning None.
        assert_eq!(queue.pop().await, None);
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(DropOldestQueue::new(8));

        let consumer = queue.clone();
        let handle = tokio::spawn(async move { consumer.pop().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(42u32);

        assert_eq!(handle.await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn test_pop_wakes_on_sentinel() {
        let queue = Arc::new(DropOldestQueue::<u32>::new(8));

        let consumer = queue.clone();
        let handle = tokio::spawn(async move { consumer.pop().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push_sentinel();

        assert_eq!(handle.await.unwrap(), None);
    }

    #[test]
    fn test_len_and_is_empty() {
        let queue = DropOldestQueue::new(4);
        assert!(queue.is_empty());

        queue.push(1);
        queue.push(2);
        assert_eq!(queue.len(), 2);

        queue.push_sentinel();
        // Sentinel is not an item.
        assert_eq!(queue.len(), 2);
    }

    #[test]
    #[should_panic(expected = "capacity must be positive")]
    fn test_zero_capacity_panics() {
        let _ = DropOldestQueue::<u32>::new(0);
    }
}
