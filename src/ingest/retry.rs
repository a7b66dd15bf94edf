//! Retry state for failed history fetches
//!
//! Owned by one pipeline instance. The queue is bounded; a push onto a full
//! queue is refused and the caller counts it as dropped.

use crossbeam::queue::ArrayQueue;
use std::time::Duration;
use tokio::sync::Notify;

/// A (symbol, interval) whose history fetch failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryEntry {
    pub symbol: String,
    pub interval: String,
    /// Failed attempts so far (the warm-up attempt counts as one)
    pub attempts: u32,
}

impl RetryEntry {
    pub fn new(symbol: impl Into<String>, interval: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            interval: interval.into(),
            attempts: 1,
        }
    }

    /// The same entry after one more failure
    pub fn next_attempt(mut self) -> Self {
        self.attempts = self.attempts.saturating_add(1);
        self
    }
}

pub struct RetryQueue {
    entries: ArrayQueue<RetryEntry>,
    notify: Notify,
}

impl RetryQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: ArrayQueue::new(capacity.max(1)),
            notify: Notify::new(),
        }
    }

    /// Enqueue; returns false if the queue is full and the entry was dropped.
    pub fn push(&self, entry: RetryEntry) -> bool {
        match self.entries.push(entry) {
            Ok(()) => {
                self.notify.notify_one();
                true
            }
            Err(_) => false,
        }
    }

    pub fn pop(&self) -> Option<RetryEntry> {
        self.entries.pop()
    }

    /// Wait for the next entry.
    pub async fn next(&self) -> RetryEntry {
        loop {
            if let Some(entry) = self.entries.pop() {
                return entry;
            }
            // notify_one stores a permit, so a push between pop() and here
            // is not lost.
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }
}

/// Long pause after every `threshold` consecutive retry attempts.
#[derive(Debug)]
pub struct Cooldown {
    counter: u64,
    threshold: u64,
    duration: Duration,
}

impl Cooldown {
    pub fn new(threshold: u64, duration: Duration) -> Self {
        Self {
            counter: 0,
            threshold,
            duration,
        }
    }

    /// Count one attempt. Returns the pause to take before it, if the
    /// threshold was just reached. A zero threshold disables cooldowns.
    pub fn tick(&mut self) -> Option<Duration> {
        if self.threshold == 0 {
            return None;
        }
        self.counter += 1;
        if self.counter >= self.threshold {
            self.counter = 0;
            Some(self.duration)
        } else {
            None
        }
    }

    /// Forget consecutive attempts (the queue went idle).
    pub fn reset(&mut self) {
        self.counter = 0;
    }

    pub fn count(&self) -> u64 {
        self.counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_push() {
        let q = RetryQueue::new(2);
        assert!(q.push(RetryEntry::new("BTCUSDT", "1h")));
        assert!(q.push(RetryEntry::new("ETHUSDT", "1h")));
        assert!(!q.push(RetryEntry::new("SOLUSDT", "1h")));
        assert_eq!(q.len(), 2);

        assert_eq!(q.pop().unwrap().symbol, "BTCUSDT");
        assert_eq!(q.pop().unwrap().symbol, "ETHUSDT");
        assert!(q.pop().is_none());
    }

    #[tokio::test]
    async fn test_next_wakes_on_push() {
        let q = std::sync::Arc::new(RetryQueue::new(4));
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.next().await })
        };
        tokio::task::yield_now().await;

        q.push(RetryEntry::new("BTCUSDT", "5m").next_attempt());
        let entry = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.attempts, 2);
    }

    #[test]
    fn test_cooldown_trips_at_threshold() {
        let mut cd = Cooldown::new(3, Duration::from_secs(1800));
        assert_eq!(cd.tick(), None);
        assert_eq!(cd.tick(), None);
        assert_eq!(cd.tick(), Some(Duration::from_secs(1800)));
        assert_eq!(cd.count(), 0);

        cd.tick();
        cd.reset();
        assert_eq!(cd.count(), 0);
    }

    #[test]
    fn test_cooldown_disabled() {
        let mut cd = Cooldown::new(0, Duration::from_secs(1));
        for _ in 0..10 {
            assert_eq!(cd.tick(), None);
        }
    }
}
