//! Fixed-capacity rolling history
//!
//! `RingBuffer` is the unsynchronized overwrite-oldest container; `RingStore`
//! wraps one behind its own lock so each (symbol, interval) pair can be read
//! and written independently of every other pair.

use parking_lot::RwLock;

use crate::error::CacheError;

/// Overwrite-oldest circular buffer.
///
/// Slots are filled left to right until `capacity` is reached, after which the
/// cursor wraps and each insert replaces the oldest entry. The slot under the
/// cursor is therefore always the oldest one once the buffer is full.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    slots: Vec<T>,
    cursor: usize,
    capacity: usize,
    total_inserts: u64,
}

impl<T: Clone> RingBuffer<T> {
    /// A zero capacity is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Vec::with_capacity(capacity),
            cursor: 0,
            capacity,
            total_inserts: 0,
        }
    }

    /// Write at the cursor and advance it, discarding the oldest item when full.
    pub fn insert(&mut self, item: T) {
        if self.slots.len() < self.capacity {
            self.slots.push(item);
        } else {
            self.slots[self.cursor] = item;
        }
        self.cursor = (self.cursor + 1) % self.capacity;
        self.total_inserts += 1;
    }

    /// Overwrite a previously written slot without moving the cursor.
    pub fn update_at(&mut self, slot: usize, item: T) -> Result<(), CacheError> {
        let len = self.slots.len();
        match self.slots.get_mut(slot) {
            Some(existing) => {
                *existing = item;
                Ok(())
            }
            None => Err(CacheError::OutOfRange { slot, len }),
        }
    }

    /// Most recently inserted item and the slot it lives in.
    pub fn last(&self) -> Result<(&T, usize), CacheError> {
        if self.slots.is_empty() {
            return Err(CacheError::Empty);
        }
        let slot = (self.cursor + self.capacity - 1) % self.capacity;
        Ok((&self.slots[slot], slot))
    }

    /// Items oldest-first, as a fresh copy.
    pub fn ascending(&self) -> Vec<T> {
        if self.slots.len() < self.capacity {
            return self.slots.clone();
        }
        let mut out = Vec::with_capacity(self.capacity);
        out.extend_from_slice(&self.slots[self.cursor..]);
        out.extend_from_slice(&self.slots[..self.cursor]);
        out
    }

    /// Items in physical slot order, as a fresh copy.
    pub fn physical(&self) -> Vec<T> {
        self.slots.clone()
    }

    /// Drop everything and insert `items` in order. `total_inserts` restarts
    /// from the rebuilt contents.
    pub fn reset<I: IntoIterator<Item = T>>(&mut self, items: I) {
        self.slots.clear();
        self.cursor = 0;
        self.total_inserts = 0;
        for item in items {
            self.insert(item);
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn total_inserts(&self) -> u64 {
        self.total_inserts
    }
}

/// Lock-guarded ring for one key.
///
/// Readers hold the lock only while copying out; compound read-modify-write
/// sequences go through [`RingStore::modify`] so they observe a consistent
/// cursor.
#[derive(Debug)]
pub struct RingStore<T> {
    inner: RwLock<RingBuffer<T>>,
}

impl<T: Clone> RingStore<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(RingBuffer::new(capacity)),
        }
    }

    pub fn insert(&self, item: T) {
        self.inner.write().insert(item);
    }

    pub fn update_at(&self, slot: usize, item: T) -> Result<(), CacheError> {
        self.inner.write().update_at(slot, item)
    }

    /// Owned copy of the most recent item with its slot.
    pub fn last(&self) -> Result<(T, usize), CacheError> {
        let ring = self.inner.read();
        ring.last().map(|(item, slot)| (item.clone(), slot))
    }

    pub fn ascending(&self) -> Vec<T> {
        self.inner.read().ascending()
    }

    pub fn physical(&self) -> Vec<T> {
        self.inner.read().physical()
    }

    /// Run `f` with exclusive access to the underlying buffer.
    pub fn modify<R>(&self, f: impl FnOnce(&mut RingBuffer<T>) -> R) -> R {
        f(&mut self.inner.write())
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.read().capacity()
    }

    pub fn total_inserts(&self) -> u64 {
        self.inner.read().total_inserts()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_wraps_cursor() {
        let mut ring = RingBuffer::new(2);

        ring.insert("1");
        assert_eq!(ring.physical(), vec!["1"]);

        ring.insert("2");
        assert_eq!(ring.physical(), vec!["1", "2"]);

        ring.insert("3");
        assert_eq!(ring.physical(), vec!["3", "2"]);
        assert_eq!(ring.ascending(), vec!["2", "3"]);

        ring.insert("4");
        assert_eq!(ring.physical(), vec!["3", "4"]);
        assert_eq!(ring.ascending(), vec!["3", "4"]);
        assert_eq!(ring.total_inserts(), 4);
    }

    #[test]
    fn test_capacity_invariant() {
        for capacity in 1..6usize {
            for extra in 0..8usize {
                let mut ring = RingBuffer::new(capacity);
                let total = capacity + extra;
                for i in 0..total {
                    ring.insert(i);
                }
                let expected: Vec<usize> = (total - capacity..total).collect();
                assert_eq!(ring.ascending(), expected, "capacity={} extra={}", capacity, extra);
                assert_eq!(ring.len(), capacity);
            }
        }
    }

    #[test]
    fn test_partial_fill_is_ascending() {
        let mut ring = RingBuffer::new(5);
        ring.insert(1);
        ring.insert(2);
        assert_eq!(ring.ascending(), vec![1, 2]);
        assert_eq!(ring.last().unwrap(), (&2, 1));
    }

    #[test]
    fn test_last_tracks_cursor() {
        let mut ring = RingBuffer::new(3);
        assert_eq!(ring.last(), Err(CacheError::Empty));

        for i in 1..=4 {
            ring.insert(i);
        }
        // 4 overwrote slot 0
        assert_eq!(ring.last().unwrap(), (&4, 0));
    }

    #[test]
    fn test_update_at() {
        let mut ring = RingBuffer::new(3);
        ring.insert(10);
        ring.insert(20);

        ring.update_at(1, 21).unwrap();
        assert_eq!(ring.ascending(), vec![10, 21]);

        assert_eq!(
            ring.update_at(2, 99),
            Err(CacheError::OutOfRange { slot: 2, len: 2 })
        );
        // Cursor untouched by updates
        ring.insert(30);
        assert_eq!(ring.ascending(), vec![10, 21, 30]);
    }

    #[test]
    fn test_reset() {
        let mut ring = RingBuffer::new(3);
        ring.insert(9);
        ring.reset(vec![1, 2, 3, 4]);
        assert_eq!(ring.ascending(), vec![2, 3, 4]);
        assert_eq!(ring.last().unwrap().0, &4);
        assert_eq!(ring.total_inserts(), 4);

        ring.insert(5);
        assert_eq!(ring.total_inserts(), 5);
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        let mut ring = RingBuffer::new(0);
        ring.insert(1);
        ring.insert(2);
        assert_eq!(ring.capacity(), 1);
        assert_eq!(ring.ascending(), vec![2]);
    }

    #[test]
    fn test_store_copy_is_detached() {
        let store = RingStore::new(2);
        store.insert(1);
        let snapshot = store.ascending();
        store.insert(2);
        store.insert(3);
        assert_eq!(snapshot, vec![1]);
        assert_eq!(store.ascending(), vec![2, 3]);
    }
}
