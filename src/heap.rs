//! Fixed-capacity binary min-heap keyed by `i64`
//!
//! Used by the merge stage to pick the stream with the smallest leading
//! key. Entries with equal keys come out in no particular order.

use crate::error::{Error, Result};

/// Binary min-heap of `(key, payload)` pairs with a fixed capacity
#[derive(Debug, Clone)]
pub struct MinHeap<T> {
    entries: Vec<(i64, T)>,
    capacity: usize,
}

impl<T> MinHeap<T> {
    /// Create an empty heap holding at most `capacity` entries
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Maximum number of entries
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the heap holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert an entry, failing with [`Error::HeapFull`] at capacity
    pub fn insert(&mut self, key: i64, payload: T) -> Result<()> {
        if self.entries.len() == self.capacity {
            return Err(Error::HeapFull(self.capacity));
        }
        self.entries.push((key, payload));

        let mut i = self.entries.len() - 1;
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.entries[parent].0 <= self.entries[i].0 {
                break;
            }
            self.entries.swap(parent, i);
            i = parent;
        }
        Ok(())
    }

    /// Remove and return the entry with the smallest key
    pub fn pop(&mut self) -> Option<(i64, T)> {
        if self.entries.is_empty() {
            return None;
        }
        let top = self.entries.swap_remove(0);

        let len = self.entries.len();
        let mut i = 0;
        loop {
            let (left, right) = (2 * i + 1, 2 * i + 2);
            let mut smallest = i;
            if left < len && self.entries[left].0 < self.entries[smallest].0 {
                smallest = left;
            }
            if right < len && self.entries[right].0 < self.entries[smallest].0 {
                smallest = right;
            }
            if smallest == i {
                break;
            }
            self.entries.swap(i, smallest);
            i = smallest;
        }
        Some(top)
    }

    /// Smallest key and its payload, without removing it
    pub fn peek(&self) -> Option<(i64, &T)> {
        self.entries.first().map(|(k, v)| (*k, v))
    }

    /// True if every parent key is at most both of its children's keys
    pub fn is_valid(&self) -> bool {
        (1..self.entries.len()).all(|i| self.entries[(i - 1) / 2].0 <= self.entries[i].0)
    }
}
