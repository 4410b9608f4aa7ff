//! Fixed-capacity, recyclable data buffers
//!
//! Buffers are only ever created by [`Network::fix`](crate::network::Network::fix),
//! which populates the queue of every unconnected input pin. Each buffer
//! remembers that queue as its origin so that whichever stage ends up
//! holding it can hand it back for reuse.

use crate::error::{Error, Result};
use crate::queue::WeakQueue;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Global buffer ID counter
static BUFFER_ID_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Where a buffer was allocated: the source queue of an input pin.
#[derive(Clone)]
pub(crate) struct Origin {
    pub(crate) queue: WeakQueue,
    pub(crate) pin: Arc<str>,
}

/// A fixed-capacity chunk of data with a logical used length.
pub struct Buffer {
    id: u32,
    round: u64,
    origin: Option<Origin>,
    data: Box<[u8]>,
    len: usize,
}

impl Buffer {
    /// Allocate a buffer with no origin. Such a buffer cannot be recycled
    /// through an unconnected output pin.
    pub fn new(capacity: usize) -> Self {
        Self {
            id: BUFFER_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            round: 0,
            origin: None,
            data: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    pub(crate) fn with_origin(capacity: usize, origin: Origin) -> Self {
        let mut buf = Self::new(capacity);
        buf.origin = Some(origin);
        buf
    }

    /// Process-wide unique buffer id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Round number stamped the last time this buffer passed through its
    /// source queue
    pub fn round(&self) -> u64 {
        self.round
    }

    pub(crate) fn set_round(&mut self, round: u64) {
        self.round = round;
    }

    /// Allocated size in bytes
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of bytes in use
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if no bytes are in use
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True if every allocated byte is in use
    pub fn is_full(&self) -> bool {
        self.len >= self.data.len()
    }

    /// Bytes still free at the end of the buffer
    pub fn remaining(&self) -> usize {
        self.data.len() - self.len
    }

    /// Set the used length.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds the capacity.
    pub fn set_len(&mut self, len: usize) {
        assert!(
            len <= self.data.len(),
            "buffer {} length {} exceeds capacity {}",
            self.id,
            len,
            self.data.len()
        );
        self.len = len;
    }

    /// Mark the buffer empty without touching its bytes
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// The used portion of the buffer
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// The used portion of the buffer, mutably
    pub fn filled_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }

    /// The whole allocation, regardless of the used length
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Append as much of `src` as fits, returning the number of bytes copied
    pub fn extend_from_slice(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.remaining());
        self.data[self.len..self.len + n].copy_from_slice(&src[..n]);
        self.len += n;
        n
    }

    /// Name of the pin that allocated this buffer, as `stage.pin`
    pub fn origin_pin(&self) -> Option<&str> {
        self.origin.as_ref().map(|o| o.pin.as_ref())
    }

    /// Hand the buffer back to the queue it was allocated for.
    pub fn recycle(self) -> Result<()> {
        let queue = self
            .origin
            .as_ref()
            .and_then(|o| o.queue.upgrade())
            .ok_or(Error::NoOrigin(self.id))?;
        queue.write(self)
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("round", &self.round)
            .field("origin", &self.origin_pin())
            .field("len", &self.len)
            .field("capacity", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_distinct() {
        let a = Buffer::new(8);
        let b = Buffer::new(8);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_extend_stops_at_capacity() {
        let mut buf = Buffer::new(4);
        assert_eq!(buf.extend_from_slice(&[1, 2, 3]), 3);
        assert_eq!(buf.extend_from_slice(&[4, 5, 6]), 1);
        assert!(buf.is_full());
        assert_eq!(buf.filled(), &[1, 2, 3, 4]);

        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.remaining(), 4);
    }

    #[test]
    fn test_recycle_without_origin_fails() {
        let buf = Buffer::new(4);
        let id = buf.id();
        match buf.recycle() {
            Err(Error::NoOrigin(got)) => assert_eq!(got, id),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
