//! Blocking FIFO connecting one producer pin to one consumer pin
//!
//! A queue has no capacity limit of its own. The number of buffers that can
//! ever reach it is fixed when the network is fixed, which is what bounds it
//! and what makes producers wait for consumers.
//!
//! ```text
//!   ACTIVE ──deactivate()──> DEACTIVATED
//!   write: enqueue            write: rejected
//!   read:  block while empty  read:  drain, then None
//! ```

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

struct State {
    buffers: VecDeque<Buffer>,
    active: bool,
}

struct Shared {
    state: Mutex<State>,
    readable: Condvar,
    /// Consumer pin's round counter; only set on true-source queues
    round: Option<Arc<AtomicU64>>,
}

/// Handle to a queue. Clones refer to the same queue.
#[derive(Clone)]
pub struct Queue {
    shared: Arc<Shared>,
}

/// Non-owning queue reference held by buffers as their origin
#[derive(Clone)]
pub(crate) struct WeakQueue(Weak<Shared>);

impl WeakQueue {
    pub(crate) fn upgrade(&self) -> Option<Queue> {
        self.0.upgrade().map(|shared| Queue { shared })
    }
}

impl Queue {
    fn with_round(round: Option<Arc<AtomicU64>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    buffers: VecDeque::new(),
                    active: true,
                }),
                readable: Condvar::new(),
                round,
            }),
        }
    }

    /// Create a queue between a producer pin and a consumer pin
    pub fn new() -> Self {
        Self::with_round(None)
    }

    /// Create a true-source queue: it has no producer pin, and every buffer
    /// written to it is stamped with the consumer's next round number.
    pub fn source(round: Arc<AtomicU64>) -> Self {
        Self::with_round(Some(round))
    }

    /// True if this queue has no producer pin
    pub fn is_source(&self) -> bool {
        self.shared.round.is_some()
    }

    /// Append a buffer and wake one reader.
    ///
    /// Fails with [`Error::QueueDeactivated`] once the queue has been
    /// deactivated; the buffer is dropped in that case.
    pub fn write(&self, mut buf: Buffer) -> Result<()> {
        let mut state = self.shared.state.lock();

        if !state.active {
            tracing::trace!(buffer = buf.id(), "write rejected by deactivated queue");
            return Err(Error::QueueDeactivated);
        }

        if let Some(round) = &self.shared.round {
            buf.set_round(round.fetch_add(1, Ordering::Relaxed));
        }
        tracing::trace!(buffer = buf.id(), round = buf.round(), "wrote buffer");

        state.buffers.push_back(buf);
        drop(state);

        self.shared.readable.notify_one();
        Ok(())
    }

    /// Blocking read.
    ///
    /// Waits while the queue is empty and active. Returns `None` once the
    /// queue is deactivated and drained.
    pub fn read(&self) -> Option<Buffer> {
        let mut state = self.shared.state.lock();

        loop {
            if let Some(buf) = state.buffers.pop_front() {
                tracing::trace!(buffer = buf.id(), round = buf.round(), "read buffer");
                return Some(buf);
            }
            if !state.active {
                return None;
            }
            self.shared.readable.wait(&mut state);
        }
    }

    /// Stop accepting writes and wake every waiting reader. Idempotent.
    pub fn deactivate(&self) {
        let mut state = self.shared.state.lock();
        if state.active {
            state.active = false;
            tracing::trace!("queue deactivated");
        }
        drop(state);

        self.shared.readable.notify_all();
    }

    /// True until [`deactivate`](Self::deactivate) is called
    pub fn is_active(&self) -> bool {
        self.shared.state.lock().active
    }

    /// Number of buffers currently enqueued
    pub fn len(&self) -> usize {
        self.shared.state.lock().buffers.len()
    }

    /// True if no buffers are enqueued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn downgrade(&self) -> WeakQueue {
        WeakQueue(Arc::downgrade(&self.shared))
    }
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fifo_order() {
        let q = Queue::new();
        let bufs: Vec<Buffer> = (0..5).map(|_| Buffer::new(16)).collect();
        let ids: Vec<u32> = bufs.iter().map(Buffer::id).collect();

        for buf in bufs {
            q.write(buf).unwrap();
        }
        assert_eq!(q.len(), 5);

        let read: Vec<u32> = (0..5).map(|_| q.read().unwrap().id()).collect();
        assert_eq!(read, ids);
        assert!(q.is_empty());
    }

    #[test]
    fn test_deactivate_drains_then_ends() {
        let q = Queue::new();
        let first = Buffer::new(8);
        let first_id = first.id();
        q.write(first).unwrap();

        q.deactivate();
        q.deactivate();
        assert!(!q.is_active());

        assert!(matches!(q.write(Buffer::new(8)), Err(Error::QueueDeactivated)));
        assert_eq!(q.len(), 1);

        assert_eq!(q.read().map(|b| b.id()), Some(first_id));
        assert!(q.read().is_none());
        assert!(q.read().is_none());
    }

    #[test]
    fn test_source_queue_stamps_rounds() {
        let round = Arc::new(AtomicU64::new(0));
        let q = Queue::source(Arc::clone(&round));
        assert!(q.is_source());

        for _ in 0..3 {
            q.write(Buffer::new(8)).unwrap();
        }
        let rounds: Vec<u64> = (0..3).map(|_| q.read().unwrap().round()).collect();
        assert_eq!(rounds, vec![0, 1, 2]);
        assert_eq!(round.load(Ordering::Relaxed), 3);

        // Connected queues leave the round alone
        let plain = Queue::new();
        let mut buf = Buffer::new(8);
        buf.set_round(7);
        plain.write(buf).unwrap();
        assert_eq!(plain.read().unwrap().round(), 7);
    }

    #[test]
    fn test_blocked_reader_wakes_on_deactivate() {
        let q = Queue::new();
        let reader = {
            let q = q.clone();
            thread::spawn(move || q.read().is_none())
        };

        thread::sleep(Duration::from_millis(50));
        q.deactivate();

        assert!(reader.join().unwrap());
    }

    #[test]
    fn test_blocked_reader_wakes_on_write() {
        let q = Queue::new();
        let reader = {
            let q = q.clone();
            thread::spawn(move || q.read().map(|b| b.len()))
        };

        thread::sleep(Duration::from_millis(50));
        let mut buf = Buffer::new(8);
        buf.set_len(5);
        q.write(buf).unwrap();

        assert_eq!(reader.join().unwrap(), Some(5));
    }
}
