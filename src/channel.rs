//! Mailbox channels with delivery statistics
//!
//! Thin wrappers over `flume` that count what goes through them. The local
//! transport gives every rank one unbounded mailbox; each peer holds a
//! [`Sender`] to it.

use crate::error::{Error, Result};
use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Send/receive counters, each on its own cache line
#[derive(Debug, Default)]
pub struct ChannelStats {
    messages_sent: CachePadded<AtomicU64>,
    messages_received: CachePadded<AtomicU64>,
    bytes_sent: CachePadded<AtomicU64>,
    send_errors: CachePadded<AtomicU64>,
}

impl ChannelStats {
    /// Number of messages sent
    pub fn sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    /// Number of messages received
    pub fn received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    /// Payload bytes sent, as reported by the sender
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Number of failed sends
    pub fn send_errors(&self) -> u64 {
        self.send_errors.load(Ordering::Relaxed)
    }
}

/// Sending half of a mailbox
pub struct Sender<T> {
    inner: flume::Sender<T>,
    stats: Arc<ChannelStats>,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<T> Sender<T> {
    /// Deliver a message, counting `bytes` toward the byte total
    pub fn send(&self, msg: T, bytes: usize) -> Result<()> {
        match self.inner.send(msg) {
            Ok(()) => {
                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                self.stats.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(e.into())
            }
        }
    }

    /// Shared statistics of this mailbox
    pub fn stats(&self) -> Arc<ChannelStats> {
        Arc::clone(&self.stats)
    }
}

/// Receiving half of a mailbox
pub struct Receiver<T> {
    inner: flume::Receiver<T>,
    stats: Arc<ChannelStats>,
}

impl<T> Receiver<T> {
    /// Block until a message arrives. Fails once every sender is gone.
    pub fn recv(&self) -> Result<T> {
        let msg = self.inner.recv()?;
        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
        Ok(msg)
    }

    /// Take a message if one is waiting
    pub fn try_recv(&self) -> Result<Option<T>> {
        match self.inner.try_recv() {
            Ok(msg) => {
                self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
                Ok(Some(msg))
            }
            Err(flume::TryRecvError::Empty) => Ok(None),
            Err(flume::TryRecvError::Disconnected) => {
                Err(Error::ReceiveError("mailbox disconnected".to_string()))
            }
        }
    }

    /// Number of messages waiting
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// True if no message is waiting
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Shared statistics of this mailbox
    pub fn stats(&self) -> Arc<ChannelStats> {
        Arc::clone(&self.stats)
    }
}

/// Create an unbounded mailbox
pub fn mailbox<T>() -> (Sender<T>, Receiver<T>) {
    let (tx, rx) = flume::unbounded();
    let stats = Arc::new(ChannelStats::default());
    (
        Sender {
            inner: tx,
            stats: Arc::clone(&stats),
        },
        Receiver { inner: rx, stats },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mailbox_counts_traffic() {
        let (tx, rx) = mailbox::<Vec<u8>>();
        tx.send(vec![1, 2, 3], 3).unwrap();
        tx.clone().send(vec![4], 1).unwrap();

        assert_eq!(rx.len(), 2);
        assert_eq!(rx.recv().unwrap(), vec![1, 2, 3]);
        assert_eq!(rx.try_recv().unwrap(), Some(vec![4]));
        assert_eq!(rx.try_recv().unwrap(), None);

        let stats = tx.stats();
        assert_eq!(stats.sent(), 2);
        assert_eq!(stats.received(), 2);
        assert_eq!(stats.bytes_sent(), 4);
    }

    #[test]
    fn test_disconnected_mailbox() {
        let (tx, rx) = mailbox::<u32>();
        drop(rx);
        assert!(matches!(tx.send(1, 0), Err(Error::SendError(_))));
        assert_eq!(tx.stats().send_errors(), 1);

        let (tx, rx) = mailbox::<u32>();
        drop(tx);
        assert!(matches!(rx.recv(), Err(Error::ReceiveError(_))));
        assert!(rx.try_recv().is_err());
    }
}
