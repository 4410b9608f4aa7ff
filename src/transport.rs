//! Rank-addressed, tagged point-to-point messaging
//!
//! Stages that talk to other ranks are written against [`Transport`]. The
//! in-process [`LocalCluster`] runs every rank inside one process, one
//! mailbox per rank, which is how the distributed sort is exercised in
//! tests and demos.

use crate::channel::{self, ChannelStats, Receiver, Sender};
use crate::error::{Error, Result};
use crate::message::{Envelope, Tag};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::Arc;

/// Point-to-point messaging between `size` ranks
pub trait Transport: Send + Sync {
    /// This endpoint's rank
    fn rank(&self) -> usize;

    /// Number of ranks
    fn size(&self) -> usize;

    /// Send `payload` to rank `dest`
    fn send(&self, dest: usize, tag: Tag, payload: &[u8]) -> Result<()>;

    /// Block until a message carrying one of `tags` arrives, from any rank.
    /// Messages with other tags are held back for later receives, in
    /// arrival order.
    fn recv(&self, tags: &[Tag]) -> Result<Envelope>;
}

struct Stash {
    held: VecDeque<Envelope>,
    pulling: bool,
}

/// One rank's endpoint in a [`LocalCluster`]
pub struct LocalEndpoint {
    rank: usize,
    peers: Vec<Sender<Envelope>>,
    inbox: Receiver<Envelope>,
    stash: Mutex<Stash>,
    arrived: Condvar,
}

impl LocalEndpoint {
    /// Statistics of this rank's mailbox
    pub fn stats(&self) -> Arc<ChannelStats> {
        self.inbox.stats()
    }

    fn take_held(held: &mut VecDeque<Envelope>, tags: &[Tag]) -> Option<Envelope> {
        let index = held.iter().position(|m| tags.contains(&m.tag))?;
        held.remove(index)
    }
}

impl Transport for LocalEndpoint {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, dest: usize, tag: Tag, payload: &[u8]) -> Result<()> {
        let peer = self.peers.get(dest).ok_or(Error::InvalidRank {
            rank: dest,
            size: self.peers.len(),
        })?;
        tracing::trace!(from = self.rank, to = dest, ?tag, len = payload.len(), "send");
        let envelope = Envelope::new(tag, payload.to_vec())
            .with_source(self.rank)
            .with_target(dest);
        peer.send(envelope, payload.len())
    }

    fn recv(&self, tags: &[Tag]) -> Result<Envelope> {
        let mut stash = self.stash.lock();
        loop {
            if let Some(msg) = Self::take_held(&mut stash.held, tags) {
                return Ok(msg);
            }
            if stash.pulling {
                // Another thread is blocked on the mailbox; it will stash
                // anything that is not for it.
                self.arrived.wait(&mut stash);
                continue;
            }

            stash.pulling = true;
            let incoming = MutexGuard::unlocked(&mut stash, || self.inbox.recv());
            stash.pulling = false;
            self.arrived.notify_all();

            let msg = incoming?;
            tracing::trace!(rank = self.rank, from = msg.source, tag = ?msg.tag, len = msg.len(), "recv");
            if tags.contains(&msg.tag) {
                return Ok(msg);
            }
            stash.held.push_back(msg);
        }
    }
}

/// `n` in-process ranks wired together by unbounded mailboxes
pub struct LocalCluster {
    endpoints: Vec<LocalEndpoint>,
}

impl LocalCluster {
    /// Create endpoints for ranks `0..n`
    pub fn new(n: usize) -> Self {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..n).map(|_| channel::mailbox()).unzip();
        let endpoints = receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| LocalEndpoint {
                rank,
                peers: senders.clone(),
                inbox,
                stash: Mutex::new(Stash {
                    held: VecDeque::new(),
                    pulling: false,
                }),
                arrived: Condvar::new(),
            })
            .collect();
        tracing::debug!(ranks = n, "created local cluster");
        Self { endpoints }
    }

    /// Number of ranks
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// True for a cluster with no ranks
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// The endpoints, ordered by rank
    pub fn into_endpoints(self) -> Vec<LocalEndpoint> {
        self.endpoints
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_rank_addressing() {
        let eps = LocalCluster::new(3).into_endpoints();
        assert_eq!(eps[2].rank(), 2);
        assert_eq!(eps[0].size(), 3);

        eps[0].send(2, Tag::Payload, b"hello").unwrap();
        let msg = eps[2].recv(&[Tag::Payload]).unwrap();
        assert_eq!(msg.source, 0);
        assert_eq!(msg.target, 2);
        assert_eq!(msg.payload, b"hello");

        assert!(matches!(
            eps[0].send(3, Tag::Payload, b""),
            Err(Error::InvalidRank { rank: 3, size: 3 })
        ));
    }

    #[test]
    fn test_unmatched_tags_are_held_in_order() {
        let eps = LocalCluster::new(2).into_endpoints();
        eps[0].send(1, Tag::RingData, b"a").unwrap();
        eps[0].send(1, Tag::Payload, b"b").unwrap();
        eps[0].send(1, Tag::RingData, b"c").unwrap();
        eps[0].send(1, Tag::ScatterDone, b"").unwrap();

        let tags = [Tag::Payload, Tag::ScatterDone];
        assert_eq!(eps[1].recv(&tags).unwrap().payload, b"b");
        assert_eq!(eps[1].recv(&tags).unwrap().tag, Tag::ScatterDone);
        assert_eq!(eps[1].recv(&[Tag::RingData]).unwrap().payload, b"a");
        assert_eq!(eps[1].recv(&[Tag::RingData]).unwrap().payload, b"c");
        assert_eq!(eps[1].stats().received(), 4);
    }

    #[test]
    fn test_concurrent_receivers_with_different_tags() {
        let eps: Vec<Arc<LocalEndpoint>> = LocalCluster::new(2)
            .into_endpoints()
            .into_iter()
            .map(Arc::new)
            .collect();

        let receivers: Vec<_> = [Tag::Payload, Tag::RingData]
            .into_iter()
            .map(|tag| {
                let ep = Arc::clone(&eps[1]);
                thread::spawn(move || {
                    (0..50)
                        .map(|_| ep.recv(&[tag]).map(|m| m.tag))
                        .collect::<Result<Vec<Tag>>>()
                })
            })
            .collect();

        for _ in 0..50 {
            eps[0].send(1, Tag::RingData, b"r").unwrap();
            eps[0].send(1, Tag::Payload, b"p").unwrap();
        }

        for (handle, tag) in receivers.into_iter().zip([Tag::Payload, Tag::RingData]) {
            let got = handle.join().unwrap().unwrap();
            assert_eq!(got.len(), 50);
            assert!(got.iter().all(|t| *t == tag));
        }
    }
}
