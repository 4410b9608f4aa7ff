//! Messages exchanged between ranks

#[cfg(feature = "serialization")]
use serde::{Deserialize, Serialize};

/// Message tag; receivers can wait for specific tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub enum Tag {
    /// A run of sorted records from a scatter stage
    Payload,
    /// Zero-length: the sending scatter stage has no more data
    ScatterDone,
    /// Splitter samples sent to the coordinator
    Samples,
    /// Elected splitters sent back by the coordinator
    Splitters,
    /// Ring transfer data
    RingData,
    /// Zero-length: end of a ring transfer
    RingEnd,
}

/// A tagged, rank-addressed message
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub struct Envelope {
    /// Message tag
    pub tag: Tag,

    /// Sending rank
    pub source: usize,

    /// Receiving rank
    pub target: usize,

    /// Message bytes
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Create an envelope with the given tag and payload, addressed from
    /// and to rank 0
    pub fn new(tag: Tag, payload: Vec<u8>) -> Self {
        Self {
            tag,
            source: 0,
            target: 0,
            payload,
        }
    }

    /// Set the sending rank
    pub fn with_source(mut self, source: usize) -> Self {
        self.source = source;
        self
    }

    /// Set the receiving rank
    pub fn with_target(mut self, target: usize) -> Self {
        self.target = target;
        self
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// True for zero-length messages such as [`Tag::ScatterDone`]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_creation() {
        let envelope = Envelope::new(Tag::Payload, vec![1, 2, 3])
            .with_source(2)
            .with_target(5);

        assert_eq!(envelope.tag, Tag::Payload);
        assert_eq!(envelope.source, 2);
        assert_eq!(envelope.target, 5);
        assert_eq!(envelope.len(), 3);
        assert!(Envelope::new(Tag::ScatterDone, Vec::new()).is_empty());
    }
}
