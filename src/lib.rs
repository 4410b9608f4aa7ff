//! # flowgraph
//!
//! A thread-per-stage dataflow engine, and a distributed external sort
//! built on it.
//!
//! A [`Network`] is a graph of [`Stage`]s joined through their pins. Every
//! connection is a blocking FIFO [`Queue`] of [`Buffer`]s. Buffers are only
//! created when the network is fixed, as a pool per unconnected input pin,
//! and they circulate back to that pin once consumed, so a fast producer
//! waits for its consumers instead of allocating.
//!
//! ## Architecture
//!
//! ```text
//!            buf_in (pool)                       buf_out (recycles)
//!               │                                      ▲
//!               ▼                                      │
//! ┌─────────────────┐  data_out   data_in ┌─────────────────┐
//! │  read-file      │ ──────────────────> │  write-file     │
//! │  (own thread)   │       Queue         │  (own thread)   │
//! └─────────────────┘                     └─────────────────┘
//! ```
//!
//! Stages that talk to other ranks do so through a [`Transport`]; the
//! [`dsort`] module drives the three-pass sort with one network per pass.

#![warn(missing_docs, rust_2018_idioms)]

pub mod buffer;
pub mod channel;
pub mod config;
pub mod dsort;
pub mod error;
pub mod heap;
pub mod message;
pub mod network;
pub mod pin;
pub mod queue;
pub mod record;
pub mod registry;
pub mod splitter;
pub mod stage;
pub mod stages;
pub mod transport;

// Re-exports
pub use buffer::Buffer;
pub use channel::{mailbox, ChannelStats, Receiver, Sender};
pub use dsort::DsortConfig;
pub use error::{Error, Result};
pub use heap::MinHeap;
pub use message::{Envelope, Tag};
pub use network::{HaltHandle, Network, ThreadConfig};
pub use pin::{FanInPin, FanOutPin, InputPin, OutputPin, Pin, PinDecl, PinDirection};
pub use queue::Queue;
pub use registry::Registry;
pub use splitter::Splitter;
pub use stage::{Stage, StageDef, StageIo, StageLogic, StageParams, StageState, Step};
pub use transport::{LocalCluster, LocalEndpoint, Transport};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config;
    pub use crate::error::{Error, Result};
    pub use crate::network::{Network, ThreadConfig};
    pub use crate::pin::PinDecl;
    pub use crate::registry::Registry;
    pub use crate::stage::{StageDef, StageIo, StageLogic, StageParams, Step};
    pub use crate::transport::{LocalCluster, Transport};
}
