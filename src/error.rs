//! Error types for the dataflow engine and the distributed sort

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for flowgraph operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building, fixing or running a network
#[derive(Debug, Error)]
pub enum Error {
    /// No stage definition registered under this type name
    #[error("definition for stage type \"{0}\" not found")]
    UnknownStageType(String),

    /// A stage definition with this type name is already registered
    #[error("stage type \"{0}\" is already registered")]
    DuplicateStageType(String),

    /// No stage with this name in the network
    #[error("stage {0} not found")]
    StageNotFound(String),

    /// A stage with this name already exists in the network
    #[error("stage name {0} is already in use")]
    DuplicateStage(String),

    /// A parameter alias with this name already exists in the network
    #[error("parameter alias {0} is already in use")]
    DuplicateAlias(String),

    /// The stage has no pin with this name
    #[error("pin {stage}.{pin} does not exist")]
    PinNotFound {
        /// Stage name
        stage: String,
        /// Pin name
        pin: String,
    },

    /// The pin exists but has the wrong direction for the requested use
    #[error("{stage}.{pin} is not {expected}")]
    PinDirection {
        /// Stage name
        stage: String,
        /// Pin name
        pin: String,
        /// What the caller needed, e.g. "an output pin"
        expected: &'static str,
    },

    /// A single pin was connected twice
    #[error("{stage}.{pin} is already connected")]
    AlreadyConnected {
        /// Stage name
        stage: String,
        /// Pin name
        pin: String,
    },

    /// The stage type does not recognize this parameter
    #[error("stage {stage} has no parameter {param}")]
    UnknownParam {
        /// Stage name
        stage: String,
        /// Parameter name
        param: String,
    },

    /// A required parameter was never set
    #[error("parameter {param} of stage {stage} is not set")]
    MissingParam {
        /// Stage name
        stage: String,
        /// Parameter name
        param: String,
    },

    /// A parameter value could not be interpreted
    #[error("invalid value {value:?} for {stage}.{param}")]
    InvalidParam {
        /// Stage name
        stage: String,
        /// Parameter name
        param: String,
        /// Offending value
        value: String,
    },

    /// A stage's init hook failed; the whole fix is aborted
    #[error("{stage}> stage initialization failed: {source}")]
    InitFailed {
        /// Stage name
        stage: String,
        /// Underlying cause
        #[source]
        source: Box<Error>,
    },

    /// A stage's step function failed while running
    #[error("{stage}> stage failed: {source}")]
    StageFailed {
        /// Stage name
        stage: String,
        /// Underlying cause
        #[source]
        source: Box<Error>,
    },

    /// The operating system refused to start a stage thread
    #[error("failed to spawn thread for stage {stage}: {source}")]
    Spawn {
        /// Stage name
        stage: String,
        /// Underlying cause
        #[source]
        source: std::io::Error,
    },

    /// A stage thread panicked
    #[error("stage thread panicked: {0}")]
    StagePanicked(String),

    /// The network must be fixed before it can run
    #[error("network {0} has not been fixed")]
    NotFixed(String),

    /// The network was already fixed (or already ran)
    #[error("network {0} is already fixed")]
    AlreadyFixed(String),

    /// The network already ran; networks run once
    #[error("network {0} has already run")]
    AlreadyRan(String),

    /// Write to a queue that has been deactivated
    #[error("queue is deactivated")]
    QueueDeactivated,

    /// A buffer was recycled but its origin queue no longer exists
    #[error("buffer {0} has no origin queue to return to")]
    NoOrigin(u32),

    /// A pipeline description line could not be applied
    #[error("line {line}: {message}")]
    Config {
        /// 1-based line number
        line: usize,
        /// What went wrong
        message: String,
    },

    /// Transport send failure
    #[error("send error: {0}")]
    SendError(String),

    /// Transport receive failure
    #[error("receive error: {0}")]
    ReceiveError(String),

    /// Rank outside of `0..size`
    #[error("rank {rank} out of range for {size} ranks")]
    InvalidRank {
        /// Requested rank
        rank: usize,
        /// Number of ranks
        size: usize,
    },

    /// Insert into a priority queue that is at capacity
    #[error("priority queue is full (capacity {0})")]
    HeapFull(usize),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Sort verification found a record out of order
    #[error("{}: record {index} out of order (key {key} after {prev})", .path.display())]
    Unsorted {
        /// File containing the offending record
        path: PathBuf,
        /// Record index within that file
        index: u64,
        /// Previous key
        prev: i64,
        /// Offending key
        key: i64,
    },

    /// I/O failure on a named file
    #[error("{}: {source}", .path.display())]
    File {
        /// File that failed
        path: PathBuf,
        /// Underlying cause
        #[source]
        source: std::io::Error,
    },

    /// Other I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Attach a path to an I/O error
    pub fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::File {
            path: path.into(),
            source,
        }
    }

    /// Wrap a cause as a config error at the given line
    pub(crate) fn at_line(line: usize, cause: impl std::fmt::Display) -> Self {
        Error::Config {
            line,
            message: cause.to_string(),
        }
    }
}

impl<T> From<flume::SendError<T>> for Error {
    fn from(err: flume::SendError<T>) -> Self {
        Error::SendError(err.to_string())
    }
}

impl From<flume::RecvError> for Error {
    fn from(err: flume::RecvError) -> Self {
        Error::ReceiveError(err.to_string())
    }
}
