use std::fmt::{Display, Formatter};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error is the error type of every fallible operation in this crate.
#[derive(Debug, Error)]
pub enum Error {
    #[error("short buffer: need {need} bytes at offset {offset}, {available} available")]
    ShortBuffer {
        offset: usize,
        need: usize,
        available: usize,
    },

    #[error("corrupted data: {0}")]
    Corrupted(String),

    #[error("unsupported compression algorithm {tag:?}")]
    UnsupportedCodec { tag: String },

    #[error("truncated compression header: got {0} bytes, need 9")]
    TruncatedHeader(usize),

    #[error("no streamer for class {class:?} (version {version})")]
    SchemaNotFound { class: String, version: i16 },

    #[error("{0}")]
    Binding(String),

    #[error("tree {tree:?} has no branch named {name:?}")]
    LeafNotFound { tree: String, name: String },

    #[error("invalid entry range [{begin}, {end}) ({violation})")]
    Range {
        begin: i64,
        end: i64,
        violation: RangeViolation,
    },

    #[error("could not set reader option {index}: {source}")]
    ReadOption { index: usize, source: anyhow::Error },

    #[error("could not set writer option {index}: {source}")]
    WriteOption { index: usize, source: anyhow::Error },

    #[error("could not process entry {entry}: {source}")]
    Process { entry: i64, source: anyhow::Error },

    #[error("scan cancelled before entry {entry}")]
    Cancelled { entry: i64 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    AlreadyExists(String),

    #[error("key {name:?} holds an object of class {got}, expected {want}")]
    ClassMismatch {
        name: String,
        got: String,
        want: String,
    },

    #[error("{0} is closed")]
    Closed(&'static str),

    #[error("file {0:?} is not writable")]
    ReadOnly(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn corrupted(msg: impl Into<String>) -> Self {
        Error::Corrupted(msg.into())
    }

    pub(crate) fn binding(msg: impl Into<String>) -> Self {
        Error::Binding(msg.into())
    }

    /// is_short_buffer reports whether the error is a cursor underrun.
    pub fn is_short_buffer(&self) -> bool {
        matches!(self, Error::ShortBuffer { .. })
    }
}

/// RangeViolation names the bound of an entry range that failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeViolation {
    NegativeStart { start: i64 },
    StartAfterEnd { start: i64, end: i64 },
    StartBeyondEntries { start: i64, entries: i64 },
    EndBeyondEntries { end: i64, entries: i64 },
}

impl Display for RangeViolation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NegativeStart { start } => write!(f, "start={} < 0", start),
            Self::StartAfterEnd { start, end } => write!(f, "start={} > end={}", start, end),
            Self::StartBeyondEntries { start, entries } => {
                write!(f, "start={} > tree-entries={}", start, entries)
            }
            Self::EndBeyondEntries { end, entries } => {
                write!(f, "end={} > tree-entries={}", end, entries)
            }
        }
    }
}
