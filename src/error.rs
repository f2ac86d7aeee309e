//! Error types surfaced by the AMAR codec.
//!
//! Four kinds of failure, mapped onto one enum so that callers get a
//! single `Result` type regardless of whether the failure originated in
//! the sink/source, a resource limit, a caller precondition, or the
//! bytes on the wire.

use std::io;

use thiserror::Error;

/// Errors produced by reading or writing an AMAR archive.
#[derive(Debug, Error)]
pub enum AmarError {
    /// A read or write against the underlying sink/source failed, either
    /// with a short result or an OS error.
    #[error("I/O error at archive position {position}: {source}")]
    Io {
        source: io::Error,
        position: u64,
    },

    /// A resource limit was hit: filename too long, or no more file IDs.
    #[error("out of space: {reason}")]
    OutOfSpace { reason: &'static str },

    /// A caller precondition was violated.
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: &'static str },

    /// The byte stream is malformed.
    #[error("invalid archive at position {position}: {reason}")]
    InvalidArchive { reason: String, position: u64 },
}

impl AmarError {
    pub(crate) fn io(source: io::Error, position: u64) -> Self {
        AmarError::Io { source, position }
    }

    pub(crate) fn out_of_space(reason: &'static str) -> Self {
        AmarError::OutOfSpace { reason }
    }

    pub(crate) fn invalid_argument(reason: &'static str) -> Self {
        AmarError::InvalidArgument { reason }
    }

    pub(crate) fn invalid_archive(reason: impl Into<String>, position: u64) -> Self {
        AmarError::InvalidArchive {
            reason: reason.into(),
            position,
        }
    }

    /// `true` if this is an I/O error, as opposed to a logical/protocol error.
    pub fn is_io(&self) -> bool {
        matches!(self, AmarError::Io { .. })
    }
}

pub type Result<T> = std::result::Result<T, AmarError>;
