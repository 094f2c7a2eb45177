use crate::compression::CompressionType;

pub type Result<T> = std::result::Result<T, Error>;

/// The broad category an [`Error`] falls into.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    /// Lower file I/O failed, including exhausted retries and opener shutdown.
    Io,
    /// Footer or cluster table failed validation.
    CorruptMetadata,
    /// A cluster or page index lies beyond the end of the file.
    OutOfRange,
    /// The operation is not supported, e.g. a non-sequential write.
    UnsupportedOperation,
    /// A buffer could not be allocated.
    OutOfMemory,
    /// A codec failed to compress or decompress.
    CodecFailure,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Lower file I/O failed")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("Lower file I/O at {pos:#x} still incomplete after {attempts} attempts")]
    TooManyRetries { attempts: usize, pos: u64 },

    #[error("Lower file opener is shutting down")]
    ShuttingDown,

    #[error("Corrupt metadata: {reason}")]
    CorruptMetadata { reason: String },

    #[error("Index {index} out of range (count: {count})")]
    OutOfRange { index: u64, count: u64 },

    #[error("Unsupported operation: {reason}")]
    UnsupportedOperation { reason: String },

    #[error("Could not allocate {bytes} bytes")]
    OutOfMemory { bytes: usize },

    #[error("{compression} codec failed")]
    CodecFailure {
        compression: CompressionType,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn corrupt(reason: impl Into<String>) -> Error {
        Error::CorruptMetadata {
            reason: reason.into(),
        }
    }

    pub(crate) fn unsupported(reason: impl Into<String>) -> Error {
        Error::UnsupportedOperation {
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io { .. } | Error::TooManyRetries { .. } | Error::ShuttingDown => ErrorKind::Io,
            Error::CorruptMetadata { .. } => ErrorKind::CorruptMetadata,
            Error::OutOfRange { .. } => ErrorKind::OutOfRange,
            Error::UnsupportedOperation { .. } => ErrorKind::UnsupportedOperation,
            Error::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            Error::CodecFailure { .. } => ErrorKind::CodecFailure,
        }
    }

    pub fn as_io_error_kind(&self) -> std::io::ErrorKind {
        use std::io::ErrorKind as Io;

        match self {
            Error::Io { source } => source.kind(),
            Error::TooManyRetries { .. } => Io::Interrupted,
            Error::ShuttingDown => Io::BrokenPipe,
            Error::CorruptMetadata { .. } | Error::CodecFailure { .. } => Io::InvalidData,
            Error::OutOfRange { .. } => Io::UnexpectedEof,
            Error::UnsupportedOperation { .. } => Io::Unsupported,
            Error::OutOfMemory { .. } => Io::OutOfMemory,
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io { source } => source,
            err => std::io::Error::new(err.as_io_error_kind(), err),
        }
    }
}
