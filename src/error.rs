use std::fmt;

use thiserror::Error;

use crate::codec::CodecError;

/// The step of a copy operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyPhase {
    /// Reading the CSV stream handed to `copy_from`.
    ReadInput,
    /// The backend rejected or failed the bulk load.
    ExecuteLoad,
    /// The backend rejected or failed the source query.
    ExecuteQuery,
    /// Writing CSV to the sink handed to `copy_to`.
    WriteOutput,
}

impl CopyPhase {
    /// True for failures of the byte stream itself rather than the backend.
    pub fn is_stream_side(self) -> bool {
        matches!(self, CopyPhase::ReadInput | CopyPhase::WriteOutput)
    }
}

impl fmt::Display for CopyPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            CopyPhase::ReadInput => "read input",
            CopyPhase::ExecuteLoad => "execute load",
            CopyPhase::ExecuteQuery => "execute query",
            CopyPhase::WriteOutput => "write output",
        };
        f.write_str(phase)
    }
}

/// Error type for copysql operations
#[derive(Debug, Error)]
pub enum CopySqlError {
    #[error("Configuration error for {backend}: {message}")]
    Configuration { backend: String, message: String },

    #[error("Connection to {backend} failed: {message}")]
    Connection { backend: String, message: String },

    #[error("Unknown backend: {0}")]
    UnknownBackend(String),

    #[error("Backend already registered: {0}")]
    DuplicateBackend(String),

    #[error("{backend}: {phase}: {message}")]
    Copy {
        backend: String,
        phase: CopyPhase,
        message: String,
    },

    #[error("{backend}: cannot scan row {row}: {message}")]
    Scan {
        backend: String,
        row: u64,
        message: String,
    },

    #[error("{backend}: close failed: {message}")]
    Close { backend: String, message: String },
}

impl CopySqlError {
    pub fn configuration(backend: impl Into<String>, message: impl fmt::Display) -> Self {
        CopySqlError::Configuration {
            backend: backend.into(),
            message: message.to_string(),
        }
    }

    pub fn connection(backend: impl Into<String>, message: impl fmt::Display) -> Self {
        CopySqlError::Connection {
            backend: backend.into(),
            message: message.to_string(),
        }
    }

    pub fn copy(backend: impl Into<String>, phase: CopyPhase, message: impl fmt::Display) -> Self {
        CopySqlError::Copy {
            backend: backend.into(),
            phase,
            message: message.to_string(),
        }
    }

    pub fn scan(backend: impl Into<String>, row: u64, message: impl fmt::Display) -> Self {
        CopySqlError::Scan {
            backend: backend.into(),
            row,
            message: message.to_string(),
        }
    }

    pub fn close(backend: impl Into<String>, message: impl fmt::Display) -> Self {
        CopySqlError::Close {
            backend: backend.into(),
            message: message.to_string(),
        }
    }

    /// Wraps an encoder failure raised while a driver writes its result rows.
    pub fn from_sink(backend: impl Into<String>, err: CodecError) -> Self {
        match err {
            CodecError::ColumnCount {
                row,
                expected,
                actual,
            } => CopySqlError::scan(
                backend,
                row,
                format!("got {} column(s), expected {}", actual, expected),
            ),
            other => CopySqlError::copy(backend, CopyPhase::WriteOutput, other),
        }
    }

    /// The backend named in this error, if any.
    pub fn backend(&self) -> Option<&str> {
        match self {
            CopySqlError::Configuration { backend, .. }
            | CopySqlError::Connection { backend, .. }
            | CopySqlError::Copy { backend, .. }
            | CopySqlError::Scan { backend, .. }
            | CopySqlError::Close { backend, .. } => Some(backend),
            CopySqlError::UnknownBackend(name) | CopySqlError::DuplicateBackend(name) => Some(name),
        }
    }
}

/// Result type alias for copysql operations
pub type Result<T> = std::result::Result<T, CopySqlError>;
