//! Error types for the VMDK codec.

use std::path::PathBuf;

/// The error taxonomy for VMDK codec operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad magic, unknown incompatible flag, disallowed geometry, invalid
    /// newline detector, or a temporary-magic file presented to a reader.
    #[error("invalid VMDK format: {message}")]
    InvalidFormat { message: String },

    /// Embedded-LBA mismatch, inflate failure, inflated length shorter than
    /// the declared grain length, or an oversize compressed payload.
    #[error("corrupt VMDK data: {message}")]
    Corruption { message: String },

    /// Short read, short write, or a positional-I/O failure reported by the host.
    #[error("I/O error{}: {source}", path.as_ref().map(|p| format!(" at '{}'", p.display())).unwrap_or_default())]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    /// Read-modify-write on an already-emitted grain, or any other operation
    /// the stream-optimized writer does not support.
    #[error("unsupported operation: {message}")]
    Unsupported { message: String },

    /// Allocation failure while opening/creating/building an in-memory structure.
    #[error("out of memory: {message}")]
    OutOfMemory { message: String },
}

/// A specialized Result type for VMDK codec operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an I/O error with path context.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: Some(path.into()),
        }
    }

    /// Create an I/O error without path context.
    pub fn io_simple(source: std::io::Error) -> Self {
        Self::Io { source, path: None }
    }

    /// Create an invalid-format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Create a corruption error.
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    /// Create an unsupported-operation error.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Create an out-of-memory error.
    pub fn out_of_memory(message: impl Into<String>) -> Self {
        Self::OutOfMemory {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::io_simple(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_with_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::io(io_err, "/path/to/file.vmdk");
        let msg = err.to_string();
        assert!(msg.contains("I/O error"));
        assert!(msg.contains("/path/to/file.vmdk"));
    }

    #[test]
    fn test_io_error_without_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::io_simple(io_err);
        let msg = err.to_string();
        assert!(msg.contains("I/O error"));
        assert!(!msg.contains("at '"));
    }

    #[test]
    fn test_invalid_format_error() {
        let err = Error::invalid_format("bad magic");
        assert!(err.to_string().contains("invalid VMDK format"));
    }

    #[test]
    fn test_corruption_error() {
        let err = Error::corruption("inflate failed");
        assert!(err.to_string().contains("corrupt VMDK data"));
    }

    #[test]
    fn test_unsupported_error() {
        let err = Error::unsupported("cannot update already written grain");
        assert!(err.to_string().contains("unsupported operation"));
    }

    #[test]
    fn test_out_of_memory_error() {
        let err = Error::out_of_memory("grain directory allocation failed");
        assert!(err.to_string().contains("out of memory"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io { path: None, .. }));
    }
}
