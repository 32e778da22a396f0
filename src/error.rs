//! Error types for the sstable codec

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for codec operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for sstable codec operations
#[derive(Error, Debug)]
pub enum Error {
    /// Structural violation in an sstable component: oversized or empty TOC,
    /// unrecognized component name, EOF in the middle of a record, and the
    /// like. Fatal to the current operation.
    #[error("malformed sstable: {0}")]
    MalformedSstable(String),

    /// A TOC or declared component file is absent on load. OS-level
    /// not-found errors are rewritten into this kind at the call site.
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// A read delivered fewer bytes than requested. Almost always rewritten
    /// as [`Error::MalformedSstable`] by the caller; `read_indexes` inspects
    /// it to distinguish clean EOF from mid-entry truncation.
    #[error("buffer improperly sized to hold requested data: got {got}, expected {expected}")]
    BufferSizeMismatch {
        /// Number of bytes actually delivered
        got: usize,
        /// Number of bytes requested
        expected: usize,
    },

    /// A size field did not survive narrowing to its on-disk width.
    #[error("integer overflow narrowing {0}")]
    Overflow(&'static str),

    /// I/O errors propagated unchanged from the runtime.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a malformed-sstable error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedSstable(msg.into())
    }

    /// Create a file-not-found error
    pub fn file_not_found(path: impl Into<PathBuf>) -> Self {
        Self::FileNotFound(path.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::malformed("Empty TOC");
        assert_eq!(err.to_string(), "malformed sstable: Empty TOC");

        let err = Error::BufferSizeMismatch { got: 3, expected: 8 };
        assert!(err.to_string().contains("got 3, expected 8"));
    }

    #[test]
    fn test_file_not_found_keeps_path() {
        let err = Error::file_not_found("/tmp/la-1-big-Filter.db");
        match err {
            Error::FileNotFound(path) => {
                assert!(path.to_string_lossy().ends_with("Filter.db"));
            }
            other => panic!("unexpected error kind: {other:?}"),
        }
    }
}
