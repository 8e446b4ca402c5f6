#![forbid(unsafe_code)]
//! Error types for NorFS.
//!
//! Defines `NorfsError` and a `Result<T>` alias used throughout the
//! workspace. Parse-level failures (`norfs_types::ParseError`) are folded
//! into `Corrupt` at the mount boundary.

use norfs_types::ParseError;
use thiserror::Error;

/// Unified error type for all NorFS operations.
#[derive(Debug, Error)]
pub enum NorfsError {
    #[error("no space left on device")]
    NoSpace,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("corrupt filesystem: {0}")]
    Corrupt(String),

    #[error("flash I/O failure: {0}")]
    Io(String),

    #[error("bad argument: {0}")]
    BadArgument(String),

    #[error("filesystem not mounted")]
    NotMounted,

    #[error("filesystem already mounted")]
    AlreadyMounted,
}

impl From<ParseError> for NorfsError {
    fn from(err: ParseError) -> Self {
        Self::Corrupt(err.to_string())
    }
}

/// Result alias using `NorfsError`.
pub type Result<T> = std::result::Result<T, NorfsError>;
