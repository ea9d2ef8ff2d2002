//! Error types for strata.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error
//! chains. Fatal build errors carry the failing instruction or path so the
//! driver can report exactly where a build died.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for strata operations.
pub type Result<T> = std::result::Result<T, StrataError>;

/// Main error type for strata.
#[derive(Error, Debug)]
pub enum StrataError {
    // Dockerfile errors
    #[error("Dockerfile parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("Invalid Dockerfile at {path:?}: {reason}")]
    InvalidDockerfile { path: PathBuf, reason: String },

    #[error("No stage named {target} in Dockerfile")]
    TargetNotFound { target: String },

    #[error("Invalid stage reference: {reason}")]
    InvalidStageReference { reason: String },

    // Base image errors
    #[error("Base image unavailable: {reference}: {reason}")]
    BaseImageUnavailable { reference: String, reason: String },

    #[error("Unpacking base image into {root:?} failed: {reason}")]
    FilesystemUnpack { root: PathBuf, reason: String },

    // Instruction errors
    #[error("Instruction failed: {instruction}: {reason}")]
    InstructionExec { instruction: String, reason: String },

    #[error("RUN exited with code {code}: {command}")]
    RunExit { command: String, code: i32 },

    #[error("Source {path:?} not found in build context")]
    SourceNotFound { path: PathBuf },

    // Snapshot errors
    #[error("Hashing {path:?} failed: {source}")]
    Hash {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Snapshot failed: {reason}")]
    Snapshot { reason: String },

    // Registry errors
    #[error("Pushing {reference} failed: {reason}")]
    DestinationPush { reference: String, reason: String },

    #[error("Invalid image reference {reference}: {reason}")]
    InvalidReference { reference: String, reason: String },

    // Image assembly errors
    #[error("Invalid image config: {reason}")]
    InvalidConfig { reason: String },

    #[error("Image tarball at {path:?}: {reason}")]
    Tarball { path: PathBuf, reason: String },

    // File system errors
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StrataError {
    /// Attach a path to a bare io::Error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}
