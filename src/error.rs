//! Error types for the SCTP glue layer.
//!
//! Only recoverable conditions are represented here: resource exhaustion and
//! policy rejections bubble up as [`GlueError`] values to the direct caller.
//! Caller-contract violations (negative use-counts, acquiring a detached
//! handle, a sentinel-length walk running past the end of a chain) are never
//! errors: they panic with diagnostic state, because continuing past them
//! risks silent corruption. Malformed input from the host stack is absorbed
//! at the point of detection with a log line and never surfaces at all.

use thiserror::Error;

use crate::descriptor::SlotId;
use crate::handle::AssocId;

/// Glue layer error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GlueError {
    /// The caller-supplied descriptor does not refer to a live handle.
    #[error("descriptor {0} does not refer to a live handle")]
    BadHandle(SlotId),

    /// The access policy rejected the operation.
    #[error("permission denied")]
    PermissionDenied,

    /// The association is not eligible for extraction from this handle.
    #[error("association {0} cannot be extracted from this handle")]
    NotExtractable(AssocId),

    /// No free descriptor slot. The sub-connection stays queued for a
    /// future attempt.
    #[error("descriptor table full")]
    ResourceExhausted,

    /// No buffer segment available under a non-blocking allocation.
    #[error("out of buffer segments")]
    NoBufs,

    /// The protocol engine failed the operation with its own error code.
    #[error("protocol engine error {0}")]
    Engine(i32),

    /// Socket-level I/O failure (tunnel setup paths only).
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for GlueError {
    fn from(e: std::io::Error) -> Self {
        GlueError::Io(e.to_string())
    }
}

/// Result type alias for glue operations.
pub type Result<T> = std::result::Result<T, GlueError>;
