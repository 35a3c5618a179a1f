#![forbid(unsafe_code)]
//! Error types for KeelStore.
//!
//! Defines `KeelError` and a `Result<T>` alias used throughout the workspace.

use thiserror::Error;

/// Unified error type for all KeelStore operations.
#[derive(Debug, Error)]
pub enum KeelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt data at device offset {offset}: {detail}")]
    Corruption { offset: u64, detail: String },

    #[error("invalid on-disk format: {0}")]
    Format(String),

    #[error("no space left in allocator")]
    SpaceFull,

    #[error("checkpoint mismatch: buffer is in cp {buf_cp}, caller holds cp {caller_cp}")]
    CpMismatch { buf_cp: u64, caller_cp: u64 },

    #[error("not found: {0}")]
    NotFound(String),
}

impl KeelError {
    /// Whether the error indicates the engine can no longer continue safely.
    ///
    /// Steady-state corruption and log-device write failures are fatal; the
    /// host is expected to abort after flushing whatever log state it can.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Corruption { .. })
    }
}

/// Result alias using `KeelError`.
pub type Result<T> = std::result::Result<T, KeelError>;
