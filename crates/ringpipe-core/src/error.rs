//! Error types for ringpipe.
//!
//! Errors are only produced while a pipeline is being described, built or
//! torn down. The queue hot path reports "no room" and "no data" through
//! `Option`/empty results instead, and a [`RingPipeError::CapacityViolation`]
//! reaching a caller means the admission contract was broken upstream.

use thiserror::Error;

use crate::types::{EdgeId, KernelId, SegmentId};

/// Result type alias for ringpipe operations.
pub type Result<T> = std::result::Result<T, RingPipeError>;

/// Error type for ringpipe operations.
#[derive(Error, Debug)]
pub enum RingPipeError {
    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The pipeline graph is malformed.
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    /// A descriptor references a kernel that does not exist.
    #[error("unknown kernel: {0}")]
    UnknownKernel(KernelId),

    /// Aligned allocation failed.
    #[error("failed to allocate {size} bytes (alignment {align})")]
    AllocationFailed {
        /// Requested size in bytes.
        size: usize,
        /// Requested alignment in bytes.
        align: usize,
    },

    /// A firing was attempted without room or data on one of its edges.
    #[error("kernel {kernel} {direction} port {port}: requested {requested} elements, {available} available")]
    CapacityViolation {
        /// Kernel that was fired.
        kernel: KernelId,
        /// "input" or "output".
        direction: &'static str,
        /// Port index.
        port: usize,
        /// Elements the firing needed.
        requested: usize,
        /// Elements the queue could provide.
        available: usize,
    },

    /// A queue failed its cookie/size check.
    #[error("invalid queue on edge {0}")]
    InvalidQueue(EdgeId),

    /// Failed to parse a configuration document.
    #[error("configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to spawn a segment thread.
    #[error("failed to spawn thread for segment {segment}: {source}")]
    ThreadSpawn {
        /// Segment the thread was meant to drive.
        segment: SegmentId,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// A segment thread panicked.
    #[error("segment {segment} panicked: {message}")]
    SegmentPanicked {
        /// Segment whose thread panicked.
        segment: SegmentId,
        /// Panic payload, if it was a string.
        message: String,
    },
}

impl RingPipeError {
    /// Check if this error is a broken firing contract.
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, RingPipeError::CapacityViolation { .. })
    }

    /// Check if this error was caused by the pipeline description.
    pub fn is_topology_error(&self) -> bool {
        matches!(
            self,
            RingPipeError::InvalidTopology(_) | RingPipeError::UnknownKernel(_)
        )
    }
}
