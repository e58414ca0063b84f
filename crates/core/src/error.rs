//! Error type shared by the selink driver stack
//!
//! All failures of the block protocol and the session façade are consolidated
//! here so that callers can distinguish "fix the input" (`InvalidArgument`)
//! from "retry the call" (`Timeout`, `Channel`) from protocol-level chip
//! misbehavior (`ShortResponse`, `Chip`) with a single match.

use crate::channel::ChannelError;

/// Error type for secure-element link operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    //
    // Caller contract violations (never retried, no I/O attempted)
    //
    /// Caller violated an argument contract
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Caller-supplied response buffer cannot hold the reassembled response
    #[error("response buffer too small: need {needed}, have {capacity}")]
    BufferTooSmall {
        /// Bytes required by the reassembled response
        needed: usize,
        /// Capacity of the caller-supplied buffer
        capacity: usize,
    },

    //
    // Transport-level faults (recovered via the retry/resynchronization
    // protocol, surfaced only once the retry budget is exhausted)
    //
    /// Computed and received error-detection codes differ
    #[error("error-detection code mismatch: computed {expected:#06x}, received {actual:#06x}")]
    ChecksumMismatch {
        /// EDC computed over the received prologue and payload
        expected: u16,
        /// EDC carried by the received block
        actual: u16,
    },

    /// Declared block length does not match the received payload size
    #[error("malformed block length: declared {declared}, received {actual}")]
    MalformedLength {
        /// Length byte carried by the block
        declared: usize,
        /// Payload bytes actually received
        actual: usize,
    },

    /// Received block carries an unexpected sequence bit
    #[error("sequence error: expected N(S)={expected}, received {actual}")]
    SequenceError {
        /// Sequence bit the link expected
        expected: u8,
        /// Sequence bit the block carried
        actual: u8,
    },

    /// No block arrived before the waiting time expired
    #[error("operation timed out")]
    Timeout,

    //
    // Protocol-level violations by the chip (surfaced, not retried)
    //
    /// Reassembled response is shorter than a status word
    #[error("response too short: {0} bytes, need at least 2")]
    ShortResponse(usize),

    /// Chip violated the block protocol
    #[error("protocol violation by chip: {0}")]
    Chip(&'static str),

    //
    // Channel failures (fatal to the exchange, session remains closable)
    //
    /// The underlying byte channel failed
    #[error(transparent)]
    Channel(#[from] ChannelError),

    //
    // General errors
    //
    /// Context error with message and source error
    #[error("{context}: {source}")]
    Context {
        /// Contextual message
        context: String,
        /// Source error
        source: Box<Self>,
    },

    /// Other error with static message
    #[error("{0}")]
    Other(&'static str),
}

impl Error {
    /// Create a new error with context information
    pub fn with_context<S: Into<String>>(self, context: S) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Create a new error with a static message
    pub const fn other(message: &'static str) -> Self {
        Self::Other(message)
    }

    /// Whether retrying the same call with the same input can possibly succeed
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch { .. }
                | Self::MalformedLength { .. }
                | Self::SequenceError { .. }
                | Self::Timeout
        )
    }
}

/// Extension trait for Result with link errors
pub trait ResultExt<T> {
    /// Add context to an error
    fn context<S: Into<String>>(self, context: S) -> Result<T, Error>;
}

impl<T> ResultExt<T> for Result<T, Error> {
    fn context<S: Into<String>>(self, context: S) -> Self {
        self.map_err(|e| e.with_context(context))
    }
}
