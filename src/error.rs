//! Error types.
//!
//! Integrity violations (dual-key collisions, stale heap handles) are caller
//! bugs and panic at the call site; everything here is recoverable.

use thiserror::Error;

/// Precondition failure on an [`IntervalHeap`](crate::interval_heap::IntervalHeap).
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("collection is empty")]
    EmptyCollection,
}

/// Failure talking to a remote region.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("remote returned status {0}")]
    Status(u16),

    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

/// Why an avatar handoff to a neighboring region did not complete.
#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("region {region} exposes no '{verb}' capability")]
    NoCapability { region: String, verb: String },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("handoff timed out")]
    Timeout,

    #[error("destination rejected agent: {0}")]
    Rejected(String),

    #[error("malformed handoff response: {0}")]
    Malformed(String),
}

/// Failure handling an inbound neighbor message.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown verb '{0}'")]
    UnknownVerb(String),

    #[error("rejected: {0}")]
    Rejected(String),
}

impl MessageError {
    /// HTTP-style status code reported back to the sender.
    pub fn status(&self) -> u16 {
        match self {
            MessageError::Malformed(_) => 400,
            MessageError::UnknownVerb(_) => 404,
            MessageError::Rejected(_) => 403,
        }
    }
}
