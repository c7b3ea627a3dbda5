//! Error taxonomy for the ring protocol.
//!
//! Every variant is terminal: nothing in the crate retries or recovers from a
//! `RingError`. The rank that detects one aborts the group and exits with a
//! failure status.

use thiserror::Error;

/// Fatal conditions raised by the group transports and the round-trip engine
#[derive(Debug, Error)]
pub enum RingError {
    /// A size probe reported a different length than the phase expects
    #[error("Message sizes differ on rank {rank}: {probed} <-> {expected}")]
    SizeMismatch {
        rank: usize,
        probed: usize,
        expected: usize,
    },

    /// The group barrier did not complete
    #[error("Barrier was not successful on rank {rank}: {reason}")]
    BarrierFailed { rank: usize, reason: String },

    /// The returned envelope does not carry the values the originator sent
    #[error(
        "Envelope corrupted on rank {rank} at index {index}: found {found}, expected {expected}"
    )]
    EnvelopeCorrupted {
        rank: usize,
        index: usize,
        found: i32,
        expected: i32,
    },

    /// An incoming message does not fit the posted receive buffer
    #[error("Message from rank {source_rank} truncated on rank {rank}: {incoming} > {capacity}")]
    Truncated {
        rank: usize,
        source_rank: usize,
        incoming: usize,
        capacity: usize,
    },

    /// Another rank terminated the run
    #[error("Run aborted by rank {by}: {reason}")]
    Aborted { by: usize, reason: String },

    /// The link to a peer went away
    #[error("Rank {rank} lost its connection to the group")]
    Disconnected { rank: usize },

    /// A rank index outside the group was addressed
    #[error("Rank {peer} is outside a group of size {size}")]
    InvalidRank { peer: usize, size: usize },

    /// Collective payload could not be encoded or decoded
    #[error("Collective payload codec failure: {0}")]
    Codec(#[from] bincode::Error),

    /// Socket level failure in the TCP transport
    #[error("Transport I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

impl RingError {
    /// Whether this error originated on another rank
    pub fn is_remote(&self) -> bool {
        matches!(self, RingError::Aborted { .. })
    }
}

/// Result alias used by the group transports and the engine
pub type RingResult<T> = std::result::Result<T, RingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_mismatch_message_names_rank_and_lengths() {
        let err = RingError::SizeMismatch {
            rank: 2,
            probed: 16,
            expected: 20,
        };
        assert_eq!(err.to_string(), "Message sizes differ on rank 2: 16 <-> 20");
        assert!(!err.is_remote());
    }

    #[test]
    fn test_aborted_is_remote() {
        let err = RingError::Aborted {
            by: 3,
            reason: "boom".to_string(),
        };
        assert!(err.is_remote());
        assert!(err.to_string().contains("rank 3"));
    }
}
