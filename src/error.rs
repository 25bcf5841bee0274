//! Error types for repstore.

use std::fmt;

/// Errors reported by the store and its transport layer.
///
/// The variants fall into two families. Configuration and usage errors
/// (`InvalidConfiguration`, `BlockTooLarge`, `NotPopulated`, `NotImplemented`)
/// are raised synchronously at the offending call and leave the store
/// untouched. Distributed errors (`PeerFailed`, `CommunicatorRevoked`,
/// `UnrecoverableDataLoss`) are raised by collectives; a failure during
/// submission additionally resets the store to its unpopulated state.
#[derive(Debug)]
pub enum Error {
    /// A constructor or submission argument is invalid.
    InvalidConfiguration(String),
    /// A serialized block exceeded the constant per-block byte length.
    BlockTooLarge { len: usize, max: usize },
    /// The operation requires submitted blocks, but none are stored.
    NotPopulated,
    /// The requested feature is declared but not implemented.
    NotImplemented(&'static str),
    /// A received byte frame does not decode to whole records.
    MalformedFrame,
    /// One or more peers died during a collective operation.
    PeerFailed,
    /// The communicator was revoked after a failure detected elsewhere.
    /// Install a repaired communicator before communicating again.
    CommunicatorRevoked,
    /// Every replica of a requested block range is dead.
    UnrecoverableDataLoss,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidConfiguration(msg) => write!(f, "Invalid configuration: {}", msg),
            Error::BlockTooLarge { len, max } => {
                write!(f, "Serialized block is {} bytes, limit is {} bytes", len, max)
            }
            Error::NotPopulated => write!(f, "No blocks have been submitted to this store"),
            Error::NotImplemented(what) => write!(f, "Not implemented: {}", what),
            Error::MalformedFrame => write!(f, "Received frame does not decode to whole records"),
            Error::PeerFailed => write!(f, "A rank in the communicator failed"),
            Error::CommunicatorRevoked => write!(
                f,
                "The communicator has been revoked; install a repaired communicator first"
            ),
            Error::UnrecoverableDataLoss => {
                write!(f, "Every replica of a requested block range is dead")
            }
        }
    }
}

impl std::error::Error for Error {}

/// Result type for repstore operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_stable() {
        assert_eq!(
            Error::PeerFailed.to_string(),
            "A rank in the communicator failed"
        );
        assert_eq!(
            Error::BlockTooLarge { len: 9, max: 4 }.to_string(),
            "Serialized block is 9 bytes, limit is 4 bytes"
        );
    }
}
