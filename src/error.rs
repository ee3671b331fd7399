//! Main Crate Error

use crate::common::Id;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Errors reported by DHT operations.
///
/// Every asynchronous operation reports exactly one of these (or success) to its
/// caller. Failures of individual contacts inside an operation are absorbed and
/// only surface here when every contact failed.
pub enum DhtError {
    /// The operation deadline passed before any lookup round produced a
    /// responding contact.
    #[error("Operation timed out before converging")]
    Timeout,

    /// The router returned zero contacts to start the operation from, usually
    /// means the node has not been seeded yet.
    #[error("No route: the routing table has no contacts close to {0}")]
    NoRoute(Id),

    /// Every contact asked to store or remove a value failed to acknowledge it.
    #[error("All {0} contacts failed to acknowledge the request")]
    AllContactsFailed(usize),

    /// Encoding a key or value into its on-wire form failed.
    #[error("Encoding failure: {0}")]
    EncodeFailure(String),

    /// Persisted router state was malformed, nothing was imported.
    #[error("Corrupt imported state: {0}")]
    ImportCorrupt(String),

    /// Bytes could not be read as an [Id].
    #[error("Invalid Id size, expected 20, got {0}")]
    InvalidIdSize(usize),

    /// A string could not be parsed as an [Id].
    #[error("Invalid Id encoding: {0}")]
    InvalidIdEncoding(String),
}
