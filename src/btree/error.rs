//! # B-Tree Status Codes
//!
//! Every engine operation reports its outcome through [`BtreeError`]. Most
//! variants are terminal for the request; `Retry` and `StaleBuf` are
//! recovered internally by restarting the descent up to the configured
//! budget, and only surface as `OperationAborted` once the budget is spent.

use crate::btree::key::NodeId;

/// Status codes surfaced by the B-tree engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BtreeError {
    /// Key not present (get/remove/update-only put).
    NotFound,
    /// Insert-only put found the key already present.
    AlreadyExists,
    /// The target node cannot fit the entry; forces a split at that level.
    SpaceNotAvail,
    /// A structural race was observed; the descent must restart.
    Retry,
    /// A node failed checksum verification on read.
    CrcMismatch { node_id: NodeId },
    /// The node was freed while a reference was outstanding.
    NodeFreed,
    /// The operation's fast path does not apply to this key/value shape.
    FastPathNotPossible,
    /// The backing store is out of space.
    ResourceFull,
    /// The in-memory copy of a node is stale and could not be refreshed.
    StaleBuf,
    /// The operation exhausted its restart budget or was cancelled.
    OperationAborted,
    /// A latch could not be acquired.
    LockNotAcquired,
    /// An I/O error from the node store, surfaced verbatim.
    Io(String),
}

impl BtreeError {
    /// True for statuses that are recovered by restarting the descent.
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, BtreeError::Retry | BtreeError::StaleBuf)
    }
}

impl std::fmt::Display for BtreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BtreeError::NotFound => write!(f, "key not found"),
            BtreeError::AlreadyExists => write!(f, "key already exists"),
            BtreeError::SpaceNotAvail => write!(f, "no space available in node"),
            BtreeError::Retry => write!(f, "structural race, restart descent"),
            BtreeError::CrcMismatch { node_id } => {
                write!(f, "checksum mismatch on node {}", node_id)
            }
            BtreeError::NodeFreed => write!(f, "node was freed"),
            BtreeError::FastPathNotPossible => write!(f, "fast path not possible"),
            BtreeError::ResourceFull => write!(f, "backing store full"),
            BtreeError::StaleBuf => write!(f, "stale node buffer"),
            BtreeError::OperationAborted => write!(f, "operation aborted"),
            BtreeError::LockNotAcquired => write!(f, "latch not acquired"),
            BtreeError::Io(msg) => write!(f, "io error: {}", msg),
        }
    }
}

impl std::error::Error for BtreeError {}

pub type BtreeResult<T> = Result<T, BtreeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_statuses() {
        assert!(BtreeError::Retry.is_transient());
        assert!(BtreeError::StaleBuf.is_transient());
        assert!(!BtreeError::NotFound.is_transient());
        assert!(!BtreeError::OperationAborted.is_transient());
    }

    #[test]
    fn display_includes_node_id() {
        let err = BtreeError::CrcMismatch { node_id: 42 };
        assert!(err.to_string().contains("42"));
    }

    #[test]
    fn composes_with_eyre() {
        fn fails() -> eyre::Result<()> {
            Err(BtreeError::NotFound)?;
            Ok(())
        }
        assert!(fails().unwrap_err().to_string().contains("not found"));
    }
}
