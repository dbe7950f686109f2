//! # Engine Constants
//!
//! Numeric configuration values shared across the crate. Constants that
//! depend on each other are co-located and the relationships enforced with
//! compile-time assertions where possible.

/// Default size of a B-tree node buffer in bytes, persistent header included.
pub const DEFAULT_NODE_SIZE: u32 = 4096;

/// Size of the packed persistent node header. Must match
/// `size_of::<PersistentHdr>()`; the node module asserts this in tests.
pub const NODE_HDR_SIZE: usize = 64;

/// Upper bound on the sibling window latched together during a merge.
pub const MAX_MERGE_NODES: u32 = 3;

/// Restart budget for descents that observe a structural race before the
/// operation surfaces `OperationAborted`.
pub const MAX_OP_RETRIES: u32 = 8;

/// Default number of appends per flush batch in the in-memory log device.
pub const DEFAULT_FLUSH_BATCH_SIZE: usize = 64;

/// Number of record slots per chunk in the sparse log-record map. Chunks
/// wholly below the truncation floor are dropped as a unit, so this trades
/// reclaim granularity against map overhead.
pub const LOG_RECORD_CHUNK: usize = 256;

const _: () = assert!(NODE_HDR_SIZE < DEFAULT_NODE_SIZE as usize);
const _: () = assert!(LOG_RECORD_CHUNK.is_power_of_two());
