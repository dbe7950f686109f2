//! # Log Store Layer
//!
//! Many independent logical log streams multiplexed over a single physical
//! log device, with per-stream sequence spaces, flush-batch truncation
//! barriers, and bounded in-memory record tracking.
//!
//! ## Layered Design
//!
//! - [`logdev`]: the [`LogDev`](logdev::LogDev) device contract and
//!   [`MemLogDev`](logdev::MemLogDev), an in-memory device with real
//!   batching and recovery-replay behavior.
//! - [`records`]: the sparse, chunked seq_num → record map each store
//!   tracks its stream with.
//! - [`store`]: [`LogStore`](store::LogStore), one logical stream:
//!   appends, sync reads, completion handling, barriers, truncation.
//! - [`manager`]: [`LogStoreManager`](manager::LogStoreManager), the
//!   id→store map, callback routing, and the device-wide truncation point.
//!
//! ## Data Flow
//!
//! ```text
//! append_async ──► LogDev ──► flush batch ──► completion callback
//!                                                  │
//!                      record update ◄─────────────┘
//!                      barrier maintenance (batch close)
//!                                                  │
//! truncate(seq) ──► nearest barrier ──► safe_truncate_ld_key
//!                                                  │
//! device_truncate ──► min over stores ──► LogDev.truncate
//! ```

pub mod logdev;
pub mod manager;
pub mod records;
pub mod store;

pub use logdev::{
    AppendCb, AppendCompletionCb, Cookie, LogDev, LogDevKey, LogFoundCb, LogReq, LogStoreId,
    LogStoreSeqNum, MemLogDev, StoreFoundCb,
};
pub use manager::{LogStoreManager, LogStoreOpenedCb};
pub use records::{LogRecord, LogRecords, RecordState};
pub use store::{LogCompletionCb, LogFoundEntryCb, LogStore, TruncationBarrier};
