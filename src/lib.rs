//! # homestore - Block-Addressed Storage Engine Core
//!
//! This crate implements the two subsystems at the heart of a
//! block-addressed storage engine: a persistent, crash-consistent B-tree
//! index and a log-store layer that multiplexes many logical log streams
//! over one physical log device.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │            Application / Volume           │
//! ├─────────────────────┬────────────────────┤
//! │    B-Tree Engine    │  Log Store Manager │
//! │  (crabbing descent, │  (per-stream seqs, │
//! │   split/merge,      │   flush batches,   │
//! │   repair, queries)  │   truncation)      │
//! ├─────────────────────┼────────────────────┤
//! │     Node Store      │      Log Device    │
//! │  (pluggable: memory,│  (pluggable: memory│
//! │   buffered, ...)    │   device, ...)     │
//! └─────────────────────┴────────────────────┘
//! ```
//!
//! Both backing layers are contracts: the B-tree persists through
//! [`btree::NodeStore`] and the log stores append through
//! [`logstore::LogDev`]. In-memory implementations of both ship with the
//! crate; device-backed implementations plug in underneath without touching
//! the engines.
//!
//! ## B-Tree
//!
//! Nodes are page-sized buffers with a packed, checksummed header and a
//! codec-managed entry area. Descents crab latches hand over hand; splits
//! and merges commit their dirty nodes as one transactional group, and a
//! torn commit is detected by link-version comparison and repaired in
//! place on the next descent.
//!
//! ## Log Stores
//!
//! A log store owns a per-stream sequence space over the shared device.
//! Append completions arrive in batches; each closed batch forms a
//! truncation barrier, and truncation is only ever applied at barriers, so
//! the device-wide safe truncation point is the minimum of every store's
//! barrier position.
//!
//! ## Module Overview
//!
//! - [`btree`]: node buffer and codecs, node store contract, the engine
//! - [`logstore`]: log device contract, sparse record map, stores, manager
//! - [`config`]: engine configuration and tuning constants

#[macro_use]
mod macros;

pub mod btree;
pub mod config;
pub mod logstore;

pub use btree::{Btree, BtreeError, KeyRange, MemNodeStore, NodeStore};
pub use config::{BtreeConfig, LogStoreConfig};
pub use logstore::{LogDev, LogDevKey, LogStore, LogStoreManager, MemLogDev};
