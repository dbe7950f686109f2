//! # B-Tree Index
//!
//! A concurrent B+tree over page-sized, checksummed nodes, designed for
//! engines that keep the index persistent through a pluggable node store.
//!
//! ## Layered Design
//!
//! - [`node`]: the node buffer itself: packed persistent header, transient
//!   latch state, binary search, range matching, edge handling.
//! - [`fixed`] / [`varlen`]: the two entry-area codecs, tagged by the
//!   header's `node_type`. Fixed-size cells for fixed-shape key/value
//!   types, a slot array with a cell heap for everything else.
//! - [`store`]: the [`NodeStore`](store::NodeStore) contract the engine
//!   persists through, and the in-memory backing used by tests and
//!   cache-resident trees.
//! - [`tree`]: the engine: latch-crabbing descents, split/merge with
//!   structural repair, range operations, sweep and traversal queries.
//!
//! ## Concurrency Model
//!
//! Every node carries its own reader/writer latch; operations crab down the
//! tree hand over hand, escalating to exclusive latches only where a
//! restructure may happen. The tree-wide latch protects root-pointer
//! publication only. Cooperative schedulers are supported by keeping all
//! blocking inside latch acquisition and node-store calls; between those
//! points computation never suspends.
//!
//! ## Keys and Values
//!
//! The engine is generic over the [`BtreeKey`](key::BtreeKey) and
//! [`BtreeValue`](key::BtreeValue) contracts; ordering always uses the
//! deserialized key's `Ord`. Interior nodes store
//! [`LinkInfo`](key::LinkInfo) values: child id plus the link version that
//! makes stale descents detectable.

pub mod error;
pub mod fixed;
pub mod key;
pub mod node;
pub mod request;
pub mod store;
pub mod tree;
pub mod varlen;

pub use error::{BtreeError, BtreeResult};
pub use key::{BtreeKey, BtreeValue, KeyRange, LinkInfo, NodeId, EMPTY_NODE_ID, LINK_INFO_SIZE};
pub use node::{LockType, Node, NodePtr, NodeType, NODE_MAGIC, NODE_VERSION};
pub use request::{
    OpContext, PutRequest, PutType, QueryRequest, QueryType, RangePutRequest, RangeRemoveRequest,
};
pub use store::{MemNodeStore, NodeStore, TransactFault};
pub use tree::Btree;
