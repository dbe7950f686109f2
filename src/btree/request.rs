//! # Requests and Operation Context
//!
//! Engine entry points take request objects that bundle the operation's
//! parameters with an [`OpContext`]. The context carries what the original
//! design kept in fiber-local storage: the ordered lists of latched nodes,
//! the force-split hint, and the opaque transaction handle the node store
//! uses to group dirty nodes.
//!
//! Lock bookkeeping is append-on-acquire / remove-on-release; debug builds
//! assert both lists are empty when a request completes, which catches
//! leaked latches at their source site.

use std::cell::{Cell, RefCell};
use std::panic::Location;
use std::time::Instant;

use crate::btree::key::{BtreeKey, BtreeValue, KeyRange, NodeId};
use crate::btree::node::{LockType, NodePtr};

/// Leaf-level semantics of a put.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutType {
    /// Fail with `AlreadyExists` when the key is present.
    InsertOnly,
    /// Update when present, insert when absent.
    Upsert,
    /// Fail with `NotFound` when the key is absent.
    UpdateOnly,
    /// Concatenate onto the existing value, insert when absent.
    AppendIfExistsElseInsert,
}

/// Query strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    /// Horizontal leaf-chain walk; the default for range scans.
    Sweep,
    /// Recursive descent from the root; suited to small predicate queries.
    Traversal,
}

#[allow(dead_code)] // acquire time and site are read by debug diagnostics only
struct LockedNodeInfo {
    node: NodePtr,
    start_time: Instant,
    site: &'static Location<'static>,
}

/// Per-operation context: latch bookkeeping plus node-store grouping.
#[derive(Default)]
pub struct OpContext {
    rd_locked: RefCell<Vec<LockedNodeInfo>>,
    wr_locked: RefCell<Vec<LockedNodeInfo>>,
    force_split_node: Cell<Option<NodeId>>,
}

impl OpContext {
    pub fn new() -> Self {
        Self::default()
    }

    #[track_caller]
    pub(crate) fn record_lock(&self, node: &NodePtr, ltype: LockType) {
        let info = LockedNodeInfo {
            node: node.clone(),
            start_time: Instant::now(),
            site: Location::caller(),
        };
        match ltype {
            LockType::Read => self.rd_locked.borrow_mut().push(info),
            LockType::Write => self.wr_locked.borrow_mut().push(info),
            LockType::None => {}
        }
    }

    pub(crate) fn record_unlock(&self, node: &NodePtr, ltype: LockType) {
        let list = match ltype {
            LockType::Read => &self.rd_locked,
            LockType::Write => &self.wr_locked,
            LockType::None => return,
        };
        let mut list = list.borrow_mut();
        let pos = list
            .iter()
            .rposition(|info| std::ptr::eq(info.node.as_ref(), node.as_ref()));
        debug_assert!(pos.is_some(), "unlock of a node this request never latched");
        if let Some(pos) = pos {
            list.remove(pos);
        }
    }

    pub(crate) fn set_force_split(&self, id: NodeId) {
        self.force_split_node.set(Some(id));
    }

    /// Consumes the force-split hint when it names `id`.
    pub(crate) fn take_force_split(&self, id: NodeId) -> bool {
        if self.force_split_node.get() == Some(id) {
            self.force_split_node.set(None);
            return true;
        }
        false
    }

    pub(crate) fn held_locks(&self) -> (usize, usize) {
        (self.rd_locked.borrow().len(), self.wr_locked.borrow().len())
    }

    /// Asserts no latch outlived the request; debug builds only.
    pub(crate) fn assert_no_leaked_latches(&self) {
        #[cfg(debug_assertions)]
        {
            if let Some(info) = self.rd_locked.borrow().first() {
                panic!(
                    "leaked read latch on node {} acquired at {}",
                    info.node.node_id(),
                    info.site
                );
            }
            if let Some(info) = self.wr_locked.borrow().first() {
                panic!(
                    "leaked write latch on node {} acquired at {}",
                    info.node.node_id(),
                    info.site
                );
            }
        }
    }
}

/// Single-key put.
pub struct PutRequest<K, V> {
    pub key: K,
    pub value: V,
    pub put_type: PutType,
    pub ctx: OpContext,
}

impl<K: BtreeKey, V: BtreeValue> PutRequest<K, V> {
    pub fn new(key: K, value: V, put_type: PutType) -> Self {
        Self {
            key,
            value,
            put_type,
            ctx: OpContext::new(),
        }
    }
}

/// Put applied across every existing key inside a range.
pub struct RangePutRequest<K, V> {
    pub range: KeyRange<K>,
    pub value: V,
    pub ctx: OpContext,
}

impl<K: BtreeKey, V: BtreeValue> RangePutRequest<K, V> {
    pub fn new(range: KeyRange<K>, value: V) -> Self {
        Self {
            range,
            value,
            ctx: OpContext::new(),
        }
    }
}

/// Range remove.
pub struct RangeRemoveRequest<K> {
    pub range: KeyRange<K>,
    pub ctx: OpContext,
}

impl<K: BtreeKey> RangeRemoveRequest<K> {
    pub fn new(range: KeyRange<K>) -> Self {
        Self {
            range,
            ctx: OpContext::new(),
        }
    }
}

/// Batched query with cursor re-entry.
pub struct QueryRequest<K> {
    pub range: KeyRange<K>,
    pub query_type: QueryType,
    pub batch_size: u32,
    pub ctx: OpContext,
}

impl<K: BtreeKey> QueryRequest<K> {
    pub fn sweep(range: KeyRange<K>, batch_size: u32) -> Self {
        Self {
            range,
            query_type: QueryType::Sweep,
            batch_size,
            ctx: OpContext::new(),
        }
    }

    pub fn traversal(range: KeyRange<K>, batch_size: u32) -> Self {
        Self {
            range,
            query_type: QueryType::Traversal,
            batch_size,
            ctx: OpContext::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::node::{Node, NodeType};
    use std::sync::Arc;

    #[test]
    fn lock_bookkeeping_balances() {
        let node: NodePtr = Arc::new(Node::alloc(512, 1, true, NodeType::Fixed, 0));
        let ctx = OpContext::new();

        ctx.record_lock(&node, LockType::Read);
        assert_eq!(ctx.held_locks(), (1, 0));
        ctx.record_unlock(&node, LockType::Read);
        assert_eq!(ctx.held_locks(), (0, 0));
        ctx.assert_no_leaked_latches();
    }

    #[test]
    #[should_panic(expected = "leaked")]
    #[cfg(debug_assertions)]
    fn leaked_latch_panics_in_debug() {
        let node: NodePtr = Arc::new(Node::alloc(512, 1, true, NodeType::Fixed, 0));
        let ctx = OpContext::new();
        ctx.record_lock(&node, LockType::Write);
        ctx.assert_no_leaked_latches();
    }

    #[test]
    fn force_split_hint_is_consumed_once() {
        let ctx = OpContext::new();
        ctx.set_force_split(9);
        assert!(!ctx.take_force_split(5));
        assert!(ctx.take_force_split(9));
        assert!(!ctx.take_force_split(9));
    }
}
