//! # Node Store
//!
//! The B-tree engine never touches a backing device directly; it goes
//! through the [`NodeStore`] contract to allocate, read, persist, and free
//! nodes, and to commit groups of dirty nodes as one atomic unit. The
//! backing implementation is replaceable: an in-memory store for tests and
//! cache-resident trees, a buffered store journaling through a log device,
//! and so on.
//!
//! [`MemNodeStore`] is the in-memory implementation. It keeps two maps: the
//! live map of materialized nodes and a persisted-bytes map standing in for
//! the device. Writes recompute the node checksum and copy the buffer into
//! the persisted map; reloads verify magic and checksum, so the
//! persist/reload cycle is exercised for real. A fault hook can tear a
//! transactional group (persist the children, lose the parent update),
//! which is how the structural-repair paths get tested.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

use crate::btree::error::{BtreeError, BtreeResult};
use crate::btree::key::NodeId;
use crate::btree::node::{Node, NodePtr, NodeType};
use crate::btree::request::OpContext;

/// Contract between the B-tree engine and its backing storage.
pub trait NodeStore: Send + Sync {
    /// Size of the node buffers this store allocates, header included.
    fn node_size(&self) -> u32;

    fn alloc_node(&self, is_leaf: bool, node_type: NodeType, level: u16) -> BtreeResult<NodePtr>;

    fn read_node(&self, id: NodeId) -> BtreeResult<NodePtr>;

    /// Persists a single dirty node. The caller holds its write latch.
    fn write_node(&self, node: &NodePtr, ctx: &OpContext) -> BtreeResult<()>;

    /// Ensures the in-memory copy is coherent with the backing device.
    fn refresh_node(&self, node: &NodePtr, for_read_modify_write: bool, ctx: &OpContext)
        -> BtreeResult<()>;

    /// Returns the node to the allocator. The caller holds its write latch.
    fn free_node(&self, node: &NodePtr, ctx: &OpContext) -> BtreeResult<()>;

    /// Called before a structural change so the store can stage a
    /// transaction covering `parent` and `child`.
    fn prepare_node_txn(
        &self,
        parent: &NodePtr,
        child: &NodePtr,
        ctx: &OpContext,
    ) -> BtreeResult<()>;

    /// Persists `new_nodes`, `child`, and `parent` as one atomic group.
    /// All are write-latched by the caller.
    fn transact_write_nodes(
        &self,
        new_nodes: &[NodePtr],
        child: &NodePtr,
        parent: &NodePtr,
        ctx: &OpContext,
    ) -> BtreeResult<()>;

    /// Publishes a new root after growth or collapse.
    fn update_new_root_info(&self, root_id: NodeId, link_version: u64) -> BtreeResult<()>;

    /// Current root id and link version; `EMPTY_NODE_ID` before init.
    fn root_info(&self) -> (NodeId, u64);
}

/// Fault injected into the next `transact_write_nodes` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactFault {
    /// Persist the children but lose the parent's update, as if the commit
    /// tore between them. The next descent through the parent observes a
    /// stale link version and must repair.
    DropParentUpdate,
    /// Fail the whole group write with an I/O error.
    FailWrite,
}

/// In-memory [`NodeStore`] backing.
pub struct MemNodeStore {
    node_size: u32,
    next_id: AtomicU64,
    live: RwLock<HashMap<NodeId, NodePtr>>,
    persisted: RwLock<HashMap<NodeId, Box<[u8]>>>,
    root: RwLock<(NodeId, u64)>,
    fault: Mutex<Option<TransactFault>>,
    allocated: AtomicU64,
    freed: AtomicU64,
}

impl MemNodeStore {
    pub fn new(node_size: u32) -> Arc<Self> {
        Arc::new(Self {
            node_size,
            next_id: AtomicU64::new(1),
            live: RwLock::new(HashMap::new()),
            persisted: RwLock::new(HashMap::new()),
            root: RwLock::new((crate::btree::key::EMPTY_NODE_ID, 0)),
            fault: Mutex::new(None),
            allocated: AtomicU64::new(0),
            freed: AtomicU64::new(0),
        })
    }

    /// Arms a one-shot fault for the next transactional group write.
    pub fn fail_next_transact(&self, fault: TransactFault) {
        *self.fault.lock() = Some(fault);
    }

    /// Drops a node from the live map so the next read reloads and
    /// re-verifies the persisted bytes.
    pub fn evict(&self, id: NodeId) {
        self.live.write().remove(&id);
    }

    /// Flips bits in the persisted copy of a node; the next reload fails
    /// checksum verification.
    pub fn corrupt_persisted(&self, id: NodeId) {
        if let Some(bytes) = self.persisted.write().get_mut(&id) {
            let last = bytes.len() - 1;
            bytes[last] ^= 0xFF;
        }
    }

    pub fn live_nodes(&self) -> usize {
        self.live.read().len()
    }

    pub fn allocated_nodes(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn freed_nodes(&self) -> u64 {
        self.freed.load(Ordering::Relaxed)
    }

    fn persist_one(persisted: &mut HashMap<NodeId, Box<[u8]>>, node: &NodePtr) {
        node.set_checksum();
        persisted.insert(node.node_id(), node.raw_bytes().to_vec().into_boxed_slice());
    }
}

impl NodeStore for MemNodeStore {
    fn node_size(&self) -> u32 {
        self.node_size
    }

    fn alloc_node(&self, is_leaf: bool, node_type: NodeType, level: u16) -> BtreeResult<NodePtr> {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let node: NodePtr = Arc::new(Node::alloc(self.node_size, id, is_leaf, node_type, level));
        self.live.write().insert(id, node.clone());
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Ok(node)
    }

    fn read_node(&self, id: NodeId) -> BtreeResult<NodePtr> {
        if let Some(node) = self.live.read().get(&id) {
            return Ok(node.clone());
        }

        let bytes = {
            let persisted = self.persisted.read();
            match persisted.get(&id) {
                Some(bytes) => bytes.clone(),
                None => return Err(BtreeError::NotFound),
            }
        };

        let node = Node::load(bytes)?;
        if !node.verify_node() {
            return Err(BtreeError::CrcMismatch { node_id: id });
        }
        let node: NodePtr = Arc::new(node);

        let mut live = self.live.write();
        // Another reader may have materialized it meanwhile; keep theirs.
        Ok(live.entry(id).or_insert(node).clone())
    }

    fn write_node(&self, node: &NodePtr, _ctx: &OpContext) -> BtreeResult<()> {
        Self::persist_one(&mut self.persisted.write(), node);
        Ok(())
    }

    fn refresh_node(
        &self,
        _node: &NodePtr,
        _for_read_modify_write: bool,
        _ctx: &OpContext,
    ) -> BtreeResult<()> {
        // The live map is authoritative for this backing; nothing to do.
        Ok(())
    }

    fn free_node(&self, node: &NodePtr, _ctx: &OpContext) -> BtreeResult<()> {
        node.set_valid_node(false);
        let id = node.node_id();
        self.live.write().remove(&id);
        self.persisted.write().remove(&id);
        self.freed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn prepare_node_txn(
        &self,
        _parent: &NodePtr,
        _child: &NodePtr,
        _ctx: &OpContext,
    ) -> BtreeResult<()> {
        Ok(())
    }

    fn transact_write_nodes(
        &self,
        new_nodes: &[NodePtr],
        child: &NodePtr,
        parent: &NodePtr,
        _ctx: &OpContext,
    ) -> BtreeResult<()> {
        let fault = self.fault.lock().take();
        let mut persisted = self.persisted.write();

        match fault {
            Some(TransactFault::FailWrite) => {
                return Err(BtreeError::Io("injected transact failure".to_string()));
            }
            Some(TransactFault::DropParentUpdate) => {
                for node in new_nodes {
                    Self::persist_one(&mut persisted, node);
                }
                Self::persist_one(&mut persisted, child);
                // The parent's update is lost: rewind its live buffer to the
                // last persisted state so the tear is observable in memory
                // too, exactly as a reload after a crash would observe it.
                if let Some(bytes) = persisted.get(&parent.node_id()) {
                    parent.overwrite_from(bytes);
                }
                tracing::warn!(
                    parent = parent.node_id(),
                    child = child.node_id(),
                    "transact fault: parent update dropped"
                );
                return Ok(());
            }
            None => {}
        }

        for node in new_nodes {
            Self::persist_one(&mut persisted, node);
        }
        Self::persist_one(&mut persisted, child);
        Self::persist_one(&mut persisted, parent);
        Ok(())
    }

    fn update_new_root_info(&self, root_id: NodeId, link_version: u64) -> BtreeResult<()> {
        *self.root.write() = (root_id, link_version);
        Ok(())
    }

    fn root_info(&self) -> (NodeId, u64) {
        *self.root.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::node::LockType;

    fn store() -> Arc<MemNodeStore> {
        MemNodeStore::new(512)
    }

    #[test]
    fn alloc_assigns_unique_ids() {
        let store = store();
        let a = store.alloc_node(true, NodeType::Fixed, 0).unwrap();
        let b = store.alloc_node(true, NodeType::Fixed, 0).unwrap();
        assert_ne!(a.node_id(), b.node_id());
        assert_eq!(store.allocated_nodes(), 2);
    }

    #[test]
    fn read_of_unknown_node_is_not_found() {
        let store = store();
        assert_eq!(store.read_node(99).unwrap_err(), BtreeError::NotFound);
    }

    #[test]
    fn write_then_evict_then_read_reloads_from_persisted() {
        let store = store();
        let ctx = OpContext::new();
        let node = store.alloc_node(true, NodeType::Fixed, 0).unwrap();
        node.init_entry_area::<u64, u64>();
        node.lock(LockType::Write);
        node.insert(&5u64, &50u64).unwrap();
        store.write_node(&node, &ctx).unwrap();
        node.unlock(LockType::Write);

        let id = node.node_id();
        store.evict(id);
        drop(node);

        let reloaded = store.read_node(id).unwrap();
        assert_eq!(reloaded.total_entries(), 1);
        assert_eq!(reloaded.value_at::<u64>(0), 50);
        assert!(reloaded.verify_node());
    }

    #[test]
    fn corrupted_persisted_bytes_fail_checksum() {
        let store = store();
        let ctx = OpContext::new();
        let node = store.alloc_node(true, NodeType::Fixed, 0).unwrap();
        node.init_entry_area::<u64, u64>();
        node.lock(LockType::Write);
        node.insert(&5u64, &50u64).unwrap();
        store.write_node(&node, &ctx).unwrap();
        node.unlock(LockType::Write);

        let id = node.node_id();
        store.corrupt_persisted(id);
        store.evict(id);
        drop(node);

        assert_eq!(
            store.read_node(id).unwrap_err(),
            BtreeError::CrcMismatch { node_id: id }
        );
    }

    #[test]
    fn free_removes_both_copies() {
        let store = store();
        let ctx = OpContext::new();
        let node = store.alloc_node(true, NodeType::Fixed, 0).unwrap();
        let id = node.node_id();

        node.lock(LockType::Write);
        store.write_node(&node, &ctx).unwrap();
        store.free_node(&node, &ctx).unwrap();
        node.unlock(LockType::Write);

        assert!(!node.is_valid_node());
        assert_eq!(store.read_node(id).unwrap_err(), BtreeError::NotFound);
        assert_eq!(store.freed_nodes(), 1);
    }

    #[test]
    fn transact_fail_write_surfaces_io() {
        let store = store();
        let ctx = OpContext::new();
        let parent = store.alloc_node(false, NodeType::Fixed, 1).unwrap();
        let child = store.alloc_node(true, NodeType::Fixed, 0).unwrap();

        store.fail_next_transact(TransactFault::FailWrite);
        let err = store
            .transact_write_nodes(&[], &child, &parent, &ctx)
            .unwrap_err();
        assert!(matches!(err, BtreeError::Io(_)));

        // One-shot: the next transact goes through.
        parent.lock(LockType::Write);
        child.lock(LockType::Write);
        store
            .transact_write_nodes(&[], &child, &parent, &ctx)
            .unwrap();
        parent.unlock(LockType::Write);
        child.unlock(LockType::Write);
    }

    #[test]
    fn root_info_round_trip() {
        let store = store();
        assert_eq!(store.root_info().0, crate::btree::key::EMPTY_NODE_ID);
        store.update_new_root_info(12, 4).unwrap();
        assert_eq!(store.root_info(), (12, 4));
    }
}
