//! # B-Tree Engine
//!
//! The ordered index at the heart of the engine: a B+tree over latched,
//! shared nodes, descended with hand-over-hand latch crabbing so that
//! concurrent operations only serialize where they actually collide.
//!
//! ## Crabbing Protocol
//!
//! Mutations descend from the root under READ latches, taking the child's
//! latch before releasing the parent's. When the child may restructure
//! (split for puts, merge for removes), the descent escalates: the parent is
//! upgraded to WRITE first, then the child. Upgrades release the shared
//! latch before acquiring the exclusive one, so after an upgrade the parent
//! generation is re-checked; if it moved, the chosen slot can no longer be
//! trusted and the descent restarts. Reads descend under READ only.
//!
//! ## Staleness and Repair
//!
//! Every interior slot stores the child's link version. A descent that finds
//! `child.link_version > slot.link_version` is looking at a parent that
//! missed a structural update (a torn transactional write). Repair walks the
//! live sibling chain from the stale child and rewrites the parent's slots
//! from what the children actually are: separators are re-derived, link
//! versions refreshed, slots of freed children dropped. No entry data moves.
//!
//! ## Split and Merge
//!
//! A split moves the upper half of a node (by bytes) into a fresh right
//! sibling, fixes the sibling chain, and republishes the parent slot: the
//! slot that covered the child keeps its key but points at the new sibling,
//! and a new slot with the child's new last key is inserted before it. All
//! three nodes go to the store as one transactional group.
//!
//! A merge latches a bounded window of adjacent siblings and compacts
//! entries leftward; drained nodes are freed, the chain is rewired, and the
//! parent's slots for the window are rebuilt. Interior slot keys are always
//! the maximum key of the child's subtree, and an interior node's edge
//! covers everything greater than its last separator.
//!
//! ## Restart Budget
//!
//! `Retry` and `StaleBuf` restart the descent; past `cfg.max_retries`
//! restarts the operation surfaces `OperationAborted`. The force-split hint
//! carries "this leaf rejected my entry" across a restart so the next
//! descent splits it preemptively.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use smallvec::SmallVec;
use tracing::{debug, info, trace};

use crate::btree::error::{BtreeError, BtreeResult};
use crate::btree::key::{
    BtreeKey, BtreeValue, KeyRange, LinkInfo, EMPTY_NODE_ID, LINK_INFO_SIZE,
};
use crate::btree::node::{LockType, NodePtr, NodeType};
use crate::btree::request::{
    OpContext, PutRequest, PutType, QueryRequest, QueryType, RangePutRequest, RangeRemoveRequest,
};
use crate::btree::store::NodeStore;
use crate::config::BtreeConfig;

/// A latch-crabbing B+tree over a pluggable node store.
pub struct Btree<K, V, S> {
    store: Arc<S>,
    cfg: BtreeConfig,
    /// Tree-shared latch; protects root-pointer publication only.
    root: RwLock<LinkInfo>,
    destroyed: AtomicBool,
    total_nodes: AtomicU64,
    _kv: PhantomData<fn(K, V)>,
}

/// What a mutation descent does once it reaches its leaf.
enum MutateAction<'a, K: BtreeKey, V: BtreeValue> {
    Put {
        key: &'a K,
        value: &'a V,
        put_type: PutType,
    },
    RangePut {
        range: &'a mut KeyRange<K>,
        value: &'a V,
        updated: &'a mut u64,
        more: &'a mut bool,
    },
    Remove {
        key: &'a K,
        out: &'a mut Option<(K, V)>,
    },
    RemoveAny {
        range: &'a KeyRange<K>,
        out: &'a mut Option<(K, V)>,
    },
    RemoveRange {
        range: &'a mut KeyRange<K>,
        removed: &'a mut u64,
        more: &'a mut bool,
    },
}

impl<K: BtreeKey, V: BtreeValue> MutateAction<'_, K, V> {
    fn target(&self) -> K {
        match self {
            MutateAction::Put { key, .. } | MutateAction::Remove { key, .. } => (*key).clone(),
            MutateAction::RangePut { range, .. } => range.start.clone(),
            MutateAction::RemoveAny { range, .. } => range.start.clone(),
            MutateAction::RemoveRange { range, .. } => range.start.clone(),
        }
    }

    fn needs_split_check(&self) -> bool {
        matches!(self, MutateAction::Put { .. } | MutateAction::RangePut { .. })
    }

    fn needs_merge_check(&self) -> bool {
        matches!(
            self,
            MutateAction::Remove { .. }
                | MutateAction::RemoveAny { .. }
                | MutateAction::RemoveRange { .. }
        )
    }

    /// Serialized sizes of the entry this action may add to a leaf.
    fn entry_sizes(&self) -> (usize, usize) {
        match self {
            MutateAction::Put { key, value, .. } => {
                (key.serialized_size(), value.serialized_size())
            }
            MutateAction::RangePut { range, value, .. } => {
                (range.start.serialized_size(), value.serialized_size())
            }
            MutateAction::Remove { key, .. } => (key.serialized_size(), 0),
            MutateAction::RemoveAny { range, .. } => (range.start.serialized_size(), 0),
            MutateAction::RemoveRange { range, .. } => (range.start.serialized_size(), 0),
        }
    }

    fn put_type(&self) -> PutType {
        match self {
            MutateAction::Put { put_type, .. } => *put_type,
            MutateAction::RangePut { .. } => PutType::UpdateOnly,
            _ => PutType::UpdateOnly,
        }
    }
}

impl<K: BtreeKey, V: BtreeValue, S: NodeStore> Btree<K, V, S> {
    /// Opens the tree over `store`, creating the root on first use.
    pub fn new(store: Arc<S>, cfg: BtreeConfig) -> BtreeResult<Self> {
        debug_assert_eq!(cfg.node_size, store.node_size());
        let tree = Self {
            store,
            cfg,
            root: RwLock::new(LinkInfo::empty()),
            destroyed: AtomicBool::new(false),
            total_nodes: AtomicU64::new(0),
            _kv: PhantomData,
        };

        let (root_id, root_version) = tree.store.root_info();
        if root_id == EMPTY_NODE_ID {
            tree.create_root_node()?;
        } else {
            *tree.root.write() = LinkInfo::new(root_id, root_version);
        }
        Ok(tree)
    }

    pub fn config(&self) -> &BtreeConfig {
        &self.cfg
    }

    pub fn root_info(&self) -> LinkInfo {
        *self.root.read()
    }

    /// Live nodes in the tree, root included.
    pub fn node_count(&self) -> u64 {
        self.total_nodes.load(Ordering::Acquire)
    }

    /// Extent coalescing hint consulted by range puts.
    pub fn can_extents_auto_merge(&self) -> bool {
        true
    }

    fn create_root_node(&self) -> BtreeResult<()> {
        let ctx = OpContext::new();
        let root = self.alloc_leaf_node()?;
        self.lock_node(&root, LockType::Write, &ctx);
        let res = self.store.write_node(&root, &ctx);
        self.unlock_node(&root, LockType::Write, &ctx);
        res?;
        self.store
            .update_new_root_info(root.node_id(), root.link_version())?;
        *self.root.write() = root.link_info();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    pub fn put(&self, req: &mut PutRequest<K, V>) -> BtreeResult<()> {
        self.check_alive()?;
        let mut action = MutateAction::Put {
            key: &req.key,
            value: &req.value,
            put_type: req.put_type,
        };
        let res = self.run_mutation(&mut action, &req.ctx);
        req.ctx.assert_no_leaked_latches();
        res
    }

    /// Single-key upsert convenience.
    pub fn upsert(&self, key: K, value: V) -> BtreeResult<()> {
        self.put(&mut PutRequest::new(key, value, PutType::Upsert))
    }

    pub fn get(&self, key: &K) -> BtreeResult<V> {
        self.check_alive()?;
        let ctx = OpContext::new();
        let res = self.with_retries(|| {
            let guard = self.root.read();
            let root_info = *guard;
            let (root, rlock) =
                self.read_and_lock_node(root_info.node_id, LockType::Read, LockType::Read, &ctx)?;
            debug_assert_eq!(rlock, LockType::Read);
            self.do_get(&root, key, &ctx)
        });
        ctx.assert_no_leaked_latches();
        res
    }

    /// Removes `key`, returning its value.
    pub fn remove(&self, key: &K) -> BtreeResult<V> {
        self.check_alive()?;
        let ctx = OpContext::new();
        let mut out = None;
        let res = {
            let mut action = MutateAction::Remove { key, out: &mut out };
            self.run_mutation(&mut action, &ctx)
        };
        ctx.assert_no_leaked_latches();
        res?;
        self.check_collapse_root(&ctx)?;
        let (_, v) = out.ok_or(BtreeError::NotFound)?;
        Ok(v)
    }

    /// Removes the first entry matching `range` in binary-search order.
    /// Which match is removed is a weak contract; callers needing a
    /// specific entry should remove by key.
    pub fn remove_any(&self, range: &KeyRange<K>) -> BtreeResult<(K, V)> {
        self.check_alive()?;
        let ctx = OpContext::new();
        let mut out = None;
        let res = {
            let mut action = MutateAction::RemoveAny {
                range,
                out: &mut out,
            };
            self.run_mutation(&mut action, &ctx)
        };
        ctx.assert_no_leaked_latches();
        res?;
        self.check_collapse_root(&ctx)?;
        out.ok_or(BtreeError::NotFound)
    }

    /// Removes every entry inside the range; returns the count removed.
    pub fn range_remove(&self, req: &mut RangeRemoveRequest<K>) -> BtreeResult<u64> {
        self.check_alive()?;
        let mut removed = 0u64;
        let mut range = req.range.clone();
        loop {
            let mut more = false;
            {
                let mut action = MutateAction::RemoveRange {
                    range: &mut range,
                    removed: &mut removed,
                    more: &mut more,
                };
                self.run_mutation(&mut action, &req.ctx)?;
            }
            req.ctx.assert_no_leaked_latches();
            if !more {
                break;
            }
        }
        self.check_collapse_root(&req.ctx)?;
        Ok(removed)
    }

    /// Applies `req.value` to every existing key inside the range; returns
    /// the count updated. Inserting across a range is not defined for
    /// opaque keys; use single-key puts for that.
    pub fn range_put(&self, req: &mut RangePutRequest<K, V>) -> BtreeResult<u64> {
        self.check_alive()?;
        let mut updated = 0u64;
        let mut range = req.range.clone();
        loop {
            let mut more = false;
            {
                let mut action = MutateAction::RangePut {
                    range: &mut range,
                    value: &req.value,
                    updated: &mut updated,
                    more: &mut more,
                };
                self.run_mutation(&mut action, &req.ctx)?;
            }
            req.ctx.assert_no_leaked_latches();
            if !more {
                break;
            }
        }
        Ok(updated)
    }

    /// Runs one batch of the query; returns whether more results remain.
    /// The request's range doubles as the cursor: re-invoke with the same
    /// request to continue.
    pub fn query(&self, req: &mut QueryRequest<K>, out: &mut Vec<(K, V)>) -> BtreeResult<bool> {
        self.check_alive()?;
        let res = match req.query_type {
            QueryType::Sweep => self.with_retries(|| self.do_sweep_query(req, out)),
            QueryType::Traversal => self.with_retries(|| self.do_traversal_query(req, out)),
        };
        req.ctx.assert_no_leaked_latches();
        res
    }

    /// Every current entry, ascending. Convenience over a sweep query.
    pub fn get_all_kvs(&self, range: KeyRange<K>) -> BtreeResult<Vec<(K, V)>> {
        let mut out = Vec::new();
        let mut req = QueryRequest::sweep(range, u32::MAX);
        self.query(&mut req, &mut out)?;
        Ok(out)
    }

    /// Frees every node via post-order traversal; returns the count freed.
    /// Idempotent: a second call observes the destroyed flag and frees 0.
    pub fn destroy(&self) -> BtreeResult<u64> {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return Ok(0);
        }
        let ctx = OpContext::new();
        let mut guard = self.root.write();
        let root_info = *guard;
        let mut freed = 0u64;
        self.do_destroy(root_info.node_id, &ctx, &mut freed)?;
        *guard = LinkInfo::empty();
        self.store.update_new_root_info(EMPTY_NODE_ID, 0)?;
        self.total_nodes.store(0, Ordering::Release);
        ctx.assert_no_leaked_latches();
        info!(freed, "btree destroyed");
        Ok(freed)
    }

    fn check_alive(&self) -> BtreeResult<()> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(BtreeError::OperationAborted);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Node management
    // ------------------------------------------------------------------

    fn leaf_node_type() -> NodeType {
        if K::FIXED_SIZE.is_some() && V::FIXED_SIZE.is_some() {
            NodeType::Fixed
        } else {
            NodeType::VarLen
        }
    }

    fn interior_node_type() -> NodeType {
        if K::FIXED_SIZE.is_some() {
            NodeType::Fixed
        } else {
            NodeType::VarLen
        }
    }

    fn alloc_leaf_node(&self) -> BtreeResult<NodePtr> {
        let node = self.store.alloc_node(true, Self::leaf_node_type(), 0)?;
        node.init_entry_area::<K, V>();
        self.total_nodes.fetch_add(1, Ordering::AcqRel);
        Ok(node)
    }

    fn alloc_interior_node(&self, level: u16) -> BtreeResult<NodePtr> {
        let node = self
            .store
            .alloc_node(false, Self::interior_node_type(), level)?;
        node.init_entry_area::<K, LinkInfo>();
        self.total_nodes.fetch_add(1, Ordering::AcqRel);
        Ok(node)
    }

    fn free_node(&self, node: &NodePtr, ctx: &OpContext) -> BtreeResult<()> {
        self.store.free_node(node, ctx)?;
        self.total_nodes.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    #[track_caller]
    fn lock_node(&self, node: &NodePtr, ltype: LockType, ctx: &OpContext) {
        node.lock(ltype);
        ctx.record_lock(node, ltype);
    }

    fn unlock_node(&self, node: &NodePtr, ltype: LockType, ctx: &OpContext) {
        ctx.record_unlock(node, ltype);
        node.unlock(ltype);
    }

    /// Reads and latches a node: `int_lock` for interiors, `leaf_lock` for
    /// leaves. A node freed underneath us surfaces as `Retry`.
    #[track_caller]
    fn read_and_lock_node(
        &self,
        id: u64,
        int_lock: LockType,
        leaf_lock: LockType,
        ctx: &OpContext,
    ) -> BtreeResult<(NodePtr, LockType)> {
        let node = self.store.read_node(id)?;
        let ltype = if node.is_leaf() { leaf_lock } else { int_lock };
        self.lock_node(&node, ltype, ctx);
        if let Err(e) = self
            .store
            .refresh_node(&node, ltype == LockType::Write, ctx)
        {
            self.unlock_node(&node, ltype, ctx);
            return Err(e);
        }
        if !node.is_valid_node() {
            self.unlock_node(&node, ltype, ctx);
            return Err(BtreeError::Retry);
        }
        Ok((node, ltype))
    }

    /// Per-slot overhead of an interior entry beyond key + link bytes.
    fn parent_slot_overhead(parent: &NodePtr) -> usize {
        match parent.node_type() {
            NodeType::Fixed => 0,
            NodeType::VarLen => crate::btree::varlen::VAR_SLOT_SIZE,
        }
    }

    fn child_info_at(&self, parent: &NodePtr, idx: u32) -> LinkInfo {
        if idx == parent.total_entries() {
            parent.edge_info()
        } else {
            parent.value_at::<LinkInfo>(idx)
        }
    }

    fn is_repair_needed(&self, child: &NodePtr, child_info: &LinkInfo) -> bool {
        child.link_version() > child_info.link_version
    }

    /// Releases and re-acquires latches so that both parent and child are
    /// held in WRITE. The parent generation is re-checked after the upgrade;
    /// movement means the chosen slot is stale and the caller must restart.
    fn upgrade_node_locks(
        &self,
        parent: &NodePtr,
        child: &NodePtr,
        parent_lock: &mut LockType,
        child_lock: &mut LockType,
        ctx: &OpContext,
    ) -> BtreeResult<()> {
        if *parent_lock == LockType::Read {
            let pgen = parent.node_gen();
            // The child is released first so the parent upgrade cannot wait
            // on a descent that is itself waiting on this child.
            self.unlock_node(child, *child_lock, ctx);
            ctx.record_unlock(parent, LockType::Read);
            parent.lock_upgrade();
            ctx.record_lock(parent, LockType::Write);
            *parent_lock = LockType::Write;
            self.lock_node(child, LockType::Write, ctx);
            *child_lock = LockType::Write;
            if !parent.is_valid_node() || !child.is_valid_node() || parent.node_gen() != pgen {
                self.unlock_node(child, LockType::Write, ctx);
                return Err(BtreeError::Retry);
            }
        } else if *child_lock == LockType::Read {
            ctx.record_unlock(child, LockType::Read);
            child.lock_upgrade();
            ctx.record_lock(child, LockType::Write);
            *child_lock = LockType::Write;
            if !child.is_valid_node() {
                self.unlock_node(child, LockType::Write, ctx);
                return Err(BtreeError::Retry);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Retry harness
    // ------------------------------------------------------------------

    fn with_retries<T>(&self, mut f: impl FnMut() -> BtreeResult<T>) -> BtreeResult<T> {
        let mut attempts = 0u32;
        loop {
            match f() {
                Err(ref e) if e.is_transient() => {
                    attempts += 1;
                    if attempts >= self.cfg.max_retries {
                        return Err(BtreeError::OperationAborted);
                    }
                    trace!(attempts, "descent restarted on structural race");
                }
                other => return other,
            }
        }
    }

    fn run_mutation(&self, action: &mut MutateAction<'_, K, V>, ctx: &OpContext) -> BtreeResult<()> {
        let mut attempts = 0u32;
        loop {
            match self.try_mutate(action, ctx) {
                Err(ref e) if e.is_transient() => {
                    attempts += 1;
                    if attempts >= self.cfg.max_retries {
                        return Err(BtreeError::OperationAborted);
                    }
                    trace!(attempts, "mutation restarted on structural race");
                }
                other => return other,
            }
        }
    }

    fn try_mutate(&self, action: &mut MutateAction<'_, K, V>, ctx: &OpContext) -> BtreeResult<()> {
        let guard = self.root.read();
        let root_info = *guard;
        let (root, rlock) =
            self.read_and_lock_node(root_info.node_id, LockType::Read, LockType::Write, ctx)?;

        if action.needs_split_check() && self.needs_split(&root, action, ctx) {
            self.unlock_node(&root, rlock, ctx);
            drop(guard);
            self.check_split_root(action, ctx)?;
            return Err(BtreeError::Retry);
        }

        self.do_mutate(&root, rlock, action, ctx)
    }

    // ------------------------------------------------------------------
    // Mutation descent
    // ------------------------------------------------------------------

    fn needs_split(
        &self,
        node: &NodePtr,
        action: &MutateAction<'_, K, V>,
        ctx: &OpContext,
    ) -> bool {
        if ctx.take_force_split(node.node_id()) {
            return true;
        }
        self.node_overfull_for(node, action)
    }

    fn node_overfull_for(&self, node: &NodePtr, action: &MutateAction<'_, K, V>) -> bool {
        let (ksize, vsize) = action.entry_sizes();
        if node.is_leaf() {
            !node.has_room_for_put(action.put_type(), ksize, vsize)
        } else {
            !node.has_room_for(ksize, LINK_INFO_SIZE)
        }
    }

    fn do_mutate(
        &self,
        node: &NodePtr,
        curlock: LockType,
        action: &mut MutateAction<'_, K, V>,
        ctx: &OpContext,
    ) -> BtreeResult<()> {
        if node.is_leaf() {
            debug_assert_eq!(curlock, LockType::Write);
            let ret = self.mutate_leaf(node, action, ctx);
            self.unlock_node(node, LockType::Write, ctx);
            return ret;
        }

        let mut curlock = curlock;
        let mut tried_merge = false;
        loop {
            let target = action.target();
            let (_, idx) = node.find(&target);
            let child_info = self.child_info_at(node, idx);

            let (child, mut child_lock) = match self.read_and_lock_node(
                child_info.node_id,
                LockType::Read,
                LockType::Write,
                ctx,
            ) {
                Ok(pair) => pair,
                Err(err) => {
                    let err = self.handle_unreadable_child(node, &mut curlock, idx, err, ctx);
                    self.unlock_node(node, curlock, ctx);
                    return Err(err);
                }
            };

            if self.is_repair_needed(&child, &child_info) {
                if let Err(e) =
                    self.upgrade_node_locks(node, &child, &mut curlock, &mut child_lock, ctx)
                {
                    self.unlock_node(node, curlock, ctx);
                    return Err(e);
                }
                let res = self.repair_links(node, &child, idx, ctx);
                self.unlock_node(&child, LockType::Write, ctx);
                if let Err(e) = res {
                    self.unlock_node(node, curlock, ctx);
                    return Err(e);
                }
                continue;
            }

            if action.needs_split_check() && self.needs_split(&child, action, ctx) {
                if let Err(e) =
                    self.upgrade_node_locks(node, &child, &mut curlock, &mut child_lock, ctx)
                {
                    self.unlock_node(node, curlock, ctx);
                    return Err(e);
                }
                let res = self.split_node(node, &child, idx, ctx);
                self.unlock_node(&child, LockType::Write, ctx);
                if let Err(e) = res {
                    self.unlock_node(node, curlock, ctx);
                    // A parent that filled up underneath us gets its own
                    // split on the restarted descent.
                    return Err(if e == BtreeError::SpaceNotAvail {
                        BtreeError::Retry
                    } else {
                        e
                    });
                }
                continue;
            }

            if !tried_merge && action.needs_merge_check() && child.is_merge_needed(&self.cfg) {
                if let Err(e) =
                    self.upgrade_node_locks(node, &child, &mut curlock, &mut child_lock, ctx)
                {
                    self.unlock_node(node, curlock, ctx);
                    return Err(e);
                }
                // The merge re-latches its whole window, this child included.
                self.unlock_node(&child, LockType::Write, ctx);
                tried_merge = true;
                let res = self.merge_nodes(node, idx, ctx);
                if let Err(e) = res {
                    self.unlock_node(node, curlock, ctx);
                    return Err(e);
                }
                continue;
            }

            self.unlock_node(node, curlock, ctx);
            return self.do_mutate(&child, child_lock, action, ctx);
        }
    }

    fn mutate_leaf(
        &self,
        leaf: &NodePtr,
        action: &mut MutateAction<'_, K, V>,
        ctx: &OpContext,
    ) -> BtreeResult<()> {
        let mut dirty = false;
        let ret = match action {
            MutateAction::Put {
                key,
                value,
                put_type,
            } => {
                let (found, idx) = leaf.find(*key);
                match put_type {
                    PutType::InsertOnly => {
                        if found {
                            Err(BtreeError::AlreadyExists)
                        } else {
                            self.leaf_insert(leaf, idx, key, value, ctx, &mut dirty)
                        }
                    }
                    PutType::UpdateOnly => {
                        if found {
                            self.leaf_update(leaf, idx, value, ctx, &mut dirty)
                        } else {
                            Err(BtreeError::NotFound)
                        }
                    }
                    PutType::Upsert => {
                        if found {
                            self.leaf_update(leaf, idx, value, ctx, &mut dirty)
                        } else {
                            self.leaf_insert(leaf, idx, key, value, ctx, &mut dirty)
                        }
                    }
                    PutType::AppendIfExistsElseInsert => {
                        if found {
                            let existing: V = leaf.value_at(idx);
                            match existing.append(value) {
                                Some(joined) => {
                                    self.leaf_update(leaf, idx, &joined, ctx, &mut dirty)
                                }
                                None => Err(BtreeError::FastPathNotPossible),
                            }
                        } else {
                            self.leaf_insert(leaf, idx, key, value, ctx, &mut dirty)
                        }
                    }
                }
            }
            MutateAction::RangePut {
                range,
                value,
                updated,
                more,
            } => {
                let mut ret = Ok(());
                let mut applied = 0u64;
                if let Some((start_idx, end_idx)) = leaf.match_range(range) {
                    for idx in start_idx..=end_idx {
                        if let Err(e) = self.leaf_update(leaf, idx, value, ctx, &mut dirty) {
                            ret = Err(e);
                            break;
                        }
                        applied += 1;
                    }
                }
                if ret.is_ok() {
                    // Committed only on success: a restarted descent re-applies
                    // the same idempotent updates and must not double-count.
                    ret = self.advance_range_cursor(leaf, range, more);
                    if ret.is_ok() {
                        **updated += applied;
                    }
                }
                ret
            }
            MutateAction::Remove { key, out } => {
                let (found, idx) = leaf.find(*key);
                if found {
                    **out = Some((leaf.key_at(idx), leaf.value_at(idx)));
                    leaf.remove_at(idx);
                    dirty = true;
                    Ok(())
                } else {
                    Err(BtreeError::NotFound)
                }
            }
            MutateAction::RemoveAny { range, out } => match leaf.get_any(range) {
                Some(idx) => {
                    **out = Some((leaf.key_at(idx), leaf.value_at(idx)));
                    leaf.remove_at(idx);
                    dirty = true;
                    Ok(())
                }
                None => Err(BtreeError::NotFound),
            },
            MutateAction::RemoveRange {
                range,
                removed,
                more,
            } => {
                let leaf_max: Option<K> = (leaf.total_entries() > 0)
                    .then(|| leaf.key_at(leaf.total_entries() - 1));
                match leaf_max {
                    Some(leaf_max) => {
                        if let Some((start_idx, end_idx)) = leaf.match_range(range) {
                            **removed += (end_idx - start_idx + 1) as u64;
                            leaf.remove_range(start_idx, end_idx);
                            dirty = true;
                        }
                        if range.end > leaf_max && leaf.next_bnode() != EMPTY_NODE_ID {
                            range.advance_past(&leaf_max);
                            **more = true;
                        }
                        Ok(())
                    }
                    // An emptied leaf gives no cursor to advance past;
                    // restart so the descent merges it away first.
                    None if leaf.next_bnode() != EMPTY_NODE_ID => Err(BtreeError::Retry),
                    None => Ok(()),
                }
            }
        };

        if dirty {
            leaf.inc_gen();
            self.store.write_node(leaf, ctx)?;
        }
        ret
    }

    fn advance_range_cursor(
        &self,
        leaf: &NodePtr,
        range: &mut KeyRange<K>,
        more: &mut bool,
    ) -> BtreeResult<()> {
        if leaf.total_entries() == 0 {
            // No cursor to advance past; restart so the descent merges the
            // emptied leaf away first.
            if leaf.next_bnode() != EMPTY_NODE_ID {
                return Err(BtreeError::Retry);
            }
            return Ok(());
        }
        let leaf_max: K = leaf.key_at(leaf.total_entries() - 1);
        if range.end > leaf_max && leaf.next_bnode() != EMPTY_NODE_ID {
            range.advance_past(&leaf_max);
            *more = true;
        }
        Ok(())
    }

    fn leaf_insert(
        &self,
        leaf: &NodePtr,
        idx: u32,
        key: &K,
        value: &V,
        ctx: &OpContext,
        dirty: &mut bool,
    ) -> BtreeResult<()> {
        match leaf.insert_at(idx, key, value) {
            Ok(()) => {
                *dirty = true;
                Ok(())
            }
            Err(BtreeError::SpaceNotAvail) => {
                // No room after all (lost the race to another insert);
                // force a split on the next descent.
                ctx.set_force_split(leaf.node_id());
                Err(BtreeError::Retry)
            }
            Err(e) => Err(e),
        }
    }

    fn leaf_update(
        &self,
        leaf: &NodePtr,
        idx: u32,
        value: &V,
        ctx: &OpContext,
        dirty: &mut bool,
    ) -> BtreeResult<()> {
        match leaf.update_at(idx, value) {
            Ok(()) => {
                *dirty = true;
                Ok(())
            }
            Err(BtreeError::SpaceNotAvail) => {
                ctx.set_force_split(leaf.node_id());
                Err(BtreeError::Retry)
            }
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------
    // Split
    // ------------------------------------------------------------------

    /// Splits `child` (slot `parent_idx` of `parent`, both WRITE-latched)
    /// into itself plus a new right sibling, and republishes the parent.
    fn split_node(
        &self,
        parent: &NodePtr,
        child: &NodePtr,
        parent_idx: u32,
        ctx: &OpContext,
    ) -> BtreeResult<()> {
        if child.total_entries() < 2 {
            return Err(BtreeError::SpaceNotAvail);
        }
        self.store.prepare_node_txn(parent, child, ctx)?;

        let sibling = if child.is_leaf() {
            self.alloc_leaf_node()?
        } else {
            self.alloc_interior_node(child.level())?
        };
        self.lock_node(&sibling, LockType::Write, ctx);

        sibling.set_next_bnode(child.next_bnode());
        child.set_next_bnode(sibling.node_id());

        let mut moved = child.move_out_to_right_by_size(&sibling, child.occupied_size() / 2);
        if moved == 0 {
            moved = child.move_out_to_right_by_entries(&sibling, 1);
        }
        debug_assert!(moved > 0 && child.total_entries() > 0);

        if !child.is_leaf() {
            // The upper half carries the edge; the left part's coverage now
            // ends at its last separator.
            sibling.set_edge_info(child.edge_info());
            child.invalidate_edge();
        }

        child.inc_link_version();
        child.inc_gen();
        sibling.inc_gen();

        let split_key: K = child.key_at(child.total_entries() - 1);
        let res = (|| -> BtreeResult<()> {
            if parent_idx == parent.total_entries() {
                // The child was the edge; the sibling takes its place.
                parent.insert_at(parent_idx, &split_key, &child.link_info())?;
                parent.set_edge_info(sibling.link_info());
            } else {
                parent.update_at(parent_idx, &sibling.link_info())?;
                parent.insert_at(parent_idx, &split_key, &child.link_info())?;
            }
            parent.inc_gen();
            self.store
                .transact_write_nodes(&[sibling.clone()], child, parent, ctx)
        })();

        debug!(
            parent = parent.node_id(),
            child = child.node_id(),
            sibling = sibling.node_id(),
            moved,
            "split node"
        );
        self.unlock_node(&sibling, LockType::Write, ctx);
        res
    }

    /// Grows the tree by one level when the root itself must split.
    fn check_split_root(
        &self,
        action: &MutateAction<'_, K, V>,
        ctx: &OpContext,
    ) -> BtreeResult<()> {
        let mut guard = self.root.write();
        let root_info = *guard;
        let (root, _) =
            self.read_and_lock_node(root_info.node_id, LockType::Write, LockType::Write, ctx)?;

        // Re-check under the exclusive tree latch; another descent may have
        // grown the tree already.
        if !self.node_overfull_for(&root, action) {
            self.unlock_node(&root, LockType::Write, ctx);
            return Ok(());
        }

        let new_root = match self.alloc_interior_node(root.level() + 1) {
            Ok(node) => node,
            Err(e) => {
                self.unlock_node(&root, LockType::Write, ctx);
                return Err(e);
            }
        };
        self.lock_node(&new_root, LockType::Write, ctx);
        new_root.set_edge_info(root.link_info());

        let res = self.split_node(&new_root, &root, new_root.total_entries(), ctx);
        match res {
            Ok(()) => {
                self.store
                    .update_new_root_info(new_root.node_id(), new_root.link_version())?;
                *guard = new_root.link_info();
                info!(
                    new_root = new_root.node_id(),
                    level = new_root.level(),
                    "root split, tree grew"
                );
            }
            Err(_) => {
                let _ = self.free_node(&new_root, ctx);
            }
        }
        self.unlock_node(&new_root, LockType::Write, ctx);
        self.unlock_node(&root, LockType::Write, ctx);
        res
    }

    // ------------------------------------------------------------------
    // Merge
    // ------------------------------------------------------------------

    /// Compacts a window of adjacent children of `parent` (WRITE-latched)
    /// around slot `cur_idx`, freeing drained nodes.
    fn merge_nodes(&self, parent: &NodePtr, cur_idx: u32, ctx: &OpContext) -> BtreeResult<()> {
        let nentries = parent.total_entries();
        let last_idx = if parent.has_valid_edge() {
            nentries
        } else if nentries == 0 {
            return Ok(());
        } else {
            nentries - 1
        };
        let start_idx = cur_idx.saturating_sub(1);
        let end_idx = (start_idx + self.cfg.max_merge_nodes - 1).min(last_idx);
        if end_idx <= start_idx {
            return Ok(());
        }

        // Latch the window left to right; ids ascend with position, which
        // keeps the ordering deadlock-free.
        let mut children: SmallVec<[NodePtr; 4]> = SmallVec::new();
        for idx in start_idx..=end_idx {
            let info = self.child_info_at(parent, idx);
            match self.read_and_lock_node(info.node_id, LockType::Write, LockType::Write, ctx) {
                Ok((child, _)) => {
                    if self.is_repair_needed(&child, &info) {
                        self.unlock_node(&child, LockType::Write, ctx);
                        for c in children.iter().rev() {
                            self.unlock_node(c, LockType::Write, ctx);
                        }
                        return Err(BtreeError::Retry);
                    }
                    children.push(child);
                }
                Err(e) => {
                    for c in children.iter().rev() {
                        self.unlock_node(c, LockType::Write, ctx);
                    }
                    // A freed or unreadable neighbor; restart so the descent
                    // repairs the slot before merging.
                    return Err(if e.is_transient() || e == BtreeError::NotFound {
                        BtreeError::Retry
                    } else {
                        e
                    });
                }
            }
        }

        if let Err(e) = self.store.prepare_node_txn(parent, &children[0], ctx) {
            for c in children.iter().rev() {
                self.unlock_node(c, LockType::Write, ctx);
            }
            return Err(e);
        }
        let rightmost = children.last().expect("window has >= 2 nodes");
        let rightmost_next = rightmost.next_bnode();
        let rightmost_edge = rightmost.edge_info();
        let window_has_edge = end_idx == nentries;

        // Worst-case room check before any entry moves: the rebuilt parent
        // slots carry survivor keys, which for var-length keys may be wider
        // than the separators they replace. Bail out while the window is
        // still untouched rather than discover this mid-rebuild.
        {
            let mut max_key_size = 0usize;
            for c in &children {
                for i in 0..c.total_entries() {
                    max_key_size = max_key_size.max(c.nth_key_size(i));
                }
            }
            let mut removed_bytes = 0usize;
            for j in start_idx..=end_idx.min(nentries.saturating_sub(1)) {
                removed_bytes += parent.entry_footprint(j);
            }
            let worst_inserted = (children.len() - 1)
                * (max_key_size + LINK_INFO_SIZE + Self::parent_slot_overhead(parent));
            if worst_inserted > removed_bytes + parent.available_size() as usize {
                for c in children.iter().rev() {
                    self.unlock_node(c, LockType::Write, ctx);
                }
                return Ok(());
            }
        }

        // Compact entries leftward; a source that still holds entries once
        // its left neighbor fills becomes the next destination.
        let mut dst = 0usize;
        for src in 1..children.len() {
            loop {
                let avail = children[dst].available_size();
                let copied = children[dst].copy_by_size(&children[src], 0, avail);
                if copied > 0 {
                    children[src].remove_range(0, copied - 1);
                }
                if children[src].total_entries() == 0 {
                    break;
                }
                if copied == 0 {
                    dst = src;
                    break;
                }
            }
        }

        let survivors: Vec<&NodePtr> = children
            .iter()
            .filter(|c| c.total_entries() > 0)
            .collect();
        let drained: Vec<&NodePtr> = children
            .iter()
            .filter(|c| c.total_entries() == 0)
            .collect();

        if drained.is_empty() || survivors.is_empty() {
            // Nothing compacted away; leave the window untouched.
            for c in children.iter().rev() {
                self.unlock_node(c, LockType::Write, ctx);
            }
            return Ok(());
        }

        // Rewire the sibling chain across the window.
        for pair in survivors.windows(2) {
            pair[0].set_next_bnode(pair[1].node_id());
        }
        let last_survivor = *survivors.last().expect("at least one survivor");
        last_survivor.set_next_bnode(rightmost_next);
        if !last_survivor.is_leaf()
            && rightmost_edge.node_id != EMPTY_NODE_ID
            && children.last().expect("non-empty window").total_entries() == 0
        {
            // The drained rightmost child hands its edge to the survivor
            // that absorbed its entries.
            last_survivor.set_edge_info(rightmost_edge);
        }

        for s in &survivors {
            s.inc_link_version();
            s.inc_gen();
        }

        // Rebuild the parent's window slots from the survivors.
        if window_has_edge {
            if nentries > start_idx {
                parent.remove_range(start_idx, nentries - 1);
            }
            for (i, s) in survivors[..survivors.len() - 1].iter().enumerate() {
                let sep: K = s.key_at(s.total_entries() - 1);
                parent
                    .insert_at(start_idx + i as u32, &sep, &s.link_info())
                    .expect("merge pre-checked parent capacity");
            }
            parent.set_edge_info(last_survivor.link_info());
        } else {
            parent.remove_range(start_idx, end_idx);
            for (i, s) in survivors.iter().enumerate() {
                let sep: K = s.key_at(s.total_entries() - 1);
                parent
                    .insert_at(start_idx + i as u32, &sep, &s.link_info())
                    .expect("merge pre-checked parent capacity");
            }
        }
        parent.inc_gen();

        let new_nodes: Vec<NodePtr> = survivors.iter().skip(1).map(|s| (**s).clone()).collect();
        let mut res = self
            .store
            .transact_write_nodes(&new_nodes, survivors[0], parent, ctx);

        let mut freed = 0u32;
        if res.is_ok() {
            for d in &drained {
                if let Err(e) = self.free_node(d, ctx) {
                    res = Err(e);
                    break;
                }
                freed += 1;
            }
        }
        debug!(
            parent = parent.node_id(),
            window = ?(start_idx, end_idx),
            freed,
            "merged nodes"
        );

        for c in children.iter().rev() {
            self.unlock_node(c, LockType::Write, ctx);
        }
        res
    }

    /// Replaces the root with its lone edge child once the root is an empty
    /// interior. Cascades until the root holds entries or is a leaf.
    fn check_collapse_root(&self, ctx: &OpContext) -> BtreeResult<()> {
        loop {
            let mut guard = self.root.write();
            let root_info = *guard;
            let (root, _) = self.read_and_lock_node(
                root_info.node_id,
                LockType::Write,
                LockType::Write,
                ctx,
            )?;
            if root.is_leaf() || root.total_entries() > 0 || !root.has_valid_edge() {
                self.unlock_node(&root, LockType::Write, ctx);
                return Ok(());
            }

            let child_info = root.edge_info();
            self.store
                .update_new_root_info(child_info.node_id, child_info.link_version)?;
            *guard = child_info;
            self.free_node(&root, ctx)?;
            self.unlock_node(&root, LockType::Write, ctx);
            info!(new_root = child_info.node_id, "root collapsed");
        }
    }

    // ------------------------------------------------------------------
    // Structural repair
    // ------------------------------------------------------------------

    /// Handles a child that could not be read during a mutation descent:
    /// repairs the parent's slots from the left sibling when possible, and
    /// maps the failure onto the request's fate.
    fn handle_unreadable_child(
        &self,
        parent: &NodePtr,
        curlock: &mut LockType,
        idx: u32,
        err: BtreeError,
        ctx: &OpContext,
    ) -> BtreeError {
        let fatal = matches!(err, BtreeError::CrcMismatch { .. });
        if idx == 0 {
            // No live left anchor to rebuild from.
            return if fatal { err } else { BtreeError::Retry };
        }

        let repair = (|| -> BtreeResult<()> {
            if *curlock == LockType::Read {
                let pgen = parent.node_gen();
                ctx.record_unlock(parent, LockType::Read);
                parent.lock_upgrade();
                ctx.record_lock(parent, LockType::Write);
                *curlock = LockType::Write;
                if !parent.is_valid_node() || parent.node_gen() != pgen {
                    return Err(BtreeError::Retry);
                }
            }
            let left_info = self.child_info_at(parent, idx - 1);
            let (left, _) =
                self.read_and_lock_node(left_info.node_id, LockType::Write, LockType::Write, ctx)?;
            let res = self.repair_links(parent, &left, idx - 1, ctx);
            self.unlock_node(&left, LockType::Write, ctx);
            res
        })();

        match (fatal, repair) {
            (true, _) => err,
            (false, Ok(())) => BtreeError::Retry,
            (false, Err(e)) if e.is_transient() => BtreeError::Retry,
            // An unreadable anchor is itself torn state, not a missing key;
            // restart and let the next descent repair further left.
            (false, Err(BtreeError::NotFound)) => BtreeError::Retry,
            (false, Err(e)) => e,
        }
    }

    /// Rebuilds `parent`'s slots from `idx` onward out of the live sibling
    /// chain starting at `child` (both WRITE-latched). Covers the torn-split
    /// case (a sibling the parent never learned about) and the torn-merge
    /// case (slots still naming freed children). Separators and link
    /// versions are re-derived from the children; no entry data moves.
    fn repair_links(
        &self,
        parent: &NodePtr,
        child: &NodePtr,
        idx: u32,
        ctx: &OpContext,
    ) -> BtreeResult<()> {
        let nentries = parent.total_entries();
        // The stale slot's old key bounds this anchor's coverage: the walk
        // must not absorb children that belong to later slots or parents.
        let bound: Option<K> = (idx < nentries).then(|| parent.key_at(idx));
        let sep: K = child.key_at(child.total_entries() - 1);
        let mut repaired: Vec<(K, LinkInfo)> = vec![(sep, child.link_info())];

        // Walk right until coverage is complete: either the collected keys
        // reach the old slot key, or we meet a node the parent already
        // references with a current link version (slots from there on are
        // intact), or the chain ends.
        let mut stop_slot: Option<u32> = None;
        let mut chain_end = false;
        let mut cur_id = child.next_bnode();
        loop {
            if let Some(b) = &bound {
                if repaired.last().expect("non-empty").0 >= *b {
                    break;
                }
            }
            if cur_id == EMPTY_NODE_ID {
                chain_end = true;
                break;
            }
            if repaired.len() as u32 > 2 * self.cfg.max_merge_nodes + 4 {
                // Walked past any plausible tear; likely out of coverage.
                return Err(BtreeError::Retry);
            }

            let matching_slot = (idx + 1..=nentries).find(|&j| {
                if j == nentries && !parent.has_valid_edge() {
                    return false;
                }
                self.child_info_at(parent, j).node_id == cur_id
            });

            let (node, _) =
                self.read_and_lock_node(cur_id, LockType::Read, LockType::Read, ctx)?;
            if let Some(j) = matching_slot {
                let info = self.child_info_at(parent, j);
                if node.link_version() == info.link_version {
                    self.unlock_node(&node, LockType::Read, ctx);
                    stop_slot = Some(j);
                    break;
                }
            }
            if node.total_entries() == 0 {
                self.unlock_node(&node, LockType::Read, ctx);
                return Err(BtreeError::Retry);
            }
            let sep: K = node.key_at(node.total_entries() - 1);
            repaired.push((sep, node.link_info()));
            cur_id = node.next_bnode();
            self.unlock_node(&node, LockType::Read, ctx);

            if idx == nentries {
                // Edge-anchored repair: a single torn split is the only
                // state this can rebuild; one hop is the whole tear.
                chain_end = cur_id == EMPTY_NODE_ID;
                if !chain_end {
                    stop_slot = Some(nentries + 1);
                }
                break;
            }
        }

        // Replace the stale slot span with the re-derived entries. Slots
        // whose keys are shadowed by what the repaired span now covers are
        // dead (a torn merge left them naming freed children); sweep them
        // into the span too.
        let mut span_end = match (stop_slot, chain_end) {
            (Some(j), _) => j,
            (None, true) => nentries + 1,
            (None, false) => idx + 1,
        };
        if span_end <= nentries {
            let max_key = repaired.last().expect("non-empty").0.clone();
            while span_end < nentries && parent.key_at::<K>(span_end) <= max_key {
                span_end += 1;
            }
        }

        let removed_span = span_end.min(nentries).saturating_sub(idx);
        let replace_edge = span_end > nentries;
        let inserted = if replace_edge {
            repaired.len().saturating_sub(1)
        } else {
            repaired.len()
        };

        // Conservative room check before touching the parent.
        let mut removed_bytes = 0usize;
        for j in idx..span_end.min(nentries) {
            removed_bytes += parent.entry_footprint(j);
        }
        let mut inserted_bytes = 0usize;
        for (k, _) in repaired.iter().take(inserted) {
            inserted_bytes +=
                k.serialized_size() + LINK_INFO_SIZE + Self::parent_slot_overhead(parent);
        }
        if inserted_bytes > removed_bytes + parent.available_size() as usize {
            return Err(BtreeError::Retry);
        }

        if removed_span > 0 {
            parent.remove_range(idx, idx + removed_span - 1);
        }
        if replace_edge {
            for (i, (k, info)) in repaired[..repaired.len() - 1].iter().enumerate() {
                parent
                    .insert_at(idx + i as u32, k, info)
                    .expect("repair pre-checked parent capacity");
            }
            parent.set_edge_info(repaired.last().expect("non-empty").1);
        } else {
            for (i, (k, info)) in repaired.iter().enumerate() {
                parent
                    .insert_at(idx + i as u32, k, info)
                    .expect("repair pre-checked parent capacity");
            }
        }
        parent.inc_gen();
        self.store.write_node(parent, ctx)?;

        info!(
            parent = parent.node_id(),
            anchor = child.node_id(),
            slots = repaired.len(),
            "repaired parent links"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    fn do_get(&self, node: &NodePtr, key: &K, ctx: &OpContext) -> BtreeResult<V> {
        if node.is_leaf() {
            let (found, idx) = node.find(key);
            let ret = if found {
                Ok(node.value_at::<V>(idx))
            } else {
                Err(BtreeError::NotFound)
            };
            self.unlock_node(node, LockType::Read, ctx);
            return ret;
        }

        let (_, idx) = node.find(key);
        let child_info = self.child_info_at(node, idx);
        match self.read_and_lock_node(child_info.node_id, LockType::Read, LockType::Read, ctx) {
            Ok((child, _)) => {
                if self.is_repair_needed(&child, &child_info) {
                    // Reads do not repair; restart and let a mutation fix it.
                    self.unlock_node(&child, LockType::Read, ctx);
                    self.unlock_node(node, LockType::Read, ctx);
                    return Err(BtreeError::Retry);
                }
                self.unlock_node(node, LockType::Read, ctx);
                self.do_get(&child, key, ctx)
            }
            Err(e) => {
                self.unlock_node(node, LockType::Read, ctx);
                // A child freed underneath a read is a torn parent, not an
                // absent key.
                Err(if e == BtreeError::NotFound {
                    BtreeError::Retry
                } else {
                    e
                })
            }
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Descends to the leaf covering the range start, READ-crabbing.
    fn descend_to_leaf(&self, start: &K, ctx: &OpContext) -> BtreeResult<NodePtr> {
        let guard = self.root.read();
        let root_info = *guard;
        let (mut node, _) =
            self.read_and_lock_node(root_info.node_id, LockType::Read, LockType::Read, ctx)?;
        drop(guard);

        while !node.is_leaf() {
            let (_, idx) = node.find(start);
            let child_info = self.child_info_at(&node, idx);
            match self.read_and_lock_node(child_info.node_id, LockType::Read, LockType::Read, ctx)
            {
                Ok((child, _)) => {
                    if self.is_repair_needed(&child, &child_info) {
                        self.unlock_node(&child, LockType::Read, ctx);
                        self.unlock_node(&node, LockType::Read, ctx);
                        return Err(BtreeError::Retry);
                    }
                    self.unlock_node(&node, LockType::Read, ctx);
                    node = child;
                }
                Err(e) => {
                    self.unlock_node(&node, LockType::Read, ctx);
                    return Err(if e == BtreeError::NotFound {
                        BtreeError::Retry
                    } else {
                        e
                    });
                }
            }
        }
        Ok(node)
    }

    /// Horizontal leaf walk under READ latches, up to `batch_size` entries
    /// per invocation. Results go to a scratch batch and are committed only
    /// on success, so a restarted descent cannot duplicate output.
    fn do_sweep_query(
        &self,
        req: &mut QueryRequest<K>,
        out: &mut Vec<(K, V)>,
    ) -> BtreeResult<bool> {
        let batch_limit = req.batch_size as usize;
        let mut batch: Vec<(K, V)> = Vec::new();
        let mut node = self.descend_to_leaf(&req.range.start.clone(), &req.ctx)?;

        loop {
            if let Some((start_idx, end_idx)) = node.match_range(&req.range) {
                for idx in start_idx..=end_idx {
                    if batch.len() >= batch_limit {
                        if let Some((last_key, _)) = batch.last() {
                            req.range.advance_past(&last_key.clone());
                        }
                        self.unlock_node(&node, LockType::Read, &req.ctx);
                        out.append(&mut batch);
                        return Ok(true);
                    }
                    batch.push((node.key_at(idx), node.value_at(idx)));
                }
            }

            let exhausted = node.total_entries() > 0
                && req.range.end <= node.key_at(node.total_entries() - 1);
            let next_id = node.next_bnode();
            if exhausted || next_id == EMPTY_NODE_ID {
                self.unlock_node(&node, LockType::Read, &req.ctx);
                out.append(&mut batch);
                return Ok(false);
            }

            match self.read_and_lock_node(next_id, LockType::Read, LockType::Read, &req.ctx) {
                Ok((next, _)) => {
                    self.unlock_node(&node, LockType::Read, &req.ctx);
                    node = next;
                }
                Err(e) => {
                    self.unlock_node(&node, LockType::Read, &req.ctx);
                    // A vanished sibling means the chain moved under us.
                    return Err(if e == BtreeError::NotFound {
                        BtreeError::Retry
                    } else {
                        e
                    });
                }
            }
        }
    }

    /// Recursive descent visiting every child whose subtree intersects the
    /// range; suited to small predicate-driven queries.
    fn do_traversal_query(
        &self,
        req: &mut QueryRequest<K>,
        out: &mut Vec<(K, V)>,
    ) -> BtreeResult<bool> {
        let batch_limit = req.batch_size as usize;
        let mut batch: Vec<(K, V)> = Vec::new();
        let guard = self.root.read();
        let root_info = *guard;
        let (root, _) = self.read_and_lock_node(
            root_info.node_id,
            LockType::Read,
            LockType::Read,
            &req.ctx,
        )?;
        drop(guard);

        let res = self.traverse_node(&root, req, &mut batch, batch_limit);
        self.unlock_node(&root, LockType::Read, &req.ctx);
        res?;

        let more = batch.len() >= batch_limit
            && batch
                .last()
                .map(|(k, _)| *k < req.range.end)
                .unwrap_or(false);
        if more {
            if let Some((last_key, _)) = batch.last() {
                req.range.advance_past(&last_key.clone());
            }
        }
        out.append(&mut batch);
        Ok(more)
    }

    fn traverse_node(
        &self,
        node: &NodePtr,
        req: &QueryRequest<K>,
        out: &mut Vec<(K, V)>,
        batch_limit: usize,
    ) -> BtreeResult<()> {
        let res = (|| -> BtreeResult<()> {
            if node.is_leaf() {
                if let Some((start_idx, end_idx)) = node.match_range(&req.range) {
                    for idx in start_idx..=end_idx {
                        if out.len() >= batch_limit {
                            break;
                        }
                        out.push((node.key_at(idx), node.value_at(idx)));
                    }
                }
                return Ok(());
            }

            if let Some((start_idx, end_idx)) = node.match_range(&req.range) {
                for idx in start_idx..=end_idx {
                    if out.len() >= batch_limit {
                        break;
                    }
                    let child_info = self.child_info_at(node, idx);
                    let (child, _) = self
                        .read_and_lock_node(
                            child_info.node_id,
                            LockType::Read,
                            LockType::Read,
                            &req.ctx,
                        )
                        .map_err(|e| {
                            if e == BtreeError::NotFound {
                                BtreeError::Retry
                            } else {
                                e
                            }
                        })?;
                    let res = self.traverse_node(&child, req, out, batch_limit);
                    self.unlock_node(&child, LockType::Read, &req.ctx);
                    res?;
                }
            }
            Ok(())
        })();
        res
    }

    // ------------------------------------------------------------------
    // Destroy
    // ------------------------------------------------------------------

    fn do_destroy(&self, id: u64, ctx: &OpContext, freed: &mut u64) -> BtreeResult<()> {
        let (node, _) = match self.read_and_lock_node(id, LockType::Write, LockType::Write, ctx) {
            Ok(pair) => pair,
            // A child already gone just has nothing left to free.
            Err(BtreeError::NotFound) => return Ok(()),
            Err(e) => return Err(e),
        };
        if !node.is_leaf() {
            for idx in 0..node.total_entries() {
                let child_info = node.value_at::<LinkInfo>(idx);
                if let Err(e) = self.do_destroy(child_info.node_id, ctx, freed) {
                    self.unlock_node(&node, LockType::Write, ctx);
                    return Err(e);
                }
            }
            if node.has_valid_edge() {
                if let Err(e) = self.do_destroy(node.edge_info().node_id, ctx, freed) {
                    self.unlock_node(&node, LockType::Write, ctx);
                    return Err(e);
                }
            }
        }
        self.free_node(&node, ctx)?;
        *freed += 1;
        self.unlock_node(&node, LockType::Write, ctx);
        Ok(())
    }
}
