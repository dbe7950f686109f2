//! # B-Tree Node Buffer
//!
//! Every node is a single page-sized buffer with a packed 64-byte persistent
//! header at the front and a codec-managed entry area behind it. The header
//! is defined with `zerocopy` little-endian wrapper types so a node can be
//! persisted and reloaded byte for byte.
//!
//! ## Persistent Header Layout (64 bytes)
//!
//! ```text
//! Offset  Size  Field          Description
//! ------  ----  -------------  ----------------------------------------
//! 0       1     magic          0xAB, verified on every load
//! 1       1     version        Layout version (1)
//! 2       2     checksum       CRC-16/T10-DIF over the data area
//! 4       8     node_id        This node's id
//! 12      8     next_node      Right sibling (leaf chain)
//! 20      4     flags          nentries:30 | leaf:1 | valid:1
//! 24      8     node_gen       Incremented on every mutation
//! 32      8     link_version   Version of the parent→this edge
//! 40      16    edge           LinkInfo for keys past the last entry
//! 56      2     level          0 for leaves
//! 58      1     node_type      Entry codec (Fixed / VarLen)
//! 59      1     reserved
//! 60      2     node_size      Stored as size - 1
//! 62      2     reserved
//! ```
//!
//! ## Transient State
//!
//! Alongside the buffer each node carries a raw reader/writer latch, an
//! upgrader counter, and a cached leaf flag. The latch is a
//! `parking_lot::RawRwLock` rather than a guard-based lock because crabbing
//! acquires and releases latches across stack frames in an order no lexical
//! scope can express; every unlock is paired with an acquire recorded in the
//! operation's lock bookkeeping.
//!
//! ## Safety Model
//!
//! The buffer lives in an `UnsafeCell` so that mutation can go through
//! `&Node` while the node is shared via `Arc`. The latch discipline is the
//! safety argument: readers hold the shared latch, writers the exclusive
//! latch, and the debug build asserts the exclusive latch in every mutating
//! accessor. Nodes are never reclaimed while any handle is outstanding; the
//! refcount lives in the `Arc`.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use crc::{Crc, CRC_16_T10_DIF};
use parking_lot::lock_api::RawRwLock as _;
use parking_lot::RawRwLock;
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::btree::error::{BtreeError, BtreeResult};
use crate::btree::key::{BtreeKey, BtreeValue, LinkInfo, NodeId, EMPTY_NODE_ID};
use crate::config::NODE_HDR_SIZE;

pub const NODE_MAGIC: u8 = 0xAB;
pub const NODE_VERSION: u8 = 1;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_T10_DIF);

const NENTRIES_MASK: u32 = (1 << 30) - 1;
const LEAF_BIT: u32 = 1 << 30;
const VALID_BIT: u32 = 1 << 31;

/// Latch states a node can be held in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    None,
    Read,
    Write,
}

/// Entry-area codec selector, persisted in the header.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Fixed = 1,
    VarLen = 2,
}

impl NodeType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(NodeType::Fixed),
            2 => Some(NodeType::VarLen),
            _ => None,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PersistentHdr {
    magic: u8,
    version: u8,
    checksum: U16,
    node_id: U64,
    next_node: U64,
    flags: U32,
    node_gen: U64,
    link_version: U64,
    edge_id: U64,
    edge_link_version: U64,
    level: U16,
    node_type: u8,
    reserved1: u8,
    node_size: U16,
    reserved2: U16,
}

impl PersistentHdr {
    zerocopy_accessors! {
        checksum: u16,
        node_id: u64,
        next_node: u64,
        node_gen: u64,
        link_version: u64,
        edge_id: u64,
        edge_link_version: u64,
        level: u16,
        node_size: u16,
    }
}

/// A latched, page-sized B-tree node.
pub struct Node {
    buf: UnsafeCell<Box<[u8]>>,
    latch: RawRwLock,
    upgraders: AtomicU16,
    leaf_cached: bool,
}

// SAFETY: the buffer is only read under the shared latch and only written
// under the exclusive latch; the latch and upgrader counter are themselves
// thread-safe.
unsafe impl Send for Node {}
unsafe impl Sync for Node {}

pub type NodePtr = Arc<Node>;

impl Node {
    /// Initializes a fresh node buffer.
    pub fn alloc(
        node_size: u32,
        id: NodeId,
        is_leaf: bool,
        node_type: NodeType,
        level: u16,
    ) -> Self {
        let buf = vec![0u8; node_size as usize].into_boxed_slice();
        let node = Self {
            buf: UnsafeCell::new(buf),
            latch: RawRwLock::INIT,
            upgraders: AtomicU16::new(0),
            leaf_cached: is_leaf,
        };
        {
            let hdr = node.hdr_mut_unchecked();
            hdr.magic = NODE_MAGIC;
            hdr.version = NODE_VERSION;
            hdr.set_node_id(id);
            hdr.set_next_node(EMPTY_NODE_ID);
            hdr.flags = U32::new(VALID_BIT | if is_leaf { LEAF_BIT } else { 0 });
            hdr.set_edge_id(EMPTY_NODE_ID);
            hdr.set_level(level);
            hdr.node_type = node_type as u8;
            hdr.node_size = U16::new((node_size - 1) as u16);
        }
        node
    }

    /// Reconstructs a node from persisted bytes. Magic and version are
    /// verified; a mismatch is fatal for this load.
    pub fn load(buf: Box<[u8]>) -> BtreeResult<Self> {
        if buf.len() < NODE_HDR_SIZE {
            return Err(BtreeError::Io(format!(
                "node buffer too small: {} < {}",
                buf.len(),
                NODE_HDR_SIZE
            )));
        }
        let is_leaf = Self::identify_leaf_node(&buf);
        let node = Self {
            buf: UnsafeCell::new(buf),
            latch: RawRwLock::INIT,
            upgraders: AtomicU16::new(0),
            leaf_cached: is_leaf,
        };
        {
            let hdr = node.hdr();
            if hdr.magic != NODE_MAGIC || hdr.version != NODE_VERSION {
                return Err(BtreeError::Io(format!(
                    "bad node header: magic={:#x} version={}",
                    hdr.magic, hdr.version
                )));
            }
            if hdr.node_size() as u32 + 1 != node.buffer_len() as u32 {
                return Err(BtreeError::Io(format!(
                    "node size mismatch: header says {}, buffer is {}",
                    hdr.node_size() as u32 + 1,
                    node.buffer_len()
                )));
            }
            if NodeType::from_byte(hdr.node_type).is_none() {
                return Err(BtreeError::Io(format!(
                    "unknown node_type {} on node {}",
                    hdr.node_type,
                    hdr.node_id()
                )));
            }
        }
        Ok(node)
    }

    /// Reads the leaf flag straight from a raw buffer, header only.
    pub fn identify_leaf_node(buf: &[u8]) -> bool {
        let hdr = PersistentHdr::ref_from_bytes(&buf[..NODE_HDR_SIZE])
            .expect("header prefix is unaligned-safe");
        hdr.flags.get() & LEAF_BIT != 0
    }

    fn buffer_len(&self) -> usize {
        // SAFETY: the box pointer and length never change after construction.
        unsafe { (&*self.buf.get()).len() }
    }

    #[inline]
    fn hdr(&self) -> &PersistentHdr {
        // SAFETY: caller holds at least the shared latch per module contract.
        let buf = unsafe { &*self.buf.get() };
        PersistentHdr::ref_from_bytes(&buf[..NODE_HDR_SIZE])
            .expect("header prefix is unaligned-safe")
    }

    #[inline]
    fn hdr_mut_unchecked(&self) -> &mut PersistentHdr {
        // SAFETY: caller holds the exclusive latch, or the node is not yet
        // shared (construction).
        let buf = unsafe { &mut *self.buf.get() };
        PersistentHdr::mut_from_bytes(&mut buf[..NODE_HDR_SIZE])
            .expect("header prefix is unaligned-safe")
    }

    #[inline]
    pub(crate) fn hdr_mut(&self) -> &mut PersistentHdr {
        debug_assert!(
            self.latch.is_locked_exclusive(),
            "header mutation without the exclusive latch"
        );
        self.hdr_mut_unchecked()
    }

    /// Whole buffer, header included, for persistence.
    pub fn raw_bytes(&self) -> &[u8] {
        // SAFETY: caller holds at least the shared latch per module contract.
        unsafe { &*self.buf.get() }
    }

    /// Replaces the whole buffer with `bytes` (a rewind to a persisted
    /// state). The caller holds the exclusive latch.
    pub(crate) fn overwrite_from(&self, bytes: &[u8]) {
        debug_assert!(self.latch.is_locked_exclusive());
        debug_assert_eq!(bytes.len(), self.buffer_len());
        // SAFETY: exclusive latch held, asserted above.
        let buf = unsafe { &mut *self.buf.get() };
        buf.copy_from_slice(bytes);
    }

    #[inline]
    pub(crate) fn data_area(&self) -> &[u8] {
        &self.raw_bytes()[NODE_HDR_SIZE..]
    }

    #[inline]
    pub(crate) fn data_area_mut(&self) -> &mut [u8] {
        // SAFETY: caller holds the exclusive latch per module contract.
        let buf = unsafe { &mut *self.buf.get() };
        &mut buf[NODE_HDR_SIZE..]
    }

    // ------------------------------------------------------------------
    // Header accessors
    // ------------------------------------------------------------------

    pub fn node_id(&self) -> NodeId {
        self.hdr().node_id()
    }

    pub fn next_bnode(&self) -> NodeId {
        self.hdr().next_node()
    }

    pub fn set_next_bnode(&self, id: NodeId) {
        self.hdr_mut().set_next_node(id);
    }

    pub fn total_entries(&self) -> u32 {
        self.hdr().flags.get() & NENTRIES_MASK
    }

    pub(crate) fn set_total_entries(&self, n: u32) {
        debug_assert!(n <= NENTRIES_MASK);
        let hdr = self.hdr_mut();
        let rest = hdr.flags.get() & !NENTRIES_MASK;
        hdr.flags = U32::new(rest | n);
    }

    pub(crate) fn add_entries(&self, n: u32) {
        self.set_total_entries(self.total_entries() + n);
    }

    pub(crate) fn sub_entries(&self, n: u32) {
        debug_assert!(self.total_entries() >= n);
        self.set_total_entries(self.total_entries() - n);
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.leaf_cached
    }

    pub fn is_valid_node(&self) -> bool {
        self.hdr().flags.get() & VALID_BIT != 0
    }

    pub fn set_valid_node(&self, valid: bool) {
        let hdr = self.hdr_mut();
        let flags = hdr.flags.get();
        hdr.flags = U32::new(if valid { flags | VALID_BIT } else { flags & !VALID_BIT });
    }

    pub fn node_gen(&self) -> u64 {
        self.hdr().node_gen()
    }

    pub fn inc_gen(&self) {
        let hdr = self.hdr_mut();
        let g = hdr.node_gen();
        hdr.set_node_gen(g + 1);
    }

    pub fn link_version(&self) -> u64 {
        self.hdr().link_version()
    }

    pub fn set_link_version(&self, v: u64) {
        self.hdr_mut().set_link_version(v);
    }

    pub fn inc_link_version(&self) {
        let hdr = self.hdr_mut();
        let v = hdr.link_version();
        hdr.set_link_version(v + 1);
    }

    /// This node's id paired with its current link version.
    pub fn link_info(&self) -> LinkInfo {
        LinkInfo::new(self.node_id(), self.link_version())
    }

    pub fn level(&self) -> u16 {
        self.hdr().level()
    }

    pub fn node_type(&self) -> NodeType {
        NodeType::from_byte(self.hdr().node_type).expect("node_type verified on load")
    }

    pub fn node_size(&self) -> u32 {
        self.hdr().node_size() as u32 + 1
    }

    pub fn node_data_size(&self) -> u32 {
        self.node_size() - NODE_HDR_SIZE as u32
    }

    // ------------------------------------------------------------------
    // Edge pointer
    // ------------------------------------------------------------------

    pub fn edge_info(&self) -> LinkInfo {
        let hdr = self.hdr();
        LinkInfo::new(hdr.edge_id(), hdr.edge_link_version())
    }

    pub fn set_edge_info(&self, info: LinkInfo) {
        let hdr = self.hdr_mut();
        hdr.set_edge_id(info.node_id);
        hdr.set_edge_link_version(info.link_version);
    }

    pub fn invalidate_edge(&self) {
        self.hdr_mut().set_edge_id(EMPTY_NODE_ID);
    }

    pub fn has_valid_edge(&self) -> bool {
        if self.is_leaf() {
            return false;
        }
        self.hdr().edge_id() != EMPTY_NODE_ID
    }

    // ------------------------------------------------------------------
    // Checksum
    // ------------------------------------------------------------------

    pub fn checksum(&self) -> u16 {
        self.hdr().checksum()
    }

    pub fn init_checksum(&self) {
        self.hdr_mut().set_checksum(0);
    }

    /// Recomputes the checksum over the data area; called before persisting.
    pub fn set_checksum(&self) {
        let sum = CRC16.checksum(self.data_area());
        self.hdr_mut().set_checksum(sum);
    }

    /// Magic + checksum verification; must hold for every node at rest.
    pub fn verify_node(&self) -> bool {
        let hdr = self.hdr();
        hdr.magic == NODE_MAGIC
            && hdr.version == NODE_VERSION
            && hdr.checksum() == CRC16.checksum(self.data_area())
    }

    // ------------------------------------------------------------------
    // Latching
    // ------------------------------------------------------------------

    pub fn lock(&self, ltype: LockType) {
        match ltype {
            LockType::Read => self.latch.lock_shared(),
            LockType::Write => self.latch.lock_exclusive(),
            LockType::None => {}
        }
    }

    pub fn unlock(&self, ltype: LockType) {
        match ltype {
            // SAFETY: callers pair every unlock with a prior lock of the
            // same kind; the per-operation bookkeeping asserts this.
            LockType::Read => unsafe { self.latch.unlock_shared() },
            LockType::Write => unsafe { self.latch.unlock_exclusive() },
            LockType::None => {}
        }
    }

    /// Shared→exclusive upgrade. The upgrader count is visible through
    /// [`Node::any_upgrade_waiters`] so long readers can yield.
    pub fn lock_upgrade(&self) {
        self.upgraders.fetch_add(1, Ordering::AcqRel);
        // SAFETY: caller holds the shared latch.
        unsafe { self.latch.unlock_shared() };
        self.latch.lock_exclusive();
        self.upgraders.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn any_upgrade_waiters(&self) -> bool {
        self.upgraders.load(Ordering::Acquire) != 0
    }

    pub fn is_locked_exclusive(&self) -> bool {
        self.latch.is_locked_exclusive()
    }

    // ------------------------------------------------------------------
    // Search
    // ------------------------------------------------------------------

    /// Binary search for `key`. Returns whether an exact match exists and
    /// the index of the first entry whose key is >= `key`. For interior
    /// nodes an index equal to `total_entries()` refers to the edge.
    pub fn find<K: BtreeKey>(&self, key: &K) -> (bool, u32) {
        debug_assert_eq!(self.hdr().magic, NODE_MAGIC);
        self.bsearch(key)
    }

    fn bsearch<K: BtreeKey>(&self, key: &K) -> (bool, u32) {
        let mut start: i64 = -1;
        let mut end: i64 = self.total_entries() as i64;
        while end - start > 1 {
            let mid = start + (end - start) / 2;
            match self.compare_nth_key(key, mid as u32) {
                std::cmp::Ordering::Equal => return (true, mid as u32),
                std::cmp::Ordering::Less => end = mid,
                std::cmp::Ordering::Greater => start = mid,
            }
        }
        (false, end as u32)
    }

    /// Compares the `idx`-th stored key against `key`:
    /// `Less` when the stored key is greater (search should move left).
    pub fn compare_nth_key<K: BtreeKey>(&self, key: &K, idx: u32) -> std::cmp::Ordering {
        let stored = self.key_at::<K>(idx);
        key.cmp(&stored)
    }

    /// Maps a key range onto this node's entries. Returns inclusive
    /// `(start_idx, end_idx)` or `None` when the node contributes nothing.
    /// For an interior node the returned end index may equal
    /// `total_entries()`, meaning the edge child.
    pub fn match_range<K: BtreeKey>(&self, range: &crate::btree::key::KeyRange<K>) -> Option<(u32, u32)> {
        let (sfound, mut start_idx) = self.bsearch(&range.start);
        if sfound && !range.start_inclusive {
            start_idx += 1;
        }

        if start_idx == self.total_entries() {
            // Past the last entry; only an edge node still has a child here.
            if !self.is_leaf() && self.has_valid_edge() {
                return Some((start_idx, start_idx));
            }
            return None;
        }

        let (efound, mut end_idx) = self.bsearch(&range.end);
        if self.is_leaf() || (end_idx == self.total_entries() && !self.has_valid_edge()) {
            if !efound || !range.end_inclusive {
                if end_idx == 0 {
                    return None;
                }
                end_idx -= 1;
            }
            if start_idx > end_idx {
                return None;
            }
        }
        Some((start_idx, end_idx))
    }

    /// First entry matching `range` in binary-search order, if any. A weak
    /// contract: which match is returned is unspecified beyond this.
    pub fn get_any<K: BtreeKey>(&self, range: &crate::btree::key::KeyRange<K>) -> Option<u32> {
        let (found, mut idx) = self.bsearch(&range.start);
        if found && !range.start_inclusive {
            idx += 1;
        }
        if idx >= self.total_entries() {
            return None;
        }
        let key = self.key_at::<K>(idx);
        range.contains(&key).then_some(idx)
    }

    /// Debug check: keys strictly increasing, duplicates forbidden.
    pub fn validate_key_order<K: BtreeKey>(&self) -> bool {
        for i in 1..self.total_entries() {
            let prev = self.key_at::<K>(i - 1);
            let cur = self.key_at::<K>(i);
            if prev >= cur {
                return false;
            }
        }
        true
    }

    // ------------------------------------------------------------------
    // Occupancy
    // ------------------------------------------------------------------

    pub fn occupied_size(&self) -> u32 {
        self.node_data_size() - self.available_size()
    }

    pub fn is_merge_needed(&self, cfg: &crate::config::BtreeConfig) -> bool {
        self.occupied_size() < cfg.suggested_min_size()
    }

    // ------------------------------------------------------------------
    // Entry-codec dispatch
    //
    // The entry area layout is owned by the codec named in the header;
    // everything below fans out on `node_type`. See `fixed.rs` and
    // `varlen.rs` for the layouts.
    // ------------------------------------------------------------------

    /// Prepares the entry area for the key/value shape this node will hold.
    /// Must be called once on a freshly allocated node, before any entry op.
    pub fn init_entry_area<K: BtreeKey, V: BtreeValue>(&self) {
        match self.node_type() {
            NodeType::Fixed => self.fixed_init::<K, V>(),
            NodeType::VarLen => {}
        }
    }

    pub fn key_at<K: BtreeKey>(&self, idx: u32) -> K {
        K::deserialize(self.key_bytes(idx))
    }

    pub fn value_at<V: BtreeValue>(&self, idx: u32) -> V {
        V::deserialize(self.value_bytes(idx))
    }

    /// Serialized key bytes of the `idx`-th entry, borrowed from the node.
    pub fn key_bytes(&self, idx: u32) -> &[u8] {
        match self.node_type() {
            NodeType::Fixed => self.fixed_key_bytes(idx),
            NodeType::VarLen => self.var_key_bytes(idx),
        }
    }

    /// Serialized value bytes of the `idx`-th entry, borrowed from the node.
    pub fn value_bytes(&self, idx: u32) -> &[u8] {
        match self.node_type() {
            NodeType::Fixed => self.fixed_value_bytes(idx),
            NodeType::VarLen => self.var_value_bytes(idx),
        }
    }

    pub fn nth_key_size(&self, idx: u32) -> usize {
        self.key_bytes(idx).len()
    }

    pub fn nth_value_size(&self, idx: u32) -> usize {
        self.value_bytes(idx).len()
    }

    pub fn nth_obj_size(&self, idx: u32) -> usize {
        self.nth_key_size(idx) + self.nth_value_size(idx)
    }

    /// Bytes the `idx`-th entry costs inside the node, overhead included.
    pub fn entry_footprint(&self, idx: u32) -> usize {
        match self.node_type() {
            NodeType::Fixed => self.nth_obj_size(idx),
            NodeType::VarLen => self.nth_obj_size(idx) + crate::btree::varlen::VAR_SLOT_SIZE,
        }
    }

    pub fn insert_at<K: BtreeKey, V: BtreeValue>(
        &self,
        idx: u32,
        key: &K,
        val: &V,
    ) -> BtreeResult<()> {
        debug_assert!(idx <= self.total_entries());
        match self.node_type() {
            NodeType::Fixed => self.fixed_insert_at(idx, key, val),
            NodeType::VarLen => self.var_insert_at(idx, key, val),
        }
    }

    /// Insert by search position. Duplicate keys are forbidden at the index
    /// level; inserting an existing key is a caller bug.
    pub fn insert<K: BtreeKey, V: BtreeValue>(&self, key: &K, val: &V) -> BtreeResult<u32> {
        let (found, idx) = self.find(key);
        debug_assert!(!found, "duplicate key insert at {}", idx);
        self.insert_at(idx, key, val)?;
        Ok(idx)
    }

    /// Replaces the value of the `idx`-th entry, keeping its key.
    pub fn update_at<V: BtreeValue>(&self, idx: u32, val: &V) -> BtreeResult<()> {
        debug_assert!(idx < self.total_entries());
        match self.node_type() {
            NodeType::Fixed => self.fixed_update_at(idx, val),
            NodeType::VarLen => self.var_update_at(idx, val),
        }
    }

    /// Replaces both key and value of the `idx`-th entry (separator updates).
    pub fn update_kv_at<K: BtreeKey, V: BtreeValue>(
        &self,
        idx: u32,
        key: &K,
        val: &V,
    ) -> BtreeResult<()> {
        debug_assert!(idx < self.total_entries());
        self.remove_range(idx, idx);
        self.insert_at(idx, key, val)
    }

    /// Removes entries `[start_idx, end_idx]`, inclusive.
    pub fn remove_range(&self, start_idx: u32, end_idx: u32) {
        debug_assert!(start_idx <= end_idx && end_idx < self.total_entries());
        match self.node_type() {
            NodeType::Fixed => self.fixed_remove_range(start_idx, end_idx),
            NodeType::VarLen => self.var_remove_range(start_idx, end_idx),
        }
    }

    pub fn remove_at(&self, idx: u32) {
        self.remove_range(idx, idx);
    }

    pub fn remove_all(&self) {
        if self.total_entries() > 0 {
            self.remove_range(0, self.total_entries() - 1);
        }
    }

    pub fn available_size(&self) -> u32 {
        match self.node_type() {
            NodeType::Fixed => self.fixed_available_size(),
            NodeType::VarLen => self.var_available_size(),
        }
    }

    /// Whether an entry of the given serialized sizes fits.
    pub fn has_room_for(&self, key_size: usize, value_size: usize) -> bool {
        let footprint = match self.node_type() {
            NodeType::Fixed => key_size + value_size,
            NodeType::VarLen => key_size + value_size + crate::btree::varlen::VAR_SLOT_SIZE,
        };
        footprint <= self.available_size() as usize
    }

    /// Whether the put described by `put_type` can proceed without a split.
    pub fn has_room_for_put(
        &self,
        put_type: crate::btree::request::PutType,
        key_size: usize,
        value_size: usize,
    ) -> bool {
        use crate::btree::request::PutType;
        match put_type {
            PutType::UpdateOnly => match self.node_type() {
                // Fixed cells are replaced in place.
                NodeType::Fixed => true,
                NodeType::VarLen => self.has_room_for(0, value_size),
            },
            PutType::InsertOnly | PutType::Upsert | PutType::AppendIfExistsElseInsert => {
                self.has_room_for(key_size, value_size)
            }
        }
    }

    /// Number of entries starting at `start_idx` that fit within `size`
    /// bytes of footprint.
    pub fn num_entries_by_size(&self, start_idx: u32, size: u32) -> u32 {
        let mut used = 0usize;
        let mut n = 0u32;
        for idx in start_idx..self.total_entries() {
            used += self.entry_footprint(idx);
            if used > size as usize {
                break;
            }
            n += 1;
        }
        n
    }

    /// Moves the trailing `nentries` entries of this node to the front of
    /// `other`, preserving order. Returns the count moved.
    pub fn move_out_to_right_by_entries(&self, other: &Node, nentries: u32) -> u32 {
        let n = nentries.min(self.total_entries());
        if n == 0 {
            return 0;
        }
        let start = self.total_entries() - n;
        match self.node_type() {
            NodeType::Fixed => self.fixed_move_out(other, start),
            NodeType::VarLen => self.var_move_out(other, start),
        }
        n
    }

    /// Moves trailing entries totalling at most `size` bytes of footprint to
    /// the front of `other`. Returns the count moved.
    pub fn move_out_to_right_by_size(&self, other: &Node, size: u32) -> u32 {
        let mut used = 0usize;
        let mut n = 0u32;
        for idx in (0..self.total_entries()).rev() {
            used += self.entry_footprint(idx);
            if used > size as usize {
                break;
            }
            n += 1;
        }
        self.move_out_to_right_by_entries(other, n)
    }

    /// Appends `nentries` entries of `other` starting at `start_idx` to this
    /// node's end. The caller removes them from `other` afterwards. Returns
    /// the count copied.
    pub fn copy_by_entries(&self, other: &Node, start_idx: u32, nentries: u32) -> u32 {
        let n = nentries.min(other.total_entries().saturating_sub(start_idx));
        if n == 0 {
            return 0;
        }
        match self.node_type() {
            NodeType::Fixed => self.fixed_copy_from(other, start_idx, n),
            NodeType::VarLen => self.var_copy_from(other, start_idx, n),
        }
        n
    }

    /// Appends entries of `other` starting at `start_idx`, stopping before
    /// this node's footprint would exceed `size`. Returns the count copied.
    pub fn copy_by_size(&self, other: &Node, start_idx: u32, size: u32) -> u32 {
        let mut used = 0usize;
        let mut n = 0u32;
        for idx in start_idx..other.total_entries() {
            used += other.entry_footprint(idx);
            if used > size as usize {
                break;
            }
            n += 1;
        }
        self.copy_by_entries(other, start_idx, n)
    }

    /// One-line description for trace logs.
    pub fn summary(&self) -> String {
        format!(
            "node={} level={} leaf={} nentries={} gen={} link_version={} next={} edge={:?}",
            self.node_id(),
            self.level(),
            self.is_leaf(),
            self.total_entries(),
            self.node_gen(),
            self.link_version(),
            self.next_bnode(),
            self.edge_info()
        )
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.summary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::key::KeyRange;

    fn leaf_node() -> Node {
        let node = Node::alloc(512, 7, true, NodeType::Fixed, 0);
        node.init_entry_area::<u64, u64>();
        node
    }

    #[test]
    fn persistent_hdr_is_64_bytes() {
        assert_eq!(size_of::<PersistentHdr>(), NODE_HDR_SIZE);
    }

    #[test]
    fn alloc_initializes_header() {
        let node = leaf_node();
        assert_eq!(node.node_id(), 7);
        assert!(node.is_leaf());
        assert!(node.is_valid_node());
        assert_eq!(node.total_entries(), 0);
        assert_eq!(node.node_size(), 512);
        assert_eq!(node.next_bnode(), EMPTY_NODE_ID);
        assert!(!node.has_valid_edge());
    }

    #[test]
    fn load_rejects_bad_magic() {
        let node = leaf_node();
        let mut bytes = node.raw_bytes().to_vec();
        bytes[0] = 0x00;
        let err = Node::load(bytes.into_boxed_slice()).unwrap_err();
        assert!(err.to_string().contains("bad node header"));
    }

    #[test]
    fn persist_reload_round_trip() {
        let node = leaf_node();
        node.lock(LockType::Write);
        node.insert_at(0, &10u64, &100u64).unwrap();
        node.insert_at(1, &20u64, &200u64).unwrap();
        node.set_checksum();
        node.unlock(LockType::Write);

        let reloaded = Node::load(node.raw_bytes().to_vec().into_boxed_slice()).unwrap();
        assert!(reloaded.verify_node());
        assert_eq!(reloaded.raw_bytes(), node.raw_bytes());
        assert_eq!(reloaded.total_entries(), 2);
        assert_eq!(reloaded.key_at::<u64>(1), 20);
        assert_eq!(reloaded.value_at::<u64>(1), 200);
    }

    #[test]
    fn checksum_catches_data_corruption() {
        let node = leaf_node();
        node.lock(LockType::Write);
        node.insert_at(0, &1u64, &2u64).unwrap();
        node.set_checksum();
        node.unlock(LockType::Write);
        assert!(node.verify_node());

        let mut bytes = node.raw_bytes().to_vec();
        bytes[NODE_HDR_SIZE + 3] ^= 0xFF;
        let corrupted = Node::load(bytes.into_boxed_slice()).unwrap();
        assert!(!corrupted.verify_node());
    }

    #[test]
    fn gen_and_link_version_increment() {
        let node = leaf_node();
        node.lock(LockType::Write);
        node.inc_gen();
        node.inc_gen();
        node.inc_link_version();
        node.unlock(LockType::Write);
        assert_eq!(node.node_gen(), 2);
        assert_eq!(node.link_version(), 1);
        assert_eq!(node.link_info(), LinkInfo::new(7, 1));
    }

    #[test]
    fn edge_only_on_interior() {
        let interior = Node::alloc(512, 1, false, NodeType::Fixed, 1);
        interior.lock(LockType::Write);
        assert!(!interior.has_valid_edge());
        interior.set_edge_info(LinkInfo::new(9, 0));
        assert!(interior.has_valid_edge());
        interior.invalidate_edge();
        assert!(!interior.has_valid_edge());
        interior.unlock(LockType::Write);

        let leaf = leaf_node();
        leaf.lock(LockType::Write);
        leaf.set_edge_info(LinkInfo::new(9, 0));
        leaf.unlock(LockType::Write);
        assert!(!leaf.has_valid_edge());
    }

    #[test]
    fn find_returns_insertion_point() {
        let node = leaf_node();
        node.lock(LockType::Write);
        for (i, k) in [10u64, 20, 30].iter().enumerate() {
            node.insert_at(i as u32, k, &0u64).unwrap();
        }
        node.unlock(LockType::Write);

        assert_eq!(node.find(&10u64), (true, 0));
        assert_eq!(node.find(&15u64), (false, 1));
        assert_eq!(node.find(&30u64), (true, 2));
        assert_eq!(node.find(&31u64), (false, 3));
        assert_eq!(node.find(&5u64), (false, 0));
    }

    #[test]
    fn match_range_leaf_adjustments() {
        let node = leaf_node();
        node.lock(LockType::Write);
        for (i, k) in [10u64, 20, 30, 40].iter().enumerate() {
            node.insert_at(i as u32, k, &0u64).unwrap();
        }
        node.unlock(LockType::Write);

        assert_eq!(node.match_range(&KeyRange::inclusive(10u64, 30u64)), Some((0, 2)));
        assert_eq!(
            node.match_range(&KeyRange::new(10u64, false, 30u64, false)),
            Some((1, 1))
        );
        // Entirely below the first key.
        assert_eq!(node.match_range(&KeyRange::inclusive(1u64, 5u64)), None);
        // Between two keys, matching nothing.
        assert_eq!(node.match_range(&KeyRange::inclusive(21u64, 29u64)), None);
        // Past the last key.
        assert_eq!(node.match_range(&KeyRange::inclusive(41u64, 50u64)), None);
    }

    #[test]
    fn match_range_interior_edge() {
        let node = Node::alloc(512, 1, false, NodeType::Fixed, 1);
        node.init_entry_area::<u64, LinkInfo>();
        node.lock(LockType::Write);
        node.insert_at(0, &10u64, &LinkInfo::new(2, 0)).unwrap();
        node.set_edge_info(LinkInfo::new(3, 0));
        node.unlock(LockType::Write);

        // Keys past the last separator route to the edge.
        assert_eq!(node.match_range(&KeyRange::inclusive(50u64, 60u64)), Some((1, 1)));
        // A range straddling the separator covers slot and edge.
        assert_eq!(node.match_range(&KeyRange::inclusive(5u64, 60u64)), Some((0, 1)));
    }

    #[test]
    fn get_any_first_match_in_search_order() {
        let node = leaf_node();
        node.lock(LockType::Write);
        for (i, k) in [10u64, 20, 30].iter().enumerate() {
            node.insert_at(i as u32, k, &0u64).unwrap();
        }
        node.unlock(LockType::Write);

        assert_eq!(node.get_any(&KeyRange::inclusive(15u64, 35u64)), Some(1));
        assert_eq!(node.get_any(&KeyRange::new(20u64, false, 35u64, true)), Some(2));
        assert_eq!(node.get_any(&KeyRange::inclusive(31u64, 35u64)), None);
    }

    #[test]
    fn upgrade_waiters_visible() {
        let node = Arc::new(leaf_node());
        node.lock(LockType::Read);
        assert!(!node.any_upgrade_waiters());
        node.lock_upgrade();
        assert!(node.is_locked_exclusive());
        node.unlock(LockType::Write);
    }
}
