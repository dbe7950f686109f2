//! # Var-Length Entry Codec
//!
//! Entry layout for nodes holding keys or values without a fixed serialized
//! size (`node_type = VarLen`). A slot array grows down from the start of
//! the data area while cell content grows up from its end, the same shape
//! the slot-array leaf pages use elsewhere in this family of engines.
//!
//! ## Entry Area Layout
//!
//! ```text
//! +------------------------+
//! | Slot 0 (6B)            |  offset: u16  (cell start, relative to area)
//! | Slot 1 (6B)            |  key_len: u16
//! | ...                    |  val_len: u16
//! +------------------------+
//! | Free Space             |
//! +------------------------+
//! | Cell Content           |  key bytes | value bytes, grows upward
//! +------------------------+
//! ```
//!
//! Slots are kept in key order; cells sit wherever the heap cursor was at
//! insert time. Removal rebuilds the cell heap, so free space is always
//! contiguous and `available_size` needs no fragmentation accounting.

use smallvec::SmallVec;

use crate::btree::error::{BtreeError, BtreeResult};
use crate::btree::key::{BtreeKey, BtreeValue};
use crate::btree::node::Node;

/// Per-entry slot overhead in bytes.
pub const VAR_SLOT_SIZE: usize = 6;

impl Node {
    #[inline]
    fn var_slot(&self, idx: u32) -> (usize, usize, usize) {
        let base = idx as usize * VAR_SLOT_SIZE;
        let area = self.data_area();
        let offset = u16::from_le_bytes([area[base], area[base + 1]]) as usize;
        let klen = u16::from_le_bytes([area[base + 2], area[base + 3]]) as usize;
        let vlen = u16::from_le_bytes([area[base + 4], area[base + 5]]) as usize;
        (offset, klen, vlen)
    }

    fn var_write_slot(&self, idx: u32, offset: usize, klen: usize, vlen: usize) {
        let base = idx as usize * VAR_SLOT_SIZE;
        let area = self.data_area_mut();
        area[base..base + 2].copy_from_slice(&(offset as u16).to_le_bytes());
        area[base + 2..base + 4].copy_from_slice(&(klen as u16).to_le_bytes());
        area[base + 4..base + 6].copy_from_slice(&(vlen as u16).to_le_bytes());
    }

    /// Lowest cell offset; the boundary the slot array may grow up to.
    fn var_heap_top(&self) -> usize {
        let mut top = self.node_data_size() as usize;
        for idx in 0..self.total_entries() {
            let (offset, _, _) = self.var_slot(idx);
            top = top.min(offset);
        }
        top
    }

    pub(crate) fn var_available_size(&self) -> u32 {
        (self.var_heap_top() - self.total_entries() as usize * VAR_SLOT_SIZE) as u32
    }

    pub(crate) fn var_key_bytes(&self, idx: u32) -> &[u8] {
        debug_assert!(idx < self.total_entries());
        let (offset, klen, _) = self.var_slot(idx);
        &self.data_area()[offset..offset + klen]
    }

    pub(crate) fn var_value_bytes(&self, idx: u32) -> &[u8] {
        debug_assert!(idx < self.total_entries());
        let (offset, klen, vlen) = self.var_slot(idx);
        &self.data_area()[offset + klen..offset + klen + vlen]
    }

    pub(crate) fn var_insert_at<K: BtreeKey, V: BtreeValue>(
        &self,
        idx: u32,
        key: &K,
        val: &V,
    ) -> BtreeResult<()> {
        let mut kbuf: SmallVec<[u8; 64]> = SmallVec::new();
        kbuf.resize(key.serialized_size(), 0);
        key.serialize_into(&mut kbuf);

        let mut vbuf: SmallVec<[u8; 64]> = SmallVec::new();
        vbuf.resize(val.serialized_size(), 0);
        val.serialize_into(&mut vbuf);

        self.var_insert_raw(idx, &kbuf, &vbuf)
    }

    fn var_insert_raw(&self, idx: u32, key: &[u8], val: &[u8]) -> BtreeResult<()> {
        let needed = key.len() + val.len() + VAR_SLOT_SIZE;
        if (self.var_available_size() as usize) < needed {
            return Err(BtreeError::SpaceNotAvail);
        }

        let n = self.total_entries();
        let cell_start = self.var_heap_top() - key.len() - val.len();
        {
            let area = self.data_area_mut();
            area[cell_start..cell_start + key.len()].copy_from_slice(key);
            area[cell_start + key.len()..cell_start + key.len() + val.len()]
                .copy_from_slice(val);
            // Shift slots at and after idx right by one.
            let slot_base = idx as usize * VAR_SLOT_SIZE;
            let slot_end = n as usize * VAR_SLOT_SIZE;
            area.copy_within(slot_base..slot_end, slot_base + VAR_SLOT_SIZE);
        }
        self.var_write_slot(idx, cell_start, key.len(), val.len());
        self.add_entries(1);
        Ok(())
    }

    /// Appends without slot shifting; the caller guarantees key order.
    fn var_append_raw(&self, key: &[u8], val: &[u8]) -> BtreeResult<()> {
        self.var_insert_raw(self.total_entries(), key, val)
    }

    pub(crate) fn var_update_at<V: BtreeValue>(&self, idx: u32, val: &V) -> BtreeResult<()> {
        let mut vbuf: SmallVec<[u8; 64]> = SmallVec::new();
        vbuf.resize(val.serialized_size(), 0);
        val.serialize_into(&mut vbuf);

        let (offset, klen, vlen) = self.var_slot(idx);
        if vbuf.len() == vlen {
            self.data_area_mut()[offset + klen..offset + klen + vlen].copy_from_slice(&vbuf);
            return Ok(());
        }

        // Size changed; rebuild the heap with the replacement in place.
        let growth = vbuf.len().saturating_sub(vlen);
        if (self.var_available_size() as usize) < growth {
            return Err(BtreeError::SpaceNotAvail);
        }
        let mut entries = self.var_collect(0, self.total_entries());
        entries[idx as usize].1 = vbuf.to_vec();
        self.var_rebuild(&entries);
        Ok(())
    }

    pub(crate) fn var_remove_range(&self, start_idx: u32, end_idx: u32) {
        let mut entries = self.var_collect(0, start_idx);
        entries.extend(self.var_collect(end_idx + 1, self.total_entries()));
        self.var_rebuild(&entries);
    }

    /// Moves entries `[start_idx, nentries)` to the front of `other`.
    pub(crate) fn var_move_out(&self, other: &Node, start_idx: u32) {
        let mut moved = self.var_collect(start_idx, self.total_entries());
        moved.extend(other.var_collect(0, other.total_entries()));
        other.var_rebuild(&moved);

        let kept = self.var_collect(0, start_idx);
        self.var_rebuild(&kept);
    }

    /// Appends `n` entries of `other` starting at `start_idx`.
    pub(crate) fn var_copy_from(&self, other: &Node, start_idx: u32, n: u32) {
        for idx in start_idx..start_idx + n {
            let (_, klen, vlen) = other.var_slot(idx);
            debug_assert!(self.var_available_size() as usize >= klen + vlen + VAR_SLOT_SIZE);
            self.var_append_raw(other.var_key_bytes(idx), other.var_value_bytes(idx))
                .expect("capacity checked by caller");
        }
    }

    fn var_collect(&self, start_idx: u32, end_idx: u32) -> Vec<(Vec<u8>, Vec<u8>)> {
        (start_idx..end_idx)
            .map(|idx| {
                (
                    self.var_key_bytes(idx).to_vec(),
                    self.var_value_bytes(idx).to_vec(),
                )
            })
            .collect()
    }

    fn var_rebuild(&self, entries: &[(Vec<u8>, Vec<u8>)]) {
        self.set_total_entries(0);
        for (key, val) in entries {
            self.var_append_raw(key, val)
                .expect("rebuild never exceeds prior occupancy");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::node::{LockType, NodeType};

    fn make_node(id: u64) -> Node {
        let node = Node::alloc(512, id, true, NodeType::VarLen, 0);
        node.init_entry_area::<Vec<u8>, Vec<u8>>();
        node
    }

    fn fill(node: &Node, pairs: &[(&str, &str)]) {
        node.lock(LockType::Write);
        for (k, v) in pairs {
            node.insert(&k.as_bytes().to_vec(), &v.as_bytes().to_vec())
                .unwrap();
        }
        node.unlock(LockType::Write);
    }

    #[test]
    fn insert_mixed_sizes_keeps_order() {
        let node = make_node(1);
        fill(&node, &[("delta", "4444"), ("a", "1"), ("charlie", "33")]);

        assert_eq!(node.total_entries(), 3);
        assert_eq!(node.key_bytes(0), b"a");
        assert_eq!(node.key_bytes(1), b"charlie");
        assert_eq!(node.key_bytes(2), b"delta");
        assert_eq!(node.value_bytes(1), b"33");
        assert!(node.validate_key_order::<Vec<u8>>());
    }

    #[test]
    fn available_size_tracks_slots_and_cells() {
        let node = make_node(1);
        let before = node.available_size();
        fill(&node, &[("key", "value")]);
        let after = node.available_size();
        assert_eq!(before - after, (3 + 5 + VAR_SLOT_SIZE) as u32);
    }

    #[test]
    fn remove_range_compacts_heap() {
        let node = make_node(1);
        fill(&node, &[("a", "1"), ("b", "22"), ("c", "333"), ("d", "4")]);
        let full = node.available_size();

        node.lock(LockType::Write);
        node.remove_range(1, 2);
        node.unlock(LockType::Write);

        assert_eq!(node.total_entries(), 2);
        assert_eq!(node.key_bytes(0), b"a");
        assert_eq!(node.key_bytes(1), b"d");
        // Heap was compacted: the freed bytes are reusable.
        assert_eq!(
            node.available_size() - full,
            (1 + 2 + 1 + 3 + 2 * VAR_SLOT_SIZE) as u32
        );
    }

    #[test]
    fn update_at_same_size_in_place() {
        let node = make_node(1);
        fill(&node, &[("k", "abc")]);
        node.lock(LockType::Write);
        node.update_at(0, &b"xyz".to_vec()).unwrap();
        node.unlock(LockType::Write);
        assert_eq!(node.value_bytes(0), b"xyz");
    }

    #[test]
    fn update_at_grown_value_rebuilds() {
        let node = make_node(1);
        fill(&node, &[("k", "s"), ("m", "t")]);
        node.lock(LockType::Write);
        node.update_at(0, &b"longer-value".to_vec()).unwrap();
        node.unlock(LockType::Write);
        assert_eq!(node.value_bytes(0), b"longer-value");
        assert_eq!(node.value_bytes(1), b"t");
        assert!(node.validate_key_order::<Vec<u8>>());
    }

    #[test]
    fn move_out_prepends_to_other() {
        let left = make_node(1);
        let right = make_node(2);
        fill(&left, &[("a", "1"), ("b", "2"), ("c", "3"), ("d", "4")]);
        fill(&right, &[("x", "9")]);

        left.lock(LockType::Write);
        right.lock(LockType::Write);
        let moved = left.move_out_to_right_by_entries(&right, 2);
        left.unlock(LockType::Write);
        right.unlock(LockType::Write);

        assert_eq!(moved, 2);
        assert_eq!(left.total_entries(), 2);
        assert_eq!(right.total_entries(), 3);
        assert_eq!(right.key_bytes(0), b"c");
        assert_eq!(right.key_bytes(1), b"d");
        assert_eq!(right.key_bytes(2), b"x");
    }

    #[test]
    fn insert_reports_space_exhaustion() {
        let node = make_node(1);
        node.lock(LockType::Write);
        let big = vec![0xAAu8; 100];
        let mut err = None;
        for k in 0..20u8 {
            let key = vec![b'k', k];
            if let Err(e) = node.insert(&key, &big) {
                err = Some(e);
                break;
            }
        }
        node.unlock(LockType::Write);
        assert_eq!(err, Some(BtreeError::SpaceNotAvail));
    }
}
