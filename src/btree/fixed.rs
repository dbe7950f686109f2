//! # Fixed-Cell Entry Codec
//!
//! Entry layout for nodes whose keys and values both serialize to a fixed
//! number of bytes (`node_type = Fixed`). Cells are stored back to back at
//! computed offsets, so there is no slot indirection and no fragmentation.
//!
//! ## Entry Area Layout
//!
//! ```text
//! +-----------------------------+
//! | key_size:  u16 LE           |  Codec prelude (4 bytes), written once
//! | val_size:  u16 LE           |  by init and checksummed with the data
//! +-----------------------------+
//! | cell 0: key | value         |  cell i at 4 + i * (key_size + val_size)
//! | cell 1: key | value         |
//! | ...                         |
//! +-----------------------------+
//! | free                        |
//! +-----------------------------+
//! ```
//!
//! Interior nodes with fixed-size keys always use this codec; their value is
//! the 16-byte link info.

use zerocopy::little_endian::U16;
use zerocopy::IntoBytes;

use crate::btree::error::{BtreeError, BtreeResult};
use crate::btree::key::{BtreeKey, BtreeValue};
use crate::btree::node::Node;

/// Bytes of codec prelude ahead of the first cell.
pub const FIXED_PRELUDE_SIZE: usize = 4;

impl Node {
    pub(crate) fn fixed_init<K: BtreeKey, V: BtreeValue>(&self) {
        let ks = K::FIXED_SIZE.expect("fixed codec requires fixed-size keys");
        let vs = V::FIXED_SIZE.expect("fixed codec requires fixed-size values");
        let area = self.data_area_mut();
        area[0..2].copy_from_slice(U16::new(ks as u16).as_bytes());
        area[2..4].copy_from_slice(U16::new(vs as u16).as_bytes());
    }

    #[inline]
    fn fixed_key_size(&self) -> usize {
        let area = self.data_area();
        u16::from_le_bytes([area[0], area[1]]) as usize
    }

    #[inline]
    fn fixed_val_size(&self) -> usize {
        let area = self.data_area();
        u16::from_le_bytes([area[2], area[3]]) as usize
    }

    #[inline]
    fn fixed_cell_size(&self) -> usize {
        self.fixed_key_size() + self.fixed_val_size()
    }

    #[inline]
    fn fixed_cell_offset(&self, idx: u32) -> usize {
        FIXED_PRELUDE_SIZE + idx as usize * self.fixed_cell_size()
    }

    pub(crate) fn fixed_key_bytes(&self, idx: u32) -> &[u8] {
        debug_assert!(idx < self.total_entries());
        let off = self.fixed_cell_offset(idx);
        &self.data_area()[off..off + self.fixed_key_size()]
    }

    pub(crate) fn fixed_value_bytes(&self, idx: u32) -> &[u8] {
        debug_assert!(idx < self.total_entries());
        let off = self.fixed_cell_offset(idx) + self.fixed_key_size();
        &self.data_area()[off..off + self.fixed_val_size()]
    }

    pub(crate) fn fixed_available_size(&self) -> u32 {
        let used = FIXED_PRELUDE_SIZE + self.total_entries() as usize * self.fixed_cell_size();
        self.node_data_size() - used as u32
    }

    pub(crate) fn fixed_insert_at<K: BtreeKey, V: BtreeValue>(
        &self,
        idx: u32,
        key: &K,
        val: &V,
    ) -> BtreeResult<()> {
        let ks = self.fixed_key_size();
        let vs = self.fixed_val_size();
        debug_assert_eq!(key.serialized_size(), ks);
        debug_assert_eq!(val.serialized_size(), vs);

        let cell = ks + vs;
        if (self.fixed_available_size() as usize) < cell {
            return Err(BtreeError::SpaceNotAvail);
        }

        let n = self.total_entries() as usize;
        let off = self.fixed_cell_offset(idx);
        let area = self.data_area_mut();

        // Shift cells at and after idx right by one cell.
        let tail_end = FIXED_PRELUDE_SIZE + n * cell;
        area.copy_within(off..tail_end, off + cell);

        key.serialize_into(&mut area[off..off + ks]);
        val.serialize_into(&mut area[off + ks..off + cell]);
        self.add_entries(1);
        Ok(())
    }

    pub(crate) fn fixed_update_at<V: BtreeValue>(&self, idx: u32, val: &V) -> BtreeResult<()> {
        let ks = self.fixed_key_size();
        let vs = self.fixed_val_size();
        debug_assert_eq!(val.serialized_size(), vs);
        let off = self.fixed_cell_offset(idx) + ks;
        val.serialize_into(&mut self.data_area_mut()[off..off + vs]);
        Ok(())
    }

    pub(crate) fn fixed_remove_range(&self, start_idx: u32, end_idx: u32) {
        let cell = self.fixed_cell_size();
        let n = self.total_entries() as usize;
        let removed = (end_idx - start_idx + 1) as usize;

        let dst = self.fixed_cell_offset(start_idx);
        let src = self.fixed_cell_offset(end_idx + 1);
        let tail_end = FIXED_PRELUDE_SIZE + n * cell;
        self.data_area_mut().copy_within(src..tail_end, dst);
        self.sub_entries(removed as u32);
    }

    /// Moves entries `[start_idx, nentries)` to the front of `other`.
    pub(crate) fn fixed_move_out(&self, other: &Node, start_idx: u32) {
        let cell = self.fixed_cell_size();
        let n = self.total_entries();
        let moved = (n - start_idx) as usize;

        debug_assert_eq!(other.fixed_cell_size(), cell);
        let src_start = self.fixed_cell_offset(start_idx);
        let src_end = self.fixed_cell_offset(n);

        {
            let other_n = other.total_entries() as usize;
            let dst = other.data_area_mut();
            // Make room at the front of other.
            dst.copy_within(
                FIXED_PRELUDE_SIZE..FIXED_PRELUDE_SIZE + other_n * cell,
                FIXED_PRELUDE_SIZE + moved * cell,
            );
            dst[FIXED_PRELUDE_SIZE..FIXED_PRELUDE_SIZE + moved * cell]
                .copy_from_slice(&self.data_area()[src_start..src_end]);
        }
        other.add_entries(moved as u32);
        self.sub_entries(moved as u32);
    }

    /// Appends `n` entries of `other` starting at `start_idx` to this node.
    pub(crate) fn fixed_copy_from(&self, other: &Node, start_idx: u32, n: u32) {
        let cell = self.fixed_cell_size();
        debug_assert_eq!(other.fixed_cell_size(), cell);
        debug_assert!(self.fixed_available_size() as usize >= n as usize * cell);

        let src_start = other.fixed_cell_offset(start_idx);
        let src_end = other.fixed_cell_offset(start_idx + n);
        let dst_start = self.fixed_cell_offset(self.total_entries());
        self.data_area_mut()[dst_start..dst_start + (src_end - src_start)]
            .copy_from_slice(&other.data_area()[src_start..src_end]);
        self.add_entries(n);
    }
}
