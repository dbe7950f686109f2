//! # Key/Value Contracts
//!
//! The engine is generic over an opaque key/value contract: anything that can
//! report its serialized size, write itself into a node buffer, and read
//! itself back can be indexed. Ordering always uses the deserialized key's
//! `Ord`, never the byte encoding, so encodings do not need to be
//! order-preserving.
//!
//! Interior nodes store [`LinkInfo`] values: the child node id plus the link
//! version of the parent→child edge. The link version increments whenever the
//! structural relationship changes, which lets a descent detect that the
//! parent entry it followed is stale without holding the parent's latch.

use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Opaque 64-bit node identifier.
pub type NodeId = u64;

/// Sentinel marking "no link" (empty edge, end of leaf chain).
pub const EMPTY_NODE_ID: NodeId = u64::MAX;

/// Key contract the engine is generic over.
pub trait BtreeKey:
    Clone + Ord + Default + std::fmt::Debug + Send + Sync + 'static
{
    /// `Some(n)` when every key of this type serializes to exactly `n`
    /// bytes; nodes holding such keys can use the fixed-cell codec.
    const FIXED_SIZE: Option<usize>;

    fn serialized_size(&self) -> usize;
    fn serialize_into(&self, out: &mut [u8]);
    fn deserialize(bytes: &[u8]) -> Self;
}

/// Value contract the engine is generic over.
pub trait BtreeValue: Clone + Default + std::fmt::Debug + Send + Sync + 'static {
    /// `Some(n)` when every value of this type serializes to exactly `n`
    /// bytes.
    const FIXED_SIZE: Option<usize>;

    fn serialized_size(&self) -> usize;
    fn serialize_into(&self, out: &mut [u8]);
    fn deserialize(bytes: &[u8]) -> Self;

    /// Concatenation used by the append-if-exists put mode and by extent
    /// auto-merge. `None` means the type does not define concatenation and
    /// the put fails with `FastPathNotPossible`.
    fn append(&self, _other: &Self) -> Option<Self> {
        None
    }
}

/// Parent→child edge descriptor: child node id plus the version of the edge.
///
/// Serialized as two little-endian u64s; this is the value type of every
/// interior node and of the header's edge slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkInfo {
    pub node_id: NodeId,
    pub link_version: u64,
}

/// On-disk form of [`LinkInfo`].
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct RawLinkInfo {
    node_id: U64,
    link_version: U64,
}

pub const LINK_INFO_SIZE: usize = 16;

impl LinkInfo {
    pub fn new(node_id: NodeId, link_version: u64) -> Self {
        Self {
            node_id,
            link_version,
        }
    }

    pub fn empty() -> Self {
        Self {
            node_id: EMPTY_NODE_ID,
            link_version: 0,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.node_id == EMPTY_NODE_ID
    }
}

impl BtreeValue for LinkInfo {
    const FIXED_SIZE: Option<usize> = Some(LINK_INFO_SIZE);

    fn serialized_size(&self) -> usize {
        LINK_INFO_SIZE
    }

    fn serialize_into(&self, out: &mut [u8]) {
        let raw = RawLinkInfo {
            node_id: U64::new(self.node_id),
            link_version: U64::new(self.link_version),
        };
        out[..LINK_INFO_SIZE].copy_from_slice(raw.as_bytes());
    }

    fn deserialize(bytes: &[u8]) -> Self {
        let raw = RawLinkInfo::read_from_bytes(&bytes[..LINK_INFO_SIZE])
            .expect("link info is 16 bytes");
        Self {
            node_id: raw.node_id.get(),
            link_version: raw.link_version.get(),
        }
    }
}

impl BtreeKey for u64 {
    const FIXED_SIZE: Option<usize> = Some(8);

    fn serialized_size(&self) -> usize {
        8
    }

    fn serialize_into(&self, out: &mut [u8]) {
        out[..8].copy_from_slice(&self.to_le_bytes());
    }

    fn deserialize(bytes: &[u8]) -> Self {
        u64::from_le_bytes(bytes[..8].try_into().expect("u64 key is 8 bytes"))
    }
}

impl BtreeValue for u64 {
    const FIXED_SIZE: Option<usize> = Some(8);

    fn serialized_size(&self) -> usize {
        8
    }

    fn serialize_into(&self, out: &mut [u8]) {
        out[..8].copy_from_slice(&self.to_le_bytes());
    }

    fn deserialize(bytes: &[u8]) -> Self {
        u64::from_le_bytes(bytes[..8].try_into().expect("u64 value is 8 bytes"))
    }
}

impl BtreeKey for Vec<u8> {
    const FIXED_SIZE: Option<usize> = None;

    fn serialized_size(&self) -> usize {
        self.len()
    }

    fn serialize_into(&self, out: &mut [u8]) {
        out[..self.len()].copy_from_slice(self);
    }

    fn deserialize(bytes: &[u8]) -> Self {
        bytes.to_vec()
    }
}

impl BtreeValue for Vec<u8> {
    const FIXED_SIZE: Option<usize> = None;

    fn serialized_size(&self) -> usize {
        self.len()
    }

    fn serialize_into(&self, out: &mut [u8]) {
        out[..self.len()].copy_from_slice(self);
    }

    fn deserialize(bytes: &[u8]) -> Self {
        bytes.to_vec()
    }

    fn append(&self, other: &Self) -> Option<Self> {
        let mut joined = self.clone();
        joined.extend_from_slice(other);
        Some(joined)
    }
}

/// A key range with independently inclusive or exclusive ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange<K> {
    pub start: K,
    pub start_inclusive: bool,
    pub end: K,
    pub end_inclusive: bool,
}

impl<K: BtreeKey> KeyRange<K> {
    pub fn new(start: K, start_inclusive: bool, end: K, end_inclusive: bool) -> Self {
        Self {
            start,
            start_inclusive,
            end,
            end_inclusive,
        }
    }

    /// The closed range `[start, end]`.
    pub fn inclusive(start: K, end: K) -> Self {
        Self::new(start, true, end, true)
    }

    pub fn contains(&self, key: &K) -> bool {
        let above = match key.cmp(&self.start) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Equal => self.start_inclusive,
            std::cmp::Ordering::Less => false,
        };
        let below = match key.cmp(&self.end) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Equal => self.end_inclusive,
            std::cmp::Ordering::Greater => false,
        };
        above && below
    }

    /// Advances the range start past `key`, for cursor-style re-entry.
    pub fn advance_past(&mut self, key: &K) {
        self.start = key.clone();
        self.start_inclusive = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_info_round_trip() {
        let li = LinkInfo::new(77, 3);
        let mut buf = [0u8; LINK_INFO_SIZE];
        li.serialize_into(&mut buf);
        assert_eq!(LinkInfo::deserialize(&buf), li);
    }

    #[test]
    fn link_info_empty_sentinel() {
        assert!(LinkInfo::empty().is_empty());
        assert!(!LinkInfo::new(0, 0).is_empty());
    }

    #[test]
    fn u64_key_round_trip() {
        let mut buf = [0u8; 8];
        <u64 as BtreeKey>::serialize_into(&42u64, &mut buf);
        assert_eq!(<u64 as BtreeKey>::deserialize(&buf), 42);
    }

    #[test]
    fn byte_value_append() {
        let a = b"abc".to_vec();
        let b = b"def".to_vec();
        assert_eq!(a.append(&b), Some(b"abcdef".to_vec()));
    }

    #[test]
    fn range_contains_respects_bounds() {
        let r = KeyRange::new(10u64, false, 20u64, true);
        assert!(!r.contains(&10));
        assert!(r.contains(&11));
        assert!(r.contains(&20));
        assert!(!r.contains(&21));
    }

    #[test]
    fn range_advance_past_excludes_key() {
        let mut r = KeyRange::inclusive(0u64, 100u64);
        r.advance_past(&50);
        assert!(!r.contains(&50));
        assert!(r.contains(&51));
    }
}
