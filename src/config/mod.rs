//! # Configuration Module
//!
//! This module centralizes the tuning knobs for the engine. Constants and
//! config structs are grouped by their functional area and interdependencies
//! are documented next to the values they constrain.
//!
//! ## Dependency Graph
//!
//! ```text
//! DEFAULT_NODE_SIZE (4096 bytes)
//!       │
//!       ├─> NODE_HDR_SIZE (64 bytes, fixed persistent header)
//!       │
//!       ├─> node_data_size (derived: node_size - NODE_HDR_SIZE)
//!       │
//!       ├─> ideal_fill_size (derived: node_data_size * ideal_fill_pct / 100)
//!       │     Split targets this occupancy for the node that keeps the
//!       │     lower half of the entries.
//!       │
//!       └─> suggested_min_size (derived: node_data_size * min_fill_pct / 100)
//!             A node below this occupancy is a merge candidate.
//!
//! MAX_MERGE_NODES (3)
//!       │
//!       └─> Upper bound on the sibling window latched during a merge.
//!           Every node in the window is WRITE-latched at once, so this
//!           also bounds per-operation latch fan-out.
//!
//! MAX_OP_RETRIES (8)
//!       │
//!       └─> Restart budget for descents that observe a structural race
//!           (stale link version, lost upgrade). Past the budget the
//!           operation surfaces OperationAborted.
//! ```

pub mod constants;
pub use constants::*;

/// Configuration for a B-tree instance.
///
/// Constructed once and shared by the tree and its node store. All derived
/// sizes are computed from `node_size`, which must match the size the node
/// store allocates.
#[derive(Debug, Clone, Copy)]
pub struct BtreeConfig {
    /// Size of a node buffer in bytes, header included.
    pub node_size: u32,
    /// Percentage of the data area a split tries to leave in the left node.
    pub ideal_fill_pct: u8,
    /// Occupancy percentage below which a node becomes a merge candidate.
    pub min_fill_pct: u8,
    /// Maximum number of adjacent siblings latched together during a merge.
    pub max_merge_nodes: u32,
    /// Restart budget for descents that hit a structural race.
    pub max_retries: u32,
}

impl Default for BtreeConfig {
    fn default() -> Self {
        Self {
            node_size: DEFAULT_NODE_SIZE,
            ideal_fill_pct: 90,
            min_fill_pct: 40,
            max_merge_nodes: MAX_MERGE_NODES,
            max_retries: MAX_OP_RETRIES,
        }
    }
}

impl BtreeConfig {
    pub fn with_node_size(node_size: u32) -> Self {
        Self {
            node_size,
            ..Self::default()
        }
    }

    #[inline]
    pub fn node_data_size(&self) -> u32 {
        self.node_size - NODE_HDR_SIZE as u32
    }

    #[inline]
    pub fn ideal_fill_size(&self) -> u32 {
        self.node_data_size() * self.ideal_fill_pct as u32 / 100
    }

    #[inline]
    pub fn suggested_min_size(&self) -> u32 {
        self.node_data_size() * self.min_fill_pct as u32 / 100
    }
}

/// Configuration for the log-store layer.
#[derive(Debug, Clone, Copy)]
pub struct LogStoreConfig {
    /// Number of appends the in-memory log device groups into one flush
    /// batch before delivering completions.
    pub flush_batch_size: usize,
}

impl Default for LogStoreConfig {
    fn default() -> Self {
        Self {
            flush_batch_size: DEFAULT_FLUSH_BATCH_SIZE,
        }
    }
}

impl LogStoreConfig {
    /// Profile that favors throughput over completion latency.
    pub fn high_throughput() -> Self {
        Self {
            flush_batch_size: 256,
        }
    }

    /// Profile that delivers completions after every append.
    pub fn low_latency() -> Self {
        Self {
            flush_batch_size: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn btree_config_derived_sizes() {
        let cfg = BtreeConfig::default();
        assert_eq!(cfg.node_data_size(), DEFAULT_NODE_SIZE - 64);
        assert_eq!(cfg.ideal_fill_size(), cfg.node_data_size() * 90 / 100);
        assert_eq!(cfg.suggested_min_size(), cfg.node_data_size() * 40 / 100);
    }

    #[test]
    fn btree_config_small_nodes() {
        let cfg = BtreeConfig::with_node_size(512);
        assert_eq!(cfg.node_data_size(), 448);
        assert!(cfg.suggested_min_size() < cfg.ideal_fill_size());
    }

    #[test]
    fn logstore_config_profiles() {
        assert_eq!(LogStoreConfig::default().flush_batch_size, 64);
        assert_eq!(LogStoreConfig::low_latency().flush_batch_size, 1);
        assert!(LogStoreConfig::high_throughput().flush_batch_size > 64);
    }
}
