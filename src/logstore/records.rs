//! # Sparse Log Record Map
//!
//! Each log store tracks its in-flight and completed records in a sparse,
//! chunked array indexed by sequence number. Chunks hold a fixed number of
//! slots; truncation drops whole chunks below the floor in one step and
//! clears the straddling chunk slot by slot, which keeps the reap cost
//! proportional to the chunk count rather than the record count.

use hashbrown::HashMap;

use crate::config::LOG_RECORD_CHUNK;
use crate::logstore::logdev::{LogDevKey, LogStoreSeqNum};

/// Lifecycle of a tracked record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// Reserved at append submission; the device has not confirmed it yet.
    Reserved,
    /// Flush confirmed; the ld_key is final.
    Completed,
    /// Reaped by truncation.
    Truncated,
}

#[derive(Debug, Clone, Copy)]
pub struct LogRecord {
    pub ld_key: LogDevKey,
    pub state: RecordState,
}

impl LogRecord {
    fn reserved() -> Self {
        Self {
            ld_key: LogDevKey::invalid(),
            state: RecordState::Reserved,
        }
    }

    #[inline]
    pub fn is_completed(&self) -> bool {
        self.state == RecordState::Completed
    }
}

type Chunk = Box<[Option<LogRecord>; LOG_RECORD_CHUNK]>;

/// Sparse seq_num → record map with prefix truncation.
pub struct LogRecords {
    chunks: HashMap<i64, Chunk>,
    /// Every seq at or below this is reaped.
    truncate_floor: i64,
}

impl Default for LogRecords {
    fn default() -> Self {
        Self::new()
    }
}

impl LogRecords {
    pub fn new() -> Self {
        Self {
            chunks: HashMap::new(),
            truncate_floor: -1,
        }
    }

    #[inline]
    fn chunk_of(seq: LogStoreSeqNum) -> (i64, usize) {
        (
            seq.div_euclid(LOG_RECORD_CHUNK as i64),
            seq.rem_euclid(LOG_RECORD_CHUNK as i64) as usize,
        )
    }

    fn slot_mut(&mut self, seq: LogStoreSeqNum) -> &mut Option<LogRecord> {
        let (chunk_no, slot) = Self::chunk_of(seq);
        let chunk = self
            .chunks
            .entry(chunk_no)
            .or_insert_with(|| Box::new([None; LOG_RECORD_CHUNK]));
        &mut chunk[slot]
    }

    /// Reserves a slot at append submission.
    pub fn create(&mut self, seq: LogStoreSeqNum) {
        debug_assert!(seq > self.truncate_floor, "create below truncation floor");
        *self.slot_mut(seq) = Some(LogRecord::reserved());
    }

    /// Creates an already-completed record (recovery path).
    pub fn create_and_complete(&mut self, seq: LogStoreSeqNum, ld_key: LogDevKey) {
        *self.slot_mut(seq) = Some(LogRecord {
            ld_key,
            state: RecordState::Completed,
        });
    }

    /// Applies `f` to an existing record. A record reaped between
    /// submission and completion is skipped silently.
    pub fn update(&mut self, seq: LogStoreSeqNum, f: impl FnOnce(&mut LogRecord)) {
        if seq <= self.truncate_floor {
            return;
        }
        if let Some(rec) = self.slot_mut(seq).as_mut() {
            f(rec);
        }
    }

    /// Marks a reserved record completed at `ld_key`.
    pub fn complete(&mut self, seq: LogStoreSeqNum, ld_key: LogDevKey) {
        self.update(seq, |rec| {
            rec.ld_key = ld_key;
            rec.state = RecordState::Completed;
        });
    }

    pub fn get(&self, seq: LogStoreSeqNum) -> Option<LogRecord> {
        if seq < 0 || seq <= self.truncate_floor {
            return None;
        }
        let (chunk_no, slot) = Self::chunk_of(seq);
        self.chunks.get(&chunk_no).and_then(|c| c[slot])
    }

    pub fn truncate_floor(&self) -> i64 {
        self.truncate_floor
    }

    /// Reaps every record with seq <= `upto_seq`.
    pub fn truncate(&mut self, upto_seq: LogStoreSeqNum) {
        if upto_seq <= self.truncate_floor {
            return;
        }
        self.truncate_floor = upto_seq;

        let (floor_chunk, floor_slot) = Self::chunk_of(upto_seq);
        self.chunks.retain(|&chunk_no, _| chunk_no >= floor_chunk);
        if let Some(chunk) = self.chunks.get_mut(&floor_chunk) {
            for slot in chunk.iter_mut().take(floor_slot + 1) {
                *slot = None;
            }
        }
    }

    /// Largest `s` such that every record in `[from, s]` is completed, or
    /// `from - 1` when `records[from]` itself is not.
    pub fn completed_upto(&self, from: LogStoreSeqNum) -> LogStoreSeqNum {
        let mut seq = from;
        while matches!(self.get(seq), Some(rec) if rec.is_completed()) {
            seq += 1;
        }
        seq - 1
    }

    /// Largest `s` such that every record in `[from, s]` exists in any
    /// state, or `from - 1` when `records[from]` is absent.
    pub fn active_upto(&self, from: LogStoreSeqNum) -> LogStoreSeqNum {
        let mut seq = from;
        while self.get(seq).is_some() {
            seq += 1;
        }
        seq - 1
    }

    /// Visits the contiguous completed run starting at `from`; stops early
    /// when `cb` returns `false`.
    pub fn foreach_completed(
        &self,
        from: LogStoreSeqNum,
        mut cb: impl FnMut(LogStoreSeqNum, &LogRecord) -> bool,
    ) {
        let mut seq = from;
        while let Some(rec) = self.get(seq) {
            if !rec.is_completed() || !cb(seq, &rec) {
                break;
            }
            seq += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(idx: i64) -> LogDevKey {
        LogDevKey {
            idx,
            dev_offset: idx as u64 * 64,
        }
    }

    #[test]
    fn create_then_complete_round_trip() {
        let mut records = LogRecords::new();
        records.create(0);
        assert_eq!(records.get(0).unwrap().state, RecordState::Reserved);

        records.complete(0, key(5));
        let rec = records.get(0).unwrap();
        assert!(rec.is_completed());
        assert_eq!(rec.ld_key.idx, 5);
    }

    #[test]
    fn sparse_seqs_span_chunks() {
        let mut records = LogRecords::new();
        records.create_and_complete(3, key(1));
        records.create_and_complete(LOG_RECORD_CHUNK as i64 * 4 + 7, key(2));

        assert!(records.get(3).is_some());
        assert!(records.get(LOG_RECORD_CHUNK as i64 * 4 + 7).is_some());
        assert!(records.get(100).is_none());
    }

    #[test]
    fn truncate_reaps_prefix_and_whole_chunks() {
        let mut records = LogRecords::new();
        let n = LOG_RECORD_CHUNK as i64 * 3;
        for seq in 0..n {
            records.create_and_complete(seq, key(seq));
        }

        records.truncate(LOG_RECORD_CHUNK as i64 + 10);

        for seq in 0..=LOG_RECORD_CHUNK as i64 + 10 {
            assert!(records.get(seq).is_none(), "seq {} should be reaped", seq);
        }
        assert!(records.get(LOG_RECORD_CHUNK as i64 + 11).is_some());
        // The fully-covered chunk is gone, not just cleared.
        assert!(records.chunks.len() < 3);
    }

    #[test]
    fn truncate_is_idempotent() {
        let mut records = LogRecords::new();
        for seq in 0..10 {
            records.create_and_complete(seq, key(seq));
        }
        records.truncate(4);
        let floor = records.truncate_floor();
        records.truncate(4);
        assert_eq!(records.truncate_floor(), floor);
        assert!(records.get(4).is_none());
        assert!(records.get(5).is_some());
    }

    #[test]
    fn completed_upto_stops_at_gaps_and_reservations() {
        let mut records = LogRecords::new();
        records.create_and_complete(0, key(0));
        records.create_and_complete(1, key(1));
        records.create(2); // reserved, not completed
        records.create_and_complete(4, key(4)); // gap at 3

        assert_eq!(records.completed_upto(0), 1);
        assert_eq!(records.active_upto(0), 2);
        assert_eq!(records.completed_upto(4), 4);
        assert_eq!(records.completed_upto(5), 4);
    }

    #[test]
    fn foreach_completed_visits_contiguous_run() {
        let mut records = LogRecords::new();
        for seq in 0..5 {
            records.create_and_complete(seq, key(seq * 10));
        }
        records.create(5);

        let mut visited = Vec::new();
        records.foreach_completed(0, |seq, rec| {
            visited.push((seq, rec.ld_key.idx));
            true
        });
        assert_eq!(visited, vec![(0, 0), (1, 10), (2, 20), (3, 30), (4, 40)]);
    }

    #[test]
    fn update_below_floor_is_ignored() {
        let mut records = LogRecords::new();
        records.create_and_complete(0, key(0));
        records.truncate(0);
        records.update(0, |_| panic!("reaped record must not be visited"));
        assert!(records.get(0).is_none());
    }
}
