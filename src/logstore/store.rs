//! # Per-Stream Log Store
//!
//! A `LogStore` owns one logical stream over the shared log device: its own
//! sequence space, the sparse record map, and the truncation barriers that
//! make reclaiming device space safe.
//!
//! ## Truncation Barriers
//!
//! Completions arrive in device flush batches. Within a batch the store
//! tracks the highest sequence number seen; the completion carrying
//! `nremaining_in_batch == 0` closes the batch and turns that high-water
//! mark plus the batch's flush position into a barrier. Nothing else closes
//! a batch; flush-key equality across completions is deliberately not
//! consulted. Truncation requests round down to the nearest barrier, so
//! `safe_truncate_ld_key` only ever moves forward and never points into the
//! middle of a flush batch.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use eyre::{ensure, Result};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace};

use crate::logstore::logdev::{
    AppendCompletionCb, Cookie, LogDev, LogDevKey, LogReq, LogStoreId, LogStoreSeqNum,
};
use crate::logstore::manager::LogStoreManager;
use crate::logstore::records::LogRecords;

/// Close of a flush batch: the highest store sequence the batch contained
/// and the batch's flush position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TruncationBarrier {
    pub seq_num: LogStoreSeqNum,
    pub ld_key: LogDevKey,
}

/// Default completion callback, shared across appends.
pub type LogCompletionCb = Arc<dyn Fn(LogStoreSeqNum, bool) + Send + Sync>;

/// Recovery callback invoked per replayed record.
pub type LogFoundEntryCb = Arc<dyn Fn(LogStoreSeqNum, &[u8]) + Send + Sync>;

/// One logical log stream multiplexed over the shared device.
pub struct LogStore<D: LogDev> {
    store_id: LogStoreId,
    logdev: Arc<D>,
    mgr: Weak<LogStoreManager<D>>,
    next_seq: AtomicI64,
    records: RwLock<LogRecords>,
    barriers: Mutex<Vec<TruncationBarrier>>,
    flush_batch_max: Mutex<TruncationBarrier>,
    safe_truncate_ld_key: RwLock<LogDevKey>,
    last_truncated_seq: AtomicI64,
    comp_cb: RwLock<Option<LogCompletionCb>>,
    found_cb: RwLock<Option<LogFoundEntryCb>>,
}

impl<D: LogDev + 'static> LogStore<D> {
    pub(crate) fn new(
        store_id: LogStoreId,
        logdev: Arc<D>,
        mgr: Weak<LogStoreManager<D>>,
    ) -> Self {
        Self {
            store_id,
            logdev,
            mgr,
            next_seq: AtomicI64::new(0),
            records: RwLock::new(LogRecords::new()),
            barriers: Mutex::new(Vec::new()),
            flush_batch_max: Mutex::new(TruncationBarrier {
                seq_num: -1,
                ld_key: LogDevKey::invalid(),
            }),
            safe_truncate_ld_key: RwLock::new(LogDevKey::invalid()),
            last_truncated_seq: AtomicI64::new(-1),
            comp_cb: RwLock::new(None),
            found_cb: RwLock::new(None),
        }
    }

    pub fn store_id(&self) -> LogStoreId {
        self.store_id
    }

    pub fn next_seq_num(&self) -> LogStoreSeqNum {
        self.next_seq.load(Ordering::Acquire)
    }

    pub fn last_truncated_seq_num(&self) -> LogStoreSeqNum {
        self.last_truncated_seq.load(Ordering::Acquire)
    }

    /// The store's contribution to the device-wide safe truncation point.
    pub fn safe_truncation_ld_key(&self) -> LogDevKey {
        *self.safe_truncate_ld_key.read()
    }

    pub fn truncation_barriers(&self) -> Vec<TruncationBarrier> {
        self.barriers.lock().clone()
    }

    /// Installs the default completion callback used by appends without one.
    pub fn register_comp_cb(&self, cb: LogCompletionCb) {
        *self.comp_cb.write() = Some(cb);
    }

    /// Installs the callback invoked per record replayed during recovery.
    pub fn register_found_cb(&self, cb: LogFoundEntryCb) {
        *self.found_cb.write() = Some(cb);
    }

    // ------------------------------------------------------------------
    // Append / read
    // ------------------------------------------------------------------

    /// Appends `data` at the next sequence number; returns it.
    pub fn append_async(
        &self,
        data: &[u8],
        cookie: Option<Cookie>,
        cb: Option<AppendCompletionCb>,
    ) -> Result<LogStoreSeqNum> {
        let seq = self.next_seq.fetch_add(1, Ordering::AcqRel);
        self.write_async(seq, data, cookie, cb)?;
        Ok(seq)
    }

    /// Low-level append at a caller-defined sequence number. Used when the
    /// sequence space is owned externally; does not advance `next_seq`.
    pub fn write_async(
        &self,
        seq_num: LogStoreSeqNum,
        data: &[u8],
        cookie: Option<Cookie>,
        cb: Option<AppendCompletionCb>,
    ) -> Result<()> {
        assert!(
            cb.is_some() || self.comp_cb.read().is_some(),
            "append needs a completion callback or a registered default"
        );
        self.records.write().create(seq_num);
        trace!(store = self.store_id, seq = seq_num, "append submitted");
        self.logdev.append_async(
            self.store_id,
            seq_num,
            data,
            LogReq {
                store_id: self.store_id,
                seq_num,
                cookie,
                cb,
            },
        )
    }

    /// Reads the record at `seq_num`; `Ok(None)` when it was truncated,
    /// never written, or not yet flushed.
    pub fn read_sync(&self, seq_num: LogStoreSeqNum) -> Result<Option<Vec<u8>>> {
        let ld_key = {
            let records = self.records.read();
            match records.get(seq_num) {
                Some(rec) if rec.is_completed() => rec.ld_key,
                _ => return Ok(None),
            }
        };
        trace!(
            store = self.store_id,
            seq = seq_num,
            idx = ld_key.idx,
            "sync read"
        );
        self.logdev.read(ld_key).map(Some)
    }

    /// Visits every contiguous completed record from `start_seq`, sync
    /// reading each; stops early when `cb` returns `false`.
    pub fn foreach(
        &self,
        start_seq: LogStoreSeqNum,
        mut cb: impl FnMut(LogStoreSeqNum, Vec<u8>) -> bool,
    ) -> Result<()> {
        let run: Vec<(LogStoreSeqNum, LogDevKey)> = {
            let records = self.records.read();
            let mut run = Vec::new();
            records.foreach_completed(start_seq, |seq, rec| {
                run.push((seq, rec.ld_key));
                true
            });
            run
        };
        for (seq, ld_key) in run {
            let data = self.logdev.read(ld_key)?;
            if !cb(seq, data) {
                break;
            }
        }
        Ok(())
    }

    /// Largest `s` with `[from, s]` all completed, or `from - 1`.
    pub fn get_contiguous_completed_seq_num(&self, from: LogStoreSeqNum) -> LogStoreSeqNum {
        self.records.read().completed_upto(from)
    }

    /// Largest `s` with `[from, s]` all issued (any state), or `from - 1`.
    pub fn get_contiguous_issued_seq_num(&self, from: LogStoreSeqNum) -> LogStoreSeqNum {
        self.records.read().active_upto(from)
    }

    // ------------------------------------------------------------------
    // Completion / recovery plumbing
    // ------------------------------------------------------------------

    /// Routed here by the manager for every append completion.
    pub(crate) fn on_write_completion(
        &self,
        req: LogReq,
        ld_key: LogDevKey,
        flush_ld_key: LogDevKey,
        nremaining_in_batch: u32,
    ) {
        self.records.write().complete(req.seq_num, ld_key);
        debug!(
            store = self.store_id,
            seq = req.seq_num,
            idx = ld_key.idx,
            nremaining_in_batch,
            "append completed"
        );

        {
            let mut batch_max = self.flush_batch_max.lock();
            if req.seq_num > batch_max.seq_num {
                *batch_max = TruncationBarrier {
                    seq_num: req.seq_num,
                    ld_key: flush_ld_key,
                };
            }
            if nremaining_in_batch == 0 {
                // Last completion of the batch; barrier time.
                debug_assert!(batch_max.seq_num != -1);
                self.create_truncation_barrier(&batch_max);
                *batch_max = TruncationBarrier {
                    seq_num: -1,
                    ld_key: LogDevKey::invalid(),
                };
            }
        }

        match req.cb {
            Some(cb) => cb(req.seq_num, true, req.cookie),
            None => {
                if let Some(cb) = self.comp_cb.read().as_ref() {
                    cb(req.seq_num, true);
                }
            }
        }
    }

    /// A batch still open when its successor closes extends the previous
    /// barrier instead of pushing a new one, keeping barrier sequence
    /// numbers strictly increasing.
    fn create_truncation_barrier(&self, batch_max: &TruncationBarrier) {
        let mut barriers = self.barriers.lock();
        match barriers.last_mut() {
            Some(last) if last.seq_num >= batch_max.seq_num => {
                last.ld_key = batch_max.ld_key;
            }
            _ => barriers.push(*batch_max),
        }
    }

    /// Routed here by the manager for every record replayed in recovery.
    /// Records may arrive in any order.
    pub(crate) fn on_log_found(&self, seq_num: LogStoreSeqNum, ld_key: LogDevKey, data: &[u8]) {
        self.records.write().create_and_complete(seq_num, ld_key);
        self.next_seq.fetch_max(seq_num + 1, Ordering::AcqRel);
        self.last_truncated_seq
            .fetch_min(seq_num - 1, Ordering::AcqRel);
        if let Some(cb) = self.found_cb.read().as_ref() {
            cb(seq_num, data);
        }
    }

    // ------------------------------------------------------------------
    // Truncation
    // ------------------------------------------------------------------

    /// Truncates this store up to `upto_seq` (rounded down to a barrier),
    /// then pushes the device-wide truncation point unless asked to stay
    /// in memory. Runs under the device's flush lock; when the lane is
    /// busy the work is deferred behind the in-flight flush.
    pub fn truncate(self: &Arc<Self>, upto_seq: LogStoreSeqNum, in_memory_only: bool) {
        let this = Arc::clone(self);
        let locked_now = self.logdev.try_lock_flush(Box::new(move || {
            this.do_truncate(upto_seq);
            if !in_memory_only {
                if let Some(mgr) = this.mgr.upgrade() {
                    mgr.device_truncate(false);
                }
            }
        }));
        if locked_now {
            self.logdev.unlock_flush();
        }
    }

    fn do_truncate(&self, upto_seq: LogStoreSeqNum) {
        let mut barriers = self.barriers.lock();
        let ind = match Self::search_max_le(&barriers, upto_seq) {
            Some(ind) => ind,
            None => {
                info!(
                    store = self.store_id,
                    upto_seq, "truncate request below every barrier, possibly already truncated"
                );
                return;
            }
        };

        let barrier = barriers[ind];
        *self.safe_truncate_ld_key.write() = barrier.ld_key;
        self.last_truncated_seq
            .store(barrier.seq_num, Ordering::Release);
        self.records.write().truncate(barrier.seq_num);
        barriers.drain(..=ind);
        info!(
            store = self.store_id,
            upto_seq,
            barrier_seq = barrier.seq_num,
            barrier_idx = barrier.ld_key.idx,
            "truncated to nearest barrier"
        );
    }

    /// Index of the rightmost barrier with `seq_num <= input`, if any.
    fn search_max_le(
        barriers: &[TruncationBarrier],
        input: LogStoreSeqNum,
    ) -> Option<usize> {
        let mut start: i64 = -1;
        let mut end: i64 = barriers.len() as i64;
        while end - start > 1 {
            let mid = start + (end - start) / 2;
            match barriers[mid as usize].seq_num.cmp(&input) {
                std::cmp::Ordering::Equal => return Some(mid as usize),
                std::cmp::Ordering::Greater => end = mid,
                std::cmp::Ordering::Less => start = mid,
            }
        }
        (end > 0).then(|| (end - 1) as usize)
    }

    /// Sanity hook for callers that must not append concurrently with an
    /// externally-owned sequence space.
    pub fn ensure_seq_not_issued(&self, seq_num: LogStoreSeqNum) -> Result<()> {
        ensure!(
            self.records.read().get(seq_num).is_none(),
            "seq {} already issued on store {}",
            seq_num,
            self.store_id
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_max_le_finds_rightmost() {
        let key = |idx| LogDevKey {
            idx,
            dev_offset: 0,
        };
        let barriers = vec![
            TruncationBarrier { seq_num: 9, ld_key: key(1) },
            TruncationBarrier { seq_num: 19, ld_key: key(2) },
            TruncationBarrier { seq_num: 29, ld_key: key(3) },
        ];

        assert_eq!(LogStore::<crate::logstore::MemLogDev>::search_max_le(&barriers, 9), Some(0));
        assert_eq!(LogStore::<crate::logstore::MemLogDev>::search_max_le(&barriers, 25), Some(1));
        assert_eq!(LogStore::<crate::logstore::MemLogDev>::search_max_le(&barriers, 100), Some(2));
        assert_eq!(LogStore::<crate::logstore::MemLogDev>::search_max_le(&barriers, 5), None);
        assert_eq!(LogStore::<crate::logstore::MemLogDev>::search_max_le(&[], 5), None);
    }
}
