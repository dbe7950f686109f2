//! # Log Device Contract
//!
//! The log-store layer sits on one physical, append-only log device shared
//! by every logical stream. The device is an external collaborator; this
//! module defines the contract ([`LogDev`]) plus [`MemLogDev`], an
//! in-memory implementation with the same batching behavior a real device
//! exhibits, used by tests and by cache-resident deployments.
//!
//! ## Batched Completion
//!
//! Appends accumulate into a flush batch. When the batch closes (size
//! threshold or explicit flush), completions are delivered in submission
//! order, each carrying:
//!
//! - `ld_key`: the record's own position (monotonic index, device offset)
//! - `flush_ld_key`: the batch's flush position, shared by the whole batch
//! - `nremaining_in_batch`: how many completions of this batch are still
//!   coming; `0` marks the batch-closing completion
//!
//! Batch boundaries are the device's decision; consumers must treat
//! `nremaining_in_batch == 0` as the only batch-close signal.
//!
//! ## Flush Locking
//!
//! Truncation must not race an in-flight flush. `try_lock_flush` runs the
//! given closure immediately when the flush lane is idle (returning `true`;
//! the caller then releases with `unlock_flush`), and otherwise queues the
//! closure to run when the current flush completes (returning `false`).

use std::any::Any;

use eyre::{bail, ensure, Result};
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info};

use crate::config::LogStoreConfig;

/// Persistent identifier of a logical log stream.
pub type LogStoreId = u32;

/// Per-store sequence number, 0-based.
pub type LogStoreSeqNum = i64;

/// Opaque per-append payload handed back on completion.
pub type Cookie = Box<dyn Any + Send>;

/// Position within the physical log: monotonic log index plus device
/// offset. Ordering compares the index first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LogDevKey {
    pub idx: i64,
    pub dev_offset: u64,
}

impl LogDevKey {
    /// Sentinel greater than every real key.
    pub const OUT_OF_BOUND: LogDevKey = LogDevKey {
        idx: i64::MAX,
        dev_offset: 0,
    };

    pub fn invalid() -> Self {
        Self {
            idx: -1,
            dev_offset: 0,
        }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.idx >= 0
    }
}

/// Completion callback attached to a single append.
pub type AppendCompletionCb = Box<dyn FnOnce(LogStoreSeqNum, bool, Option<Cookie>) + Send>;

/// Request context traveling with an append through the device; handed
/// back verbatim in the append completion.
pub struct LogReq {
    pub store_id: LogStoreId,
    pub seq_num: LogStoreSeqNum,
    pub cookie: Option<Cookie>,
    pub cb: Option<AppendCompletionCb>,
}

/// Invoked during recovery for every store id found on the device.
pub type StoreFoundCb = Box<dyn Fn(LogStoreId) + Send + Sync>;

/// Invoked once per completed append: `(store_id, ld_key, flush_ld_key,
/// nremaining_in_batch, req)`.
pub type AppendCb = Box<dyn Fn(LogStoreId, LogDevKey, LogDevKey, u32, LogReq) + Send + Sync>;

/// Invoked during recovery for every record found on the device.
pub type LogFoundCb = Box<dyn Fn(LogStoreId, LogStoreSeqNum, LogDevKey, &[u8]) + Send + Sync>;

/// Contract between the log-store layer and the physical log device.
pub trait LogDev: Send + Sync {
    /// Starts the device: `format` wipes it, otherwise recovery replays
    /// store-found and log-found callbacks for the retained log.
    fn start(&self, format: bool) -> Result<()>;

    fn stop(&self);

    fn register_store_found_cb(&self, cb: StoreFoundCb);
    fn register_append_cb(&self, cb: AppendCb);
    fn register_logfound_cb(&self, cb: LogFoundCb);

    /// Reserves a store id, persisting the reservation when asked.
    fn reserve_store_id(&self, persist: bool) -> LogStoreId;

    fn append_async(
        &self,
        store_id: LogStoreId,
        seq_num: LogStoreSeqNum,
        data: &[u8],
        req: LogReq,
    ) -> Result<()>;

    fn read(&self, key: LogDevKey) -> Result<Vec<u8>>;

    /// Runs `f` now if the flush lane is idle (returns `true`; caller must
    /// `unlock_flush`), otherwise queues it behind the in-flight flush and
    /// returns `false`.
    fn try_lock_flush(&self, f: Box<dyn FnOnce() + Send>) -> bool;

    fn unlock_flush(&self);

    /// Drops every record at or below `key.idx`; returns the count dropped.
    fn truncate(&self, key: LogDevKey) -> u64;
}

struct DevEntry {
    store_id: LogStoreId,
    seq_num: LogStoreSeqNum,
    data: Vec<u8>,
    ld_key: LogDevKey,
}

struct PendingAppend {
    store_id: LogStoreId,
    seq_num: LogStoreSeqNum,
    data: Vec<u8>,
    req: LogReq,
}

#[derive(Default)]
struct DevState {
    started: bool,
    next_idx: i64,
    next_offset: u64,
    next_store_id: LogStoreId,
    reserved_stores: Vec<LogStoreId>,
    entries: Vec<DevEntry>,
    pending: Vec<PendingAppend>,
}

#[derive(Default)]
struct FlushLane {
    busy: bool,
    deferred: Vec<Box<dyn FnOnce() + Send>>,
}

/// In-memory [`LogDev`] with deterministic batching.
pub struct MemLogDev {
    cfg: LogStoreConfig,
    state: Mutex<DevState>,
    flush_lane: Mutex<FlushLane>,
    flush_idle: Condvar,
    store_found_cb: RwLock<Option<StoreFoundCb>>,
    append_cb: RwLock<Option<AppendCb>>,
    logfound_cb: RwLock<Option<LogFoundCb>>,
}

impl MemLogDev {
    pub fn new(cfg: LogStoreConfig) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            cfg,
            state: Mutex::new(DevState::default()),
            flush_lane: Mutex::new(FlushLane::default()),
            flush_idle: Condvar::new(),
            store_found_cb: RwLock::new(None),
            append_cb: RwLock::new(None),
            logfound_cb: RwLock::new(None),
        })
    }

    /// Closes the current batch regardless of size.
    pub fn flush(&self) {
        self.begin_flush();
        let batch = {
            let mut st = self.state.lock();
            std::mem::take(&mut st.pending)
                .into_iter()
                .map(|mut p| {
                    let key = LogDevKey {
                        idx: st.next_idx,
                        dev_offset: st.next_offset,
                    };
                    st.next_idx += 1;
                    st.next_offset += p.data.len() as u64;
                    st.entries.push(DevEntry {
                        store_id: p.store_id,
                        seq_num: p.seq_num,
                        data: std::mem::take(&mut p.data),
                        ld_key: key,
                    });
                    (key, p)
                })
                .collect::<Vec<_>>()
        };

        if !batch.is_empty() {
            let flush_key = batch.last().expect("non-empty batch").0;
            let n = batch.len();
            let cb_guard = self.append_cb.read();
            if let Some(cb) = cb_guard.as_ref() {
                for (i, (key, pending)) in batch.into_iter().enumerate() {
                    cb(
                        pending.store_id,
                        key,
                        flush_key,
                        (n - 1 - i) as u32,
                        pending.req,
                    );
                }
            }
            debug!(batch = n, flush_idx = flush_key.idx, "flush batch closed");
        }
        self.end_flush();
    }

    /// Drops un-flushed appends and stops the device, as a crash would.
    /// Restart with `start(false)` to replay the retained log.
    pub fn simulate_restart(&self) {
        let mut st = self.state.lock();
        let lost = st.pending.len();
        st.pending.clear();
        st.started = false;
        info!(lost, "device restart simulated");
    }

    /// Retained (flushed, untruncated) record count.
    pub fn retained_records(&self) -> usize {
        self.state.lock().entries.len()
    }

    fn begin_flush(&self) {
        let mut lane = self.flush_lane.lock();
        while lane.busy {
            self.flush_idle.wait(&mut lane);
        }
        lane.busy = true;
    }

    fn end_flush(&self) {
        let deferred = {
            let mut lane = self.flush_lane.lock();
            lane.busy = false;
            self.flush_idle.notify_all();
            std::mem::take(&mut lane.deferred)
        };
        for f in deferred {
            f();
        }
    }

    fn replay(&self) {
        let (stores, records) = {
            let st = self.state.lock();
            let mut stores = st.reserved_stores.clone();
            for e in &st.entries {
                if !stores.contains(&e.store_id) {
                    stores.push(e.store_id);
                }
            }
            let records: Vec<(LogStoreId, LogStoreSeqNum, LogDevKey, Vec<u8>)> = st
                .entries
                .iter()
                .map(|e| (e.store_id, e.seq_num, e.ld_key, e.data.clone()))
                .collect();
            (stores, records)
        };

        if let Some(cb) = self.store_found_cb.read().as_ref() {
            for id in &stores {
                cb(*id);
            }
        }

        // Recovery makes no ordering promise; deliver records scrambled
        // (evens first, then odds) so consumers cannot rely on one.
        if let Some(cb) = self.logfound_cb.read().as_ref() {
            for parity in [0usize, 1] {
                for (i, (store_id, seq, key, data)) in records.iter().enumerate() {
                    if i % 2 == parity {
                        cb(*store_id, *seq, *key, data);
                    }
                }
            }
        }
        info!(
            stores = stores.len(),
            records = records.len(),
            "recovery replay complete"
        );
    }
}

impl LogDev for MemLogDev {
    fn start(&self, format: bool) -> Result<()> {
        {
            let mut st = self.state.lock();
            ensure!(!st.started, "log device already started");
            if format {
                *st = DevState::default();
            }
            st.started = true;
        }
        if !format {
            self.replay();
        }
        Ok(())
    }

    fn stop(&self) {
        let mut st = self.state.lock();
        st.started = false;
        st.pending.clear();
    }

    fn register_store_found_cb(&self, cb: StoreFoundCb) {
        *self.store_found_cb.write() = Some(cb);
    }

    fn register_append_cb(&self, cb: AppendCb) {
        *self.append_cb.write() = Some(cb);
    }

    fn register_logfound_cb(&self, cb: LogFoundCb) {
        *self.logfound_cb.write() = Some(cb);
    }

    fn reserve_store_id(&self, persist: bool) -> LogStoreId {
        let mut st = self.state.lock();
        let id = st.next_store_id;
        st.next_store_id += 1;
        if persist {
            st.reserved_stores.push(id);
        }
        id
    }

    fn append_async(
        &self,
        store_id: LogStoreId,
        seq_num: LogStoreSeqNum,
        data: &[u8],
        req: LogReq,
    ) -> Result<()> {
        let should_flush = {
            let mut st = self.state.lock();
            ensure!(st.started, "operation aborted: log device is stopped");
            st.pending.push(PendingAppend {
                store_id,
                seq_num,
                data: data.to_vec(),
                req,
            });
            st.pending.len() >= self.cfg.flush_batch_size
        };
        if should_flush {
            self.flush();
        }
        Ok(())
    }

    fn read(&self, key: LogDevKey) -> Result<Vec<u8>> {
        let st = self.state.lock();
        match st.entries.iter().find(|e| e.ld_key.idx == key.idx) {
            Some(entry) => Ok(entry.data.clone()),
            None => bail!("log record at idx {} not found", key.idx),
        }
    }

    fn try_lock_flush(&self, f: Box<dyn FnOnce() + Send>) -> bool {
        {
            let mut lane = self.flush_lane.lock();
            if lane.busy {
                lane.deferred.push(f);
                return false;
            }
            lane.busy = true;
        }
        f();
        true
    }

    fn unlock_flush(&self) {
        self.end_flush();
    }

    fn truncate(&self, key: LogDevKey) -> u64 {
        let mut st = self.state.lock();
        let before = st.entries.len();
        st.entries.retain(|e| e.ld_key.idx > key.idx);
        let dropped = (before - st.entries.len()) as u64;
        info!(upto_idx = key.idx, dropped, "device truncated");
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn started_dev(batch: usize) -> Arc<MemLogDev> {
        let dev = MemLogDev::new(LogStoreConfig {
            flush_batch_size: batch,
        });
        dev.start(true).unwrap();
        dev
    }

    fn req(store_id: LogStoreId, seq: LogStoreSeqNum) -> LogReq {
        LogReq {
            store_id,
            seq_num: seq,
            cookie: None,
            cb: None,
        }
    }

    #[test]
    fn ld_key_orders_by_idx_first() {
        let a = LogDevKey { idx: 1, dev_offset: 900 };
        let b = LogDevKey { idx: 2, dev_offset: 0 };
        assert!(a < b);
        assert!(a < LogDevKey::OUT_OF_BOUND);
        assert!(!LogDevKey::invalid().is_valid());
    }

    #[test]
    fn batch_completions_count_down_in_order() {
        let dev = started_dev(3);
        let seen: Arc<parking_lot::Mutex<Vec<(LogStoreSeqNum, u32, i64)>>> =
            Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        dev.register_append_cb(Box::new(move |_, ld_key, flush_key, nremaining, req| {
            seen2
                .lock()
                .push((req.seq_num, nremaining, flush_key.idx));
            assert!(ld_key.idx <= flush_key.idx);
        }));

        for seq in 0..3 {
            dev.append_async(1, seq, b"x", req(1, seq)).unwrap();
        }

        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert_eq!(*seen, vec![(0, 2, 2), (1, 1, 2), (2, 0, 2)]);
    }

    #[test]
    fn explicit_flush_closes_partial_batch() {
        let dev = started_dev(100);
        let count = Arc::new(AtomicU32::new(0));
        let count2 = Arc::clone(&count);
        dev.register_append_cb(Box::new(move |_, _, _, _, _| {
            count2.fetch_add(1, Ordering::Relaxed);
        }));

        dev.append_async(1, 0, b"a", req(1, 0)).unwrap();
        dev.append_async(1, 1, b"b", req(1, 1)).unwrap();
        assert_eq!(count.load(Ordering::Relaxed), 0);

        dev.flush();
        assert_eq!(count.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn append_to_stopped_device_is_rejected() {
        let dev = started_dev(4);
        dev.stop();
        let err = dev.append_async(1, 0, b"x", req(1, 0)).unwrap_err();
        assert!(err.to_string().contains("operation aborted"));
    }

    #[test]
    fn read_returns_flushed_data() {
        let dev = started_dev(1);
        let key_slot: Arc<parking_lot::Mutex<Option<LogDevKey>>> =
            Arc::new(parking_lot::Mutex::new(None));
        let key_slot2 = Arc::clone(&key_slot);
        dev.register_append_cb(Box::new(move |_, ld_key, _, _, _| {
            *key_slot2.lock() = Some(ld_key);
        }));

        dev.append_async(7, 0, b"payload", req(7, 0)).unwrap();
        let key = key_slot.lock().unwrap();
        assert_eq!(dev.read(key).unwrap(), b"payload".to_vec());
    }

    #[test]
    fn truncate_drops_prefix_by_idx() {
        let dev = started_dev(1);
        for seq in 0..5 {
            dev.append_async(1, seq, b"x", req(1, seq)).unwrap();
        }
        assert_eq!(dev.retained_records(), 5);

        let dropped = dev.truncate(LogDevKey { idx: 2, dev_offset: 0 });
        assert_eq!(dropped, 3);
        assert_eq!(dev.retained_records(), 2);
        assert!(dev.read(LogDevKey { idx: 2, dev_offset: 0 }).is_err());
        assert!(dev.read(LogDevKey { idx: 3, dev_offset: 0 }).is_ok());
    }

    #[test]
    fn try_lock_flush_runs_or_defers() {
        let dev = started_dev(8);
        let ran = Arc::new(AtomicU32::new(0));

        let ran2 = Arc::clone(&ran);
        let acquired = dev.try_lock_flush(Box::new(move || {
            ran2.fetch_add(1, Ordering::Relaxed);
        }));
        assert!(acquired);
        assert_eq!(ran.load(Ordering::Relaxed), 1);

        // The lane is still held: a second closure must be deferred.
        let ran3 = Arc::clone(&ran);
        let acquired2 = dev.try_lock_flush(Box::new(move || {
            ran3.fetch_add(1, Ordering::Relaxed);
        }));
        assert!(!acquired2);
        assert_eq!(ran.load(Ordering::Relaxed), 1);

        dev.unlock_flush();
        assert_eq!(ran.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn restart_replays_stores_and_records_out_of_order() {
        let dev = started_dev(2);
        let id = dev.reserve_store_id(true);
        for seq in 0..4 {
            dev.append_async(id, seq, format!("r{}", seq).as_bytes(), req(id, seq))
                .unwrap();
        }

        dev.simulate_restart();

        let found_seqs: Arc<parking_lot::Mutex<Vec<LogStoreSeqNum>>> =
            Arc::new(parking_lot::Mutex::new(Vec::new()));
        let found2 = Arc::clone(&found_seqs);
        dev.register_logfound_cb(Box::new(move |_, seq, _, _| {
            found2.lock().push(seq);
        }));
        let stores_found = Arc::new(AtomicU32::new(0));
        let stores2 = Arc::clone(&stores_found);
        dev.register_store_found_cb(Box::new(move |_| {
            stores2.fetch_add(1, Ordering::Relaxed);
        }));

        dev.start(false).unwrap();

        assert_eq!(stores_found.load(Ordering::Relaxed), 1);
        let seqs = found_seqs.lock().clone();
        assert_eq!(seqs.len(), 4);
        // Scrambled delivery: not ascending.
        assert_ne!(seqs, vec![0, 1, 2, 3]);
        let mut sorted = seqs.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![0, 1, 2, 3]);
    }
}
