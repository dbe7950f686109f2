//! # Log Store Manager
//!
//! Multiplexes N logical log streams over one physical device. The manager
//! owns the id→store map, registers the device callbacks exactly once, and
//! routes every completion and recovery event to the right store. It also
//! computes the device-wide safe truncation point: the minimum of every
//! store's barrier position, because a byte of the shared log may only be
//! reclaimed once no stream can still need it.
//!
//! ## Open-Before-Found
//!
//! Streams are recovered by the device, not the application: callers that
//! expect a stream after restart pre-register a placeholder with
//! [`LogStoreManager::open_log_store`], and when recovery announces the
//! store id the manager materializes the store and fires the open
//! callback. A store id found with no placeholder is logged and ignored.

use std::sync::{Arc, Weak};

use eyre::Result;
use hashbrown::HashMap;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::logstore::logdev::{
    LogDev, LogDevKey, LogReq, LogStoreId, LogStoreSeqNum,
};
use crate::logstore::store::LogStore;

/// Callback fired when a pre-registered store is materialized by recovery.
pub type LogStoreOpenedCb<D> = Box<dyn Fn(Arc<LogStore<D>>) + Send + Sync>;

struct LogStoreInfo<D: LogDev> {
    store: Option<Arc<LogStore<D>>>,
    on_open: Option<LogStoreOpenedCb<D>>,
}

/// Owner of every logical stream on one shared log device.
pub struct LogStoreManager<D: LogDev> {
    logdev: Arc<D>,
    map: RwLock<HashMap<LogStoreId, LogStoreInfo<D>>>,
}

impl<D: LogDev + 'static> LogStoreManager<D> {
    pub fn new(logdev: Arc<D>) -> Arc<Self> {
        Arc::new(Self {
            logdev,
            map: RwLock::new(HashMap::new()),
        })
    }

    pub fn logdev(&self) -> &Arc<D> {
        &self.logdev
    }

    /// Registers the device callbacks and starts the device. With
    /// `format = false` the device replays its retained log through the
    /// store-found and log-found callbacks before this returns.
    pub fn start(self: &Arc<Self>, format: bool) -> Result<()> {
        let weak = Arc::downgrade(self);
        self.logdev.register_store_found_cb(Box::new({
            let weak = Weak::clone(&weak);
            move |store_id| {
                if let Some(mgr) = weak.upgrade() {
                    mgr.on_store_found(store_id);
                }
            }
        }));
        self.logdev.register_append_cb(Box::new({
            let weak = Weak::clone(&weak);
            move |store_id, ld_key, flush_ld_key, nremaining, req| {
                if let Some(mgr) = weak.upgrade() {
                    mgr.on_io_completion(store_id, ld_key, flush_ld_key, nremaining, req);
                }
            }
        }));
        self.logdev.register_logfound_cb(Box::new({
            let weak = Weak::clone(&weak);
            move |store_id, seq_num, ld_key, data| {
                if let Some(mgr) = weak.upgrade() {
                    mgr.on_log_found(store_id, seq_num, ld_key, data);
                }
            }
        }));

        self.logdev.start(format)
    }

    pub fn stop(&self) {
        self.map.write().clear();
        self.logdev.stop();
    }

    /// Reserves a persistent store id and installs a fresh stream on it.
    pub fn create_new_log_store(self: &Arc<Self>) -> Arc<LogStore<D>> {
        let store_id = self.logdev.reserve_store_id(true);
        let store = Arc::new(LogStore::new(
            store_id,
            Arc::clone(&self.logdev),
            Arc::downgrade(self),
        ));
        self.map.write().insert(
            store_id,
            LogStoreInfo {
                store: Some(Arc::clone(&store)),
                on_open: None,
            },
        );
        info!(store_id, "created new log store");
        store
    }

    /// Pre-registers `store_id` so recovery can materialize it; `on_open`
    /// fires with the live store once the device announces it.
    pub fn open_log_store(&self, store_id: LogStoreId, on_open: LogStoreOpenedCb<D>) {
        self.map.write().insert(
            store_id,
            LogStoreInfo {
                store: None,
                on_open: Some(on_open),
            },
        );
    }

    pub fn get_log_store(&self, store_id: LogStoreId) -> Option<Arc<LogStore<D>>> {
        self.map.read().get(&store_id).and_then(|i| i.store.clone())
    }

    /// Computes the device-wide safe truncation key: the minimum of every
    /// store's safe position, compared by index then offset. Pushed to the
    /// device unless `dry_run`.
    pub fn device_truncate(&self, dry_run: bool) -> LogDevKey {
        let mut min_safe_key = LogDevKey::OUT_OF_BOUND;
        {
            let map = self.map.read();
            for info in map.values() {
                if let Some(store) = &info.store {
                    let store_key = store.safe_truncation_ld_key();
                    if store_key < min_safe_key {
                        min_safe_key = store_key;
                    }
                }
            }
        }
        info!(
            idx = min_safe_key.idx,
            dry_run, "device-wide safe truncation point computed"
        );
        if !dry_run && min_safe_key.is_valid() && min_safe_key != LogDevKey::OUT_OF_BOUND {
            self.logdev.truncate(min_safe_key);
        }
        min_safe_key
    }

    fn on_store_found(self: &Arc<Self>, store_id: LogStoreId) {
        let (store, on_open) = {
            let mut map = self.map.write();
            match map.get_mut(&store_id) {
                None => {
                    warn!(store_id, "store found but never opened, ignoring");
                    return;
                }
                Some(info) => {
                    let store = Arc::new(LogStore::new(
                        store_id,
                        Arc::clone(&self.logdev),
                        Arc::downgrade(self),
                    ));
                    info.store = Some(Arc::clone(&store));
                    (store, info.on_open.take())
                }
            }
        };
        info!(store_id, "log store materialized from recovery");
        if let Some(cb) = on_open {
            cb(store);
        }
    }

    fn on_io_completion(
        &self,
        store_id: LogStoreId,
        ld_key: LogDevKey,
        flush_ld_key: LogDevKey,
        nremaining_in_batch: u32,
        req: LogReq,
    ) {
        debug_assert_eq!(store_id, req.store_id);
        match self.get_log_store(store_id) {
            Some(store) => store.on_write_completion(req, ld_key, flush_ld_key, nremaining_in_batch),
            None => warn!(store_id, "completion for unknown store dropped"),
        }
    }

    fn on_log_found(
        &self,
        store_id: LogStoreId,
        seq_num: LogStoreSeqNum,
        ld_key: LogDevKey,
        data: &[u8],
    ) {
        match self.get_log_store(store_id) {
            Some(store) => store.on_log_found(seq_num, ld_key, data),
            None => warn!(store_id, seq_num, "recovered record for unknown store dropped"),
        }
    }
}
