#![forbid(unsafe_code)]
//! Append-only log device with group commit and CRC-chained recovery.
//!
//! `LogDev` multiplexes caller-named record streams (stores) onto one
//! append-only journal. Appends are batched into log groups by a single
//! CAS-guarded flusher; each group is one atomic device write whose header
//! chains the CRC of the previous group. Recovery replays the stream from
//! the persisted start offset and stops at the first chain break, after
//! probing ahead to rule out corruption of live data.

pub mod log_group;
pub mod stream;

pub use log_group::{
    LogGroup, LogGroupFooter, LogGroupHeader, LogRecord, SerializedLogRecord, HEADER_SIZE,
    INITIAL_READ_SIZE, LOG_GROUP_FOOTER_MAGIC, LOG_GROUP_HDR_MAGIC, MAX_LOG_GROUP,
    MAX_RECORDS_IN_A_BATCH, RECORD_SIZE,
};
pub use stream::LogStreamReader;

use keel_device::{ByteDevice, JournalVirtualDev};
use keel_error::{KeelError, Result};
use keel_types::{
    bitmap_clear, bitmap_find_free, bitmap_get, bitmap_set, put_le_u32, put_le_u64, read_le_u32,
    read_le_u64, round_down, round_up, LogId, SeqNum, StoreId, DMA_BOUNDARY,
};
use log_group::{nth_record, record_data};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

// ── Configuration ───────────────────────────────────────────────────────────

/// Tunables for the log device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogDevConfig {
    /// Pending-bytes trigger for group commit.
    pub flush_threshold_size: u64,
    /// Recurring timer interval for the forced flush check.
    pub flush_timer_frequency: Duration,
    /// Latency ceiling for pending data: a flush is forced once the oldest
    /// pending byte has waited this long.
    pub max_time_between_flush: Duration,
    /// Recovery bulk read chunk size.
    pub bulk_read_size: u64,
    /// Pages probed past the tail before corruption is ruled out.
    pub recovery_extra_probe_pages: u32,
    /// Records below this size are stored in the group's inline area.
    pub optimal_inline_data_size: u32,
}

impl Default for LogDevConfig {
    fn default() -> Self {
        Self {
            flush_threshold_size: 64 * 1024,
            flush_timer_frequency: Duration::from_micros(500),
            max_time_between_flush: Duration::from_micros(300),
            bulk_read_size: 512 * 1024,
            recovery_extra_probe_pages: 20,
            optimal_inline_data_size: 512,
        }
    }
}

impl LogDevConfig {
    fn validate(self) -> Result<Self> {
        if self.flush_threshold_size == 0 {
            return Err(KeelError::Format(
                "flush_threshold_size must be > 0".to_owned(),
            ));
        }
        if self.flush_timer_frequency.is_zero() {
            return Err(KeelError::Format(
                "flush_timer_frequency must be > 0".to_owned(),
            ));
        }
        if self.bulk_read_size < INITIAL_READ_SIZE as u64
            || self.bulk_read_size % u64::from(DMA_BOUNDARY) != 0
        {
            return Err(KeelError::Format(format!(
                "bulk_read_size must be a dma multiple >= {INITIAL_READ_SIZE}"
            )));
        }
        if self.recovery_extra_probe_pages == 0 {
            return Err(KeelError::Format(
                "recovery_extra_probe_pages must be > 0".to_owned(),
            ));
        }
        if self.optimal_inline_data_size == 0 {
            return Err(KeelError::Format(
                "optimal_inline_data_size must be > 0".to_owned(),
            ));
        }
        Ok(self)
    }
}

// ── Keys and callbacks ──────────────────────────────────────────────────────

/// Location of one record: its log index and the device offset of the group
/// containing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogDevKey {
    pub idx: LogId,
    pub dev_offset: u64,
}

/// Append completion: `(store_id, record_key, flushed_up_to_key,
/// records_remaining_in_batch, cb_context)`.
pub type AppendCompCb = Box<dyn Fn(StoreId, LogDevKey, LogDevKey, u32, u64) + Send + Sync>;
/// Invoked once per reserved store during recovery, before replay.
pub type StoreFoundCb = Box<dyn Fn(StoreId) + Send + Sync>;
/// Invoked once per replayed record during recovery.
pub type LogFoundCb = Box<dyn Fn(StoreId, SeqNum, LogDevKey, &[u8]) + Send + Sync>;
/// Deferred callback queued behind an in-flight flush.
pub type FlushBlockedCb = Box<dyn FnOnce() + Send>;

/// Host callbacks; all must be registered before `start`.
pub struct LogDevCallbacks {
    pub append_comp: AppendCompCb,
    pub store_found: StoreFoundCb,
    pub log_found: LogFoundCb,
}

// ── Store-id reservation ────────────────────────────────────────────────────

/// Number of store ids one log device can hand out.
pub const STORE_ID_CAPACITY: u32 = 1024;

/// Bitmap reserver for store ids, serialized into the info block.
#[derive(Debug, Clone)]
pub struct StoreIdReserver {
    bitmap: Vec<u8>,
    capacity: u32,
}

impl StoreIdReserver {
    #[must_use]
    pub fn new(capacity: u32) -> Self {
        Self {
            bitmap: vec![0_u8; (capacity as usize).div_ceil(8)],
            capacity,
        }
    }

    pub fn reserve(&mut self) -> Result<StoreId> {
        let Some(id) = bitmap_find_free(&self.bitmap, self.capacity, 0) else {
            return Err(KeelError::SpaceFull);
        };
        bitmap_set(&mut self.bitmap, id);
        Ok(StoreId(id))
    }

    pub fn unreserve(&mut self, id: StoreId) {
        bitmap_clear(&mut self.bitmap, id.0);
    }

    #[must_use]
    pub fn is_reserved(&self, id: StoreId) -> bool {
        bitmap_get(&self.bitmap, id.0)
    }

    #[must_use]
    pub fn reserved_ids(&self) -> Vec<StoreId> {
        (0..self.capacity)
            .filter(|&id| bitmap_get(&self.bitmap, id))
            .map(StoreId)
            .collect()
    }

    #[must_use]
    pub fn bitmap_bytes(&self) -> &[u8] {
        &self.bitmap
    }

    #[must_use]
    pub fn from_bitmap(bitmap: Vec<u8>, capacity: u32) -> Self {
        Self { bitmap, capacity }
    }
}

// ── Info block ──────────────────────────────────────────────────────────────

/// Serialized size of the info block stored in the vdev context.
pub const INFO_BLOCK_SIZE: usize = 2048;
const INFO_BLOCK_MAGIC: u32 = 0xDABA_F00D;
const INFO_BLOCK_VERSION: u32 = 1;

/// Persisted log-device state: the first live device offset plus the
/// store-id reservation bitmap.
#[derive(Debug, Clone)]
struct LogdevInfoBlock {
    logdev_id: u32,
    start_dev_offset: u64,
    reserver: StoreIdReserver,
}

impl LogdevInfoBlock {
    fn serialize(&self) -> Vec<u8> {
        let mut buf = vec![0_u8; INFO_BLOCK_SIZE];
        put_le_u32(&mut buf, 0, INFO_BLOCK_MAGIC);
        put_le_u32(&mut buf, 4, INFO_BLOCK_VERSION);
        put_le_u32(&mut buf, 8, self.logdev_id);
        put_le_u64(&mut buf, 12, self.start_dev_offset);
        put_le_u32(&mut buf, 20, STORE_ID_CAPACITY);
        let bitmap = self.reserver.bitmap_bytes();
        buf[24..24 + bitmap.len()].copy_from_slice(bitmap);
        buf
    }

    fn parse(data: &[u8]) -> Result<Self> {
        let magic = read_le_u32(data, 0)
            .map_err(|e| KeelError::Format(format!("short info block: {e}")))?;
        if magic != INFO_BLOCK_MAGIC {
            return Err(KeelError::Format(format!(
                "info block magic mismatch: {magic:#x}"
            )));
        }
        let version = read_le_u32(data, 4)
            .map_err(|e| KeelError::Format(format!("short info block: {e}")))?;
        if version != INFO_BLOCK_VERSION {
            return Err(KeelError::Format(format!(
                "unsupported info block version: {version}"
            )));
        }
        let logdev_id = read_le_u32(data, 8)
            .map_err(|e| KeelError::Format(format!("short info block: {e}")))?;
        let start_dev_offset = read_le_u64(data, 12)
            .map_err(|e| KeelError::Format(format!("short info block: {e}")))?;
        let capacity = read_le_u32(data, 20)
            .map_err(|e| KeelError::Format(format!("short info block: {e}")))?;
        if capacity != STORE_ID_CAPACITY {
            return Err(KeelError::Format(format!(
                "info block store capacity mismatch: {capacity}"
            )));
        }
        let bitmap_len = (capacity as usize).div_ceil(8);
        let bitmap = data
            .get(24..24 + bitmap_len)
            .ok_or_else(|| KeelError::Format("info block bitmap truncated".to_owned()))?
            .to_vec();
        Ok(Self {
            logdev_id,
            start_dev_offset,
            reserver: StoreIdReserver::from_bitmap(bitmap, capacity),
        })
    }
}

// ── In-memory record tracker ────────────────────────────────────────────────

#[derive(Debug)]
struct TrackedRecord {
    store_id: StoreId,
    seq_num: SeqNum,
    /// Dropped once the record is durable; the device is the copy of record.
    data: Option<Vec<u8>>,
    context: u64,
    completed: bool,
}

/// Ordered tracker of in-memory records keyed by log index.
///
/// `create` is called concurrently by appenders; the flush walk and
/// completion run single-threaded under the flush guard.
#[derive(Debug, Default)]
struct StreamTracker {
    records: BTreeMap<i64, TrackedRecord>,
}

impl StreamTracker {
    fn create(&mut self, idx: i64, rec: TrackedRecord) {
        let prev = self.records.insert(idx, rec);
        debug_assert!(prev.is_none(), "log idx {idx} reused");
    }

    /// Walk active (uncompleted) records from `from` upward in index order,
    /// stopping at the first gap or when `f` returns `false`.
    fn foreach_active<F: FnMut(i64, &TrackedRecord) -> bool>(&self, from: i64, mut f: F) {
        let mut idx = from;
        while let Some(rec) = self.records.get(&idx) {
            if rec.completed || !f(idx, rec) {
                break;
            }
            idx += 1;
        }
    }

    /// Mark `[from, upto]` complete, dropping payloads, and return the
    /// completion metadata in index order.
    fn complete(&mut self, from: i64, upto: i64) -> Vec<(i64, StoreId, u64)> {
        let mut out = Vec::with_capacity((upto - from + 1).max(0) as usize);
        for idx in from..=upto {
            if let Some(rec) = self.records.get_mut(&idx) {
                rec.completed = true;
                rec.data = None;
                out.push((idx, rec.store_id, rec.context));
            }
        }
        out
    }

    fn truncate(&mut self, upto: i64) {
        self.records = self.records.split_off(&(upto + 1));
    }

    fn reinit(&mut self) {
        self.records.clear();
    }

    fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

// ── Flush timer ─────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct TimerSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

/// Handle for the recurring flush-check thread. The tick wait is
/// condvar-based so shutdown interrupts a sleeping timer immediately.
#[derive(Debug)]
struct FlushTimer {
    signal: Arc<TimerSignal>,
    join: Option<JoinHandle<()>>,
}

impl FlushTimer {
    fn request_stop(&self) {
        *self.signal.stopped.lock() = true;
        self.signal.cond.notify_all();
    }

    fn shutdown(mut self) {
        self.request_stop();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for FlushTimer {
    fn drop(&mut self) {
        self.request_stop();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

// ── LogDev ──────────────────────────────────────────────────────────────────

pub struct LogDev<D: ByteDevice + 'static> {
    jdev: Arc<JournalVirtualDev<D>>,
    config: LogDevConfig,
    logdev_id: u32,
    cbs: LogDevCallbacks,

    records: Mutex<StreamTracker>,
    /// Generator of log indices; `fetch_add` is the only writer.
    log_idx: AtomicI64,
    /// Bytes appended but not yet handed to a flush.
    pending_flush_size: AtomicI64,
    /// Single-flusher guard. Winner of the CAS owns group assembly, the
    /// device write, and completion processing.
    is_flushing: AtomicBool,
    last_flush_idx: AtomicI64,
    /// Key of the last flushed record: its index and the device offset of
    /// the group that carried it. Checkpoint cut-offs read this.
    last_flush_key: Mutex<LogDevKey>,
    last_truncate_idx: AtomicI64,
    /// CRC of the last persisted group; chained into the next header.
    last_crc: Mutex<Option<u32>>,
    last_flush_time: Mutex<Instant>,
    group_pool: Mutex<Vec<LogGroup>>,
    block_flush_q: Mutex<Vec<FlushBlockedCb>>,
    store_reserve: Mutex<StoreIdReserver>,
    start_dev_offset: AtomicU64,
    timer: Mutex<Option<FlushTimer>>,
}

impl<D: ByteDevice + 'static> LogDev<D> {
    pub fn new(
        jdev: Arc<JournalVirtualDev<D>>,
        logdev_id: u32,
        config: LogDevConfig,
        callbacks: LogDevCallbacks,
    ) -> Result<Arc<Self>> {
        let config = config.validate()?;
        let mut pool = Vec::with_capacity(MAX_LOG_GROUP);
        for _ in 0..MAX_LOG_GROUP {
            pool.push(LogGroup::new());
        }
        Ok(Arc::new(Self {
            jdev,
            config,
            logdev_id,
            cbs: callbacks,
            records: Mutex::new(StreamTracker::default()),
            log_idx: AtomicI64::new(0),
            pending_flush_size: AtomicI64::new(0),
            is_flushing: AtomicBool::new(false),
            last_flush_idx: AtomicI64::new(-1),
            last_flush_key: Mutex::new(LogDevKey {
                idx: LogId::INVALID,
                dev_offset: 0,
            }),
            last_truncate_idx: AtomicI64::new(-1),
            last_crc: Mutex::new(None),
            last_flush_time: Mutex::new(Instant::now()),
            group_pool: Mutex::new(pool),
            block_flush_q: Mutex::new(Vec::new()),
            store_reserve: Mutex::new(StoreIdReserver::new(STORE_ID_CAPACITY)),
            start_dev_offset: AtomicU64::new(0),
            timer: Mutex::new(None),
        }))
    }

    /// Start the log device.
    ///
    /// On `format`, zero the info block and initialize an empty store-id
    /// reserver. Otherwise load the info block, announce reserved stores,
    /// replay the log stream from the persisted start offset, and position
    /// the append tail past the last valid group. Either way the recurring
    /// flush timer is armed before returning.
    pub fn start(self: &Arc<Self>, format: bool) -> Result<()> {
        if format {
            *self.store_reserve.lock() = StoreIdReserver::new(STORE_ID_CAPACITY);
            self.start_dev_offset.store(0, Ordering::Release);
            self.persist_info_block()?;
            info!(
                target: "keel::logdev",
                event = "logdev_formatted",
                logdev_id = self.logdev_id
            );
        } else {
            let mut ctx = vec![0_u8; INFO_BLOCK_SIZE];
            self.jdev.get_vb_context(&mut ctx)?;
            let info = LogdevInfoBlock::parse(&ctx)?;
            if info.logdev_id != self.logdev_id {
                return Err(KeelError::Format(format!(
                    "info block belongs to logdev {} (expected {})",
                    info.logdev_id, self.logdev_id
                )));
            }
            self.start_dev_offset
                .store(info.start_dev_offset, Ordering::Release);
            let reserved = info.reserver.reserved_ids();
            *self.store_reserve.lock() = info.reserver;

            for id in reserved {
                (self.cbs.store_found)(id);
            }

            self.jdev.truncate(info.start_dev_offset)?;
            self.do_load(info.start_dev_offset)?;

            let next_idx = self.log_idx.load(Ordering::Acquire);
            self.records.lock().reinit();
            self.last_flush_idx.store(next_idx - 1, Ordering::Release);
            info!(
                target: "keel::logdev",
                event = "logdev_recovered",
                logdev_id = self.logdev_id,
                next_log_idx = next_idx
            );
        }

        *self.timer.lock() = Some(self.start_timer());
        Ok(())
    }

    /// Stop the log device. Requires that no flush is in flight and no
    /// pending bytes remain.
    pub fn stop(&self) -> Result<()> {
        if self.pending_flush_size.load(Ordering::Acquire) != 0 {
            return Err(KeelError::Format(
                "logdev stopped while appends are pending flush".to_owned(),
            ));
        }
        if self.is_flushing.load(Ordering::Acquire) {
            return Err(KeelError::Format(
                "logdev stopped while a flush is in flight".to_owned(),
            ));
        }

        if let Some(timer) = self.timer.lock().take() {
            timer.shutdown();
        }
        self.records.lock().reinit();
        self.log_idx.store(0, Ordering::Release);
        self.last_flush_idx.store(-1, Ordering::Release);
        *self.last_flush_key.lock() = LogDevKey {
            idx: LogId::INVALID,
            dev_offset: 0,
        };
        self.last_truncate_idx.store(-1, Ordering::Release);
        *self.last_crc.lock() = None;
        self.block_flush_q.lock().clear();
        info!(target: "keel::logdev", event = "logdev_stopped", logdev_id = self.logdev_id);
        Ok(())
    }

    /// Append a record asynchronously. Returns the assigned log index
    /// immediately; durability is signaled later through `append_comp_cb`.
    pub fn append_async(
        &self,
        store_id: StoreId,
        seq_num: SeqNum,
        data: Vec<u8>,
        cb_context: u64,
    ) -> Result<LogId> {
        let size = data.len();
        let idx = self.log_idx.fetch_add(1, Ordering::AcqRel);
        self.records.lock().create(
            idx,
            TrackedRecord {
                store_id,
                seq_num,
                data: Some(data),
                context: cb_context,
                completed: false,
            },
        );
        trace!(
            target: "keel::logdev",
            event = "append",
            idx,
            store_id = store_id.0,
            seq_num = seq_num.0,
            size
        );
        self.flush_if_needed_inner(size as i64, Some(idx))?;
        Ok(LogId(idx))
    }

    /// Flush check entry point for the timer and for explicit callers.
    pub fn flush_if_needed(&self) -> Result<bool> {
        self.flush_if_needed_inner(0, None)
    }

    /// Force a flush of all pending data regardless of thresholds. Used by
    /// checkpoint cut-offs and clean shutdown.
    pub fn flush(&self) -> Result<bool> {
        let mut flushed = false;
        while self.pending_flush_size.load(Ordering::Acquire) > 0 {
            if self
                .is_flushing
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                thread::yield_now();
                continue;
            }
            while self.pending_flush_size.load(Ordering::Acquire) > 0 {
                let upto_est = self.log_idx.load(Ordering::Relaxed);
                let estimated =
                    (upto_est - self.last_flush_idx.load(Ordering::Acquire) + 4).max(1) as u32;
                let Some(lg) = self.prepare_flush(estimated)? else {
                    break;
                };
                self.pending_flush_size
                    .fetch_sub(i64::from(lg.actual_data_size()), Ordering::Relaxed);
                *self.last_flush_time.lock() = Instant::now();
                match self.do_flush(lg) {
                    Ok(()) => flushed = true,
                    Err(err) => {
                        error!(target: "keel::logdev", event = "flush_io_failed", error = %err);
                        self.is_flushing.store(false, Ordering::Release);
                        return Err(err);
                    }
                }
            }
            self.drain_blocked_and_unlock();
            break;
        }
        Ok(flushed)
    }

    /// Run `cb` with flushes excluded. If no flush is in progress the
    /// callback runs immediately; otherwise it is queued and invoked when
    /// the current flush completes, before new flushes resume.
    pub fn try_lock_flush(&self, cb: FlushBlockedCb) -> bool {
        let mut q = self.block_flush_q.lock();
        if self
            .is_flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            drop(q);
            cb();
            self.drain_blocked_and_unlock();
            let _ = self.flush_if_needed();
            return true;
        }
        q.push(cb);
        false
    }

    /// Reserve a fresh store id, optionally persisting the info block.
    pub fn reserve_store_id(&self, persist: bool) -> Result<StoreId> {
        let mut reserver = self.store_reserve.lock();
        let id = reserver.reserve()?;
        if persist {
            self.persist_info_block_with(&reserver)?;
        }
        debug!(target: "keel::logdev", event = "store_reserved", store_id = id.0, persist);
        Ok(id)
    }

    /// Return a store id to the reserver. The released id is persisted on
    /// the next `persist_store_ids` or truncation.
    pub fn unreserve_store_id(&self, id: StoreId) {
        self.store_reserve.lock().unreserve(id);
        debug!(target: "keel::logdev", event = "store_unreserved", store_id = id.0);
    }

    /// Write the current store-id reservation map through to the device.
    pub fn persist_store_ids(&self) -> Result<()> {
        let reserver = self.store_reserve.lock();
        self.persist_info_block_with(&reserver)
    }

    /// Synchronous positioned read of exactly the record named by `key`.
    pub fn read(&self, key: LogDevKey) -> Result<Vec<u8>> {
        let (header, rec, buf) = self.read_header_and_slot(key)?;
        let data_offset = u64::from(rec.data_offset(&header));
        let data_end = data_offset + u64::from(rec.size);
        if data_end <= buf.len() as u64 {
            return Ok(buf[data_offset as usize..data_end as usize].to_vec());
        }
        // Data resides past the initial read; fetch just the rounded span.
        trace!(
            target: "keel::logdev",
            event = "read_beyond_initial",
            idx = key.idx.0,
            dev_offset = key.dev_offset,
            data_offset,
            size = rec.size
        );
        self.read_span(key.dev_offset, data_offset, u64::from(rec.size))
    }

    /// Positioned read of just the serialized record header for `key`.
    pub fn read_record_header(&self, key: LogDevKey) -> Result<SerializedLogRecord> {
        let (_, rec, _) = self.read_header_and_slot(key)?;
        Ok(rec)
    }

    /// Truncate the in-memory tracker up to `key.idx` and the device up to
    /// `key.dev_offset`, persisting the new start offset.
    pub fn truncate(&self, key: LogDevKey) -> Result<()> {
        self.records.lock().truncate(key.idx.0);
        self.jdev.truncate(key.dev_offset)?;
        self.start_dev_offset.store(key.dev_offset, Ordering::Release);
        self.last_truncate_idx.store(key.idx.0, Ordering::Release);
        self.persist_info_block()?;
        info!(
            target: "keel::logdev",
            event = "logdev_truncated",
            upto_idx = key.idx.0,
            dev_offset = key.dev_offset
        );
        Ok(())
    }

    /// Index of the last flushed record.
    #[must_use]
    pub fn last_flush_idx(&self) -> i64 {
        self.last_flush_idx.load(Ordering::Acquire)
    }

    /// Key of the last flushed record, for checkpoint cut-offs: everything
    /// at or below it is durable on the log device.
    #[must_use]
    pub fn last_flush_key(&self) -> LogDevKey {
        *self.last_flush_key.lock()
    }

    #[must_use]
    pub fn pending_flush_size(&self) -> i64 {
        self.pending_flush_size.load(Ordering::Acquire)
    }

    // ── internals ──────────────────────────────────────────────────────────

    fn flush_due(&self, pending: i64) -> bool {
        pending >= self.config.flush_threshold_size as i64
            || (pending > 0
                && self.last_flush_time.lock().elapsed() > self.config.max_time_between_flush)
    }

    fn flush_if_needed_inner(&self, new_size: i64, new_idx: Option<i64>) -> Result<bool> {
        let mut pending = self.pending_flush_size.fetch_add(new_size, Ordering::Relaxed) + new_size;
        let mut flushed = false;

        loop {
            if !self.flush_due(pending) {
                return Ok(flushed);
            }
            if self
                .is_flushing
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                trace!(
                    target: "keel::logdev",
                    event = "flush_deferred",
                    reason = "flush_in_progress"
                );
                return Ok(flushed);
            }

            // We won the flush; drain everything due before handing it back.
            let mut progressed = false;
            while self.flush_due(self.pending_flush_size.load(Ordering::Acquire)) {
                let upto_est = new_idx.unwrap_or_else(|| self.log_idx.load(Ordering::Relaxed));
                let estimated =
                    (upto_est - self.last_flush_idx.load(Ordering::Acquire) + 4).max(1) as u32;
                let Some(lg) = self.prepare_flush(estimated)? else {
                    // A racing appender has counted bytes but not yet
                    // published its record; the timer picks it up.
                    break;
                };
                self.pending_flush_size
                    .fetch_sub(i64::from(lg.actual_data_size()), Ordering::Relaxed);
                *self.last_flush_time.lock() = Instant::now();
                match self.do_flush(lg) {
                    Ok(()) => {
                        flushed = true;
                        progressed = true;
                    }
                    Err(err) => {
                        // Device write failures are fatal to the log; release
                        // the guard so shutdown paths do not wedge.
                        error!(target: "keel::logdev", event = "flush_io_failed", error = %err);
                        self.is_flushing.store(false, Ordering::Release);
                        return Err(err);
                    }
                }
            }

            self.drain_blocked_and_unlock();
            if !progressed {
                return Ok(flushed);
            }
            pending = self.pending_flush_size.load(Ordering::Acquire);
        }
    }

    /// Gather active records into a pooled group and finish it. Returns
    /// `None` when nothing is flushable (racing appender not yet visible).
    fn prepare_flush(&self, estimated_records: u32) -> Result<Option<LogGroup>> {
        let mut lg = self
            .group_pool
            .lock()
            .pop()
            .expect("log group pool exhausted");
        lg.reset(estimated_records);

        let from = self.last_flush_idx.load(Ordering::Acquire) + 1;
        let mut upto = from - 1;
        {
            let tracker = self.records.lock();
            tracker.foreach_active(from, |idx, rec| {
                let data = rec.data.as_deref().unwrap_or(&[]);
                if lg.add_record(
                    LogId(idx),
                    rec.store_id,
                    rec.seq_num,
                    data,
                    self.config.optimal_inline_data_size,
                ) {
                    upto = idx;
                    true
                } else {
                    false
                }
            });
        }

        if upto < from {
            self.group_pool.lock().push(lg);
            return Ok(None);
        }

        let prev_crc = self.last_crc.lock().unwrap_or(0);
        lg.finish(self.logdev_id, prev_crc);
        lg.flush_log_idx_from = LogId(from);
        lg.flush_log_idx_upto = LogId(upto);
        lg.log_dev_offset = self
            .jdev
            .alloc_next_extent(u64::from(lg.header().group_size))?;
        debug!(
            target: "keel::logdev",
            event = "flush_prepared",
            from,
            upto,
            dev_offset = lg.log_dev_offset,
            group_size = lg.header().group_size,
            nrecords = lg.nrecords()
        );
        Ok(Some(lg))
    }

    fn do_flush(&self, lg: LogGroup) -> Result<()> {
        let segments = lg.iovecs();
        self.jdev.pwritev(lg.log_dev_offset, &segments)?;
        self.on_flush_completion(lg)
    }

    fn on_flush_completion(&self, lg: LogGroup) -> Result<()> {
        let from = lg.flush_log_idx_from.0;
        let upto = lg.flush_log_idx_upto.0;
        let completions = self.records.lock().complete(from, upto);
        self.last_flush_idx.store(upto, Ordering::Release);
        *self.last_crc.lock() = Some(lg.header().cur_grp_crc);

        let flush_key = LogDevKey {
            idx: LogId(upto),
            dev_offset: lg.log_dev_offset,
        };
        *self.last_flush_key.lock() = flush_key;
        for (idx, store_id, context) in completions {
            (self.cbs.append_comp)(
                store_id,
                LogDevKey {
                    idx: LogId(idx),
                    dev_offset: lg.log_dev_offset,
                },
                flush_key,
                (upto - idx) as u32,
                context,
            );
        }
        trace!(
            target: "keel::logdev",
            event = "flush_complete",
            from,
            upto,
            dev_offset = lg.log_dev_offset
        );

        self.group_pool.lock().push(lg);
        Ok(())
    }

    /// Run queued flush-blocked callbacks under the flush guard, then
    /// release it.
    fn drain_blocked_and_unlock(&self) {
        loop {
            let cbs: Vec<FlushBlockedCb> = std::mem::take(&mut *self.block_flush_q.lock());
            if cbs.is_empty() {
                break;
            }
            for cb in cbs {
                cb();
            }
        }
        self.is_flushing.store(false, Ordering::Release);
    }

    fn start_timer(self: &Arc<Self>) -> FlushTimer {
        let signal = Arc::new(TimerSignal::default());
        let thread_signal = Arc::clone(&signal);
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.flush_timer_frequency;

        let join = thread::Builder::new()
            .name("keel-logdev-flush".to_owned())
            .spawn(move || loop {
                {
                    let mut stopped = thread_signal.stopped.lock();
                    if !*stopped {
                        thread_signal.cond.wait_for(&mut stopped, interval);
                    }
                    if *stopped {
                        break;
                    }
                }
                let Some(logdev) = weak.upgrade() else {
                    break;
                };
                if let Err(err) = logdev.flush_if_needed() {
                    error!(target: "keel::logdev", event = "timer_flush_failed", error = %err);
                }
            })
            .expect("failed to spawn logdev flush timer");

        FlushTimer {
            signal,
            join: Some(join),
        }
    }

    fn persist_info_block(&self) -> Result<()> {
        let reserver = self.store_reserve.lock();
        self.persist_info_block_with(&reserver)
    }

    fn persist_info_block_with(&self, reserver: &StoreIdReserver) -> Result<()> {
        let info = LogdevInfoBlock {
            logdev_id: self.logdev_id,
            start_dev_offset: self.start_dev_offset.load(Ordering::Acquire),
            reserver: reserver.clone(),
        };
        self.jdev.update_vb_context(&info.serialize())
    }

    fn do_load(&self, cursor: u64) -> Result<()> {
        let mut lstream =
            LogStreamReader::new(Arc::clone(&self.jdev), cursor, self.config.bulk_read_size);
        let mut loaded_from: Option<i64> = None;
        let mut last_key: Option<LogDevKey> = None;

        loop {
            let Some((group, dev_offset)) = lstream.next_group()? else {
                self.assert_next_pages(&mut lstream)?;
                break;
            };
            let header = LogGroupHeader::parse(&group).map_err(|e| KeelError::Corruption {
                offset: dev_offset,
                detail: format!("validated group failed reparse: {e}"),
            })?;
            if loaded_from.is_none() {
                loaded_from = Some(header.start_log_idx);
            }

            for i in 0..header.n_log_records {
                let rec = nth_record(&group, &header, i)?;
                let data = record_data(&group, &header, &rec)?;
                (self.cbs.log_found)(
                    rec.store_id,
                    rec.store_seq_num,
                    LogDevKey {
                        idx: LogId(header.start_log_idx + i64::from(i)),
                        dev_offset,
                    },
                    data,
                );
            }
            self.log_idx.store(
                header.start_log_idx + i64::from(header.n_log_records),
                Ordering::Release,
            );
            if header.n_log_records > 0 {
                last_key = Some(LogDevKey {
                    idx: LogId(header.start_log_idx + i64::from(header.n_log_records) - 1),
                    dev_offset,
                });
            }
        }

        info!(
            target: "keel::logdev",
            event = "logdev_replayed",
            from = loaded_from.unwrap_or(-1),
            upto = self.log_idx.load(Ordering::Acquire) - 1
        );
        // New appends continue from where the valid stream ended and chain
        // their CRCs from the last group replayed.
        *self.last_crc.lock() = lstream.last_crc();
        if let Some(key) = last_key {
            *self.last_flush_key.lock() = key;
        }
        self.jdev.set_tail(lstream.group_cursor())?;
        Ok(())
    }

    /// After the stream ends, probe the next pages: a valid header carrying
    /// a future log index means the data we failed on was corrupted, not
    /// the tail.
    fn assert_next_pages(&self, lstream: &mut LogStreamReader<D>) -> Result<()> {
        info!(
            target: "keel::logdev",
            event = "recovery_tail_probe",
            cursor = lstream.group_cursor(),
            pages = self.config.recovery_extra_probe_pages
        );
        for _ in 0..self.config.recovery_extra_probe_pages {
            let Some(header) = lstream.group_in_next_page()? else {
                continue;
            };
            let cur_idx = self.log_idx.load(Ordering::Acquire);
            if cur_idx == 0 {
                return Err(KeelError::Corruption {
                    offset: lstream.group_cursor(),
                    detail: format!(
                        "found log group (start_idx={}) but info block recorded no log",
                        header.start_log_idx
                    ),
                });
            }
            if header.start_log_idx >= cur_idx {
                return Err(KeelError::Corruption {
                    offset: lstream.group_cursor(),
                    detail: format!(
                        "future header past end of log: start_idx={} log_idx={cur_idx}",
                        header.start_log_idx
                    ),
                });
            }
            warn!(
                target: "keel::logdev",
                event = "recovery_stale_header",
                start_log_idx = header.start_log_idx
            );
        }
        Ok(())
    }

    /// Parse the group header at `key.dev_offset` and the slot for
    /// `key.idx`, verifying magic, index range, and (when the whole group
    /// fits the initial read) the group CRC.
    fn read_header_and_slot(
        &self,
        key: LogDevKey,
    ) -> Result<(LogGroupHeader, SerializedLogRecord, Vec<u8>)> {
        let data_len = self.jdev.data_len();
        if key.dev_offset >= data_len {
            return Err(KeelError::Format(format!(
                "read key out of range: dev_offset={} data_len={data_len}",
                key.dev_offset
            )));
        }
        let read_len = (INITIAL_READ_SIZE as u64).min(data_len - key.dev_offset);
        let mut buf = vec![0_u8; read_len as usize];
        self.jdev.pread(key.dev_offset, &mut buf)?;

        let header = LogGroupHeader::parse(&buf).map_err(|e| KeelError::Corruption {
            offset: key.dev_offset,
            detail: format!("log group header corrupted: {e}"),
        })?;
        if key.idx.0 < header.start_log_idx
            || key.idx.0 >= header.start_log_idx + i64::from(header.n_log_records)
        {
            return Err(KeelError::Corruption {
                offset: key.dev_offset,
                detail: format!(
                    "log key idx {} outside group range [{}, {})",
                    key.idx.0,
                    header.start_log_idx,
                    header.start_log_idx + i64::from(header.n_log_records)
                ),
            });
        }
        if u64::from(header.group_size) <= read_len {
            let crc = crc32c::crc32c(&buf[HEADER_SIZE..header.group_size as usize]);
            if crc != header.cur_grp_crc {
                return Err(KeelError::Corruption {
                    offset: key.dev_offset,
                    detail: "group CRC mismatch on read".to_owned(),
                });
            }
        }

        let n = (key.idx.0 - header.start_log_idx) as u32;
        let slot_start = HEADER_SIZE as u64 + u64::from(n) * RECORD_SIZE as u64;
        let slot_end = slot_start + RECORD_SIZE as u64;
        let rec = if slot_end <= read_len {
            SerializedLogRecord::parse(&buf[slot_start as usize..slot_end as usize])
        } else {
            let span = self.read_span(key.dev_offset, slot_start, RECORD_SIZE as u64)?;
            SerializedLogRecord::parse(&span)
        }
        .map_err(|e| KeelError::Corruption {
            offset: key.dev_offset,
            detail: format!("record slot corrupted: {e}"),
        })?;
        Ok((header, rec, buf))
    }

    /// Read `len` bytes at `group_offset + span_start`, rounding the device
    /// access out to dma boundaries.
    fn read_span(&self, group_offset: u64, span_start: u64, len: u64) -> Result<Vec<u8>> {
        let rounded_start = round_down(span_start, u64::from(DMA_BOUNDARY));
        let rounded_end = round_up(span_start + len, u64::from(DMA_BOUNDARY));
        let mut buf = vec![0_u8; (rounded_end - rounded_start) as usize];
        self.jdev.pread(group_offset + rounded_start, &mut buf)?;
        let skip = (span_start - rounded_start) as usize;
        Ok(buf[skip..skip + len as usize].to_vec())
    }
}
