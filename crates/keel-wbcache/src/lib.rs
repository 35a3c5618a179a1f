#![forbid(unsafe_code)]
//! Write-back cache: gathers dirty index buffers, holds them until
//! checkpoint time, then flushes them to the block store in an order
//! consistent with caller-declared dependencies.
//!
//! Two checkpoint generations (`cp_id % 2`) are live at once: one draining,
//! one accepting new writes. Each dirty buffer carries a per-generation
//! writeback request; requests form a reverse-adjacency DAG through
//! `dependent_cnt` and `req_q`, and a request issues only when its count
//! reaches zero.

use keel_alloc::BlkAllocCp;
use keel_device::BlockBuf;
use keel_error::{KeelError, Result};
use keel_types::BlkId;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, trace, warn};

/// Two checkpoint generations live simultaneously.
pub const MAX_CP_CNT: usize = 2;

/// Shared ordered set of blocks whose device-level free is deferred to
/// checkpoint completion.
pub type FreeBlkList = Arc<Mutex<BTreeSet<BlkId>>>;

/// Fired when a checkpoint generation fully drains.
pub type CpCompCb = Box<dyn Fn(Arc<Checkpoint>) + Send + Sync>;
/// Back-pressure to the coordinator when the dirty count crosses its limit.
pub type TriggerCpCb = Box<dyn Fn() + Send + Sync>;

// ── Block store contract ────────────────────────────────────────────────────

/// The block store the cache flushes through.
pub trait BlockStore: Send + Sync {
    /// Persist the buffer for `bid`. Called from flusher threads.
    fn write(&self, bid: BlkId, data: &BlockBuf) -> Result<()>;

    /// Cache-level free of `bid`. The device-level free is deferred through
    /// the checkpoint free list.
    fn free_blk(&self, bid: BlkId);
}

// ── Checkpoint handle ───────────────────────────────────────────────────────

/// A consistency barrier. Dirty buffers and allocator state produced before
/// the barrier flush together and become crash-recoverable as a unit.
pub struct Checkpoint {
    cp_id: u64,
    free_blks: Mutex<Option<FreeBlkList>>,
    /// Set when this checkpoint also flushes the block allocator; only then
    /// does its accumulated free list release to the allocator.
    blkalloc_cp: AtomicBool,
    failed: AtomicBool,
    fail_detail: Mutex<Option<String>>,
}

impl Checkpoint {
    #[must_use]
    pub fn new(cp_id: u64) -> Arc<Self> {
        Arc::new(Self {
            cp_id,
            free_blks: Mutex::new(None),
            blkalloc_cp: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            fail_detail: Mutex::new(None),
        })
    }

    pub fn set_blkalloc_cp(&self, blkalloc_cp: bool) {
        self.blkalloc_cp.store(blkalloc_cp, Ordering::Release);
    }

    #[must_use]
    pub fn is_blkalloc_cp(&self) -> bool {
        self.blkalloc_cp.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn cp_id(&self) -> u64 {
        self.cp_id
    }

    /// Generation slot: `cp_id % 2`.
    #[must_use]
    pub fn generation(&self) -> usize {
        (self.cp_id % MAX_CP_CNT as u64) as usize
    }

    #[must_use]
    pub fn free_blks(&self) -> Option<FreeBlkList> {
        self.free_blks.lock().clone()
    }

    pub fn set_free_blks(&self, list: FreeBlkList) {
        *self.free_blks.lock() = Some(list);
    }

    /// Record a flush failure. The checkpoint still drains (so counters
    /// settle and `cp_comp_cb` fires) but does not complete cleanly.
    pub fn mark_failed(&self, detail: String) {
        if !self.failed.swap(true, Ordering::AcqRel) {
            *self.fail_detail.lock() = Some(detail);
        }
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn failure(&self) -> Option<String> {
        self.fail_detail.lock().clone()
    }
}

impl std::fmt::Debug for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checkpoint")
            .field("cp_id", &self.cp_id)
            .field("failed", &self.is_failed())
            .finish()
    }
}

// ── Writeback request ───────────────────────────────────────────────────────

/// Writeback request lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WbReqState {
    /// Created, not yet attached to a generation.
    Init = 0,
    /// Dirty in its generation, waiting for the checkpoint flush.
    Waiting = 1,
    /// All dependencies resolved; write handed to the block store.
    Sent = 2,
    /// Device write finished.
    Compl = 3,
}

impl WbReqState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Waiting,
            2 => Self::Sent,
            3 => Self::Compl,
            _ => Self::Init,
        }
    }
}

/// Per-buffer, per-generation flush intent carrying dependency edges.
///
/// The request pins the flush-time buffer bytes (`mem`) so a concurrent
/// copy-on-write refresh cannot change what an in-flight write persists.
/// `req_q` holds the requests that must wait for this one; `dependent_cnt`
/// is the reverse counter and the request issues when it reaches zero.
pub struct WritebackReq {
    bid: BlkId,
    cp: Arc<Checkpoint>,
    state: AtomicU8,
    mem: Mutex<BlockBuf>,
    buf: CacheBuf,
    req_q: Mutex<Vec<Arc<WritebackReq>>>,
    dependent_cnt: AtomicI32,
}

impl WritebackReq {
    #[must_use]
    pub fn state(&self) -> WbReqState {
        WbReqState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: WbReqState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[must_use]
    pub fn bid(&self) -> BlkId {
        self.bid
    }

    fn generation(&self) -> usize {
        self.cp.generation()
    }
}

impl std::fmt::Debug for WritebackReq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WritebackReq")
            .field("bid", &self.bid)
            .field("cp_id", &self.cp.cp_id())
            .field("state", &self.state())
            .field("dependent_cnt", &self.dependent_cnt.load(Ordering::Acquire))
            .finish()
    }
}

// ── Cache buffer ────────────────────────────────────────────────────────────

struct BufState {
    mem: BlockBuf,
    /// Checkpoint the buffer was last dirtied in.
    cp_id: Option<u64>,
    /// Per-generation writeback request slots. Non-null ⇔ dirty in that
    /// generation.
    req: [Option<Arc<WritebackReq>>; MAX_CP_CNT],
}

/// Cache unit: exclusively owns a block id and a reference-counted memory
/// buffer, plus the two per-generation request slots.
#[derive(Clone)]
pub struct CacheBuf {
    inner: Arc<CacheBufInner>,
}

struct CacheBufInner {
    node_id: BlkId,
    state: Mutex<BufState>,
}

impl CacheBuf {
    #[must_use]
    pub fn new(node_id: BlkId, mem: BlockBuf) -> Self {
        Self {
            inner: Arc::new(CacheBufInner {
                node_id,
                state: Mutex::new(BufState {
                    mem,
                    cp_id: None,
                    req: [None, None],
                }),
            }),
        }
    }

    #[must_use]
    pub fn node_id(&self) -> BlkId {
        self.inner.node_id
    }

    /// Snapshot of the current memory buffer (shared, not copied).
    #[must_use]
    pub fn mem(&self) -> BlockBuf {
        self.inner.state.lock().mem.clone_ref()
    }

    /// Mutate the buffer contents in place.
    pub fn modify(&self, f: impl FnOnce(&mut [u8])) {
        let mut state = self.inner.state.lock();
        f(state.mem.make_mut());
    }

    /// Whether the buffer is dirty in `generation`.
    #[must_use]
    pub fn is_dirty_in(&self, generation: usize) -> bool {
        self.inner.state.lock().req[generation % MAX_CP_CNT].is_some()
    }

    #[must_use]
    pub fn cp_id(&self) -> Option<u64> {
        self.inner.state.lock().cp_id
    }
}

impl std::fmt::Debug for CacheBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheBuf")
            .field("node_id", &self.node_id())
            .field("cp_id", &self.cp_id())
            .finish()
    }
}

// ── Dirty-buffer accountant ─────────────────────────────────────────────────

/// Process-wide dirty-buffer accounting, passed in at construction.
///
/// Fires the trigger callback when the dirty count crosses its limit, as
/// back-pressure toward the checkpoint coordinator.
pub struct DirtyBufAccountant {
    dirty_buf_cnt: AtomicU64,
    dirty_buf_limit: u64,
    free_blk_bytes: AtomicU64,
    trigger_cp: Mutex<Option<TriggerCpCb>>,
}

impl DirtyBufAccountant {
    #[must_use]
    pub fn new(dirty_buf_limit: u64) -> Arc<Self> {
        Arc::new(Self {
            dirty_buf_cnt: AtomicU64::new(0),
            dirty_buf_limit,
            free_blk_bytes: AtomicU64::new(0),
            trigger_cp: Mutex::new(None),
        })
    }

    pub fn set_trigger_cp_cb(&self, cb: TriggerCpCb) {
        *self.trigger_cp.lock() = Some(cb);
    }

    pub fn inc_dirty_buf_cnt(&self) {
        let prev = self.dirty_buf_cnt.fetch_add(1, Ordering::AcqRel);
        if prev + 1 == self.dirty_buf_limit {
            warn!(
                target: "keel::wbcache",
                event = "dirty_buf_limit_reached",
                dirty_buf_cnt = prev + 1,
                limit = self.dirty_buf_limit
            );
            if let Some(cb) = self.trigger_cp.lock().as_ref() {
                cb();
            }
        }
    }

    pub fn dec_dirty_buf_cnt(&self) {
        let prev = self.dirty_buf_cnt.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "dirty buf count underflow");
    }

    pub fn inc_free_blk(&self, bytes: u64) {
        self.free_blk_bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    #[must_use]
    pub fn dirty_buf_cnt(&self) -> u64 {
        self.dirty_buf_cnt.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn free_blk_bytes(&self) -> u64 {
        self.free_blk_bytes.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for DirtyBufAccountant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirtyBufAccountant")
            .field("dirty_buf_cnt", &self.dirty_buf_cnt())
            .field("dirty_buf_limit", &self.dirty_buf_limit)
            .finish()
    }
}

// ── Flusher pool ────────────────────────────────────────────────────────────

/// Unit of work executed by a flusher thread.
pub type Job = Box<dyn FnOnce() + Send>;

struct JobQueue {
    jobs: Mutex<VecDeque<Job>>,
    cond: Condvar,
}

struct PoolShared {
    queues: Vec<JobQueue>,
    stop: AtomicBool,
}

/// Fixed pool of cache-flush threads, started once by the cache owner.
///
/// Each worker owns a queue; `submit` round-robins across them. Queued jobs
/// drain before a worker honors shutdown.
pub struct FlusherPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    rr: AtomicUsize,
}

impl FlusherPool {
    pub fn start(threads: usize) -> Result<Arc<Self>> {
        if threads == 0 {
            return Err(KeelError::Format(
                "flusher pool needs at least one thread".to_owned(),
            ));
        }
        let shared = Arc::new(PoolShared {
            queues: (0..threads)
                .map(|_| JobQueue {
                    jobs: Mutex::new(VecDeque::new()),
                    cond: Condvar::new(),
                })
                .collect(),
            stop: AtomicBool::new(false),
        });

        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("keel-wbcache-flusher-{i}"))
                .spawn(move || worker_loop(&shared, i))
                .map_err(KeelError::from)?;
            workers.push(handle);
        }
        info!(target: "keel::wbcache", event = "flushers_started", threads);
        Ok(Arc::new(Self {
            shared,
            workers: Mutex::new(workers),
            rr: AtomicUsize::new(0),
        }))
    }

    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.shared.queues.len()
    }

    /// Queue a job on a specific worker (affinity is a performance hint).
    pub fn submit_to(&self, worker: usize, job: Job) {
        let queue = &self.shared.queues[worker % self.shared.queues.len()];
        queue.jobs.lock().push_back(job);
        queue.cond.notify_one();
    }

    /// Queue a job on the next worker round-robin.
    pub fn submit(&self, job: Job) {
        let worker = self.rr.fetch_add(1, Ordering::Relaxed);
        self.submit_to(worker, job);
    }

    /// Stop accepting shutdown-racing sleeps and join the workers after
    /// their queues drain.
    pub fn shutdown(&self) {
        self.shared.stop.store(true, Ordering::Release);
        for queue in &self.shared.queues {
            queue.cond.notify_all();
        }
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for FlusherPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &PoolShared, index: usize) {
    let queue = &shared.queues[index];
    loop {
        let job = {
            let mut jobs = queue.jobs.lock();
            loop {
                if let Some(job) = jobs.pop_front() {
                    break Some(job);
                }
                if shared.stop.load(Ordering::Acquire) {
                    break None;
                }
                queue.cond.wait(&mut jobs);
            }
        };
        match job {
            Some(job) => job(),
            None => break,
        }
    }
}

// ── Configuration ───────────────────────────────────────────────────────────

/// Write-back cache tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WbCacheConfig {
    /// Number of cache-flush threads.
    pub cache_flush_threads: usize,
    /// Dirty-buffer back-pressure threshold as a percentage of
    /// `cache_capacity_bufs`.
    pub dirty_buf_percent: u8,
    /// Nominal cache capacity in buffers, used to derive the dirty limit.
    pub cache_capacity_bufs: u64,
}

impl Default for WbCacheConfig {
    fn default() -> Self {
        Self {
            cache_flush_threads: 1,
            dirty_buf_percent: 10,
            cache_capacity_bufs: 10_000,
        }
    }
}

impl WbCacheConfig {
    pub fn validate(self) -> Result<Self> {
        if self.cache_flush_threads == 0 {
            return Err(KeelError::Format(
                "cache_flush_threads must be > 0".to_owned(),
            ));
        }
        if self.dirty_buf_percent == 0 || self.dirty_buf_percent > 100 {
            return Err(KeelError::Format(
                "dirty_buf_percent must be in 1..=100".to_owned(),
            ));
        }
        Ok(self)
    }

    /// Dirty-buffer count at which the accountant fires `trigger_cp_cb`.
    #[must_use]
    pub fn dirty_buf_limit(self) -> u64 {
        (self.cache_capacity_bufs * u64::from(self.dirty_buf_percent) / 100).max(1)
    }
}

// ── Write-back cache ────────────────────────────────────────────────────────

pub struct WriteBackCache<S: BlockStore + 'static> {
    store: Arc<S>,
    req_list: [Mutex<Vec<Arc<WritebackReq>>>; MAX_CP_CNT],
    free_list: [FreeBlkList; MAX_CP_CNT],
    free_list_cnt: AtomicU64,
    dirty_buf_cnt: [AtomicU64; MAX_CP_CNT],
    cp_comp_cb: CpCompCb,
    accountant: Arc<DirtyBufAccountant>,
    flushers: Arc<FlusherPool>,
    next_flusher: AtomicUsize,
}

impl<S: BlockStore + 'static> WriteBackCache<S> {
    pub fn new(
        store: Arc<S>,
        config: WbCacheConfig,
        flushers: Arc<FlusherPool>,
        accountant: Arc<DirtyBufAccountant>,
        cp_comp_cb: CpCompCb,
    ) -> Result<Arc<Self>> {
        let config = config.validate()?;
        if flushers.thread_count() < config.cache_flush_threads {
            return Err(KeelError::Format(format!(
                "flusher pool has {} threads, config wants {}",
                flushers.thread_count(),
                config.cache_flush_threads
            )));
        }
        Ok(Arc::new(Self {
            store,
            req_list: [Mutex::new(Vec::new()), Mutex::new(Vec::new())],
            free_list: [
                Arc::new(Mutex::new(BTreeSet::new())),
                Arc::new(Mutex::new(BTreeSet::new())),
            ],
            free_list_cnt: AtomicU64::new(0),
            dirty_buf_cnt: [AtomicU64::new(0), AtomicU64::new(0)],
            cp_comp_cb,
            accountant,
            flushers,
            next_flusher: AtomicUsize::new(0),
        }))
    }

    #[must_use]
    pub fn accountant(&self) -> &Arc<DirtyBufAccountant> {
        &self.accountant
    }

    #[must_use]
    pub fn dirty_buf_cnt(&self, generation: usize) -> u64 {
        self.dirty_buf_cnt[generation % MAX_CP_CNT].load(Ordering::Acquire)
    }

    /// Prepare the generation `new_cp.cp_id % 2` for writes.
    ///
    /// The slot must be fully drained. The new checkpoint gets a fresh free
    /// list on an allocator checkpoint (or when there is no current one);
    /// otherwise it inherits the current list so freed blocks keep
    /// accumulating across non-alloc checkpoints.
    pub fn prepare_cp(
        &self,
        new_cp: Option<&Arc<Checkpoint>>,
        cur_cp: Option<&Arc<Checkpoint>>,
        blkalloc_checkpoint: bool,
    ) -> Result<()> {
        let Some(new_cp) = new_cp else {
            return Ok(());
        };
        let generation = new_cp.generation();
        if self.dirty_buf_cnt[generation].load(Ordering::Acquire) != 0
            || !self.req_list[generation].lock().is_empty()
        {
            return Err(KeelError::Format(format!(
                "generation {generation} not drained before prepare_cp (cp {})",
                new_cp.cp_id()
            )));
        }

        let free_list = if blkalloc_checkpoint || cur_cp.is_none() {
            let slot = (self.free_list_cnt.fetch_add(1, Ordering::AcqRel) + 1)
                % MAX_CP_CNT as u64;
            let list = Arc::clone(&self.free_list[slot as usize]);
            debug_assert!(list.lock().is_empty());
            list
        } else {
            // Keep accumulating frees until a blkalloc checkpoint is taken.
            cur_cp
                .and_then(|cp| cp.free_blks())
                .ok_or_else(|| {
                    KeelError::Format("current checkpoint has no free list".to_owned())
                })?
        };
        new_cp.set_free_blks(free_list);
        debug!(
            target: "keel::wbcache",
            event = "cp_prepared",
            cp_id = new_cp.cp_id(),
            generation,
            blkalloc_checkpoint
        );
        Ok(())
    }

    /// Make `buf` dirty in `cp`'s generation, optionally ordered after
    /// `dep_buf` (whose request must exist in the same generation).
    pub fn write(&self, buf: &CacheBuf, dep_buf: Option<&CacheBuf>, cp: &Arc<Checkpoint>) {
        let generation = cp.generation();

        let dep_req = dep_buf.and_then(|dep| {
            let state = dep.inner.state.lock();
            let req = state.req[generation].clone();
            debug_assert!(
                req.is_some(),
                "dependency {} has no request in generation {generation}",
                dep.node_id()
            );
            req
        });

        let wb_req = {
            let mut state = buf.inner.state.lock();
            if let Some(req) = state.req[generation].clone() {
                debug_assert_eq!(req.bid, buf.node_id());
                state.cp_id = Some(cp.cp_id());
                // The buffer may have been re-homed by a copy-on-write
                // refresh since the request was created.
                let mut mem = req.mem.lock();
                if !mem.same_backing(&state.mem) {
                    *mem = state.mem.clone_ref();
                }
                drop(mem);
                req
            } else {
                let req = Arc::new(WritebackReq {
                    bid: buf.node_id(),
                    cp: Arc::clone(cp),
                    state: AtomicU8::new(WbReqState::Waiting as u8),
                    mem: Mutex::new(state.mem.clone_ref()),
                    buf: buf.clone(),
                    req_q: Mutex::new(Vec::new()),
                    // Self-hold released by flush_buffers, so dependents
                    // queued before the flush cannot issue early.
                    dependent_cnt: AtomicI32::new(1),
                });
                state.req[generation] = Some(Arc::clone(&req));
                state.cp_id = Some(cp.cp_id());
                drop(state);

                self.req_list[generation].lock().push(Arc::clone(&req));
                self.dirty_buf_cnt[generation].fetch_add(1, Ordering::AcqRel);
                self.accountant.inc_dirty_buf_cnt();
                trace!(
                    target: "keel::wbcache",
                    event = "buf_dirtied",
                    bid = %req.bid,
                    cp_id = cp.cp_id(),
                    generation
                );
                req
            }
        };
        debug_assert_eq!(wb_req.state(), WbReqState::Waiting);

        if let Some(dep) = dep_req {
            let mut queue = dep.req_q.lock();
            queue.push(Arc::clone(&wb_req));
            wb_req.dependent_cnt.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Copy-on-write entry point invoked before a writer touches `buf`.
    ///
    /// Read access succeeds while the caller's checkpoint is not behind the
    /// buffer's. Write access in the next generation makes a private copy
    /// when the previous generation's flush is still in flight, so the
    /// in-flight write keeps the old bytes.
    pub fn refresh_buf(
        &self,
        buf: &CacheBuf,
        is_write_modifiable: bool,
        cp: Option<&Arc<Checkpoint>>,
    ) -> Result<()> {
        let Some(cp) = cp else {
            return Ok(());
        };
        let mut state = buf.inner.state.lock();
        let Some(buf_cp_id) = state.cp_id else {
            return Ok(());
        };

        if !is_write_modifiable {
            if buf_cp_id > cp.cp_id() {
                return Err(KeelError::CpMismatch {
                    buf_cp: buf_cp_id,
                    caller_cp: cp.cp_id(),
                });
            }
            return Ok(());
        }

        if buf_cp_id == cp.cp_id() {
            // Modifying the buffer multiple times in the same cp.
            return Ok(());
        }
        if buf_cp_id > cp.cp_id() {
            return Err(KeelError::CpMismatch {
                buf_cp: buf_cp_id,
                caller_cp: cp.cp_id(),
            });
        }

        let prev_generation = (cp.cp_id().wrapping_sub(1) % MAX_CP_CNT as u64) as usize;
        match &state.req[prev_generation] {
            None => Ok(()),
            Some(req) if req.state() == WbReqState::Compl => Ok(()),
            Some(_) => {
                // The previous generation still flushes the old bytes
                // through its pinned request; give the writer a private
                // copy.
                let copy = state.mem.deep_copy();
                state.mem = copy;
                trace!(
                    target: "keel::wbcache",
                    event = "buf_copy_on_write",
                    bid = %buf.node_id(),
                    caller_cp = cp.cp_id()
                );
                Ok(())
            }
        }
    }

    /// Free `node_id` from the cache immediately; when `free_list` is
    /// given, defer the device-level free to the owning checkpoint.
    pub fn free_blk(&self, node_id: BlkId, free_list: Option<&FreeBlkList>, size: u64) {
        self.store.free_blk(node_id);
        if let Some(list) = free_list {
            self.accountant.inc_free_blk(size);
            list.lock().insert(node_id);
        }
    }

    /// Hand the checkpoint's accumulated free list to the allocator
    /// checkpoint, which persists the frees.
    pub fn flush_free_blks(&self, cp: &Arc<Checkpoint>, ba_cp: &BlkAllocCp) {
        if let Some(list) = cp.free_blks() {
            ba_cp.free_blks(&list);
        }
    }

    /// Schedule `flush_buffers(cp)` on one of the cache-flush threads.
    pub fn cp_start(self: &Arc<Self>, cp: &Arc<Checkpoint>) {
        let worker = self.next_flusher.fetch_add(1, Ordering::Relaxed);
        let cache = Arc::clone(self);
        let cp = Arc::clone(cp);
        debug!(
            target: "keel::wbcache",
            event = "cp_flush_scheduled",
            cp_id = cp.cp_id(),
            worker = worker % self.flushers.thread_count()
        );
        self.flushers
            .submit_to(worker, Box::new(move || cache.flush_buffers(&cp)));
    }

    /// Release every request of the generation whose dependencies are
    /// already resolved; the rest issue from their dependencies'
    /// completions.
    pub fn flush_buffers(self: &Arc<Self>, cp: &Arc<Checkpoint>) {
        let generation = cp.generation();
        // Self-hold: the generation cannot complete while requests are
        // still being released.
        self.dirty_buf_cnt[generation].fetch_add(1, Ordering::AcqRel);

        let reqs: Vec<Arc<WritebackReq>> =
            std::mem::take(&mut *self.req_list[generation].lock());
        trace!(
            target: "keel::wbcache",
            event = "cp_flush_begin",
            cp_id = cp.cp_id(),
            reqs = reqs.len()
        );
        for req in reqs {
            if req.dependent_cnt.fetch_sub(1, Ordering::AcqRel) == 1 {
                self.issue(req);
            }
        }

        if self.dirty_buf_cnt[generation].fetch_sub(1, Ordering::AcqRel) == 1 {
            (self.cp_comp_cb)(Arc::clone(cp));
        }
    }

    /// Hand a ready request to a flusher: the worker performs the device
    /// write and then runs completion processing.
    fn issue(self: &Arc<Self>, req: Arc<WritebackReq>) {
        debug_assert_eq!(req.state(), WbReqState::Waiting);
        req.set_state(WbReqState::Sent);
        let cache = Arc::clone(self);
        self.flushers.submit(Box::new(move || {
            if req.cp.is_failed() {
                // The checkpoint already failed; drain without touching the
                // device so dependency order is never violated.
                warn!(
                    target: "keel::wbcache",
                    event = "write_skipped_failed_cp",
                    bid = %req.bid,
                    cp_id = req.cp.cp_id()
                );
            } else {
                let mem = req.mem.lock().clone_ref();
                if let Err(err) = cache.store.write(req.bid, &mem) {
                    error!(
                        target: "keel::wbcache",
                        event = "writeback_failed",
                        bid = %req.bid,
                        cp_id = req.cp.cp_id(),
                        error = %err
                    );
                    req.cp.mark_failed(format!("write of {} failed: {err}", req.bid));
                }
            }
            cache.write_back_completion(&req);
        }));
    }

    /// Device-write completion: drain dependents, clear the buffer's
    /// generation slot, and settle the generation counter.
    fn write_back_completion(self: &Arc<Self>, req: &Arc<WritebackReq>) {
        let generation = req.generation();
        req.set_state(WbReqState::Compl);

        {
            // Drained from the back: a request appended later was declared
            // later, so issuing it last respects declaration order.
            let mut queue = req.req_q.lock();
            while let Some(dependent) = queue.pop() {
                if dependent.dependent_cnt.fetch_sub(1, Ordering::AcqRel) == 1 {
                    self.issue(dependent);
                }
            }
        }

        {
            let mut state = req.buf.inner.state.lock();
            state.req[generation] = None;
        }
        self.accountant.dec_dirty_buf_cnt();

        if self.dirty_buf_cnt[generation].fetch_sub(1, Ordering::AcqRel) == 1 {
            trace!(
                target: "keel::wbcache",
                event = "cp_drained",
                cp_id = req.cp.cp_id()
            );
            (self.cp_comp_cb)(Arc::clone(&req.cp));
        }
    }
}

impl<S: BlockStore + 'static> std::fmt::Debug for WriteBackCache<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBackCache")
            .field("dirty_gen0", &self.dirty_buf_cnt(0))
            .field("dirty_gen1", &self.dirty_buf_cnt(1))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_alloc::{AppendBlkAllocator, BlkAllocHints};
    use keel_device::{MemMetaStore, MetaStore};
    use keel_types::ChunkId;
    use std::sync::mpsc;
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct RecordingStore {
        writes: Mutex<Vec<(BlkId, Vec<u8>)>>,
        freed: Mutex<Vec<BlkId>>,
        fail_writes: AtomicBool,
    }

    impl RecordingStore {
        fn write_order(&self) -> Vec<BlkId> {
            self.writes.lock().iter().map(|(bid, _)| *bid).collect()
        }

        fn written_bytes(&self, bid: BlkId) -> Option<Vec<u8>> {
            self.writes
                .lock()
                .iter()
                .rev()
                .find(|(b, _)| *b == bid)
                .map(|(_, data)| data.clone())
        }
    }

    impl BlockStore for RecordingStore {
        fn write(&self, bid: BlkId, data: &BlockBuf) -> Result<()> {
            if self.fail_writes.load(Ordering::Acquire) {
                return Err(std::io::Error::other("injected write failure").into());
            }
            self.writes.lock().push((bid, data.as_slice().to_vec()));
            Ok(())
        }

        fn free_blk(&self, bid: BlkId) {
            self.freed.lock().push(bid);
        }
    }

    struct Harness {
        cache: Arc<WriteBackCache<RecordingStore>>,
        store: Arc<RecordingStore>,
        comp_rx: mpsc::Receiver<Arc<Checkpoint>>,
    }

    fn make_cache(threads: usize) -> Harness {
        let store = Arc::new(RecordingStore::default());
        let flushers = FlusherPool::start(threads).unwrap();
        let accountant = DirtyBufAccountant::new(1_000);
        let (tx, rx) = mpsc::channel();
        let cache = WriteBackCache::new(
            Arc::clone(&store),
            WbCacheConfig {
                cache_flush_threads: threads,
                ..WbCacheConfig::default()
            },
            flushers,
            accountant,
            Box::new(move |cp| {
                let _ = tx.send(cp);
            }),
        )
        .unwrap();
        Harness {
            cache,
            store,
            comp_rx: rx,
        }
    }

    fn bid(n: u64) -> BlkId {
        BlkId::new(n, 1, ChunkId(0))
    }

    fn buf(n: u64, fill: u8) -> CacheBuf {
        CacheBuf::new(bid(n), BlockBuf::new(vec![fill; 64]))
    }

    fn wait_comp(h: &Harness) -> Arc<Checkpoint> {
        h.comp_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("checkpoint did not complete")
    }

    fn start_cp(h: &Harness, cp_id: u64, cur: Option<&Arc<Checkpoint>>) -> Arc<Checkpoint> {
        let cp = Checkpoint::new(cp_id);
        h.cache.prepare_cp(Some(&cp), cur, true).unwrap();
        cp
    }

    #[test]
    fn dependency_orders_device_writes() {
        let h = make_cache(2);
        let cp = start_cp(&h, 1, None);

        let a = buf(1, 0xAA);
        let b = buf(2, 0xBB);
        h.cache.write(&a, None, &cp);
        h.cache.write(&b, Some(&a), &cp);
        h.cache.cp_start(&cp);

        let done = wait_comp(&h);
        assert_eq!(done.cp_id(), 1);
        assert!(!done.is_failed());
        assert_eq!(h.store.write_order(), vec![bid(1), bid(2)]);
        // Exactly one completion.
        assert!(h
            .comp_rx
            .recv_timeout(Duration::from_millis(100))
            .is_err());
        assert!(!a.is_dirty_in(cp.generation()));
        assert!(!b.is_dirty_in(cp.generation()));
    }

    #[test]
    fn dag_writes_follow_topological_order() {
        let h = make_cache(4);
        let cp = start_cp(&h, 1, None);

        // A -> B -> D, A -> C -> D (diamond).
        let a = buf(1, 1);
        let b = buf(2, 2);
        let c = buf(3, 3);
        let d = buf(4, 4);
        h.cache.write(&a, None, &cp);
        h.cache.write(&b, Some(&a), &cp);
        h.cache.write(&c, Some(&a), &cp);
        h.cache.write(&d, Some(&b), &cp);
        h.cache.write(&d, Some(&c), &cp);
        h.cache.cp_start(&cp);
        wait_comp(&h);

        let order = h.store.write_order();
        assert_eq!(order.len(), 4);
        let pos = |b: BlkId| order.iter().position(|&x| x == b).unwrap();
        assert!(pos(bid(1)) < pos(bid(2)));
        assert!(pos(bid(1)) < pos(bid(3)));
        assert!(pos(bid(2)) < pos(bid(4)));
        assert!(pos(bid(3)) < pos(bid(4)));
    }

    #[test]
    fn long_dependency_chain_completes_in_order() {
        let h = make_cache(3);
        let cp = start_cp(&h, 1, None);

        let bufs: Vec<CacheBuf> = (0..16).map(|i| buf(i, i as u8)).collect();
        h.cache.write(&bufs[0], None, &cp);
        for i in 1..bufs.len() {
            h.cache.write(&bufs[i], Some(&bufs[i - 1]), &cp);
        }
        h.cache.cp_start(&cp);
        wait_comp(&h);

        let order = h.store.write_order();
        assert_eq!(
            order,
            (0..16).map(bid).collect::<Vec<BlkId>>()
        );
    }

    #[test]
    fn redirty_same_generation_reuses_request() {
        let h = make_cache(1);
        let cp = start_cp(&h, 1, None);
        let a = buf(1, 0x11);
        h.cache.write(&a, None, &cp);
        a.modify(|m| m.fill(0x22));
        h.cache.write(&a, None, &cp);
        assert_eq!(h.cache.dirty_buf_cnt(cp.generation()), 1);

        h.cache.cp_start(&cp);
        wait_comp(&h);
        assert_eq!(h.store.write_order(), vec![bid(1)]);
        assert_eq!(h.store.written_bytes(bid(1)).unwrap(), vec![0x22; 64]);
    }

    #[test]
    fn copy_on_write_preserves_inflight_bytes() {
        let h = make_cache(1);
        let cp1 = start_cp(&h, 1, None);
        let x = buf(7, 0xAA);
        h.cache.write(&x, None, &cp1);

        // Next checkpoint starts while cp1 has not flushed yet.
        let cp2 = start_cp(&h, 2, Some(&cp1));
        h.cache.refresh_buf(&x, true, Some(&cp2)).unwrap();
        x.modify(|m| m.fill(0xBB));
        h.cache.write(&x, None, &cp2);

        // cp1 flushes after the refresh; it must persist the old bytes.
        h.cache.cp_start(&cp1);
        let done = wait_comp(&h);
        assert_eq!(done.cp_id(), 1);
        assert_eq!(h.store.written_bytes(bid(7)).unwrap(), vec![0xAA; 64]);
        assert_eq!(x.mem().as_slice(), &[0xBB; 64][..]);

        h.cache.cp_start(&cp2);
        let done = wait_comp(&h);
        assert_eq!(done.cp_id(), 2);
        assert_eq!(h.store.written_bytes(bid(7)).unwrap(), vec![0xBB; 64]);
    }

    #[test]
    fn refresh_rules_for_read_and_same_generation() {
        let h = make_cache(1);
        let cp1 = start_cp(&h, 1, None);
        let cp2 = start_cp(&h, 2, Some(&cp1));
        let x = buf(1, 0);

        // Not in any cp yet: always fine.
        h.cache.refresh_buf(&x, true, Some(&cp1)).unwrap();
        h.cache.refresh_buf(&x, false, None).unwrap();

        h.cache.write(&x, None, &cp2);
        // Reader holding the older cp is behind the buffer.
        assert!(matches!(
            h.cache.refresh_buf(&x, false, Some(&cp1)),
            Err(KeelError::CpMismatch { buf_cp: 2, caller_cp: 1 })
        ));
        // Writer in the same generation is fine.
        h.cache.refresh_buf(&x, true, Some(&cp2)).unwrap();
        // Writer holding the older cp is behind.
        assert!(matches!(
            h.cache.refresh_buf(&x, true, Some(&cp1)),
            Err(KeelError::CpMismatch { .. })
        ));

        h.cache.cp_start(&cp2);
        wait_comp(&h);
    }

    #[test]
    fn refresh_after_completion_skips_the_copy() {
        let h = make_cache(1);
        let cp1 = start_cp(&h, 1, None);
        let x = buf(3, 0x10);
        h.cache.write(&x, None, &cp1);
        h.cache.cp_start(&cp1);
        wait_comp(&h);

        let cp2 = start_cp(&h, 2, Some(&cp1));
        let before = x.mem();
        h.cache.refresh_buf(&x, true, Some(&cp2)).unwrap();
        // Previous generation's request completed; no copy was made.
        assert!(before.same_backing(&x.mem()));
    }

    #[test]
    fn empty_checkpoint_completes_immediately() {
        let h = make_cache(1);
        let cp = start_cp(&h, 1, None);
        h.cache.cp_start(&cp);
        let done = wait_comp(&h);
        assert_eq!(done.cp_id(), 1);
        assert!(h.store.write_order().is_empty());
    }

    #[test]
    fn generations_alternate_and_redirty_after_drain() {
        let h = make_cache(2);
        let mut cur: Option<Arc<Checkpoint>> = None;
        for cp_id in 1..=4_u64 {
            let cp = start_cp(&h, cp_id, cur.as_ref());
            let a = buf(1, cp_id as u8);
            h.cache.write(&a, None, &cp);
            h.cache.cp_start(&cp);
            let done = wait_comp(&h);
            assert_eq!(done.cp_id(), cp_id);
            cur = Some(cp);
        }
        assert_eq!(h.store.write_order().len(), 4);
    }

    #[test]
    fn write_failure_marks_cp_failed_and_still_drains() {
        let h = make_cache(2);
        let cp = start_cp(&h, 1, None);
        let a = buf(1, 1);
        let b = buf(2, 2);
        h.cache.write(&a, None, &cp);
        h.cache.write(&b, Some(&a), &cp);

        h.store.fail_writes.store(true, Ordering::Release);
        h.cache.cp_start(&cp);
        let done = wait_comp(&h);
        assert!(done.is_failed());
        assert!(done.failure().unwrap().contains("write of"));
        // Nothing landed on the device, and counters drained.
        assert!(h.store.write_order().is_empty());
        assert_eq!(h.cache.dirty_buf_cnt(cp.generation()), 0);
    }

    #[test]
    fn free_blks_defer_to_the_allocator_checkpoint() {
        let h = make_cache(1);
        let meta: Arc<dyn MetaStore> = Arc::new(MemMetaStore::new());
        let allocator =
            Arc::new(AppendBlkAllocator::new(ChunkId(0), 100, meta, true).unwrap());
        let freed_bid = allocator.alloc(2, BlkAllocHints::default()).unwrap();

        let cp = start_cp(&h, 1, None);
        let list = cp.free_blks().unwrap();
        h.cache.free_blk(freed_bid, Some(&list), 2 * 4096);

        // Cache-level free is immediate, allocator free is deferred.
        assert_eq!(h.store.freed.lock().as_slice(), &[freed_bid]);
        assert_eq!(allocator.freeable_nblks(), 0);

        let ba_cp = BlkAllocCp::new(Arc::clone(&allocator));
        h.cache.flush_free_blks(&cp, &ba_cp);
        ba_cp.cp_flush().unwrap();
        assert_eq!(allocator.freeable_nblks(), 2);

        h.cache.cp_start(&cp);
        wait_comp(&h);
    }

    #[test]
    fn non_alloc_checkpoint_inherits_free_list() {
        let h = make_cache(1);
        let cp1 = Checkpoint::new(1);
        h.cache.prepare_cp(Some(&cp1), None, true).unwrap();
        let list1 = cp1.free_blks().unwrap();
        list1.lock().insert(bid(42));

        let cp2 = Checkpoint::new(2);
        h.cache.prepare_cp(Some(&cp2), Some(&cp1), false).unwrap();
        let list2 = cp2.free_blks().unwrap();
        assert!(Arc::ptr_eq(&list1, &list2));

        // An allocator checkpoint rotates to the other (empty) list. The
        // inherited one still holds the accumulated block.
        h.cache.cp_start(&cp1);
        wait_comp(&h);
        let cp3 = Checkpoint::new(3);
        h.cache.prepare_cp(Some(&cp3), Some(&cp2), true).unwrap();
        let list3 = cp3.free_blks().unwrap();
        assert!(!Arc::ptr_eq(&list2, &list3));
        assert_eq!(list2.lock().len(), 1);
    }

    #[test]
    fn prepare_cp_rejects_undrained_generation() {
        let h = make_cache(1);
        let cp1 = start_cp(&h, 1, None);
        let a = buf(1, 1);
        h.cache.write(&a, None, &cp1);

        // cp3 shares cp1's generation slot, which is still dirty.
        let cp3 = Checkpoint::new(3);
        assert!(h.cache.prepare_cp(Some(&cp3), Some(&cp1), true).is_err());

        h.cache.cp_start(&cp1);
        wait_comp(&h);
    }

    #[test]
    fn accountant_triggers_cp_at_limit() {
        let accountant = DirtyBufAccountant::new(3);
        let fired = Arc::new(AtomicU64::new(0));
        let fired_cb = Arc::clone(&fired);
        accountant.set_trigger_cp_cb(Box::new(move || {
            fired_cb.fetch_add(1, Ordering::SeqCst);
        }));

        accountant.inc_dirty_buf_cnt();
        accountant.inc_dirty_buf_cnt();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        accountant.inc_dirty_buf_cnt();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        accountant.dec_dirty_buf_cnt();
        assert_eq!(accountant.dirty_buf_cnt(), 2);
    }

    #[test]
    fn concurrent_writers_one_generation() {
        let h = make_cache(4);
        let cp = start_cp(&h, 1, None);
        let mut handles = Vec::new();
        for t in 0..4_u64 {
            let cache = Arc::clone(&h.cache);
            let cp = Arc::clone(&cp);
            handles.push(thread::spawn(move || {
                for i in 0..25 {
                    let b = CacheBuf::new(
                        BlkId::new(t * 100 + i, 1, ChunkId(0)),
                        BlockBuf::new(vec![t as u8; 32]),
                    );
                    cache.write(&b, None, &cp);
                }
            }));
        }
        for handle in handles {
            handle.join().expect("no panic");
        }
        assert_eq!(h.cache.dirty_buf_cnt(cp.generation()), 100);

        h.cache.cp_start(&cp);
        wait_comp(&h);
        assert_eq!(h.store.write_order().len(), 100);
        assert_eq!(h.cache.dirty_buf_cnt(cp.generation()), 0);
    }
}
