#![forbid(unsafe_code)]
//! Checkpoint coordination.
//!
//! `CpCoordinator` drives the two-generation checkpoint switch: phase one
//! creates the next generation and prepares the cache slot, phase two drains
//! the previous generation through the flusher pool. When the cache reports
//! the drain, the coordinator persists the log device up to the cut-off,
//! flushes the allocator superblock, applies the deferred block frees, and
//! only then declares the checkpoint complete to the host. A cached buffer
//! thus never becomes durable ahead of the log records that produced it.

use keel_alloc::{AppendBlkAllocator, BlkAllocCp};
use keel_device::ByteDevice;
use keel_error::{KeelError, Result};
use keel_logdev::{LogDev, LogDevKey};
use keel_wbcache::{
    BlockStore, Checkpoint, CpCompCb, DirtyBufAccountant, FlusherPool, WbCacheConfig,
    WriteBackCache,
};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

/// Host notification that a checkpoint finished draining and persisting.
/// Inspect `Checkpoint::failure` for a non-clean completion.
pub type CpDoneCb = Box<dyn Fn(Arc<Checkpoint>) + Send + Sync>;

#[derive(Debug)]
struct CoordState {
    /// Checkpoint currently accepting writes.
    cur_cp: Option<Arc<Checkpoint>>,
    /// Previous generation, draining through the flushers.
    in_progress: Option<Arc<Checkpoint>>,
    /// Last issued checkpoint id.
    cp_id: u64,
    /// Log key of the last completed checkpoint's cut-off. The host may
    /// truncate the log up to it once its stores have consumed the
    /// checkpoint.
    last_cp_cutoff: Option<LogDevKey>,
}

/// Two-generation checkpoint coordinator.
pub struct CpCoordinator<S: BlockStore + 'static, D: ByteDevice + 'static> {
    cache: Arc<WriteBackCache<S>>,
    logdev: Arc<LogDev<D>>,
    allocator: Arc<AppendBlkAllocator>,
    state: Mutex<CoordState>,
    done_cb: CpDoneCb,
}

impl<S: BlockStore + 'static, D: ByteDevice + 'static> CpCoordinator<S, D> {
    /// Build the coordinator and its cache. The cache's completion path
    /// feeds back into the coordinator, which finishes the checkpoint.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<S>,
        config: WbCacheConfig,
        flushers: Arc<FlusherPool>,
        accountant: Arc<DirtyBufAccountant>,
        logdev: Arc<LogDev<D>>,
        allocator: Arc<AppendBlkAllocator>,
        done_cb: CpDoneCb,
    ) -> Result<Arc<Self>> {
        let slot: Arc<Mutex<Option<Weak<Self>>>> = Arc::new(Mutex::new(None));

        let cb_slot = Arc::clone(&slot);
        let cp_comp_cb: CpCompCb = Box::new(move |cp| {
            let coordinator = cb_slot.lock().as_ref().and_then(Weak::upgrade);
            match coordinator {
                Some(coordinator) => coordinator.on_cache_drained(cp),
                None => warn!(
                    target: "keel::cp",
                    event = "cp_drained_after_coordinator_drop",
                    cp_id = cp.cp_id()
                ),
            }
        });

        let cache = WriteBackCache::new(store, config, flushers, accountant, cp_comp_cb)?;
        let coordinator = Arc::new(Self {
            cache,
            logdev,
            allocator,
            state: Mutex::new(CoordState {
                cur_cp: None,
                in_progress: None,
                cp_id: 0,
                last_cp_cutoff: None,
            }),
            done_cb,
        });
        *slot.lock() = Some(Arc::downgrade(&coordinator));

        // Dirty-buffer back-pressure folds into an ordinary checkpoint.
        let trigger_slot = Arc::downgrade(&coordinator);
        coordinator
            .cache
            .accountant()
            .set_trigger_cp_cb(Box::new(move || {
                if let Some(coordinator) = trigger_slot.upgrade() {
                    if let Err(err) = coordinator.trigger_cp(false) {
                        warn!(
                            target: "keel::cp",
                            event = "backpressure_cp_deferred",
                            error = %err
                        );
                    }
                }
            }));
        Ok(coordinator)
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<WriteBackCache<S>> {
        &self.cache
    }

    /// Checkpoint currently accepting writes, if any.
    #[must_use]
    pub fn cur_cp(&self) -> Option<Arc<Checkpoint>> {
        self.state.lock().cur_cp.clone()
    }

    /// Log cut-off of the last cleanly completed checkpoint: every record
    /// at or below this key was durable when that checkpoint was declared
    /// complete. The host drives `LogDev::truncate` from it once all of its
    /// stores have consumed the checkpoint.
    #[must_use]
    pub fn last_cp_log_cutoff(&self) -> Option<LogDevKey> {
        self.state.lock().last_cp_cutoff
    }

    /// Switch to a new checkpoint generation and start draining the old one.
    ///
    /// Returns the new current checkpoint. Fails while the previous
    /// generation is still draining; callers retry after their done
    /// callback fires.
    pub fn trigger_cp(self: &Arc<Self>, blkalloc_cp: bool) -> Result<Arc<Checkpoint>> {
        let (new_cp, old_cp) = {
            let mut state = self.state.lock();
            if state.in_progress.is_some() {
                return Err(KeelError::Format(
                    "checkpoint already in progress".to_owned(),
                ));
            }
            let new_cp = Checkpoint::new(state.cp_id + 1);
            self.cache
                .prepare_cp(Some(&new_cp), state.cur_cp.as_ref(), blkalloc_cp)?;
            state.cp_id += 1;
            let old_cp = state.cur_cp.replace(Arc::clone(&new_cp));
            state.in_progress.clone_from(&old_cp);
            (new_cp, old_cp)
        };
        info!(
            target: "keel::cp",
            event = "cp_switched",
            new_cp = new_cp.cp_id(),
            draining = old_cp.as_ref().map_or(0, |cp| cp.cp_id()),
            blkalloc_cp
        );

        if let Some(old_cp) = old_cp {
            // The closing generation releases its free list only when this
            // switch also checkpoints the allocator.
            old_cp.set_blkalloc_cp(blkalloc_cp);
            self.cache.cp_start(&old_cp);
        }
        Ok(new_cp)
    }

    /// Cache drain notification: persist the log up to the cut-off, flush
    /// the allocator, apply deferred frees, then tell the host.
    fn on_cache_drained(self: &Arc<Self>, cp: Arc<Checkpoint>) {
        if cp.is_failed() {
            error!(
                target: "keel::cp",
                event = "cp_failed",
                cp_id = cp.cp_id(),
                detail = cp.failure().unwrap_or_default()
            );
            self.finish(cp);
            return;
        }

        if let Err(err) = self.persist_cp(&cp) {
            error!(
                target: "keel::cp",
                event = "cp_persist_failed",
                cp_id = cp.cp_id(),
                error = %err
            );
            cp.mark_failed(format!("checkpoint persistence failed: {err}"));
        }
        self.finish(cp);
    }

    fn persist_cp(&self, cp: &Arc<Checkpoint>) -> Result<()> {
        // Log records covering this checkpoint's buffers must be durable
        // before the checkpoint is declared complete.
        self.logdev.flush()?;
        let cutoff = self.logdev.last_flush_key();
        self.state.lock().last_cp_cutoff = Some(cutoff);
        debug!(
            target: "keel::cp",
            event = "cp_log_cutoff",
            cp_id = cp.cp_id(),
            upto_idx = cutoff.idx.0,
            dev_offset = cutoff.dev_offset
        );

        let ba_cp = BlkAllocCp::new(Arc::clone(&self.allocator));
        if cp.is_blkalloc_cp() {
            // Blocks freed under this checkpoint release to the allocator
            // only now, after both log and data flushes persisted.
            self.cache.flush_free_blks(cp, &ba_cp);
        }
        ba_cp.cp_flush()?;
        Ok(())
    }

    fn finish(self: &Arc<Self>, cp: Arc<Checkpoint>) {
        {
            let mut state = self.state.lock();
            state.in_progress = None;
        }
        info!(
            target: "keel::cp",
            event = "cp_complete",
            cp_id = cp.cp_id(),
            clean = !cp.is_failed()
        );
        (self.done_cb)(cp);
    }
}

impl<S: BlockStore + 'static, D: ByteDevice + 'static> std::fmt::Debug for CpCoordinator<S, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CpCoordinator")
            .field("cp_id", &state.cp_id)
            .field("in_progress", &state.in_progress.is_some())
            .finish()
    }
}
