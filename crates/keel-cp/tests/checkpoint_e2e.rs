#![forbid(unsafe_code)]
//! End-to-end checkpoint pipeline: log appends, dependency-ordered cache
//! flush, allocator superblock persistence, and deferred block frees.

use keel_alloc::{AppendBlkAllocator, BlkAllocHints};
use keel_cp::CpCoordinator;
use keel_device::{
    BlockBuf, BlockDevice, ByteBlockDevice, ByteDevice, JournalVirtualDev, MemByteDevice,
    MemMetaStore, MetaStore,
};
use keel_error::Result;
use keel_logdev::{LogDev, LogDevCallbacks, LogDevConfig};
use keel_types::{BlkId, ChunkId, SeqNum, StoreId};
use keel_wbcache::{
    BlockStore, CacheBuf, Checkpoint, DirtyBufAccountant, FlusherPool, WbCacheConfig,
};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

const BLOCK_SIZE: u32 = 4096;

/// Block store over a fixed-size chunk that acknowledges each durable
/// write back to the allocator.
struct ChunkBlockStore {
    dev: ByteBlockDevice<MemByteDevice>,
    allocator: Arc<AppendBlkAllocator>,
}

impl BlockStore for ChunkBlockStore {
    fn write(&self, bid: BlkId, data: &BlockBuf) -> Result<()> {
        self.dev.write_block(bid.blk_num(), data.as_slice())?;
        self.allocator.reserve_on_disk(bid);
        Ok(())
    }

    fn free_blk(&self, _bid: BlkId) {}
}

struct Pipeline {
    coordinator: Arc<CpCoordinator<ChunkBlockStore, MemByteDevice>>,
    logdev: Arc<LogDev<MemByteDevice>>,
    allocator: Arc<AppendBlkAllocator>,
    meta: Arc<MemMetaStore>,
    chunk_dev: MemByteDevice,
    done_rx: mpsc::Receiver<Arc<Checkpoint>>,
}

fn build_pipeline() -> Pipeline {
    // Journal for the log device.
    let journal_dev = MemByteDevice::new(4096 + (1 << 20));
    let jdev = Arc::new(JournalVirtualDev::new(journal_dev).unwrap());
    let logdev = LogDev::new(
        jdev,
        0,
        LogDevConfig {
            flush_threshold_size: 1 << 20,
            flush_timer_frequency: Duration::from_secs(3600),
            max_time_between_flush: Duration::from_secs(3600),
            bulk_read_size: 8192,
            ..LogDevConfig::default()
        },
        LogDevCallbacks {
            append_comp: Box::new(|_, _, _, _, _| {}),
            store_found: Box::new(|_| {}),
            log_found: Box::new(|_, _, _, _| {}),
        },
    )
    .unwrap();
    logdev.start(true).unwrap();

    // Allocator and its chunk device.
    let meta = Arc::new(MemMetaStore::new());
    let meta_dyn: Arc<dyn MetaStore> = Arc::clone(&meta) as Arc<dyn MetaStore>;
    let allocator =
        Arc::new(AppendBlkAllocator::new(ChunkId(0), 256, meta_dyn, true).unwrap());
    let chunk_dev = MemByteDevice::new(256 * BLOCK_SIZE as usize);
    let store = Arc::new(ChunkBlockStore {
        dev: ByteBlockDevice::new(chunk_dev.clone(), BLOCK_SIZE).unwrap(),
        allocator: Arc::clone(&allocator),
    });

    let flushers = FlusherPool::start(2).unwrap();
    let accountant = DirtyBufAccountant::new(1_000);
    let (done_tx, done_rx) = mpsc::channel();
    let coordinator = CpCoordinator::new(
        store,
        WbCacheConfig {
            cache_flush_threads: 2,
            ..WbCacheConfig::default()
        },
        flushers,
        accountant,
        Arc::clone(&logdev),
        Arc::clone(&allocator),
        Box::new(move |cp| {
            let _ = done_tx.send(cp);
        }),
    )
    .unwrap();

    Pipeline {
        coordinator,
        logdev,
        allocator,
        meta,
        chunk_dev,
        done_rx,
    }
}

fn wait_done(p: &Pipeline) -> Arc<Checkpoint> {
    p.done_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("checkpoint did not complete")
}

#[test]
fn checkpoint_persists_log_cache_and_allocator_together() {
    let p = build_pipeline();
    let cp1 = p.coordinator.trigger_cp(true).unwrap();

    // Three dependent index pages, each preceded by its log record.
    let mut bufs: Vec<CacheBuf> = Vec::new();
    for i in 0..3_u8 {
        p.logdev
            .append_async(StoreId(1), SeqNum(i64::from(i)), vec![i; 256], 0)
            .unwrap();
        let bid = p.allocator.alloc(1, BlkAllocHints::default()).unwrap();
        let buf = CacheBuf::new(bid, BlockBuf::new(vec![0xC0 + i; BLOCK_SIZE as usize]));
        let dep = bufs.last().cloned();
        p.coordinator.cache().write(&buf, dep.as_ref(), &cp1);
        bufs.push(buf);
    }

    // A page freed under this checkpoint; released only after completion.
    let freed = p.allocator.alloc(1, BlkAllocHints::default()).unwrap();
    let free_list = cp1.free_blks().unwrap();
    p.coordinator
        .cache()
        .free_blk(freed, Some(&free_list), u64::from(BLOCK_SIZE));
    assert_eq!(p.allocator.freeable_nblks(), 0);

    // Switch generations; cp1 drains and persists.
    let cp2 = p.coordinator.trigger_cp(true).unwrap();
    assert_eq!(cp2.cp_id(), 2);
    let done = wait_done(&p);
    assert_eq!(done.cp_id(), 1);
    assert!(!done.is_failed(), "cp failed: {:?}", done.failure());

    // Cache pages landed on the chunk device.
    for (i, buf) in bufs.iter().enumerate() {
        let mut block = vec![0_u8; BLOCK_SIZE as usize];
        p.chunk_dev
            .read_exact_at(buf.node_id().blk_num() * u64::from(BLOCK_SIZE), &mut block)
            .unwrap();
        assert_eq!(block, vec![0xC0 + i as u8; BLOCK_SIZE as usize]);
    }

    // The log was persisted up to the cut-off before completion, and the
    // coordinator recorded the real cut-off key (all three records landed
    // in the first group, at device offset 0).
    assert_eq!(p.logdev.pending_flush_size(), 0);
    assert_eq!(p.logdev.last_flush_idx(), 2);
    let cutoff = p.coordinator.last_cp_log_cutoff().unwrap();
    assert_eq!(cutoff.idx.0, 2);
    assert_eq!(cutoff.dev_offset, 0);
    assert_eq!(cutoff, p.logdev.last_flush_key());

    // Allocator state: writes acknowledged, the free applied and persisted.
    assert_eq!(p.allocator.commit_offset(), 3);
    assert_eq!(p.allocator.freeable_nblks(), 1);
    assert!(free_list.lock().is_empty());

    let meta_dyn: Arc<dyn MetaStore> = Arc::clone(&p.meta) as Arc<dyn MetaStore>;
    let recovered = AppendBlkAllocator::new(ChunkId(0), 256, meta_dyn, false).unwrap();
    assert_eq!(recovered.commit_offset(), 3);
    assert_eq!(recovered.used_blks(), 3);
    assert_eq!(recovered.freeable_nblks(), 1);
}

#[test]
fn non_alloc_checkpoints_accumulate_frees_until_alloc_cp() {
    let p = build_pipeline();
    let cp1 = p.coordinator.trigger_cp(true).unwrap();

    let freed = p.allocator.alloc(2, BlkAllocHints::default()).unwrap();
    p.coordinator
        .cache()
        .free_blk(freed, Some(&cp1.free_blks().unwrap()), 0);

    // Non-alloc switch: cp2 inherits cp1's free list, and draining cp1
    // must not release the accumulated blocks yet.
    let cp2 = p.coordinator.trigger_cp(false).unwrap();
    let done = wait_done(&p);
    assert_eq!(done.cp_id(), 1);
    assert!(Arc::ptr_eq(
        &cp1.free_blks().unwrap(),
        &cp2.free_blks().unwrap()
    ));
    assert_eq!(cp2.free_blks().unwrap().lock().len(), 1);

    // The allocator checkpoint finally applies the free.
    let _cp3 = p.coordinator.trigger_cp(true).unwrap();
    let done = wait_done(&p);
    assert_eq!(done.cp_id(), 2);
    assert_eq!(p.allocator.freeable_nblks(), 2);
}

#[test]
fn trigger_while_draining_is_rejected() {
    let p = build_pipeline();
    let cp1 = p.coordinator.trigger_cp(true).unwrap();

    // Leave a dirty buffer so the drain stays observable until it runs.
    let bid = p.allocator.alloc(1, BlkAllocHints::default()).unwrap();
    let buf = CacheBuf::new(bid, BlockBuf::new(vec![1; BLOCK_SIZE as usize]));
    p.coordinator.cache().write(&buf, None, &cp1);

    let _cp2 = p.coordinator.trigger_cp(true).unwrap();
    // cp1 is draining; a third switch may be rejected until it completes.
    let third = p.coordinator.trigger_cp(true);
    let done = wait_done(&p);
    assert_eq!(done.cp_id(), 1);
    if third.is_err() {
        // After completion the switch goes through.
        p.coordinator.trigger_cp(true).unwrap();
    }
}
