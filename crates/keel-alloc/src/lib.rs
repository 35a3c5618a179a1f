#![forbid(unsafe_code)]
//! Append-only block allocation.
//!
//! `AppendBlkAllocator` is a per-chunk accountant with a two-offset model:
//! `last_append_offset` is the next block to hand out and advances on every
//! allocation; `commit_offset` is the highest block boundary acknowledged as
//! durable and is the only offset that survives a crash. Freed blocks are
//! book-kept but never reclaimed (append-only).

use keel_device::MetaStore;
use keel_error::{KeelError, Result};
use keel_types::{
    put_le_u32, put_le_u64, read_le_u32, read_le_u64, BlkId, ChunkId, MAX_BLKS_PER_BLKID,
};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

const APPEND_BLK_SB_MAGIC: u32 = 0xA11C_A7ED;
const APPEND_BLK_SB_VERSION: u32 = 1;
const APPEND_BLK_SB_SIZE: usize = 32;

/// Allocation hints passed by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlkAllocHints {
    /// Blocks the caller wants held back from this allocation.
    pub reserved_blks: u64,
}

/// Persisted allocator state, written through the metadata service under
/// `append_blk_alloc_chunk_<id>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendBlkSb {
    pub allocator_id: u32,
    pub commit_offset: u64,
    pub freeable_nblks: u64,
}

impl AppendBlkSb {
    fn serialize(&self) -> Vec<u8> {
        let mut buf = vec![0_u8; APPEND_BLK_SB_SIZE];
        put_le_u32(&mut buf, 0, APPEND_BLK_SB_MAGIC);
        put_le_u32(&mut buf, 4, APPEND_BLK_SB_VERSION);
        put_le_u32(&mut buf, 8, self.allocator_id);
        put_le_u64(&mut buf, 12, self.commit_offset);
        put_le_u64(&mut buf, 20, self.freeable_nblks);
        let crc = crc32c::crc32c(&buf[..28]);
        put_le_u32(&mut buf, 28, crc);
        buf
    }

    fn parse(data: &[u8]) -> Result<Self> {
        let bad = |detail: String| KeelError::Format(detail);
        let magic = read_le_u32(data, 0).map_err(|e| bad(format!("short allocator sb: {e}")))?;
        if magic != APPEND_BLK_SB_MAGIC {
            return Err(bad(format!("allocator sb magic mismatch: {magic:#x}")));
        }
        let version = read_le_u32(data, 4).map_err(|e| bad(format!("short allocator sb: {e}")))?;
        if version != APPEND_BLK_SB_VERSION {
            return Err(bad(format!("unsupported allocator sb version: {version}")));
        }
        let stored_crc =
            read_le_u32(data, 28).map_err(|e| bad(format!("short allocator sb: {e}")))?;
        let crc = crc32c::crc32c(&data[..28]);
        if crc != stored_crc {
            return Err(KeelError::Corruption {
                offset: 0,
                detail: format!("allocator sb crc mismatch: stored={stored_crc:#x} computed={crc:#x}"),
            });
        }
        Ok(Self {
            allocator_id: read_le_u32(data, 8).map_err(|e| bad(format!("short allocator sb: {e}")))?,
            commit_offset: read_le_u64(data, 12)
                .map_err(|e| bad(format!("short allocator sb: {e}")))?,
            freeable_nblks: read_le_u64(data, 20)
                .map_err(|e| bad(format!("short allocator sb: {e}")))?,
        })
    }
}

/// Per-chunk monotonically increasing block allocator.
///
/// One writer appends per chunk; offsets are atomics so readers and the
/// checkpoint flush never block allocation.
pub struct AppendBlkAllocator {
    chunk_id: ChunkId,
    total_blks: u64,
    last_append_offset: AtomicU64,
    commit_offset: AtomicU64,
    freeable_nblks: AtomicU64,
    is_dirty: AtomicBool,
    meta: Arc<dyn MetaStore>,
}

impl AppendBlkAllocator {
    /// Create the allocator. With `need_format` the chunk starts empty;
    /// otherwise state is recovered from the persisted superblock (both
    /// in-memory offsets restore to the durable `commit_offset`, never to
    /// the higher unpersisted append offset).
    pub fn new(
        chunk_id: ChunkId,
        total_blks: u64,
        meta: Arc<dyn MetaStore>,
        need_format: bool,
    ) -> Result<Self> {
        let alloc = Self {
            chunk_id,
            total_blks,
            last_append_offset: AtomicU64::new(0),
            commit_offset: AtomicU64::new(0),
            freeable_nblks: AtomicU64::new(0),
            is_dirty: AtomicBool::new(false),
            meta,
        };

        if !need_format {
            if let Some(bytes) = alloc.meta.read_meta(&alloc.name())? {
                let sb = AppendBlkSb::parse(&bytes)?;
                alloc.last_append_offset.store(sb.commit_offset, Ordering::Release);
                alloc.commit_offset.store(sb.commit_offset, Ordering::Release);
                alloc.freeable_nblks.store(sb.freeable_nblks, Ordering::Release);
                info!(
                    target: "keel::alloc",
                    event = "allocator_recovered",
                    chunk_id = chunk_id.0,
                    commit_offset = sb.commit_offset,
                    freeable_nblks = sb.freeable_nblks
                );
            }
        }
        Ok(alloc)
    }

    /// Stable registration name in the metadata service.
    #[must_use]
    pub fn name(&self) -> String {
        format!("append_blk_alloc_chunk_{}", self.chunk_id.0)
    }

    /// Allocate `nblks` contiguous blocks at the append tail.
    pub fn alloc(&self, nblks: u32, hints: BlkAllocHints) -> Result<BlkId> {
        let avail = self
            .available_blks()
            .saturating_sub(hints.reserved_blks);
        if avail < u64::from(nblks) {
            error!(
                target: "keel::alloc",
                event = "alloc_space_full",
                chunk_id = self.chunk_id.0,
                nblks,
                available_blks = self.available_blks(),
                avail_excl_reserved = avail
            );
            return Err(KeelError::SpaceFull);
        }
        if nblks > MAX_BLKS_PER_BLKID {
            return Err(KeelError::Format(format!(
                "alloc request nblks={nblks} exceeds max per blkid {MAX_BLKS_PER_BLKID}"
            )));
        }

        let blk_num = self
            .last_append_offset
            .fetch_add(u64::from(nblks), Ordering::AcqRel);
        debug!(
            target: "keel::alloc",
            event = "blks_allocated",
            chunk_id = self.chunk_id.0,
            blk_num,
            nblks
        );
        Ok(BlkId::new(blk_num, nblks, self.chunk_id))
    }

    /// Allocate a single block.
    pub fn alloc_contiguous(&self) -> Result<BlkId> {
        self.alloc(1, BlkAllocHints::default())
    }

    /// Acknowledge `bid` as durable: bump the commit offset to cover it.
    pub fn reserve_on_disk(&self, bid: BlkId) {
        debug_assert!(
            self.is_blk_alloced(bid),
            "reserve_on_disk for unallocated {bid}"
        );
        let new_offset = bid.end_blk_num();
        let mut cur = self.commit_offset.load(Ordering::Acquire);
        let mut modified = true;
        loop {
            if cur >= new_offset {
                modified = false;
                break;
            }
            match self.commit_offset.compare_exchange_weak(
                cur,
                new_offset,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
        if modified {
            self.is_dirty.store(true, Ordering::Release);
        }
    }

    /// Recovery replay: bump the in-memory append offset to cover `bid`.
    pub fn reserve_on_cache(&self, bid: BlkId) {
        let new_offset = bid.end_blk_num();
        let mut cur = self.last_append_offset.load(Ordering::Acquire);
        loop {
            if cur >= new_offset {
                break;
            }
            match self.last_append_offset.compare_exchange_weak(
                cur,
                new_offset,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Book-keep freed blocks. The blocks are not reclaimed.
    pub fn free(&self, bid: BlkId) {
        self.freeable_nblks
            .fetch_add(u64::from(bid.blk_count()), Ordering::AcqRel);
        self.is_dirty.store(true, Ordering::Release);
    }

    /// Persist the superblock if anything changed since the last flush.
    pub fn cp_flush(&self) -> Result<()> {
        if !self.is_dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let sb = AppendBlkSb {
            allocator_id: u32::from(self.chunk_id.0),
            commit_offset: self.commit_offset.load(Ordering::Acquire),
            freeable_nblks: self.freeable_nblks.load(Ordering::Acquire),
        };
        self.meta.write_meta(&self.name(), &sb.serialize())?;
        debug!(
            target: "keel::alloc",
            event = "allocator_sb_flushed",
            chunk_id = self.chunk_id.0,
            commit_offset = sb.commit_offset,
            freeable_nblks = sb.freeable_nblks
        );
        Ok(())
    }

    #[must_use]
    pub fn is_blk_alloced(&self, bid: BlkId) -> bool {
        bid.blk_num() < self.used_blks()
    }

    #[must_use]
    pub fn is_blk_alloced_on_disk(&self, bid: BlkId) -> bool {
        bid.blk_num() < self.commit_offset.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn available_blks(&self) -> u64 {
        self.total_blks - self.used_blks()
    }

    #[must_use]
    pub fn used_blks(&self) -> u64 {
        self.last_append_offset.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn freeable_nblks(&self) -> u64 {
        self.freeable_nblks.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn commit_offset(&self) -> u64 {
        self.commit_offset.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    /// Reset all offsets to an empty chunk. Persisted on the next flush.
    pub fn reset(&self) {
        self.last_append_offset.store(0, Ordering::Release);
        self.commit_offset.store(0, Ordering::Release);
        self.freeable_nblks.store(0, Ordering::Release);
        self.is_dirty.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for AppendBlkAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppendBlkAllocator")
            .field("chunk_id", &self.chunk_id)
            .field("total_blks", &self.total_blks)
            .field("last_append_offset", &self.used_blks())
            .field("commit_offset", &self.commit_offset())
            .field("freeable_nblks", &self.freeable_nblks())
            .finish()
    }
}

/// Per-checkpoint allocator work: applies the checkpoint's deferred free
/// list and persists the superblock snapshot. Commit-offset advances happen
/// on the host write path through `reserve_on_disk`, not here.
#[derive(Debug)]
pub struct BlkAllocCp {
    allocator: Arc<AppendBlkAllocator>,
}

impl BlkAllocCp {
    #[must_use]
    pub fn new(allocator: Arc<AppendBlkAllocator>) -> Self {
        Self { allocator }
    }

    #[must_use]
    pub fn allocator(&self) -> &Arc<AppendBlkAllocator> {
        &self.allocator
    }

    /// Apply a checkpoint's accumulated free list. Blocks for other chunks
    /// are ignored by this allocator's checkpoint.
    pub fn free_blks(&self, free_list: &Mutex<BTreeSet<BlkId>>) {
        let drained: Vec<BlkId> = {
            let mut list = free_list.lock();
            let drained = list.iter().copied().collect();
            list.clear();
            drained
        };
        let mut freed = 0_u64;
        for bid in drained {
            if bid.chunk_id() == self.allocator.chunk_id() {
                self.allocator.free(bid);
                freed += u64::from(bid.blk_count());
            }
        }
        if freed > 0 {
            debug!(
                target: "keel::alloc",
                event = "cp_blks_freed",
                chunk_id = self.allocator.chunk_id().0,
                nblks = freed
            );
        }
    }

    /// Persist the allocator superblock for this checkpoint.
    pub fn cp_flush(&self) -> Result<()> {
        self.allocator.cp_flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_device::MemMetaStore;

    fn make_alloc(total: u64, meta: &Arc<MemMetaStore>, format: bool) -> AppendBlkAllocator {
        let meta: Arc<dyn MetaStore> = Arc::clone(meta) as Arc<dyn MetaStore>;
        AppendBlkAllocator::new(ChunkId(1), total, meta, format).unwrap()
    }

    #[test]
    fn alloc_advances_the_append_offset() {
        let meta = Arc::new(MemMetaStore::new());
        let alloc = make_alloc(100, &meta, true);
        let a = alloc.alloc(4, BlkAllocHints::default()).unwrap();
        let b = alloc.alloc(6, BlkAllocHints::default()).unwrap();
        assert_eq!(a.blk_num(), 0);
        assert_eq!(a.blk_count(), 4);
        assert_eq!(b.blk_num(), 4);
        assert_eq!(alloc.used_blks(), 10);
        assert_eq!(alloc.available_blks(), 90);
    }

    #[test]
    fn alloc_honors_reserved_blks_hint() {
        let meta = Arc::new(MemMetaStore::new());
        let alloc = make_alloc(10, &meta, true);
        let hints = BlkAllocHints { reserved_blks: 8 };
        assert!(matches!(alloc.alloc(4, hints), Err(KeelError::SpaceFull)));
        assert!(alloc.alloc(2, hints).is_ok());
    }

    #[test]
    fn alloc_space_full_when_exhausted() {
        let meta = Arc::new(MemMetaStore::new());
        let alloc = make_alloc(4, &meta, true);
        alloc.alloc(4, BlkAllocHints::default()).unwrap();
        assert!(matches!(
            alloc.alloc(1, BlkAllocHints::default()),
            Err(KeelError::SpaceFull)
        ));
    }

    #[test]
    fn reserve_on_disk_is_monotonic() {
        let meta = Arc::new(MemMetaStore::new());
        let alloc = make_alloc(100, &meta, true);
        let a = alloc.alloc(5, BlkAllocHints::default()).unwrap();
        let b = alloc.alloc(5, BlkAllocHints::default()).unwrap();
        alloc.reserve_on_disk(b);
        assert_eq!(alloc.commit_offset(), 10);
        // Acknowledging the earlier range does not move the offset back.
        alloc.reserve_on_disk(a);
        assert_eq!(alloc.commit_offset(), 10);
        assert!(alloc.is_blk_alloced_on_disk(a));
    }

    #[test]
    fn commit_offset_never_exceeds_append_offset() {
        let meta = Arc::new(MemMetaStore::new());
        let alloc = make_alloc(100, &meta, true);
        for _ in 0..10 {
            let bid = alloc.alloc(3, BlkAllocHints::default()).unwrap();
            alloc.reserve_on_disk(bid);
            assert!(alloc.commit_offset() <= alloc.used_blks());
        }
    }

    #[test]
    fn recovery_restores_both_offsets_from_commit_offset() {
        let meta = Arc::new(MemMetaStore::new());
        let alloc = make_alloc(100, &meta, true);

        // Allocate 10 blocks but acknowledge only the first 5 as durable.
        let first = alloc.alloc(5, BlkAllocHints::default()).unwrap();
        let _second = alloc.alloc(5, BlkAllocHints::default()).unwrap();
        alloc.reserve_on_disk(first);
        alloc.cp_flush().unwrap();
        drop(alloc);

        let recovered = make_alloc(100, &meta, false);
        assert_eq!(recovered.used_blks(), 5);
        assert_eq!(recovered.commit_offset(), 5);
        let next = recovered.alloc(3, BlkAllocHints::default()).unwrap();
        assert_eq!(next.blk_num(), 5);
        assert_eq!(next.blk_count(), 3);
    }

    #[test]
    fn cp_flush_skips_when_clean() {
        let meta = Arc::new(MemMetaStore::new());
        let alloc = make_alloc(100, &meta, true);
        alloc.cp_flush().unwrap();
        assert_eq!(meta.read_meta(&alloc.name()).unwrap(), None);

        let bid = alloc.alloc(2, BlkAllocHints::default()).unwrap();
        alloc.reserve_on_disk(bid);
        alloc.cp_flush().unwrap();
        assert!(meta.read_meta(&alloc.name()).unwrap().is_some());
    }

    #[test]
    fn reserve_on_cache_replays_holes_in_any_order() {
        let meta = Arc::new(MemMetaStore::new());
        let alloc = make_alloc(100, &meta, true);
        alloc.reserve_on_cache(BlkId::new(10, 5, ChunkId(1)));
        alloc.reserve_on_cache(BlkId::new(2, 2, ChunkId(1)));
        assert_eq!(alloc.used_blks(), 15);
    }

    #[test]
    fn free_accumulates_freeable_and_survives_flush() {
        let meta = Arc::new(MemMetaStore::new());
        let alloc = make_alloc(100, &meta, true);
        let a = alloc.alloc(4, BlkAllocHints::default()).unwrap();
        alloc.free(a);
        assert_eq!(alloc.freeable_nblks(), 4);
        alloc.cp_flush().unwrap();
        drop(alloc);

        let recovered = make_alloc(100, &meta, false);
        assert_eq!(recovered.freeable_nblks(), 4);
    }

    #[test]
    fn superblock_rejects_corruption() {
        let meta = Arc::new(MemMetaStore::new());
        let alloc = make_alloc(100, &meta, true);
        let bid = alloc.alloc(2, BlkAllocHints::default()).unwrap();
        alloc.reserve_on_disk(bid);
        alloc.cp_flush().unwrap();

        let mut bytes = meta.read_meta(&alloc.name()).unwrap().unwrap();
        bytes[12] ^= 0xFF;
        meta.write_meta(&alloc.name(), &bytes).unwrap();
        drop(alloc);

        let meta_dyn: Arc<dyn MetaStore> = meta;
        assert!(AppendBlkAllocator::new(ChunkId(1), 100, meta_dyn, false).is_err());
    }

    #[test]
    fn blkalloc_cp_applies_free_list_for_its_chunk() {
        let meta = Arc::new(MemMetaStore::new());
        let alloc = Arc::new(make_alloc(100, &meta, true));
        let a = alloc.alloc(3, BlkAllocHints::default()).unwrap();
        let foreign = BlkId::new(0, 2, ChunkId(9));

        let free_list = Mutex::new(BTreeSet::from([a, foreign]));
        let ba_cp = BlkAllocCp::new(Arc::clone(&alloc));
        ba_cp.free_blks(&free_list);
        assert_eq!(alloc.freeable_nblks(), 3);
        assert!(free_list.lock().is_empty());
    }
}
