#![forbid(unsafe_code)]
//! Core identifier types and on-disk primitives shared across KeelStore.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Minimum alignment the device accepts for dma-style writes.
pub const DMA_BOUNDARY: u32 = 512;

/// Chunk identifier within a device (8 bits on disk inside a `BlkId`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkId(pub u8);

/// Caller-named logical record stream multiplexed onto a log device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StoreId(pub u32);

/// Monotonic log index assigned by the log device. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogId(pub i64);

impl LogId {
    pub const INVALID: Self = Self(-1);
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-store sequence number carried opaquely through the log device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeqNum(pub i64);

// ── BlkId ───────────────────────────────────────────────────────────────────

const BLK_NUM_BITS: u32 = 40;
const BLK_COUNT_BITS: u32 = 16;
const BLK_NUM_MASK: u64 = (1 << BLK_NUM_BITS) - 1;
const BLK_COUNT_MASK: u64 = (1 << BLK_COUNT_BITS) - 1;

/// Maximum blocks a single `BlkId` can describe.
pub const MAX_BLKS_PER_BLKID: u32 = (1 << BLK_COUNT_BITS) - 1;

/// Chunk-scoped block identifier packed into 64 bits.
///
/// Layout (low to high): `blk_num` (40 bits), `blk_count` (16 bits),
/// `chunk_id` (8 bits). Ordering follows the packed integer, which sorts by
/// chunk first and block number second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlkId(u64);

impl BlkId {
    /// Pack a block range. `blk_num` and `blk_count` are truncated to their
    /// on-disk field widths; callers validate range before packing.
    #[must_use]
    pub fn new(blk_num: u64, blk_count: u32, chunk_id: ChunkId) -> Self {
        let packed = (blk_num & BLK_NUM_MASK)
            | ((u64::from(blk_count) & BLK_COUNT_MASK) << BLK_NUM_BITS)
            | (u64::from(chunk_id.0) << (BLK_NUM_BITS + BLK_COUNT_BITS));
        Self(packed)
    }

    #[must_use]
    pub fn from_integer(packed: u64) -> Self {
        Self(packed)
    }

    #[must_use]
    pub fn to_integer(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn blk_num(self) -> u64 {
        self.0 & BLK_NUM_MASK
    }

    /// Number of blocks covered by this id. At most [`MAX_BLKS_PER_BLKID`].
    #[must_use]
    pub fn blk_count(self) -> u32 {
        // The field is 16 bits wide, so the cast cannot truncate.
        ((self.0 >> BLK_NUM_BITS) & BLK_COUNT_MASK) as u32
    }

    #[must_use]
    pub fn chunk_id(self) -> ChunkId {
        ChunkId((self.0 >> (BLK_NUM_BITS + BLK_COUNT_BITS)) as u8)
    }

    /// First block past the range: `blk_num + blk_count`.
    #[must_use]
    pub fn end_blk_num(self) -> u64 {
        self.blk_num() + u64::from(self.blk_count())
    }
}

impl fmt::Display for BlkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[chunk={} blk={} cnt={}]",
            self.chunk_id().0,
            self.blk_num(),
            self.blk_count()
        )
    }
}

// ── Alignment helpers ───────────────────────────────────────────────────────

/// Round `value` up to the next multiple of power-of-two `boundary`.
#[must_use]
pub fn round_up(value: u64, boundary: u64) -> u64 {
    debug_assert!(boundary.is_power_of_two());
    (value + boundary - 1) & !(boundary - 1)
}

/// Round `value` down to a multiple of power-of-two `boundary`.
#[must_use]
pub fn round_down(value: u64, boundary: u64) -> u64 {
    debug_assert!(boundary.is_power_of_two());
    value & !(boundary - 1)
}

// ── On-disk parse/emit helpers ──────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_le_i64(data: &[u8], offset: usize) -> Result<i64, ParseError> {
    read_le_u64(data, offset).map(|v| v as i64)
}

#[inline]
pub fn put_le_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn put_le_u64(data: &mut [u8], offset: usize, value: u64) {
    data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn put_le_i64(data: &mut [u8], offset: usize, value: i64) {
    put_le_u64(data, offset, value as u64);
}

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// Find the first free (zero) bit in the first `count` bits of `bitmap`,
/// starting from `start` and wrapping.
#[must_use]
pub fn bitmap_find_free(bitmap: &[u8], count: u32, start: u32) -> Option<u32> {
    for idx in start..count {
        if !bitmap_get(bitmap, idx) {
            return Some(idx);
        }
    }
    (0..start).find(|&idx| !bitmap_get(bitmap, idx))
}

/// Count set bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_set(bitmap: &[u8], count: u32) -> u32 {
    let mut set = 0_u32;
    for idx in 0..count {
        if bitmap_get(bitmap, idx) {
            set += 1;
        }
    }
    set
}
