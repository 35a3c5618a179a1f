//! Journal virtual device: the log device's view of a byte device as an
//! append-only ring of write extents plus a small persisted context region.

use crate::ByteDevice;
use keel_error::{KeelError, Result};
use keel_types::DMA_BOUNDARY;
use parking_lot::Mutex;
use tracing::{debug, trace};

/// Size of the persisted virtual-device context blob.
pub const VB_CONTEXT_SIZE: usize = 2048;

/// Reserved region at the head of the device holding the vb context,
/// padded out to a full page so the data region stays page-aligned.
const VB_CONTEXT_REGION: u64 = 4096;

#[derive(Debug)]
struct JournalState {
    /// First live byte of the log (data-region relative).
    start_offset: u64,
    /// Next byte to hand out to an extent reservation.
    tail_offset: u64,
}

/// Append-only ring over a byte device.
///
/// All log offsets are relative to the data region, which begins after the
/// context region and wraps at `data_len`. Extents never straddle the wrap
/// point: a reservation that would cross the end wraps to offset 0 instead.
#[derive(Debug)]
pub struct JournalVirtualDev<D: ByteDevice> {
    dev: D,
    data_len: u64,
    state: Mutex<JournalState>,
}

impl<D: ByteDevice> JournalVirtualDev<D> {
    pub fn new(dev: D) -> Result<Self> {
        let total = dev.len_bytes();
        if total <= VB_CONTEXT_REGION {
            return Err(KeelError::Format(format!(
                "device too small for a journal: len_bytes={total}"
            )));
        }
        let data_len = total - VB_CONTEXT_REGION;
        if data_len % u64::from(DMA_BOUNDARY) != 0 {
            return Err(KeelError::Format(format!(
                "journal data region not dma-aligned: data_len={data_len}"
            )));
        }
        Ok(Self {
            dev,
            data_len,
            state: Mutex::new(JournalState {
                start_offset: 0,
                tail_offset: 0,
            }),
        })
    }

    /// Usable data-region length in bytes.
    #[must_use]
    pub fn data_len(&self) -> u64 {
        self.data_len
    }

    #[must_use]
    pub fn start_offset(&self) -> u64 {
        self.state.lock().start_offset
    }

    #[must_use]
    pub fn tail_offset(&self) -> u64 {
        self.state.lock().tail_offset
    }

    /// Reserve the next contiguous extent of `size` bytes, wrapping to
    /// offset 0 when the tail would cross the end of the data region.
    pub fn alloc_next_extent(&self, size: u64) -> Result<u64> {
        if size == 0 || size % u64::from(DMA_BOUNDARY) != 0 {
            return Err(KeelError::Format(format!(
                "extent size must be a nonzero dma multiple: size={size}"
            )));
        }
        if size > self.data_len {
            return Err(KeelError::SpaceFull);
        }

        let mut state = self.state.lock();
        if state.tail_offset + size > self.data_len {
            debug!(
                target: "keel::device",
                event = "journal_wrap",
                tail = state.tail_offset,
                data_len = self.data_len
            );
            state.tail_offset = 0;
        }
        let offset = state.tail_offset;
        state.tail_offset += size;
        trace!(
            target: "keel::device",
            event = "extent_reserved",
            offset,
            size
        );
        Ok(offset)
    }

    /// Positioned read within the data region.
    pub fn pread(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let len = buf.len() as u64;
        if offset + len > self.data_len {
            return Err(KeelError::Format(format!(
                "journal read out of bounds: offset={offset} len={len} data_len={}",
                self.data_len
            )));
        }
        self.dev.read_exact_at(VB_CONTEXT_REGION + offset, buf)
    }

    /// Vectored positioned write: segments land back to back starting at
    /// `offset`. Delegates to scalar writes, preserving correctness over
    /// true vectored syscalls.
    pub fn pwritev(&self, offset: u64, segments: &[&[u8]]) -> Result<()> {
        let total: u64 = segments.iter().map(|s| s.len() as u64).sum();
        if offset + total > self.data_len {
            return Err(KeelError::Format(format!(
                "journal write out of bounds: offset={offset} len={total} data_len={}",
                self.data_len
            )));
        }
        let mut cursor = VB_CONTEXT_REGION + offset;
        for segment in segments {
            self.dev.write_all_at(cursor, segment)?;
            cursor += segment.len() as u64;
        }
        trace!(
            target: "keel::device",
            event = "journal_writev",
            offset,
            segments = segments.len(),
            bytes = total
        );
        Ok(())
    }

    /// Read the persisted vb context into `buf` (at most [`VB_CONTEXT_SIZE`]).
    pub fn get_vb_context(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() > VB_CONTEXT_SIZE {
            return Err(KeelError::Format(format!(
                "vb context read too large: {} > {VB_CONTEXT_SIZE}",
                buf.len()
            )));
        }
        self.dev.read_exact_at(0, buf)
    }

    /// Persist the vb context and sync it through.
    pub fn update_vb_context(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > VB_CONTEXT_SIZE {
            return Err(KeelError::Format(format!(
                "vb context write too large: {} > {VB_CONTEXT_SIZE}",
                bytes.len()
            )));
        }
        self.dev.write_all_at(0, bytes)?;
        self.dev.sync()
    }

    /// Move the logical start of the log. Bytes before the new start are
    /// dead and will be overwritten as the ring wraps.
    pub fn truncate(&self, offset: u64) -> Result<()> {
        if offset > self.data_len {
            return Err(KeelError::Format(format!(
                "truncate offset out of bounds: offset={offset} data_len={}",
                self.data_len
            )));
        }
        let mut state = self.state.lock();
        debug!(
            target: "keel::device",
            event = "journal_truncate",
            old_start = state.start_offset,
            new_start = offset
        );
        state.start_offset = offset;
        Ok(())
    }

    /// Recovery hand-off: position the tail where replay stopped so new
    /// appends continue from there.
    pub fn set_tail(&self, offset: u64) -> Result<()> {
        if offset > self.data_len {
            return Err(KeelError::Format(format!(
                "tail offset out of bounds: offset={offset} data_len={}",
                self.data_len
            )));
        }
        self.state.lock().tail_offset = offset;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.dev.sync()
    }
}
