//! Sequential log-group reader used by recovery.
//!
//! Reads the journal in bulk chunks from a starting cursor, wrapping at the
//! end of the data region, and validates one group at a time: magic, size
//! bounds, group CRC, CRC chain to the previous group, and footer echo. The
//! first validation failure ends the stream; the caller then runs the
//! page-probe to distinguish a clean tail from corruption.

use crate::log_group::{LogGroupFooter, LogGroupHeader, FOOTER_SIZE, HEADER_SIZE, RECORD_SIZE};
use keel_device::{ByteDevice, JournalVirtualDev};
use keel_error::Result;
use keel_types::DMA_BOUNDARY;
use std::sync::Arc;
use tracing::{debug, trace};

pub struct LogStreamReader<D: ByteDevice> {
    jdev: Arc<JournalVirtualDev<D>>,
    /// Device offset (data-region relative) of the next group to parse.
    cursor: u64,
    /// Total bytes accepted as valid groups; a full circle ends the stream.
    scanned: u64,
    read_size: u64,
    buf: Vec<u8>,
    buf_dev_offset: u64,
    /// CRC of the last accepted group; chains into the next header.
    prev_crc: Option<u32>,
    /// Separate cursor for the post-tail corruption probe.
    probe_cursor: u64,
}

impl<D: ByteDevice> LogStreamReader<D> {
    #[must_use]
    pub fn new(jdev: Arc<JournalVirtualDev<D>>, cursor: u64, read_size: u64) -> Self {
        Self {
            jdev,
            cursor,
            scanned: 0,
            read_size,
            buf: Vec::new(),
            buf_dev_offset: 0,
            prev_crc: None,
            probe_cursor: cursor,
        }
    }

    /// Device offset where the valid stream ended (or the next group starts).
    #[must_use]
    pub fn group_cursor(&self) -> u64 {
        self.cursor
    }

    /// CRC of the last accepted group, if any. New appends after recovery
    /// chain from this value.
    #[must_use]
    pub fn last_crc(&self) -> Option<u32> {
        self.prev_crc
    }

    /// Return the next validated group and its device offset, or `None` at
    /// the first validation failure (end-of-stream candidate).
    pub fn next_group(&mut self) -> Result<Option<(Vec<u8>, u64)>> {
        let data_len = self.jdev.data_len();
        if self.scanned >= data_len {
            debug!(
                target: "keel::logdev",
                event = "recovery_full_circle",
                scanned = self.scanned
            );
            return Ok(None);
        }

        if self.cursor >= data_len {
            self.cursor = 0;
        }
        let avail_to_end = data_len - self.cursor;
        if !self.ensure_buffered(HEADER_SIZE as u64)? {
            return Ok(None);
        }

        let pos = (self.cursor - self.buf_dev_offset) as usize;
        let Ok(header) = LogGroupHeader::parse(&self.buf[pos..]) else {
            debug!(
                target: "keel::logdev",
                event = "recovery_no_magic",
                cursor = self.cursor
            );
            return Ok(None);
        };

        if !plausible_group(&header, avail_to_end) {
            debug!(
                target: "keel::logdev",
                event = "recovery_bad_geometry",
                cursor = self.cursor,
                group_size = header.group_size
            );
            return Ok(None);
        }
        if !self.ensure_buffered(u64::from(header.group_size))? {
            return Ok(None);
        }

        let pos = (self.cursor - self.buf_dev_offset) as usize;
        let group = self.buf[pos..pos + header.group_size as usize].to_vec();

        let crc = crc32c::crc32c(&group[HEADER_SIZE..]);
        if crc != header.cur_grp_crc {
            debug!(
                target: "keel::logdev",
                event = "recovery_crc_mismatch",
                cursor = self.cursor,
                expected = header.cur_grp_crc,
                computed = crc
            );
            return Ok(None);
        }
        if let Some(prev) = self.prev_crc {
            if header.prev_grp_crc != prev {
                debug!(
                    target: "keel::logdev",
                    event = "recovery_chain_break",
                    cursor = self.cursor,
                    expected = prev,
                    found = header.prev_grp_crc
                );
                return Ok(None);
            }
        }
        match LogGroupFooter::parse(&group[header.footer_offset as usize..]) {
            Ok(footer) if footer.start_log_idx == header.start_log_idx => {}
            _ => {
                debug!(
                    target: "keel::logdev",
                    event = "recovery_bad_footer",
                    cursor = self.cursor
                );
                return Ok(None);
            }
        }

        let dev_offset = self.cursor;
        self.prev_crc = Some(header.cur_grp_crc);
        self.cursor += u64::from(header.group_size);
        self.scanned += u64::from(header.group_size);
        self.probe_cursor = self.cursor;
        trace!(
            target: "keel::logdev",
            event = "recovery_group",
            dev_offset,
            start_log_idx = header.start_log_idx,
            n_log_records = header.n_log_records
        );
        Ok(Some((group, dev_offset)))
    }

    /// Read the dma page after the current probe position and parse a
    /// header out of it. Used to distinguish a clean end-of-stream from
    /// corrupted data with live groups behind it. The page the stream
    /// failed on is skipped: its header legitimately carries the current
    /// log index.
    pub fn group_in_next_page(&mut self) -> Result<Option<LogGroupHeader>> {
        let data_len = self.jdev.data_len();
        self.probe_cursor += u64::from(DMA_BOUNDARY);
        if self.probe_cursor >= data_len {
            self.probe_cursor = 0;
        }
        let mut page = vec![0_u8; DMA_BOUNDARY as usize];
        self.jdev.pread(self.probe_cursor, &mut page)?;
        Ok(LogGroupHeader::parse(&page).ok())
    }

    /// Make sure `len` bytes starting at `cursor` are buffered, refilling
    /// from the device when needed. Returns `false` if the region cannot be
    /// read without crossing the end of the data region.
    fn ensure_buffered(&mut self, len: u64) -> Result<bool> {
        let data_len = self.jdev.data_len();
        if self.cursor + len > data_len {
            return Ok(false);
        }
        let pos = self.cursor.wrapping_sub(self.buf_dev_offset);
        if self.cursor >= self.buf_dev_offset && pos + len <= self.buf.len() as u64 {
            return Ok(true);
        }

        let read_len = self.read_size.max(len).min(data_len - self.cursor);
        self.buf = vec![0_u8; read_len as usize];
        self.jdev.pread(self.cursor, &mut self.buf)?;
        self.buf_dev_offset = self.cursor;
        trace!(
            target: "keel::logdev",
            event = "recovery_bulk_read",
            offset = self.cursor,
            bytes = read_len
        );
        Ok(true)
    }
}

/// Geometry sanity for a parsed header before trusting `group_size`.
fn plausible_group(header: &LogGroupHeader, avail_to_end: u64) -> bool {
    let group_size = u64::from(header.group_size);
    let min_size = (HEADER_SIZE + FOOTER_SIZE) as u64;
    group_size >= min_size
        && group_size % u64::from(DMA_BOUNDARY) == 0
        && group_size <= avail_to_end
        && u64::from(header.footer_offset) + FOOTER_SIZE as u64 <= group_size
        && u64::from(header.oob_data_offset) <= u64::from(header.footer_offset)
        && (HEADER_SIZE as u64 + u64::from(header.n_log_records) * RECORD_SIZE as u64)
            <= u64::from(header.oob_data_offset)
}
