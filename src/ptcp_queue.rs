// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Persistent send/acknowledge queue, mmapped to a file.
//
// The file carries a typed index block followed by a fixed-capacity array
// of 8-byte cells. A message owns `frame_cells(size)` consecutive cells
// from the moment `push` commits it until the peer's cumulative ACK
// retires it, so unacknowledged messages survive a crash and are replayed
// after reconnect. Indices are host byte order; committed cell contents
// are wire byte order.
//
// Single-owner: exactly one connection drives a queue at any time.

use std::marker::PhantomData;
use std::path::Path;

use crate::config::Config;
use crate::endian::swap_if;
use crate::mmap::{MmapRegion, SysError};
use crate::msg::{frame_cells, seq_before, MsgHeader, CELL_SIZE};

/// On-disk index block preceding the cell array.
///
/// Invariant: `read_idx <= send_idx <= write_idx <= capacity`, where
/// `send_idx` may fall mid-message. `read_seq_num` is the sequence number
/// of the message at `read_idx`; `ack_seq_num` is the next inbound
/// sequence this side will acknowledge.
#[repr(C)]
struct IndexBlock {
    write_idx: u32,
    read_idx: u32,
    send_idx: u32,
    read_seq_num: u32,
    ack_seq_num: u32,
    _reserved: [u32; 3],
}

const INDEX_BLOCK_SIZE: usize = 32;
const _: () = assert!(std::mem::size_of::<IndexBlock>() == INDEX_BLOCK_SIZE);

pub struct PtcpQueue<C: Config> {
    region: MmapRegion,
    _marker: PhantomData<C>,
}

impl<C: Config> PtcpQueue<C> {
    pub const CELL_CNT: u32 = C::TCP_QUEUE_BYTES / CELL_SIZE as u32;

    /// Map the queue file, creating it (all-zero, empty) if missing.
    pub fn open(path: &Path) -> Result<Self, SysError> {
        let region =
            MmapRegion::open_file(path, INDEX_BLOCK_SIZE + C::TCP_QUEUE_BYTES as usize)?;
        Ok(Self {
            region,
            _marker: PhantomData,
        })
    }

    fn idx(&self) -> &IndexBlock {
        unsafe { &*(self.region.as_ptr() as *const IndexBlock) }
    }

    fn idx_mut(&mut self) -> &mut IndexBlock {
        unsafe { &mut *(self.region.as_mut_ptr() as *mut IndexBlock) }
    }

    fn cell_ptr(&self, i: u32) -> *mut MsgHeader {
        unsafe {
            (self.region.as_mut_ptr().add(INDEX_BLOCK_SIZE) as *mut MsgHeader).add(i as usize)
        }
    }

    fn cell(&self, i: u32) -> MsgHeader {
        unsafe { *self.cell_ptr(i) }
    }

    /// Reserve space for a message with `payload_size` payload bytes.
    ///
    /// Returns a header whose frame the caller fills in place before
    /// `push`, or `None` when neither the free tail nor tail-plus-head can
    /// hold it. When only the combined free space suffices, the live
    /// window `[read_idx, write_idx)` is shifted to offset 0 first.
    pub fn alloc(&mut self, payload_size: u16) -> Option<*mut MsgHeader> {
        let size = payload_size as u32 + CELL_SIZE as u32;
        debug_assert!(size <= u16::MAX as u32);
        let blk_sz = (size + CELL_SIZE as u32 - 1) / CELL_SIZE as u32;
        let ix = self.idx();
        let avail_sz = Self::CELL_CNT - ix.write_idx;
        if blk_sz > avail_sz {
            if blk_sz > avail_sz + ix.read_idx {
                return None;
            }
            let (read_idx, write_idx) = (ix.read_idx, ix.write_idx);
            unsafe {
                // overlapping move of the live window to offset 0
                std::ptr::copy(
                    self.cell_ptr(read_idx),
                    self.cell_ptr(0),
                    (write_idx - read_idx) as usize,
                );
            }
            let ix = self.idx_mut();
            ix.write_idx -= read_idx;
            ix.send_idx -= read_idx;
            ix.read_idx = 0;
        }
        let header = self.cell_ptr(self.idx().write_idx);
        unsafe { (*header).size = size as u16 };
        Some(header)
    }

    /// Commit the message reserved by the last `alloc`: stamp the
    /// cumulative ACK, convert the header to wire order and advance
    /// `write_idx`.
    pub fn push(&mut self) {
        let write_idx = self.idx().write_idx;
        let header = self.cell_ptr(write_idx);
        let blk_sz = unsafe { frame_cells((*header).size) };
        unsafe {
            (*header).ack_seq = self.idx().ack_seq_num;
            (*header).convert_byte_order(C::TO_LITTLE_ENDIAN);
        }
        self.idx_mut().write_idx = write_idx + blk_sz;
    }

    /// The unsent region `[send_idx, write_idx)`: pointer plus cell count.
    pub fn get_sendable(&self) -> (*const u8, u32) {
        let ix = self.idx();
        (
            self.cell_ptr(ix.send_idx) as *const u8,
            ix.write_idx - ix.send_idx,
        )
    }

    /// Advance `send_idx` after a successful socket write of `blk_sz` cells.
    pub fn sendout(&mut self, blk_sz: u32) {
        self.idx_mut().send_idx += blk_sz;
    }

    /// Retire messages the peer has cumulatively acknowledged: advance
    /// `read_idx` past every message with sequence before `ack_seq`.
    /// Stale or duplicate ACKs are no-ops. A drained queue resets all
    /// indices to 0 to keep the file window small.
    pub fn ack(&mut self, ack_seq: u32) {
        if !seq_before(self.idx().read_seq_num, ack_seq) {
            return;
        }
        // a logged-in peer never acks beyond what we committed, so the walk
        // terminates before write_idx
        loop {
            let size = swap_if(C::TO_LITTLE_ENDIAN, self.cell(self.idx().read_idx).size);
            let ix = self.idx_mut();
            ix.read_idx += frame_cells(size);
            ix.read_seq_num = ix.read_seq_num.wrapping_add(1);
            if ix.read_seq_num == ack_seq {
                break;
            }
        }
        let ix = self.idx_mut();
        if ix.read_idx == ix.write_idx {
            ix.read_idx = 0;
            ix.send_idx = 0;
            ix.write_idx = 0;
        }
    }

    /// `ack`, then rewind `send_idx` to `read_idx` so every message the
    /// peer has not acknowledged is replayed after reconnect.
    pub fn login_ack(&mut self, ack_seq: u32) {
        self.ack(ack_seq);
        let ix = self.idx_mut();
        ix.send_idx = ix.read_idx;
    }

    /// Next inbound sequence this side will acknowledge.
    pub fn my_ack(&self) -> u32 {
        self.idx().ack_seq_num
    }

    /// Record one more message delivered to the application.
    pub fn inc_my_ack(&mut self) {
        let ix = self.idx_mut();
        ix.ack_seq_num = ix.ack_seq_num.wrapping_add(1);
    }

    /// Validate the persistent state and return the unacknowledged send
    /// window as `(read_seq_num, read_seq_num + msg_count)`.
    ///
    /// Fails when the indices are out of bounds, a cell walk does not land
    /// exactly on `write_idx`, or a stored cumulative ACK is newer than the
    /// index block's — any of which means the file is corrupt.
    pub fn sanity_check_and_get_seq(&self) -> Option<(u32, u32)> {
        let ix = self.idx();
        if ix.read_idx > ix.send_idx
            || ix.send_idx > ix.write_idx
            || ix.write_idx > Self::CELL_CNT
        {
            return None;
        }
        let mut end = ix.read_seq_num;
        let mut i = ix.read_idx;
        while i < ix.write_idx {
            let mut header = self.cell(i);
            header.convert_byte_order(C::TO_LITTLE_ENDIAN);
            if seq_before(ix.ack_seq_num, header.ack_seq) {
                return None;
            }
            let blk_sz = frame_cells(header.size);
            if blk_sz == 0 {
                return None;
            }
            i += blk_sz;
            end = end.wrapping_add(1);
        }
        if i != ix.write_idx {
            return None;
        }
        Some((ix.read_seq_num, end))
    }

    /// Forget everything (fresh-peer reset).
    pub fn reset(&mut self) {
        self.region.zero();
    }
}
