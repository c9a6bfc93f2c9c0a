// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Wait-free single-producer single-consumer ring of variable-length
// messages over a shared mmapped region. Writer and reader normally live
// in different processes.
//
// Layout: a cache-line-padded header holding the two canonical indices,
// then a power-of-two count of 64-byte cells. A message occupies
// consecutive cells; when it would cross the end of the array the writer
// leaves a `size == 0` sentinel at the current position and wraps to
// index 0. The producer's cached copy of `read_idx` lives in the local
// handle only — aliasing it into the shared region would let the peer
// trample it.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::config::Config;
use crate::mmap::{MmapRegion, SysError};
use crate::msg::{MsgHeader, CELL_SIZE};

/// Size of one ring cell (one cache line).
const BLOCK_SIZE: usize = 64;

/// Shared header: indices on separate cache lines so the producer's
/// stores never invalidate the consumer's line and vice versa.
#[repr(C)]
struct RingHeader {
    write_idx: AtomicU32,
    _pad0: [u8; BLOCK_SIZE - 4],
    read_idx: AtomicU32,
    _pad1: [u8; BLOCK_SIZE - 4],
}

const _: () = assert!(std::mem::size_of::<RingHeader>() == 2 * BLOCK_SIZE);

pub struct SpscVarQueue<C: Config> {
    region: MmapRegion,
    /// Producer-side cache of the consumer's index; process-local.
    read_idx_cach: u32,
    _marker: PhantomData<C>,
}

impl<C: Config> SpscVarQueue<C> {
    pub const BLK_CNT: u32 = C::SHM_QUEUE_BYTES / BLOCK_SIZE as u32;

    /// Map the named POSIX shared-memory object, creating it (empty) if
    /// missing. `name` must begin with '/'.
    pub fn open_shm(name: &str) -> Result<Self, SysError> {
        let region = MmapRegion::open_shm(
            name,
            std::mem::size_of::<RingHeader>() + C::SHM_QUEUE_BYTES as usize,
        )?;
        Ok(Self {
            region,
            read_idx_cach: 0,
            _marker: PhantomData,
        })
    }

    fn hdr(&self) -> &RingHeader {
        unsafe { &*(self.region.as_ptr() as *const RingHeader) }
    }

    fn cell_ptr(&self, idx: u32) -> *mut MsgHeader {
        unsafe {
            self.region
                .as_mut_ptr()
                .add(std::mem::size_of::<RingHeader>())
                .add((idx % Self::BLK_CNT) as usize * BLOCK_SIZE) as *mut MsgHeader
        }
    }

    /// Reserve contiguous cells for a message with `payload_size` payload
    /// bytes; `None` when the ring is full. May place a wrap sentinel.
    ///
    /// Producer side only.
    pub fn alloc(&mut self, payload_size: u16) -> Option<*mut MsgHeader> {
        let size = payload_size as u32 + CELL_SIZE as u32;
        debug_assert!(size <= u16::MAX as u32);
        let blk_sz = (size + BLOCK_SIZE as u32 - 1) / BLOCK_SIZE as u32;
        // sole writer, so the relaxed load is our own last store
        let write_idx = self.hdr().write_idx.load(Ordering::Relaxed);
        let padding_sz = Self::BLK_CNT - (write_idx % Self::BLK_CNT);
        let rewind = blk_sz > padding_sz;
        // oldest index the reader may still be at for us to fit; the
        // subtraction may wrap, which the signed comparison below absorbs
        let min_read_idx = write_idx
            .wrapping_add(blk_sz)
            .wrapping_add(if rewind { padding_sz } else { 0 })
            .wrapping_sub(Self::BLK_CNT);
        if (self.read_idx_cach.wrapping_sub(min_read_idx) as i32) < 0 {
            self.read_idx_cach = self.hdr().read_idx.load(Ordering::Acquire);
            if (self.read_idx_cach.wrapping_sub(min_read_idx) as i32) < 0 {
                return None;
            }
        }
        let write_idx = if rewind {
            unsafe { (*self.cell_ptr(write_idx)).size = 0 };
            let wrapped = write_idx.wrapping_add(padding_sz);
            // publish the sentinel before the message cells become visible
            self.hdr().write_idx.store(wrapped, Ordering::Release);
            wrapped
        } else {
            write_idx
        };
        let header = self.cell_ptr(write_idx);
        unsafe { (*header).size = size as u16 };
        Some(header)
    }

    /// Commit the message reserved by the last `alloc`.
    ///
    /// The release store publishes the filled header and payload: the
    /// consumer can only observe the new `write_idx` after every cell
    /// write that preceded it.
    pub fn push(&mut self) {
        let hdr = self.hdr();
        let write_idx = hdr.write_idx.load(Ordering::Relaxed);
        let size = unsafe { (*self.cell_ptr(write_idx)).size };
        let blk_sz = (size as u32 + BLOCK_SIZE as u32 - 1) / BLOCK_SIZE as u32;
        hdr.write_idx
            .store(write_idx.wrapping_add(blk_sz), Ordering::Release);
    }

    /// Oldest uncommitted-to-reader message, or `None` when the ring is
    /// empty. Skips a wrap sentinel by advancing to the next capacity
    /// multiple. Consumer side only.
    pub fn front(&mut self) -> Option<*mut MsgHeader> {
        let hdr = self.hdr();
        let mut read_idx = hdr.read_idx.load(Ordering::Relaxed);
        let write_idx = hdr.write_idx.load(Ordering::Acquire);
        if read_idx == write_idx {
            return None;
        }
        let size = unsafe { (*self.cell_ptr(read_idx)).size };
        if size == 0 {
            read_idx = read_idx.wrapping_add(Self::BLK_CNT - (read_idx % Self::BLK_CNT));
            hdr.read_idx.store(read_idx, Ordering::Release);
            if read_idx == write_idx {
                return None;
            }
        }
        Some(self.cell_ptr(read_idx))
    }

    /// Consume the message returned by `front`.
    pub fn pop(&mut self) {
        let hdr = self.hdr();
        let read_idx = hdr.read_idx.load(Ordering::Relaxed);
        let size = unsafe { (*self.cell_ptr(read_idx)).size };
        let blk_sz = (size as u32 + BLOCK_SIZE as u32 - 1) / BLOCK_SIZE as u32;
        // release so the producer's acquire of read_idx orders after our
        // payload reads
        hdr.read_idx
            .store(read_idx.wrapping_add(blk_sz), Ordering::Release);
    }

    /// Forget everything (fresh-peer reset). Both sides must be quiescent.
    pub fn reset(&mut self) {
        self.region.zero();
        self.read_idx_cach = 0;
    }
}
