// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Per-peer TCP framing state machine with durable sequencing.
//
// Owns the persistent send queue (absent in pure-shared-memory mode) and a
// growable receive buffer. All socket I/O is nonblocking; the owning poll
// thread drives every operation except `request_close` / `is_closed`,
// which any thread may call. Closing is two-phase: a thread-safe "mark
// closed" publishes a tagged reason and errno, and the owner later calls
// `try_close_fd` to close the descriptor and surface the disconnect.

use std::cell::UnsafeCell;
use std::path::Path;
use std::slice;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use crate::config::Config;
use crate::endian::swap_if;
use crate::mmap::SysError;
use crate::msg::{frame_bytes, MsgHeader, CELL_SIZE, MSG_TYPE_HEARTBEAT};
use crate::ptcp_queue::PtcpQueue;
use crate::sock;

/// Why a connection was closed. The errno (when any) travels next to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CloseReason {
    /// Not closed, or closed with no recorded reason.
    None = 0,
    /// The local application asked for the close.
    RequestClose = 1,
    /// Connection released at shutdown.
    Release = 2,
    /// Nothing received for longer than the connection timeout.
    Timeout = 3,
    /// A send failed, or a partial send left an unaligned remainder.
    SendError = 4,
    /// A receive failed.
    ReadError = 5,
    /// The peer closed the socket.
    RemoteClose = 6,
    /// A single message exceeded the receive buffer limit.
    MsgTooLarge = 7,
    /// An application message arrived on the TCP side of a
    /// shared-memory connection.
    UnexpectedTcpMsg = 8,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::None => "nil",
            CloseReason::RequestClose => "Request close",
            CloseReason::Release => "Release",
            CloseReason::Timeout => "Timeout",
            CloseReason::SendError => "Send error",
            CloseReason::ReadError => "Read error",
            CloseReason::RemoteClose => "Remote close",
            CloseReason::MsgTooLarge => "Msg size larger than recv buf max size",
            CloseReason::UnexpectedTcpMsg => "Unexpected msg in shm mode",
        }
    }

    fn from_u32(v: u32) -> Self {
        match v {
            1 => CloseReason::RequestClose,
            2 => CloseReason::Release,
            3 => CloseReason::Timeout,
            4 => CloseReason::SendError,
            5 => CloseReason::ReadError,
            6 => CloseReason::RemoteClose,
            7 => CloseReason::MsgTooLarge,
            8 => CloseReason::UnexpectedTcpMsg,
            _ => CloseReason::None,
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receive buffer kept 8-byte aligned so headers can be inspected in
/// place at frame boundaries.
struct AlignedBuf(Box<[u64]>);

impl AlignedBuf {
    fn new(bytes: usize) -> Self {
        debug_assert!(bytes % 8 == 0);
        Self(vec![0u64; bytes / 8].into_boxed_slice())
    }

    fn len(&self) -> usize {
        self.0.len() * 8
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.0.as_ptr() as *const u8, self.len()) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.0.as_mut_ptr() as *mut u8, self.len()) }
    }

    fn header_at(&self, idx: usize) -> *mut MsgHeader {
        debug_assert!(idx % 8 == 0);
        unsafe { self.0.as_ptr().cast::<u8>().add(idx) as *mut MsgHeader }
    }
}

/// Single-owner mutable state; see the struct-level discipline note.
struct ConnCore<C: Config> {
    q: Option<PtcpQueue<C>>,
    recvbuf: AlignedBuf,
    /// End of received bytes.
    writeidx: usize,
    /// Boundary of fully-framed (and endian-converted) messages.
    nextmsg_idx: usize,
    /// Next message to hand to the application.
    readidx: usize,
    recv_time: i64,
    send_time: i64,
    now: i64,
    /// Pre-encoded heartbeat frame; only `ack_seq` is restamped.
    hbmsg: MsgHeader,
    /// Guard so an un-popped message is not returned twice.
    last_my_ack: u32,
}

pub struct PtcpConnection<C: Config> {
    /// The live socket, or -1 once marked closed. Any thread may read.
    sockfd: AtomicI32,
    /// Descriptor awaiting the owner's real close.
    fd_to_close: AtomicI32,
    /// `CloseReason << 32 | errno`; 0 while open. First closer wins.
    close_state: AtomicU64,
    core: UnsafeCell<ConnCore<C>>,
}

// Safety: all methods except request_close / is_closed / close_reason are
// driven by exactly one poll thread at a time; those three touch only the
// atomics above. The UnsafeCell is never aliased across threads.
unsafe impl<C: Config> Send for PtcpConnection<C> {}
unsafe impl<C: Config> Sync for PtcpConnection<C> {}

impl<C: Config> Default for PtcpConnection<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Config> PtcpConnection<C> {
    pub fn new() -> Self {
        let mut hbmsg = MsgHeader {
            size: CELL_SIZE as u16,
            msg_type: MSG_TYPE_HEARTBEAT,
            ack_seq: 0,
        };
        hbmsg.convert_byte_order(C::TO_LITTLE_ENDIAN);
        Self {
            sockfd: AtomicI32::new(-1),
            fd_to_close: AtomicI32::new(-1),
            close_state: AtomicU64::new(0),
            core: UnsafeCell::new(ConnCore {
                q: None,
                recvbuf: AlignedBuf::new(0),
                writeidx: 0,
                nextmsg_idx: 0,
                readidx: 0,
                recv_time: 0,
                send_time: 0,
                now: 0,
                hbmsg,
                last_my_ack: 0,
            }),
        }
    }

    /// Owner-thread access to the mutable core. Take it once per method.
    #[allow(clippy::mut_from_ref)]
    fn core(&self) -> &mut ConnCore<C> {
        unsafe { &mut *self.core.get() }
    }

    /// Map the persistent queue file; idempotent.
    pub(crate) fn open_file(&self, path: &Path) -> Result<(), SysError> {
        let s = self.core();
        if s.q.is_none() {
            s.q = Some(PtcpQueue::open(path)?);
        }
        Ok(())
    }

    /// `(my_ack, seq_start, seq_end)` from the persistent queue, or `None`
    /// when the file fails its sanity check.
    pub(crate) fn get_seq(&self) -> Option<(u32, u32, u32)> {
        let s = self.core();
        let q = s.q.as_ref()?;
        let (start, end) = q.sanity_check_and_get_seq()?;
        Some((q.my_ack(), start, end))
    }

    /// Fresh-peer reset of the persistent queue.
    pub(crate) fn reset(&self) {
        if let Some(q) = self.core().q.as_mut() {
            q.reset();
        }
    }

    /// Close, release the descriptor and unmap the queue file.
    pub(crate) fn release(&self) {
        self.close(CloseReason::Release, 0);
        self.try_close_fd();
        self.core().q = None;
    }

    /// Attach a freshly connected nonblocking socket.
    ///
    /// `remote_ack_seq` is what the peer reported during login; the queue
    /// retires everything before it and rewinds `send_idx` so unacked
    /// messages are replayed immediately.
    ///
    /// Precondition: not open (`sockfd == fd_to_close == -1`).
    pub(crate) fn open(&self, fd: i32, remote_ack_seq: u32, now: i64) {
        let s = self.core();
        self.close_state.store(0, Ordering::Relaxed);
        self.fd_to_close.store(fd, Ordering::Relaxed);
        self.sockfd.store(fd, Ordering::Release);
        s.writeidx = 0;
        s.readidx = 0;
        s.nextmsg_idx = 0;
        s.recv_time = now;
        s.send_time = now;
        s.now = now;
        if s.q.is_some() {
            s.q.as_mut().unwrap().login_ack(remote_ack_seq);
            self.send_pending_inner(s);
        }
        if s.recvbuf.is_empty() {
            s.recvbuf = AlignedBuf::new(C::TCP_RECV_BUF_INIT_SIZE as usize);
        }
    }

    pub fn alloc(&self, payload_size: u16) -> Option<*mut MsgHeader> {
        self.core().q.as_mut()?.alloc(payload_size)
    }

    /// Commit the allocated message and flush opportunistically.
    pub fn push(&self) {
        let s = self.core();
        if let Some(q) = s.q.as_mut() {
            q.push();
        }
        self.send_pending_inner(s);
    }

    /// Commit without flushing; a later `push` or heartbeat flushes.
    pub fn push_more(&self) {
        if let Some(q) = self.core().q.as_mut() {
            q.push();
        }
    }

    /// Next complete inbound application message, or `None`.
    ///
    /// The pointer stays valid until the next `front` or `pop`. Safe to
    /// call on a closed connection.
    pub fn front(&self) -> Option<*mut MsgHeader> {
        let s = self.core();
        if s.q.is_none() {
            self.shm_mode_recv(s);
            return None;
        }
        while s.nextmsg_idx != s.readidx {
            let header = s.recvbuf.header_at(s.readidx);
            if unsafe { (*header).msg_type } == MSG_TYPE_HEARTBEAT {
                s.readidx += CELL_SIZE;
                continue;
            }
            // an un-popped message keeps my_ack unchanged; keep reading
            // socket data below so peer acks still retire our queue
            let my_ack = s.q.as_ref().unwrap().my_ack();
            if s.last_my_ack == my_ack {
                break;
            }
            s.last_my_ack = my_ack;
            return Some(header);
        }

        let len = self.do_recv(s);
        if len > 0 {
            let old_writeidx = s.writeidx;
            s.writeidx += len;
            while s.writeidx - s.nextmsg_idx >= CELL_SIZE {
                let header = s.recvbuf.header_at(s.nextmsg_idx);
                if (old_writeidx as isize - s.nextmsg_idx as isize) < CELL_SIZE as isize {
                    // first time this header is complete in the buffer
                    unsafe { (*header).convert_byte_order(C::TO_LITTLE_ENDIAN) };
                }
                let (size, msg_type, ack_seq) =
                    unsafe { ((*header).size, (*header).msg_type, (*header).ack_seq) };
                s.q.as_mut().unwrap().ack(ack_seq);
                let msg_size = frame_bytes(size);
                if msg_size > C::TCP_RECV_BUF_MAX_SIZE as usize {
                    self.close(CloseReason::MsgTooLarge, 0);
                    return None;
                }
                if s.writeidx - s.nextmsg_idx < msg_size {
                    break;
                }
                if msg_type == MSG_TYPE_HEARTBEAT && s.readidx == s.nextmsg_idx {
                    s.readidx += msg_size;
                }
                s.nextmsg_idx += msg_size;
            }
        }
        if s.readidx != s.nextmsg_idx {
            return Some(s.recvbuf.header_at(s.readidx));
        }
        None
    }

    /// Consume the message returned by `front` and advance the
    /// cumulative ACK.
    pub fn pop(&self) {
        let s = self.core();
        let header = s.recvbuf.header_at(s.readidx);
        s.readidx += frame_bytes(unsafe { (*header).size });
        if let Some(q) = s.q.as_mut() {
            q.inc_my_ack();
        }
    }

    /// Emit a heartbeat when nothing was sent for the configured interval;
    /// pending backlog counts as the heartbeat. Safe to call when closed.
    pub fn send_hb(&self, now: i64) {
        let s = self.core();
        s.now = now;
        if self.is_closed() {
            return;
        }
        if now - s.send_time < C::HEART_BEAT_INTERVAL {
            return;
        }
        if s.q.is_some() {
            if self.send_pending_inner(s) {
                return;
            }
            s.hbmsg.ack_seq = swap_if(C::TO_LITTLE_ENDIAN, s.q.as_ref().unwrap().my_ack());
        }
        let fd = self.sockfd.load(Ordering::Relaxed);
        let hb = s.hbmsg;
        let bytes = unsafe {
            slice::from_raw_parts(&hb as *const MsgHeader as *const u8, CELL_SIZE)
        };
        let sent = sock::send(fd, bytes);
        if sent < 0 && sock::errno_would_block(sock::last_errno()) {
            return;
        }
        if sent != CELL_SIZE as isize {
            // a partial heartbeat is not worth resuming
            let errno = if sent < 0 { sock::last_errno() } else { 0 };
            self.close(CloseReason::SendError, errno);
            return;
        }
        s.send_time = now;
    }

    /// Flush the queue's unsent region. Returns false only when there was
    /// nothing pending.
    pub fn send_pending(&self) -> bool {
        self.send_pending_inner(self.core())
    }

    fn send_pending_inner(&self, s: &mut ConnCore<C>) -> bool {
        if self.is_closed() {
            return false;
        }
        let Some(q) = s.q.as_mut() else {
            return false;
        };
        let (mut p, blk_sz) = q.get_sendable();
        if blk_sz == 0 {
            return false;
        }
        let fd = self.sockfd.load(Ordering::Relaxed);
        let mut size = (blk_sz as usize) << 3;
        loop {
            let buf = unsafe { slice::from_raw_parts(p, size) };
            let sent = sock::send(fd, buf);
            if sent < 0 {
                let errno = sock::last_errno();
                // an unaligned remainder cannot be resumed later
                if !sock::errno_would_block(errno) || (size & 7) != 0 {
                    self.close(CloseReason::SendError, errno);
                    return false;
                }
                break;
            }
            p = unsafe { p.add(sent as usize) };
            size -= sent as usize;
            if size == 0 {
                break;
            }
        }
        let sent_blk = blk_sz - (size >> 3) as u32;
        if sent_blk > 0 {
            s.send_time = s.now;
            q.sendout(sent_blk);
        }
        true
    }

    /// The TCP side of a shared-memory connection carries heartbeats only;
    /// anything else is a protocol violation and closes the connection.
    fn shm_mode_recv(&self, s: &mut ConnCore<C>) {
        let len = self.do_recv(s);
        if len == 0 {
            return;
        }
        let old_writeidx = s.writeidx;
        s.writeidx += len;
        while s.writeidx - s.nextmsg_idx >= CELL_SIZE {
            let header = s.recvbuf.header_at(s.nextmsg_idx);
            if (old_writeidx as isize - s.nextmsg_idx as isize) < CELL_SIZE as isize {
                unsafe { (*header).convert_byte_order(C::TO_LITTLE_ENDIAN) };
            }
            if unsafe { (*header).msg_type } != MSG_TYPE_HEARTBEAT {
                self.close(CloseReason::UnexpectedTcpMsg, 0);
                return;
            }
            s.nextmsg_idx += CELL_SIZE;
            s.readidx = s.nextmsg_idx;
        }
    }

    /// Read from the socket into the buffer tail plus a stack scratch;
    /// spilled scratch bytes trigger compaction or bounded growth.
    /// Returns bytes received (0 on would-block, close, or error).
    fn do_recv(&self, s: &mut ConnCore<C>) -> usize {
        let fd = self.sockfd.load(Ordering::Relaxed);
        if fd < 0 {
            return 0;
        }
        let mut stackbuf = [0u8; 65536];
        if s.readidx > 0 && s.readidx == s.writeidx {
            s.readidx = 0;
            s.nextmsg_idx = 0;
            s.writeidx = 0;
        }
        let recvbuf_size = s.recvbuf.len();
        let writable = recvbuf_size - s.writeidx;
        let max_size = C::TCP_RECV_BUF_MAX_SIZE as usize;
        // growth is a last resort: only when less than half the buffer
        // would be free after compaction
        let allow_expand = (writable + s.readidx) * 2 < recvbuf_size;
        let extra_size = stackbuf
            .len()
            .min(s.readidx + if allow_expand { max_size - recvbuf_size } else { 0 });
        if writable + extra_size == 0 {
            return 0;
        }
        let writeidx = s.writeidx;
        let ret = sock::readv2(
            fd,
            &mut s.recvbuf.bytes_mut()[writeidx..],
            &mut stackbuf[..extra_size],
        );
        if ret <= 0 {
            if ret < 0 {
                let errno = sock::last_errno();
                if sock::errno_would_block(errno) {
                    if s.now - s.recv_time > C::CONNECTION_TIMEOUT {
                        self.close(CloseReason::Timeout, 0);
                    }
                } else {
                    self.close(CloseReason::ReadError, errno);
                }
            } else {
                self.close(CloseReason::RemoteClose, 0);
            }
            return 0;
        }
        let ret = ret as usize;
        s.recv_time = s.now;
        if ret <= writable {
            return ret;
        }
        let spill = ret - writable;
        if ret <= writable + s.readidx {
            // compact: move unread bytes to offset 0, append the spill
            let readidx = s.readidx;
            let buf = s.recvbuf.bytes_mut();
            buf.copy_within(readidx..recvbuf_size, 0);
            let tail = recvbuf_size - readidx;
            buf[tail..tail + spill].copy_from_slice(&stackbuf[..spill]);
        } else {
            // grow: at least double, enough for everything just read,
            // never beyond the configured maximum
            let needed = (s.writeidx - s.readidx + ret + 7) & !7;
            let newbufsize = max_size.min((recvbuf_size * 2).max(needed));
            let mut newbuf = AlignedBuf::new(newbufsize);
            let tail = recvbuf_size - s.readidx;
            newbuf.bytes_mut()[..tail].copy_from_slice(&s.recvbuf.bytes()[s.readidx..]);
            newbuf.bytes_mut()[tail..tail + spill].copy_from_slice(&stackbuf[..spill]);
            s.recvbuf = newbuf;
        }
        s.writeidx -= s.readidx;
        s.nextmsg_idx -= s.readidx;
        s.readidx = 0;
        ret
    }

    pub fn is_closed(&self) -> bool {
        self.sockfd.load(Ordering::Acquire) < 0
    }

    /// Mark closed on behalf of the application. Thread-safe.
    pub fn request_close(&self) {
        self.close(CloseReason::RequestClose, 0);
    }

    /// The recorded close reason and errno.
    pub fn close_reason(&self) -> (CloseReason, i32) {
        let v = self.close_state.load(Ordering::Acquire);
        (CloseReason::from_u32((v >> 32) as u32), v as u32 as i32)
    }

    /// Owner-only: close the descriptor of a marked-closed connection.
    /// Returns true the one time the close actually happens.
    pub(crate) fn try_close_fd(&self) -> bool {
        if self.sockfd.load(Ordering::Acquire) >= 0 {
            return false;
        }
        let fd = self.fd_to_close.swap(-1, Ordering::Relaxed);
        if fd >= 0 {
            sock::close(fd);
            return true;
        }
        false
    }

    /// Thread-safe "mark closed": publish the first reason, clear the
    /// socket handle. The descriptor stays open until `try_close_fd`.
    fn close(&self, reason: CloseReason, errno: i32) {
        if self.sockfd.load(Ordering::Relaxed) < 0 {
            return;
        }
        let packed = ((reason as u32 as u64) << 32) | (errno as u32 as u64);
        if self
            .close_state
            .compare_exchange(0, packed, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.sockfd.store(-1, Ordering::Release);
        }
    }
}
