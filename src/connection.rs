// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// A single connection handle hiding which channel carries application
// data. TCP mode routes messages through the persistent queue; shared
// memory mode routes them through a pair of SPSC rings (one per
// direction) while the TCP side keeps carrying login and heartbeats.
//
// Persistent resources follow a canonical naming rule so both peers agree
// on them without negotiation:
//   <ptcp_dir>/<local>_<remote>.ptcp   persistent queue (TCP mode)
//   /<local>_<remote>.shm              outbound ring  (shm mode)
//   /<remote>_<local>.shm              inbound ring   (shm mode)

use std::cell::UnsafeCell;
use std::path::{Path, PathBuf};

use crate::config::{Config, NAME_SIZE};
use crate::login::bytes_to_str;
use crate::mmap::SysError;
use crate::msg::MsgHeader;
use crate::ptcp_conn::{CloseReason, PtcpConnection};
use crate::spsc_varq::SpscVarQueue;

struct FacadeCore<C: Config> {
    local_name: [u8; NAME_SIZE],
    remote_name: [u8; NAME_SIZE],
    ptcp_dir: PathBuf,
    shm_sendq: Option<SpscVarQueue<C>>,
    shm_recvq: Option<SpscVarQueue<C>>,
}

pub struct TcpShmConnection<C: Config> {
    ptcp: PtcpConnection<C>,
    core: UnsafeCell<FacadeCore<C>>,
    user_data: UnsafeCell<C::ConnectionUserData>,
}

// Safety: same single-owner discipline as PtcpConnection. The shm rings
// are each driven by one local thread; remote_name is written only before
// the connection becomes visible to data threads (ordered by the group
// live-count publication).
unsafe impl<C: Config> Send for TcpShmConnection<C> {}
unsafe impl<C: Config> Sync for TcpShmConnection<C> {}

impl<C: Config> TcpShmConnection<C> {
    pub(crate) fn new(ptcp_dir: &Path, local_name: [u8; NAME_SIZE]) -> Self {
        Self {
            ptcp: PtcpConnection::new(),
            core: UnsafeCell::new(FacadeCore {
                local_name,
                remote_name: [0; NAME_SIZE],
                ptcp_dir: ptcp_dir.to_path_buf(),
                shm_sendq: None,
                shm_recvq: None,
            }),
            user_data: UnsafeCell::new(Default::default()),
        }
    }

    #[allow(clippy::mut_from_ref)]
    fn core(&self) -> &mut FacadeCore<C> {
        unsafe { &mut *self.core.get() }
    }

    pub fn local_name(&self) -> String {
        bytes_to_str(&self.core().local_name).to_string()
    }

    pub fn remote_name(&self) -> String {
        bytes_to_str(&self.core().remote_name).to_string()
    }

    pub(crate) fn remote_name_bytes(&self) -> [u8; NAME_SIZE] {
        self.core().remote_name
    }

    pub(crate) fn set_remote_name(&self, name: [u8; NAME_SIZE]) {
        self.core().remote_name = name;
    }

    /// Path of the persistent queue file for this peer pair.
    pub fn ptcp_file(&self) -> PathBuf {
        let s = self.core();
        s.ptcp_dir.join(format!(
            "{}_{}.ptcp",
            bytes_to_str(&s.local_name),
            bytes_to_str(&s.remote_name)
        ))
    }

    pub fn ptcp_dir(&self) -> PathBuf {
        self.core().ptcp_dir.clone()
    }

    fn shm_name(from: &[u8; NAME_SIZE], to: &[u8; NAME_SIZE]) -> String {
        format!("/{}_{}.shm", bytes_to_str(from), bytes_to_str(to))
    }

    /// Map the persistent resources for the mode chosen at login;
    /// idempotent per resource.
    pub(crate) fn open_file(&self, use_shm: bool) -> Result<(), SysError> {
        let s = self.core();
        if use_shm {
            if s.shm_sendq.is_none() {
                s.shm_sendq = Some(SpscVarQueue::open_shm(&Self::shm_name(
                    &s.local_name,
                    &s.remote_name,
                ))?);
            }
            if s.shm_recvq.is_none() {
                s.shm_recvq = Some(SpscVarQueue::open_shm(&Self::shm_name(
                    &s.remote_name,
                    &s.local_name,
                ))?);
            }
            return Ok(());
        }
        self.ptcp.open_file(&self.ptcp_file())
    }

    /// `(my_ack, seq_start, seq_end)`; zeros in shm mode (the rings carry
    /// no retransmit state). `None` means the persistent file is corrupt.
    pub(crate) fn get_seq(&self) -> Option<(u32, u32, u32)> {
        if self.core().shm_sendq.is_some() {
            return Some((0, 0, 0));
        }
        self.ptcp.get_seq()
    }

    /// Fresh-peer reset of the persistent state.
    pub(crate) fn reset(&self) {
        let s = self.core();
        if let Some(q) = s.shm_sendq.as_mut() {
            q.reset();
        }
        if let Some(q) = s.shm_recvq.as_mut() {
            q.reset();
        }
        if s.shm_sendq.is_none() {
            self.ptcp.reset();
        }
    }

    /// Drop all persistent mappings and forget the peer.
    pub(crate) fn release(&self) {
        let s = self.core();
        s.remote_name = [0; NAME_SIZE];
        s.shm_sendq = None;
        s.shm_recvq = None;
        self.ptcp.release();
    }

    pub(crate) fn open(&self, fd: i32, remote_ack_seq: u32, now: i64) {
        self.ptcp.open(fd, remote_ack_seq, now);
    }

    pub(crate) fn try_close_fd(&self) -> bool {
        self.ptcp.try_close_fd()
    }

    /// Reserve a message with `payload_size` payload bytes in the send
    /// queue of the active channel. The returned frame is 8-byte aligned;
    /// fill the payload and `msg_type`, then `push`. `None` when the
    /// queue is out of space (back off and retry).
    pub fn alloc(&self, payload_size: u16) -> Option<*mut MsgHeader> {
        let s = self.core();
        if let Some(q) = s.shm_sendq.as_mut() {
            return q.alloc(payload_size);
        }
        self.ptcp.alloc(payload_size)
    }

    /// Commit the message from the last `alloc` and send it out.
    pub fn push(&self) {
        let s = self.core();
        if let Some(q) = s.shm_sendq.as_mut() {
            q.push();
        } else {
            self.ptcp.push();
        }
    }

    /// Commit without an immediate flush; useful when pushing a batch.
    /// Identical to `push` in shm mode.
    pub fn push_more(&self) {
        let s = self.core();
        if let Some(q) = s.shm_sendq.as_mut() {
            q.push();
        } else {
            self.ptcp.push_more();
        }
    }

    /// Next inbound message of the active channel, or `None`. The same
    /// message is returned again until `pop`.
    pub fn front(&self) -> Option<*mut MsgHeader> {
        let s = self.core();
        if let Some(q) = s.shm_recvq.as_mut() {
            return q.front();
        }
        self.ptcp.front()
    }

    /// Consume the message obtained from `front` (or a polling callback).
    pub fn pop(&self) {
        let s = self.core();
        if let Some(q) = s.shm_recvq.as_mut() {
            q.pop();
        } else {
            self.ptcp.pop();
        }
    }

    /// TCP-channel poll: heartbeat bookkeeping plus the next TCP message.
    /// Always returns `None` for a shm connection (whose TCP side carries
    /// only heartbeats).
    pub(crate) fn tcp_front(&self, now: i64) -> Option<*mut MsgHeader> {
        self.ptcp.send_hb(now);
        self.ptcp.front()
    }

    /// SHM-channel poll.
    pub(crate) fn shm_front(&self) -> Option<*mut MsgHeader> {
        self.core().shm_recvq.as_mut()?.front()
    }

    /// Ask the owning thread to close this connection.
    pub fn close(&self) {
        self.ptcp.request_close();
    }

    pub fn is_closed(&self) -> bool {
        self.ptcp.is_closed()
    }

    pub fn close_reason(&self) -> (CloseReason, i32) {
        self.ptcp.close_reason()
    }

    /// Embedder state attached to this connection. Owner thread only.
    pub fn user_data(&self) -> *mut C::ConnectionUserData {
        self.user_data.get()
    }
}
