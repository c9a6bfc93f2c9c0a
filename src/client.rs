// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Client side of the transport: connect, log in with sequence
// reconciliation, then poll the single connection. The name of the last
// server this client talked to persists in a small mmapped file so a
// restart can tell "same server, reconcile sequences" from "new server,
// start fresh".

use std::cell::UnsafeCell;
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::config::{check_layout, Config, NAME_SIZE};
use crate::connection::TcpShmConnection;
use crate::login::{
    bytes_to_str, decode_login_rsp, encode_login, login_frame_size, login_rsp_frame_size,
    name_from_str, LoginMsg, LoginRsp, LOGIN_STATUS_SEQ_MISMATCH,
};
use crate::mmap::MmapRegion;
use crate::msg::MsgHeader;
use crate::ptcp_conn::CloseReason;
use crate::sock;

/// Seconds a blocking login exchange may take before giving up.
const LOGIN_TIMEOUT_SECS: i64 = 10;

/// Application callbacks surfaced by the client. All callbacks run inline
/// on the calling thread.
pub trait ClientHandler<C: Config> {
    fn on_system_error(&self, _what: &'static str, _sys_errno: i32) {}

    /// Login rejected with a reason other than sequence mismatch.
    fn on_login_reject(&self, _rsp: &LoginRsp<C>) {}

    /// Login accepted. Returns the current time, which seeds the
    /// connection's heartbeat and timeout clocks.
    fn on_login_success(&self, rsp: &LoginRsp<C>) -> i64;

    /// The two sides' sequence windows do not reconcile; manual repair
    /// (e.g. removing the stale queue files) is needed.
    #[allow(clippy::too_many_arguments)]
    fn on_seq_number_mismatch(
        &self,
        _local_ack: u32,
        _local_seq_start: u32,
        _local_seq_end: u32,
        _remote_ack: u32,
        _remote_seq_start: u32,
        _remote_seq_end: u32,
    ) {
    }

    /// A message is available; `pop` it from the connection (or leave it
    /// for the next poll).
    fn on_server_msg(&self, header: *mut MsgHeader);

    /// Surfaced exactly once after the connection was marked closed.
    fn on_disconnected(&self, _reason: CloseReason, _sys_errno: i32) {}
}

struct ClientCore {
    /// `<client>.lastserver`, NAME_SIZE bytes.
    server_name_file: Option<MmapRegion>,
}

pub struct TcpShmClient<C: Config> {
    client_name: [u8; NAME_SIZE],
    ptcp_dir: PathBuf,
    conn: TcpShmConnection<C>,
    core: UnsafeCell<ClientCore>,
}

// Safety: connect/stop are single-threaded (before and after polling);
// poll_tcp and poll_shm may run on two different threads, each driving a
// disjoint channel of the connection.
unsafe impl<C: Config> Send for TcpShmClient<C> {}
unsafe impl<C: Config> Sync for TcpShmClient<C> {}

impl<C: Config> TcpShmClient<C> {
    /// Creates `ptcp_dir` if missing.
    pub fn new(client_name: &str, ptcp_dir: &Path) -> Self {
        check_layout::<C>();
        let _ = std::fs::create_dir_all(ptcp_dir);
        let name = name_from_str(client_name);
        Self {
            client_name: name,
            ptcp_dir: ptcp_dir.to_path_buf(),
            conn: TcpShmConnection::new(ptcp_dir, name),
            core: UnsafeCell::new(ClientCore {
                server_name_file: None,
            }),
        }
    }

    #[allow(clippy::mut_from_ref)]
    fn core(&self) -> &mut ClientCore {
        unsafe { &mut *self.core.get() }
    }

    fn last_server_name(&self) -> [u8; NAME_SIZE] {
        let mut name = [0u8; NAME_SIZE];
        if let Some(region) = self.core().server_name_file.as_ref() {
            unsafe {
                std::ptr::copy_nonoverlapping(region.as_ptr(), name.as_mut_ptr(), NAME_SIZE)
            };
        }
        name
    }

    fn store_server_name(&self, name: &[u8; NAME_SIZE]) {
        if let Some(region) = self.core().server_name_file.as_ref() {
            unsafe {
                std::ptr::copy_nonoverlapping(name.as_ptr(), region.as_mut_ptr(), NAME_SIZE)
            };
        }
    }

    /// Connect and log in; blocks for at most the login timeout.
    ///
    /// On success the connection is live and nonblocking; poll it with
    /// `poll_tcp` (and `poll_shm` when `use_shm`). On failure the reason
    /// went through one of the handler callbacks.
    pub fn connect<H: ClientHandler<C>>(
        &self,
        use_shm: bool,
        server_ipv4: &str,
        port: u16,
        login_user_data: C::LoginUserData,
        handler: &H,
    ) -> bool {
        if !self.conn.is_closed() {
            handler.on_system_error("already connected", 0);
            return false;
        }
        self.conn.try_close_fd();
        let core = self.core();
        if core.server_name_file.is_none() {
            let path = self
                .ptcp_dir
                .join(format!("{}.lastserver", bytes_to_str(&self.client_name)));
            match MmapRegion::open_file(&path, NAME_SIZE) {
                Ok(region) => core.server_name_file = Some(region),
                Err(e) => {
                    handler.on_system_error(e.what, e.errno);
                    return false;
                }
            }
            self.conn.set_remote_name(self.last_server_name());
        }
        let server_name = self.last_server_name();
        let mut login = LoginMsg::<C> {
            client_seq_start: 0,
            client_seq_end: 0,
            user_data: login_user_data,
            use_shm: use_shm as u8,
            client_name: self.client_name,
            last_server_name: server_name,
        };
        let mut ack_seq = 0u32;
        if server_name[0] != 0 {
            if let Err(e) = self.conn.open_file(use_shm) {
                handler.on_system_error(e.what, e.errno);
                return false;
            }
            match self.conn.get_seq() {
                Some((a, s, e)) => {
                    ack_seq = a;
                    login.client_seq_start = s;
                    login.client_seq_end = e;
                }
                None => {
                    handler.on_system_error("Ptcp file corrupt", 0);
                    return false;
                }
            }
        }
        let fd = match sock::tcp_connect(server_ipv4, port, C::TCP_NO_DELAY, LOGIN_TIMEOUT_SECS) {
            Ok(fd) => fd,
            Err(e) => {
                handler.on_system_error(e.what, e.errno);
                return false;
            }
        };
        let mut buf = vec![0u8; login_frame_size::<C>()];
        let n = encode_login::<C>(&mut buf, ack_seq, &login);
        let sent = sock::send(fd, &buf[..n]);
        if sent != n as isize {
            let errno = if sent < 0 { sock::last_errno() } else { 0 };
            handler.on_system_error("send", errno);
            sock::close(fd);
            return false;
        }
        let mut rbuf = vec![0u8; login_rsp_frame_size::<C>()];
        let ret = sock::recv(fd, &mut rbuf);
        if ret != rbuf.len() as isize {
            let errno = if ret < 0 { sock::last_errno() } else { 0 };
            handler.on_system_error("recv", errno);
            sock::close(fd);
            return false;
        }
        let (rsp_header, rsp) = match decode_login_rsp::<C>(&rbuf) {
            Some(decoded) => decoded,
            None => {
                handler.on_system_error("Invalid LoginRsp", 0);
                sock::close(fd);
                return false;
            }
        };
        if rsp.server_name[0] == 0 {
            handler.on_system_error("Invalid LoginRsp", 0);
            sock::close(fd);
            return false;
        }
        if rsp.status != 0 {
            if rsp.status == LOGIN_STATUS_SEQ_MISMATCH {
                warn!(
                    "seq number mismatch: local ack {} [{}, {}) remote ack {} [{}, {})",
                    ack_seq,
                    login.client_seq_start,
                    login.client_seq_end,
                    rsp_header.ack_seq,
                    rsp.server_seq_start,
                    rsp.server_seq_end
                );
                handler.on_seq_number_mismatch(
                    ack_seq,
                    login.client_seq_start,
                    login.client_seq_end,
                    rsp_header.ack_seq,
                    rsp.server_seq_start,
                    rsp.server_seq_end,
                );
            } else {
                handler.on_login_reject(&rsp);
            }
            sock::close(fd);
            return false;
        }
        if rsp.server_name != server_name {
            // a different server owns this endpoint now; drop every trace
            // of the old one and start fresh
            self.conn.release();
            self.store_server_name(&rsp.server_name);
            self.conn.set_remote_name(rsp.server_name);
            if let Err(e) = self.conn.open_file(use_shm) {
                handler.on_system_error(e.what, e.errno);
                sock::close(fd);
                return false;
            }
            self.conn.reset();
        }
        sock::set_nonblock(fd);
        info!(
            "logged in to {} ({})",
            bytes_to_str(&rsp.server_name),
            if use_shm { "shm" } else { "tcp" }
        );
        let now = handler.on_login_success(&rsp);
        self.conn.open(fd, rsp_header.ack_seq, now);
        true
    }

    /// Poll the TCP channel; needed even in shm mode for heartbeats.
    /// Surfaces the disconnect event when the connection winds down.
    pub fn poll_tcp<H: ClientHandler<C>>(&self, now: i64, handler: &H) {
        if !self.conn.is_closed() {
            if let Some(header) = self.conn.tcp_front(now) {
                handler.on_server_msg(header);
            }
        }
        if self.conn.try_close_fd() {
            let (reason, sys_errno) = self.conn.close_reason();
            info!("disconnected: {reason} errno {sys_errno}");
            handler.on_disconnected(reason, sys_errno);
        }
    }

    /// Poll the SHM channel; only meaningful in shm mode.
    pub fn poll_shm<H: ClientHandler<C>>(&self, handler: &H) {
        if let Some(header) = self.conn.shm_front() {
            handler.on_server_msg(header);
        }
    }

    /// Release the connection and persistent mappings.
    pub fn stop(&self) {
        self.core().server_name_file = None;
        self.conn.release();
    }

    /// The single connection; valid as long as the client lives.
    pub fn connection(&self) -> &TcpShmConnection<C> {
        &self.conn
    }
}
