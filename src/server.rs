// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Server side of the transport.
//
// A fixed pool of connection slots is partitioned into shared-memory
// groups and TCP groups; each group is served by one polling thread. The
// control thread accepts sockets, drives login handshakes, keeps shm
// connections' heartbeats alive and performs the real descriptor close
// for connections marked closed.
//
// Thread discipline: only the control thread mutates `live_cnt` and the
// group slot arrays. Data threads read them through atomics and may
// briefly observe a stale view — visiting a closed slot or missing a
// fresh one for a poll round — which is harmless: slots never move in
// memory and a closed connection yields no messages.

use std::cell::UnsafeCell;
use std::net::SocketAddrV4;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use log::{info, warn};

use crate::config::{check_layout, Config, NAME_SIZE};
use crate::connection::TcpShmConnection;
use crate::login::{
    decode_login, encode_login_rsp, login_frame_size, login_rsp_frame_size, name_from_str,
    LoginMsg, LoginRsp, LOGIN_STATUS_ERROR, LOGIN_STATUS_OK, LOGIN_STATUS_SEQ_MISMATCH,
};
use crate::msg::{seq_in_window, MsgHeader};
use crate::ptcp_conn::CloseReason;
use crate::sock;

/// Application callbacks surfaced by the server. All callbacks run inline
/// on the polling thread that discovered the event.
pub trait ServerHandler<C: Config>: Sync {
    /// A startup or accept-path syscall failed.
    fn on_system_error(&self, _what: &'static str, _sys_errno: i32) {}

    /// A syntactically valid login arrived: pick the group (by the mode
    /// the client asked for) or reject with `None`, optionally filling
    /// `rsp.user_data` / `rsp.error_msg`.
    fn on_new_connection(
        &self,
        addr: SocketAddrV4,
        login: &LoginMsg<C>,
        rsp: &mut LoginRsp<C>,
    ) -> Option<usize>;

    /// Mapping or validating a client's persistent file failed.
    fn on_client_file_error(
        &self,
        _conn: &TcpShmConnection<C>,
        _what: &'static str,
        _sys_errno: i32,
    ) {
    }

    /// The two sides' sequence windows do not reconcile; the login was
    /// rejected with status 1.
    #[allow(clippy::too_many_arguments)]
    fn on_seq_number_mismatch(
        &self,
        _conn: &TcpShmConnection<C>,
        _local_ack: u32,
        _local_seq_start: u32,
        _local_seq_end: u32,
        _remote_ack: u32,
        _remote_seq_start: u32,
        _remote_seq_end: u32,
    ) {
    }

    fn on_client_logon(&self, _addr: SocketAddrV4, _conn: &TcpShmConnection<C>) {}

    /// Surfaced exactly once per disconnect, from the control thread.
    fn on_client_disconnected(
        &self,
        _conn: &TcpShmConnection<C>,
        _reason: CloseReason,
        _sys_errno: i32,
    ) {
    }

    /// A message is available; `pop` it (or leave it for the next poll).
    fn on_client_msg(&self, conn: &TcpShmConnection<C>, header: *mut MsgHeader);
}

/// Pre-login slot: a socket that has yet to produce a valid login frame
/// before its deadline.
struct NewConn {
    time: i64,
    fd: i32,
    addr: libc::sockaddr_in,
    recvbuf: Vec<u8>,
}

/// Control-thread-only state.
struct CtlState {
    listenfd: i32,
    new_conns: Vec<NewConn>,
    avail_idx: usize,
}

struct ConnGroup {
    live_cnt: AtomicU32,
    /// Pool indices; the first `live_cnt` entries are the live prefix.
    conns: Box<[AtomicUsize]>,
}

pub struct TcpShmServer<C: Config> {
    server_name: [u8; NAME_SIZE],
    ctl: UnsafeCell<CtlState>,
    pool: Box<[TcpShmConnection<C>]>,
    shm_grps: Box<[ConnGroup]>,
    tcp_grps: Box<[ConnGroup]>,
}

// Safety: CtlState is touched only by the control thread; the pool and
// groups follow the thread discipline in the module header.
unsafe impl<C: Config> Send for TcpShmServer<C> {}
unsafe impl<C: Config> Sync for TcpShmServer<C> {}

fn to_socket_addr(sa: &libc::sockaddr_in) -> SocketAddrV4 {
    SocketAddrV4::new(
        u32::from_be(sa.sin_addr.s_addr).into(),
        u16::from_be(sa.sin_port),
    )
}

impl<C: Config> TcpShmServer<C> {
    /// Build the slot pool and groups. Creates `ptcp_dir` if missing.
    pub fn new(server_name: &str, ptcp_dir: &Path) -> Self {
        check_layout::<C>();
        let _ = std::fs::create_dir_all(ptcp_dir);
        let name = name_from_str(server_name);
        let pool_size =
            C::MAX_SHM_CONNS_PER_GRP * C::MAX_SHM_GRPS + C::MAX_TCP_CONNS_PER_GRP * C::MAX_TCP_GRPS;
        let pool: Box<[TcpShmConnection<C>]> = (0..pool_size)
            .map(|_| TcpShmConnection::new(ptcp_dir, name))
            .collect();
        let mut next = 0usize;
        let mut make_grps = |grp_cnt: usize, conns_per_grp: usize| -> Box<[ConnGroup]> {
            (0..grp_cnt)
                .map(|_| ConnGroup {
                    live_cnt: AtomicU32::new(0),
                    conns: (0..conns_per_grp)
                        .map(|_| {
                            let idx = next;
                            next += 1;
                            AtomicUsize::new(idx)
                        })
                        .collect(),
                })
                .collect()
        };
        let shm_grps = make_grps(C::MAX_SHM_GRPS, C::MAX_SHM_CONNS_PER_GRP);
        let tcp_grps = make_grps(C::MAX_TCP_GRPS, C::MAX_TCP_CONNS_PER_GRP);
        Self {
            server_name: name,
            ctl: UnsafeCell::new(CtlState {
                listenfd: -1,
                new_conns: (0..C::MAX_NEW_CONNECTIONS)
                    .map(|_| NewConn {
                        time: 0,
                        fd: -1,
                        addr: unsafe { std::mem::zeroed() },
                        recvbuf: vec![0u8; login_frame_size::<C>()],
                    })
                    .collect(),
                avail_idx: 0,
            }),
            pool,
            shm_grps,
            tcp_grps,
        }
    }

    pub fn name(&self) -> String {
        crate::login::bytes_to_str(&self.server_name).to_string()
    }

    #[allow(clippy::mut_from_ref)]
    fn ctl(&self) -> &mut CtlState {
        unsafe { &mut *self.ctl.get() }
    }

    /// Bind and listen. Failures go to `on_system_error` and abort the
    /// start without touching the process.
    pub fn start<H: ServerHandler<C>>(&self, listen_ipv4: &str, port: u16, handler: &H) -> bool {
        let ctl = self.ctl();
        if ctl.listenfd >= 0 {
            handler.on_system_error("already started", 0);
            return false;
        }
        match sock::tcp_listen(listen_ipv4, port, C::TCP_NO_DELAY) {
            Ok(fd) => {
                ctl.listenfd = fd;
                info!("listening on {listen_ipv4}:{port}");
                true
            }
            Err(e) => {
                handler.on_system_error(e.what, e.errno);
                false
            }
        }
    }

    /// Control poll: accept at most one new socket, drive pre-login slots
    /// and login handshakes, keep shm connections' TCP side alive, close
    /// descriptors of marked-closed connections and surface disconnects.
    pub fn poll_ctl<H: ServerHandler<C>>(&self, now: i64, handler: &H) {
        let ctl = self.ctl();
        if ctl.avail_idx != C::MAX_NEW_CONNECTIONS {
            let nc = &mut ctl.new_conns[ctl.avail_idx];
            if let Some((fd, addr)) = sock::tcp_accept(ctl.listenfd) {
                nc.fd = fd;
                nc.addr = addr;
                nc.time = now;
                ctl.avail_idx = C::MAX_NEW_CONNECTIONS;
            }
        }
        for i in 0..C::MAX_NEW_CONNECTIONS {
            let nc = &mut ctl.new_conns[i];
            if nc.fd < 0 {
                ctl.avail_idx = i;
                continue;
            }
            let frame = nc.recvbuf.len();
            let ret = sock::recv(nc.fd, &mut nc.recvbuf);
            if ret < 0
                && sock::errno_would_block(sock::last_errno())
                && now - nc.time <= C::NEW_CONNECTION_TIMEOUT
            {
                continue;
            }
            if ret == frame as isize {
                if let Some((header, login)) = decode_login::<C>(&nc.recvbuf) {
                    let fd = nc.fd;
                    let addr = nc.addr;
                    if self.handle_login(now, fd, &addr, &header, &login, handler) {
                        nc.fd = -1; // ownership moved to the connection
                    }
                }
            }
            if nc.fd >= 0 {
                sock::close(nc.fd);
                nc.fd = -1;
            }
            ctl.avail_idx = i;
        }

        for grp in self.shm_grps.iter() {
            self.sweep_group(grp, Some(now), handler);
        }
        for grp in self.tcp_grps.iter() {
            self.sweep_group(grp, None, handler);
        }
    }

    /// Heartbeat-poll (shm groups) and reap closed connections.
    fn sweep_group<H: ServerHandler<C>>(&self, grp: &ConnGroup, hb_now: Option<i64>, handler: &H) {
        let mut i = 0usize;
        while i < grp.live_cnt.load(Ordering::Relaxed) as usize {
            let conn = &self.pool[grp.conns[i].load(Ordering::Relaxed)];
            if let Some(now) = hb_now {
                // shm data lives in the rings; the tcp side only carries
                // heartbeats here
                conn.tcp_front(now);
            }
            if conn.try_close_fd() {
                let (reason, sys_errno) = conn.close_reason();
                info!(
                    "client {} disconnected: {} errno {}",
                    conn.remote_name(),
                    reason,
                    sys_errno
                );
                handler.on_client_disconnected(conn, reason, sys_errno);
                let live = grp.live_cnt.load(Ordering::Relaxed) as usize - 1;
                let a = grp.conns[i].load(Ordering::Relaxed);
                let b = grp.conns[live].load(Ordering::Relaxed);
                grp.conns[i].store(b, Ordering::Relaxed);
                grp.conns[live].store(a, Ordering::Relaxed);
                grp.live_cnt.store(live as u32, Ordering::Release);
            } else {
                i += 1;
            }
        }
    }

    /// TCP data poll for one group; runs on that group's dedicated thread.
    pub fn poll_tcp<H: ServerHandler<C>>(&self, now: i64, grpid: usize, handler: &H) {
        let grp = &self.tcp_grps[grpid];
        // acquire the live prefix published by the control thread; a stale
        // view only costs a visit to a closed slot or a missed fresh one
        let n = grp.live_cnt.load(Ordering::Acquire) as usize;
        for slot in grp.conns[..n].iter() {
            let conn = &self.pool[slot.load(Ordering::Relaxed)];
            if let Some(header) = conn.tcp_front(now) {
                handler.on_client_msg(conn, header);
            }
        }
    }

    /// SHM data poll for one group; runs on that group's dedicated thread.
    pub fn poll_shm<H: ServerHandler<C>>(&self, grpid: usize, handler: &H) {
        let grp = &self.shm_grps[grpid];
        let n = grp.live_cnt.load(Ordering::Acquire) as usize;
        for slot in grp.conns[..n].iter() {
            let conn = &self.pool[slot.load(Ordering::Relaxed)];
            if let Some(header) = conn.shm_front() {
                handler.on_client_msg(conn, header);
            }
        }
    }

    /// Stop accepting, drop pre-login sockets and release every slot.
    /// Call after the data threads have been joined.
    pub fn stop(&self) {
        let ctl = self.ctl();
        if ctl.listenfd < 0 {
            return;
        }
        sock::close(ctl.listenfd);
        ctl.listenfd = -1;
        for nc in ctl.new_conns.iter_mut() {
            if nc.fd >= 0 {
                sock::close(nc.fd);
                nc.fd = -1;
            }
        }
        ctl.avail_idx = 0;
        for grp in self.shm_grps.iter().chain(self.tcp_grps.iter()) {
            for slot in grp.conns.iter() {
                self.pool[slot.load(Ordering::Relaxed)].release();
            }
            grp.live_cnt.store(0, Ordering::Release);
        }
    }

    /// Run the login procedure for a decoded login frame. Returns true
    /// when the socket was adopted by a connection slot.
    fn handle_login<H: ServerHandler<C>>(
        &self,
        now: i64,
        fd: i32,
        addr: &libc::sockaddr_in,
        header: &MsgHeader,
        login: &LoginMsg<C>,
        handler: &H,
    ) -> bool {
        let mut rsp = LoginRsp::<C> {
            server_seq_start: 0,
            server_seq_end: 0,
            user_data: Default::default(),
            status: LOGIN_STATUS_ERROR,
            server_name: self.server_name,
            error_msg: [0; crate::login::ERROR_MSG_SIZE],
        };
        if login.client_name[0] == 0 {
            rsp.set_error_msg("Invalid client name");
            self.send_rsp(fd, 0, &rsp);
            return false;
        }
        let use_shm = login.use_shm != 0;
        let grpid = match handler.on_new_connection(to_socket_addr(addr), login, &mut rsp) {
            Some(id) => id,
            None => {
                if rsp.error_msg[0] == 0 {
                    rsp.set_error_msg("Login Reject");
                }
                self.send_rsp(fd, 0, &rsp);
                return false;
            }
        };
        let grps: &[ConnGroup] = if use_shm { &self.shm_grps } else { &self.tcp_grps };
        if grpid >= grps.len() {
            warn!("handler returned group {grpid} out of range, rejecting login");
            rsp.set_error_msg("Login Reject");
            self.send_rsp(fd, 0, &rsp);
            return false;
        }
        let grp = &grps[grpid];
        for i in 0..grp.conns.len() {
            let conn = &self.pool[grp.conns[i].load(Ordering::Relaxed)];
            let mut remote_name = conn.remote_name_bytes();
            if remote_name[0] == 0 {
                // free slot adopts the client
                conn.set_remote_name(login.client_name);
                remote_name = login.client_name;
            }
            if remote_name != login.client_name {
                continue;
            }
            if i < grp.live_cnt.load(Ordering::Relaxed) as usize {
                rsp.set_error_msg("Already logged on");
                self.send_rsp(fd, 0, &rsp);
                return false;
            }
            if let Err(e) = conn.open_file(use_shm) {
                handler.on_client_file_error(conn, e.what, e.errno);
                rsp.set_error_msg("System error");
                self.send_rsp(fd, 0, &rsp);
                return false;
            }
            let mut local_ack = 0u32;
            let mut local_seq_start = 0u32;
            let mut local_seq_end = 0u32;
            let mut remote_ack = header.ack_seq;
            let mut remote_seq_start = login.client_seq_start;
            let mut remote_seq_end = login.client_seq_end;
            if login.last_server_name != self.server_name {
                // the client last talked to someone else; start fresh
                conn.reset();
                remote_ack = 0;
                remote_seq_start = 0;
                remote_seq_end = 0;
            } else {
                match conn.get_seq() {
                    Some((a, s, e)) => {
                        local_ack = a;
                        local_seq_start = s;
                        local_seq_end = e;
                    }
                    None => {
                        handler.on_client_file_error(conn, "Ptcp file corrupt", 0);
                        rsp.set_error_msg("System error");
                        self.send_rsp(fd, 0, &rsp);
                        return false;
                    }
                }
            }
            rsp.server_seq_start = local_seq_start;
            rsp.server_seq_end = local_seq_end;
            if !seq_in_window(remote_ack, local_seq_start, local_seq_end)
                || !seq_in_window(local_ack, remote_seq_start, remote_seq_end)
            {
                handler.on_seq_number_mismatch(
                    conn,
                    local_ack,
                    local_seq_start,
                    local_seq_end,
                    remote_ack,
                    remote_seq_start,
                    remote_seq_end,
                );
                rsp.status = LOGIN_STATUS_SEQ_MISMATCH;
                self.send_rsp(fd, local_ack, &rsp);
                return false;
            }
            rsp.status = LOGIN_STATUS_OK;
            if !self.send_rsp(fd, local_ack, &rsp) {
                return false;
            }
            conn.open(fd, remote_ack, now);
            // publish to the data thread: open above happens-before the
            // release store of the grown live count
            let live = grp.live_cnt.load(Ordering::Relaxed) as usize;
            let a = grp.conns[i].load(Ordering::Relaxed);
            let b = grp.conns[live].load(Ordering::Relaxed);
            grp.conns[i].store(b, Ordering::Relaxed);
            grp.conns[live].store(a, Ordering::Relaxed);
            grp.live_cnt.store(live as u32 + 1, Ordering::Release);
            info!(
                "client {} logged on from {} ({})",
                conn.remote_name(),
                sock::format_addr(addr),
                if use_shm { "shm" } else { "tcp" }
            );
            handler.on_client_logon(to_socket_addr(addr), conn);
            return true;
        }
        rsp.set_error_msg("Max client cnt exceeded");
        self.send_rsp(fd, 0, &rsp);
        false
    }

    /// Encode and send a login response; best effort on rejections.
    fn send_rsp(&self, fd: i32, ack_seq: u32, rsp: &LoginRsp<C>) -> bool {
        let mut buf = vec![0u8; login_rsp_frame_size::<C>()];
        let n = encode_login_rsp::<C>(&mut buf, ack_seq, rsp);
        sock::send(fd, &buf[..n]) == n as isize
    }
}
