// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Echo server demo: accepts TCP and shm clients and echoes every
// application message back. Send SIGTERM to stop gracefully; kill it hard
// to watch the persistent queues replay on restart.
//
// Usage:
//   echo_server [NAME] [LISTEN_IP] [PORT]
// Defaults: server 0.0.0.0 12345

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::SocketAddrV4;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use msglink::login::{LoginMsg, LoginRsp};
use msglink::msg::MsgHeader;
use msglink::{now_nanos, CloseReason, Config, ServerHandler, TcpShmConnection, TcpShmServer};

struct ServerConf;

impl Config for ServerConf {
    const TCP_QUEUE_BYTES: u32 = 1024 * 1024;
    const SHM_QUEUE_BYTES: u32 = 1024 * 1024;
    const TCP_RECV_BUF_INIT_SIZE: u32 = 8192;
    const TCP_RECV_BUF_MAX_SIZE: u32 = 65536;

    type LoginUserData = ();
    type LoginRspUserData = ();
    /// Messages echoed on this connection.
    type ConnectionUserData = u64;
}

static STOPPED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_: libc::c_int) {
    STOPPED.store(true, Ordering::Release);
}

/// Minimal log backend for the transport's own diagnostics.
struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, _: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        eprintln!("{:5} {}: {}", record.level(), record.target(), record.args());
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

struct EchoHandler;

impl ServerHandler<ServerConf> for EchoHandler {
    fn on_system_error(&self, what: &'static str, sys_errno: i32) {
        eprintln!("system error: {what} errno {sys_errno}");
    }

    fn on_new_connection(
        &self,
        addr: SocketAddrV4,
        login: &LoginMsg<ServerConf>,
        rsp: &mut LoginRsp<ServerConf>,
    ) -> Option<usize> {
        let name = msglink::login::bytes_to_str(&login.client_name);
        println!(
            "new connection from {addr}, name: {name}, use_shm: {}",
            login.use_shm != 0
        );
        // hash the name so clients spread evenly over the groups
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        let hh = hasher.finish() as usize;
        if login.use_shm != 0 {
            if ServerConf::MAX_SHM_GRPS > 0 {
                Some(hh % ServerConf::MAX_SHM_GRPS)
            } else {
                rsp.set_error_msg("Shm disabled");
                None
            }
        } else if ServerConf::MAX_TCP_GRPS > 0 {
            Some(hh % ServerConf::MAX_TCP_GRPS)
        } else {
            rsp.set_error_msg("Tcp disabled");
            None
        }
    }

    fn on_client_file_error(
        &self,
        conn: &TcpShmConnection<ServerConf>,
        what: &'static str,
        sys_errno: i32,
    ) {
        println!(
            "client file error, name: {} reason: {what} errno {sys_errno}",
            conn.remote_name()
        );
    }

    fn on_seq_number_mismatch(
        &self,
        conn: &TcpShmConnection<ServerConf>,
        local_ack: u32,
        local_seq_start: u32,
        local_seq_end: u32,
        remote_ack: u32,
        remote_seq_start: u32,
        remote_seq_end: u32,
    ) {
        println!(
            "client seq number mismatch, name: {} file: {} local {local_ack} [{local_seq_start}, \
             {local_seq_end}) remote {remote_ack} [{remote_seq_start}, {remote_seq_end})",
            conn.remote_name(),
            conn.ptcp_file().display()
        );
    }

    fn on_client_logon(&self, addr: SocketAddrV4, conn: &TcpShmConnection<ServerConf>) {
        println!("client logon from {addr}, name: {}", conn.remote_name());
    }

    fn on_client_disconnected(
        &self,
        conn: &TcpShmConnection<ServerConf>,
        reason: CloseReason,
        sys_errno: i32,
    ) {
        let echoed = unsafe { *conn.user_data() };
        println!(
            "client disconnected, name: {} reason: {reason} errno {sys_errno} echoed {echoed}",
            conn.remote_name()
        );
    }

    fn on_client_msg(&self, conn: &TcpShmConnection<ServerConf>, header: *mut MsgHeader) {
        unsafe {
            let size = (*header).size - std::mem::size_of::<MsgHeader>() as u16;
            let Some(echo) = conn.alloc(size) else {
                return; // send queue full; the message stays at front
            };
            (*echo).msg_type = (*header).msg_type;
            std::ptr::copy_nonoverlapping(
                header.add(1) as *const u8,
                echo.add(1) as *mut u8,
                size as usize,
            );
            // pop before push so a crash between the two cannot drop the
            // inbound message unacked after having echoed it
            conn.pop();
            conn.push();
            *conn.user_data() += 1;
        }
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let name = args.get(1).map(String::as_str).unwrap_or("server");
    let listen_ip = args.get(2).map(String::as_str).unwrap_or("0.0.0.0");
    let port: u16 = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(12345);

    unsafe {
        libc::signal(libc::SIGTERM, on_signal as *const () as libc::sighandler_t);
        libc::signal(libc::SIGINT, on_signal as *const () as libc::sighandler_t);
    }
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(log::LevelFilter::Info);
    }

    let server = TcpShmServer::<ServerConf>::new(name, Path::new(name));
    let handler = EchoHandler;
    if !server.start(listen_ip, port, &handler) {
        std::process::exit(1);
    }

    thread::scope(|s| {
        for grpid in 0..ServerConf::MAX_TCP_GRPS {
            s.spawn({
                let server = &server;
                let handler = &handler;
                move || {
                    while !STOPPED.load(Ordering::Acquire) {
                        server.poll_tcp(now_nanos(), grpid, handler);
                    }
                }
            });
        }
        for grpid in 0..ServerConf::MAX_SHM_GRPS {
            s.spawn({
                let server = &server;
                let handler = &handler;
                move || {
                    while !STOPPED.load(Ordering::Acquire) {
                        server.poll_shm(grpid, handler);
                    }
                }
            });
        }
        while !STOPPED.load(Ordering::Acquire) {
            server.poll_ctl(now_nanos(), &handler);
        }
    });
    server.stop();
    println!("server stopped");
}
