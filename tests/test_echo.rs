// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// End-to-end TCP tests: login, echo round trips, graceful close,
// duplicate and capacity rejections, reconnect sequence reconciliation,
// oversized-message shutdown, corrupt-file rejection, and the
// heartbeat/timeout state machine. Server and client run in one process
// over loopback sockets, each side with its own queue directory.

use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use msglink::login::{name_from_str, LoginMsg, LoginRsp};
use msglink::msg::MsgHeader;
use msglink::{
    now_nanos, ClientHandler, CloseReason, Config, ServerHandler, TcpShmClient, TcpShmConnection,
    TcpShmServer,
};

struct Conf;

impl Config for Conf {
    const TCP_QUEUE_BYTES: u32 = 4096;
    const TCP_RECV_BUF_INIT_SIZE: u32 = 1024;
    const TCP_RECV_BUF_MAX_SIZE: u32 = 2048;
    const HEART_BEAT_INTERVAL: i64 = 50_000_000;
    const CONNECTION_TIMEOUT: i64 = 2_000_000_000;

    type LoginUserData = ();
    type LoginRspUserData = ();
    type ConnectionUserData = ();
}

static PORT_SALT: AtomicU32 = AtomicU32::new(0);

fn unique_port() -> u16 {
    let n = PORT_SALT.fetch_add(1, Ordering::Relaxed);
    (22000 + (std::process::id() % 8000) as u16).wrapping_add((n * 13) as u16)
}

fn unique_dir(tag: &str, side: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "msglink_echo_{tag}_{side}_{}",
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

// ---------------------------------------------------------------------------
// Echo server application
// ---------------------------------------------------------------------------

#[derive(Default)]
struct EchoServerApp {
    disconnect: Mutex<Option<(CloseReason, i32)>>,
    file_errors: AtomicU32,
    seq_mismatches: AtomicU32,
}

impl<C: Config> ServerHandler<C> for EchoServerApp {
    fn on_new_connection(
        &self,
        _addr: SocketAddrV4,
        _login: &LoginMsg<C>,
        _rsp: &mut LoginRsp<C>,
    ) -> Option<usize> {
        Some(0)
    }

    fn on_client_file_error(
        &self,
        _conn: &TcpShmConnection<C>,
        _what: &'static str,
        _sys_errno: i32,
    ) {
        self.file_errors.fetch_add(1, Ordering::Relaxed);
    }

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
        self.seq_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    fn on_client_disconnected(
        &self,
        _conn: &TcpShmConnection<C>,
        reason: CloseReason,
        sys_errno: i32,
    ) {
        *self.disconnect.lock().unwrap() = Some((reason, sys_errno));
    }

    fn on_client_msg(&self, conn: &TcpShmConnection<C>, header: *mut MsgHeader) {
        unsafe {
            let size = (*header).size - std::mem::size_of::<MsgHeader>() as u16;
            let Some(echo) = conn.alloc(size) else {
                return;
            };
            (*echo).msg_type = (*header).msg_type;
            std::ptr::copy_nonoverlapping(
                header.add(1) as *const u8,
                echo.add(1) as *mut u8,
                size as usize,
            );
            conn.pop();
            conn.push();
        }
    }
}

// ---------------------------------------------------------------------------
// Echo client application
// ---------------------------------------------------------------------------

struct EchoClientApp<'a, C: Config> {
    conn: &'a TcpShmConnection<C>,
    received: Mutex<Vec<u32>>,
    reject_msg: Mutex<Option<String>>,
    disconnected: Mutex<Option<(CloseReason, i32)>>,
    login_window: Mutex<Option<(u32, u32)>>,
    seq_mismatch: AtomicU32,
}

impl<'a, C: Config> EchoClientApp<'a, C> {
    fn new(conn: &'a TcpShmConnection<C>) -> Self {
        Self {
            conn,
            received: Mutex::new(Vec::new()),
            reject_msg: Mutex::new(None),
            disconnected: Mutex::new(None),
            login_window: Mutex::new(None),
            seq_mismatch: AtomicU32::new(0),
        }
    }
}

impl<C: Config> ClientHandler<C> for EchoClientApp<'_, C> {
    fn on_login_reject(&self, rsp: &LoginRsp<C>) {
        *self.reject_msg.lock().unwrap() = Some(rsp.error_msg_str().to_string());
    }

    fn on_login_success(&self, rsp: &LoginRsp<C>) -> i64 {
        *self.login_window.lock().unwrap() = Some((rsp.server_seq_start, rsp.server_seq_end));
        now_nanos()
    }

    fn on_seq_number_mismatch(
        &self,
        _local_ack: u32,
        _local_seq_start: u32,
        _local_seq_end: u32,
        _remote_ack: u32,
        _remote_seq_start: u32,
        _remote_seq_end: u32,
    ) {
        self.seq_mismatch.fetch_add(1, Ordering::Relaxed);
    }

    fn on_server_msg(&self, header: *mut MsgHeader) {
        let val = unsafe { *(header.add(1) as *const u32) };
        self.received.lock().unwrap().push(val);
        self.conn.pop();
    }

    fn on_disconnected(&self, reason: CloseReason, sys_errno: i32) {
        *self.disconnected.lock().unwrap() = Some((reason, sys_errno));
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn run_server_loop<C: Config, H: ServerHandler<C>>(
    server: &TcpShmServer<C>,
    handler: &H,
    ip: &str,
    port: u16,
    stop: &AtomicBool,
) {
    assert!(server.start(ip, port, handler), "server start failed");
    while !stop.load(Ordering::Acquire) {
        server.poll_ctl(now_nanos(), handler);
        server.poll_tcp(now_nanos(), 0, handler);
        std::thread::yield_now();
    }
    server.stop();
}

fn connect_with_retry<C: Config, H: ClientHandler<C>>(
    client: &TcpShmClient<C>,
    handler: &H,
    port: u16,
) -> bool {
    for _ in 0..100 {
        if client.connect(false, "127.0.0.1", port, Default::default(), handler) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

/// Stream `vals`, polling the connection, until every echo came back.
fn send_and_collect<C: Config>(
    client: &TcpShmClient<C>,
    app: &EchoClientApp<'_, C>,
    vals: std::ops::Range<u32>,
) {
    let total = app.received.lock().unwrap().len() + vals.len();
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut pending = vals;
    let mut next = pending.next();
    while app.received.lock().unwrap().len() < total {
        assert!(Instant::now() < deadline, "echo exchange timed out");
        assert!(!app.conn.is_closed(), "connection died mid-exchange");
        if let Some(val) = next {
            if let Some(header) = app.conn.alloc(4) {
                unsafe {
                    (*header).msg_type = 3;
                    *(header.add(1) as *mut u32) = val;
                }
                app.conn.push();
                next = pending.next();
            }
        }
        client.poll_tcp(now_nanos(), app);
    }
}

fn wait_for<F: Fn() -> bool>(what: &str, f: F) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !f() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Block until the server thread is accepting on `port`.
fn wait_listening(port: u16) {
    wait_for("server to listen", || {
        std::net::TcpStream::connect(("127.0.0.1", port)).is_ok()
    });
}

/// Keep polling for a few heartbeat intervals so the final cumulative ACK
/// reaches the peer before we tear the connection down.
fn drain_acks<C: Config>(client: &TcpShmClient<C>, app: &EchoClientApp<'_, C>, ms: u64) {
    let until = Instant::now() + Duration::from_millis(ms);
    while Instant::now() < until {
        client.poll_tcp(now_nanos(), app);
        std::thread::sleep(Duration::from_millis(2));
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn echo_round_trip_and_remote_close() {
    let port = unique_port();
    let server = TcpShmServer::<Conf>::new("srv1", &unique_dir("s1", "server"));
    let sapp = EchoServerApp::default();
    let stop = AtomicBool::new(false);
    std::thread::scope(|s| {
        s.spawn(|| run_server_loop(&server, &sapp, "127.0.0.1", port, &stop));

        let client = TcpShmClient::<Conf>::new("c1", &unique_dir("s1", "client"));
        let capp = EchoClientApp::new(client.connection());
        assert!(connect_with_retry(&client, &capp, port));

        send_and_collect(&client, &capp, 0..100);
        let received = capp.received.lock().unwrap().clone();
        assert_eq!(received, (0..100).collect::<Vec<_>>());

        client.connection().close();
        wait_for("client disconnect event", || {
            client.poll_tcp(now_nanos(), &capp);
            capp.disconnected.lock().unwrap().is_some()
        });
        client.stop();

        wait_for("server disconnect event", || {
            sapp.disconnect.lock().unwrap().is_some()
        });
        stop.store(true, Ordering::Release);
    });
    let (reason, _) = sapp.disconnect.lock().unwrap().take().unwrap();
    assert_eq!(reason, CloseReason::RemoteClose);
}

#[test]
fn duplicate_name_rejected() {
    let port = unique_port();
    let server = TcpShmServer::<Conf>::new("srv3", &unique_dir("s3", "server"));
    let sapp = EchoServerApp::default();
    let stop = AtomicBool::new(false);
    std::thread::scope(|s| {
        s.spawn(|| run_server_loop(&server, &sapp, "127.0.0.1", port, &stop));

        let client1 = TcpShmClient::<Conf>::new("dup", &unique_dir("s3", "client1"));
        let capp1 = EchoClientApp::new(client1.connection());
        assert!(connect_with_retry(&client1, &capp1, port));

        // same name while the first is still live
        let client2 = TcpShmClient::<Conf>::new("dup", &unique_dir("s3", "client2"));
        let capp2 = EchoClientApp::new(client2.connection());
        assert!(!client2.connect(false, "127.0.0.1", port, (), &capp2));
        assert_eq!(
            capp2.reject_msg.lock().unwrap().as_deref(),
            Some("Already logged on")
        );

        client1.connection().close();
        wait_for("client1 disconnect", || {
            client1.poll_tcp(now_nanos(), &capp1);
            capp1.disconnected.lock().unwrap().is_some()
        });
        stop.store(true, Ordering::Release);
    });
}

struct OneSlotConf;

impl Config for OneSlotConf {
    const TCP_QUEUE_BYTES: u32 = 4096;
    const MAX_TCP_CONNS_PER_GRP: usize = 1;
    const MAX_SHM_CONNS_PER_GRP: usize = 1;

    type LoginUserData = ();
    type LoginRspUserData = ();
    type ConnectionUserData = ();
}

#[test]
fn capacity_exceeded_rejected() {
    let port = unique_port();
    let server = TcpShmServer::<OneSlotConf>::new("srvcap", &unique_dir("cap", "server"));
    let sapp = EchoServerApp::default();
    let stop = AtomicBool::new(false);
    std::thread::scope(|s| {
        s.spawn(|| run_server_loop(&server, &sapp, "127.0.0.1", port, &stop));

        let client1 = TcpShmClient::<OneSlotConf>::new("capa", &unique_dir("cap", "client1"));
        let capp1 = EchoClientApp::new(client1.connection());
        assert!(connect_with_retry(&client1, &capp1, port));

        let client2 = TcpShmClient::<OneSlotConf>::new("capb", &unique_dir("cap", "client2"));
        let capp2 = EchoClientApp::new(client2.connection());
        assert!(!client2.connect(false, "127.0.0.1", port, (), &capp2));
        assert_eq!(
            capp2.reject_msg.lock().unwrap().as_deref(),
            Some("Max client cnt exceeded")
        );
        stop.store(true, Ordering::Release);
    });
}

#[test]
fn reconnect_reconciles_and_continues() {
    let port = unique_port();
    let server = TcpShmServer::<Conf>::new("srv2", &unique_dir("s2", "server"));
    let sapp = EchoServerApp::default();
    let stop = AtomicBool::new(false);
    let client_dir = unique_dir("s2", "client");
    std::thread::scope(|s| {
        s.spawn(|| run_server_loop(&server, &sapp, "127.0.0.1", port, &stop));

        {
            let client = TcpShmClient::<Conf>::new("c2", &client_dir);
            let capp = EchoClientApp::new(client.connection());
            assert!(connect_with_retry(&client, &capp, port));
            assert_eq!(*capp.login_window.lock().unwrap(), Some((0, 0)));
            send_and_collect(&client, &capp, 0..20);
            // let a heartbeat carry the last cumulative ACK so the server's
            // queue drains before we disconnect
            drain_acks(&client, &capp, 500);
            client.connection().close();
            wait_for("first client disconnect", || {
                client.poll_tcp(now_nanos(), &capp);
                capp.disconnected.lock().unwrap().is_some()
            });
            client.stop();
        }
        wait_for("server saw first disconnect", || {
            sapp.disconnect.lock().unwrap().is_some()
        });

        // a fresh client object with the same name and directory: both
        // sides reconcile to identical, empty windows and carry on
        let client = TcpShmClient::<Conf>::new("c2", &client_dir);
        let capp = EchoClientApp::new(client.connection());
        assert!(connect_with_retry(&client, &capp, port));
        assert_eq!(*capp.login_window.lock().unwrap(), Some((20, 20)));
        assert_eq!(sapp.seq_mismatches.load(Ordering::Relaxed), 0);
        assert_eq!(capp.seq_mismatch.load(Ordering::Relaxed), 0);

        send_and_collect(&client, &capp, 20..40);
        let received = capp.received.lock().unwrap().clone();
        assert_eq!(received, (20..40).collect::<Vec<_>>());
        stop.store(true, Ordering::Release);
    });
}

struct TinyBufConf;

impl Config for TinyBufConf {
    const TCP_QUEUE_BYTES: u32 = 4096;
    const TCP_RECV_BUF_INIT_SIZE: u32 = 64;
    const TCP_RECV_BUF_MAX_SIZE: u32 = 64;

    type LoginUserData = ();
    type LoginRspUserData = ();
    type ConnectionUserData = ();
}

#[test]
fn oversized_message_closes_connection() {
    let port = unique_port();
    let server = TcpShmServer::<TinyBufConf>::new("srv4", &unique_dir("s4", "server"));
    let sapp = EchoServerApp::default();
    let stop = AtomicBool::new(false);
    std::thread::scope(|s| {
        s.spawn(|| run_server_loop(&server, &sapp, "127.0.0.1", port, &stop));

        // wire-compatible client config with a roomier receive buffer
        let client = TcpShmClient::<Conf>::new("c4", &unique_dir("s4", "client"));
        let capp = EchoClientApp::new(client.connection());
        assert!(connect_with_retry(&client, &capp, port));

        let header = client.connection().alloc(120).expect("alloc");
        unsafe { (*header).msg_type = 3 };
        client.connection().push();

        wait_for("server oversize disconnect", || {
            sapp.disconnect.lock().unwrap().is_some()
        });
        let (reason, _) = sapp.disconnect.lock().unwrap().take().unwrap();
        assert_eq!(reason, CloseReason::MsgTooLarge);

        wait_for("client remote close", || {
            client.poll_tcp(now_nanos(), &capp);
            capp.disconnected.lock().unwrap().is_some()
        });
        let (reason, _) = capp.disconnected.lock().unwrap().take().unwrap();
        assert_eq!(reason, CloseReason::RemoteClose);
        stop.store(true, Ordering::Release);
    });
}

#[test]
fn corrupt_server_file_rejects_login() {
    let port = unique_port();
    let server_dir = unique_dir("s6", "server");
    let client_dir = unique_dir("s6", "client");
    std::fs::create_dir_all(&server_dir).unwrap();
    std::fs::create_dir_all(&client_dir).unwrap();

    // the client has talked to this server before
    std::fs::write(client_dir.join("c6.lastserver"), name_from_str("srv6")).unwrap();
    // and the server's queue file for it got mangled: a cell walk from
    // this size field cannot land on write_idx
    let mut bytes = vec![0u8; 32 + 64];
    bytes[0..4].copy_from_slice(&4u32.to_ne_bytes());
    bytes[32..34].copy_from_slice(&0xffffu16.to_le_bytes());
    std::fs::write(server_dir.join("srv6_c6.ptcp"), &bytes).unwrap();

    let server = TcpShmServer::<Conf>::new("srv6", &server_dir);
    let sapp = EchoServerApp::default();
    let stop = AtomicBool::new(false);
    std::thread::scope(|s| {
        s.spawn(|| run_server_loop(&server, &sapp, "127.0.0.1", port, &stop));

        wait_listening(port);
        let client = TcpShmClient::<Conf>::new("c6", &client_dir);
        let capp = EchoClientApp::new(client.connection());
        assert!(!client.connect(false, "127.0.0.1", port, (), &capp));
        assert_eq!(capp.reject_msg.lock().unwrap().as_deref(), Some("System error"));
        assert!(sapp.file_errors.load(Ordering::Relaxed) >= 1);
        stop.store(true, Ordering::Release);
    });
}

struct FastHbConf;

impl Config for FastHbConf {
    const TCP_QUEUE_BYTES: u32 = 4096;
    const HEART_BEAT_INTERVAL: i64 = 30_000_000;
    const CONNECTION_TIMEOUT: i64 = 250_000_000;

    type LoginUserData = ();
    type LoginRspUserData = ();
    type ConnectionUserData = ();
}

#[test]
fn heartbeats_keep_idle_connection_alive_until_peer_stops() {
    let port = unique_port();
    let server = TcpShmServer::<FastHbConf>::new("srv7", &unique_dir("s7", "server"));
    let sapp = EchoServerApp::default();
    let stop = AtomicBool::new(false);
    std::thread::scope(|s| {
        s.spawn(|| run_server_loop(&server, &sapp, "127.0.0.1", port, &stop));

        let client = TcpShmClient::<FastHbConf>::new("c7", &unique_dir("s7", "client"));
        let capp = EchoClientApp::new(client.connection());
        assert!(connect_with_retry(&client, &capp, port));

        // idle but polling: heartbeats flow, nobody times out
        let until = Instant::now() + Duration::from_millis(600);
        while Instant::now() < until {
            client.poll_tcp(now_nanos(), &capp);
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!client.connection().is_closed());
        assert!(sapp.disconnect.lock().unwrap().is_none());

        // stop polling: no more heartbeats from us, the server times out
        wait_for("server timeout disconnect", || {
            sapp.disconnect.lock().unwrap().is_some()
        });
        let (reason, _) = sapp.disconnect.lock().unwrap().take().unwrap();
        assert_eq!(reason, CloseReason::Timeout);
        stop.store(true, Ordering::Release);
    });
}
