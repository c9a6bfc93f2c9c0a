// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Echo client demo: streams counter messages to the echo server and
// verifies the echoes come back in order with no gap and no duplicate.
// The send and receive counters persist in mmapped files, so killing the
// client mid-flight and restarting it exercises the replay path: the
// counters pick up exactly where the crash left them.
//
// Usage:
//   echo_client NAME SERVER_IP USE_SHM[0|1] [fast]

use std::cell::Cell;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use msglink::endian::swap_if;
use msglink::login::LoginRsp;
use msglink::msg::{MsgHeader, MSG_TYPE_APP_MIN};
use msglink::{
    now_nanos, ClientHandler, CloseReason, Config, MmapRegion, TcpShmClient, TcpShmConnection,
};

struct ClientConf;

impl Config for ClientConf {
    const TCP_QUEUE_BYTES: u32 = 1024 * 1024;
    const SHM_QUEUE_BYTES: u32 = 1024 * 1024;

    type LoginUserData = ();
    type LoginRspUserData = ();
    type ConnectionUserData = ();
}

/// Stop after this many counter values.
const MAX_NUM: i32 = 1_000_000;

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

struct EchoHandler<'a> {
    conn: &'a TcpShmConnection<ClientConf>,
    /// Mmapped counters; single polling thread touches them.
    send_num: *mut i32,
    recv_num: *mut i32,
    msg_sent: Cell<u64>,
    /// In slow mode wait for each echo before sending the next message.
    slow: bool,
}

// Safety: the counters and msg_sent are touched only by the data thread;
// the tcp thread only reports heartbeat-side events.
unsafe impl Sync for EchoHandler<'_> {}

impl EchoHandler<'_> {
    fn send_num(&self) -> i32 {
        unsafe { *self.send_num }
    }

    fn recv_num(&self) -> i32 {
        unsafe { *self.recv_num }
    }

    /// Send the next counter message; payload length cycles over 1..=4
    /// u32 values. Returns true when the whole exchange is complete.
    fn poll_num(&self) -> bool {
        let send_num = self.send_num();
        if send_num < MAX_NUM {
            if self.slow && send_num != self.recv_num() {
                return false;
            }
            let vals = (send_num as u32 % 4 + 1) as u16;
            if let Some(header) = self.conn.alloc(vals * 4) {
                unsafe {
                    (*header).msg_type = MSG_TYPE_APP_MIN + vals - 1;
                    let payload = header.add(1) as *mut u32;
                    for k in 0..vals {
                        // wire byte order, as the server may sit on a
                        // different-endian host
                        *payload.add(k as usize) =
                            swap_if(ClientConf::TO_LITTLE_ENDIAN, *self.send_num as u32);
                        *self.send_num += 1;
                    }
                }
                self.conn.push();
                self.msg_sent.set(self.msg_sent.get() + 1);
            }
        } else if send_num == self.recv_num() {
            return true;
        }
        false
    }
}

impl ClientHandler<ClientConf> for EchoHandler<'_> {
    fn on_system_error(&self, what: &'static str, sys_errno: i32) {
        eprintln!("system error: {what} errno {sys_errno}");
    }

    fn on_login_reject(&self, rsp: &LoginRsp<ClientConf>) {
        eprintln!("login rejected: {}", rsp.error_msg_str());
    }

    fn on_login_success(&self, _rsp: &LoginRsp<ClientConf>) -> i64 {
        println!("login success");
        now_nanos()
    }

    fn on_seq_number_mismatch(
        &self,
        local_ack: u32,
        local_seq_start: u32,
        local_seq_end: u32,
        remote_ack: u32,
        remote_seq_start: u32,
        remote_seq_end: u32,
    ) {
        eprintln!(
            "seq number mismatch, file: {} local {local_ack} [{local_seq_start}, {local_seq_end}) \
             remote {remote_ack} [{remote_seq_start}, {remote_seq_end})",
            self.conn.ptcp_file().display()
        );
    }

    fn on_server_msg(&self, header: *mut MsgHeader) {
        unsafe {
            let vals = ((*header).size as usize - std::mem::size_of::<MsgHeader>()) / 4;
            let payload = header.add(1) as *const u32;
            for k in 0..vals {
                let v = swap_if(ClientConf::TO_LITTLE_ENDIAN, *payload.add(k)) as i32;
                if v != *self.recv_num {
                    eprintln!("bad echo: got {v} expected {}", *self.recv_num);
                    std::process::exit(1);
                }
                *self.recv_num += 1;
            }
        }
        self.conn.pop();
    }

    fn on_disconnected(&self, reason: CloseReason, sys_errno: i32) {
        println!("disconnected, reason: {reason} errno {sys_errno}");
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 4 {
        eprintln!("usage: echo_client NAME SERVER_IP USE_SHM[0|1] [fast]");
        std::process::exit(1);
    }
    let name = args[1].as_str();
    let server_ip = args[2].as_str();
    let use_shm = args[3] != "0";
    let slow = args.get(4).map(String::as_str) != Some("fast");

    unsafe {
        libc::signal(libc::SIGTERM, on_signal as *const () as libc::sighandler_t);
        libc::signal(libc::SIGINT, on_signal as *const () as libc::sighandler_t);
    }
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(log::LevelFilter::Info);
    }

    let client = TcpShmClient::<ClientConf>::new(name, Path::new(name));
    let conn = client.connection();

    // counters survive a crash alongside the ptcp queue files
    let dir = conn.ptcp_dir();
    let send_region = MmapRegion::open_file(&dir.join(format!("{name}.send_num")), 8)
        .expect("mmap send_num");
    let recv_region = MmapRegion::open_file(&dir.join(format!("{name}.recv_num")), 8)
        .expect("mmap recv_num");
    let handler = EchoHandler {
        conn,
        send_num: send_region.as_mut_ptr() as *mut i32,
        recv_num: recv_region.as_mut_ptr() as *mut i32,
        msg_sent: Cell::new(0),
        slow,
    };

    if !client.connect(use_shm, server_ip, 12345, (), &handler) {
        std::process::exit(1);
    }
    println!(
        "client started, send_num: {} recv_num: {}",
        handler.send_num(),
        handler.recv_num()
    );

    let start_time = now_nanos();
    if use_shm {
        thread::scope(|s| {
            s.spawn(|| {
                // shm data thread; the main thread keeps tcp heartbeats alive
                while !conn.is_closed() && !STOPPED.load(Ordering::Acquire) {
                    if handler.poll_num() {
                        conn.close();
                        break;
                    }
                    client.poll_shm(&handler);
                }
            });
            while !conn.is_closed() {
                client.poll_tcp(now_nanos(), &handler);
            }
        });
    } else {
        while !conn.is_closed() {
            if STOPPED.load(Ordering::Acquire) || handler.poll_num() {
                conn.close();
            }
            client.poll_tcp(now_nanos(), &handler);
        }
    }
    let latency = now_nanos() - start_time;
    let sent = handler.msg_sent.get();
    println!(
        "client stopped, send_num: {} recv_num: {} elapsed: {latency} ns avg rtt: {:.1} ns",
        handler.send_num(),
        handler.recv_num(),
        if sent > 0 { latency as f64 / sent as f64 } else { 0.0 }
    );
    client.stop();
}
