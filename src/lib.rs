// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Hybrid TCP / shared-memory messaging transport.
//
// Two named peers exchange fixed-framed, 8-byte-aligned binary messages
// over either a reliable TCP channel with durable, resumable delivery
// (every outbound message persists in an mmapped queue until the peer's
// cumulative ACK retires it) or a pair of wait-free SPSC rings in POSIX
// shared memory for co-located peers. A TCP connection always exists and
// carries the login handshake and heartbeats; in shm mode the rings carry
// the application data.

pub mod endian;
pub mod msg;

mod mmap;
pub use mmap::{shm_unlink, MmapRegion, SysError};

pub mod config;
pub use config::{Config, NAME_SIZE};

mod sock;

mod ptcp_queue;
pub use ptcp_queue::PtcpQueue;

mod spsc_varq;
pub use spsc_varq::SpscVarQueue;

pub mod login;
pub use login::{LoginMsg, LoginRsp};

mod ptcp_conn;
pub use ptcp_conn::{CloseReason, PtcpConnection};

mod connection;
pub use connection::TcpShmConnection;

mod server;
pub use server::{ServerHandler, TcpShmServer};

mod client;
pub use client::{ClientHandler, TcpShmClient};

/// Monotonic clock in nanoseconds; the `now` currency of the polling APIs.
pub fn now_nanos() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64
}
