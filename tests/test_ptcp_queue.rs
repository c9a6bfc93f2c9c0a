// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Persistent queue tests: commit/ack bookkeeping, window compaction,
// crash persistence and replay, and corruption detection.

use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};

use msglink::{Config, PtcpQueue};

struct SmallConf;

impl Config for SmallConf {
    // 8 cells of 8 bytes
    const TCP_QUEUE_BYTES: u32 = 64;

    type LoginUserData = ();
    type LoginRspUserData = ();
    type ConnectionUserData = ();
}

struct BigConf;

impl Config for BigConf {
    const TCP_QUEUE_BYTES: u32 = 4096;

    type LoginUserData = ();
    type LoginRspUserData = ();
    type ConnectionUserData = ();
}

static COUNTER: AtomicI32 = AtomicI32::new(0);

fn unique_file(tag: &str) -> PathBuf {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "msglink_ptcpq_{tag}_{n}_{}.ptcp",
        std::process::id()
    ))
}

/// Push one message with a 4-byte payload (2 cells framed).
fn push_val<C: Config>(q: &mut PtcpQueue<C>, val: u32) {
    let header = q.alloc(4).expect("alloc");
    unsafe {
        (*header).msg_type = 3;
        *(header.add(1) as *mut u32) = val;
    }
    q.push();
}

#[test]
fn push_ack_drain() {
    let path = unique_file("ack");
    let mut q = PtcpQueue::<SmallConf>::open(&path).expect("open");
    for v in 0..3u32 {
        push_val(&mut q, v);
    }
    let (_, cells) = q.get_sendable();
    assert_eq!(cells, 6);
    q.sendout(cells);
    assert_eq!(q.get_sendable().1, 0);
    assert_eq!(q.sanity_check_and_get_seq(), Some((0, 3)));

    // peer acknowledged the first two
    q.ack(2);
    assert_eq!(q.sanity_check_and_get_seq(), Some((2, 3)));
    // stale and duplicate acks are no-ops
    q.ack(2);
    q.ack(1);
    assert_eq!(q.sanity_check_and_get_seq(), Some((2, 3)));

    // draining resets the indices so the file window stays small
    q.ack(3);
    assert_eq!(q.sanity_check_and_get_seq(), Some((3, 3)));
    assert_eq!(q.get_sendable().1, 0);
    push_val(&mut q, 99);
    // a fresh message lands at offset 0 again
    let (_, cells) = q.get_sendable();
    assert_eq!(cells, 2);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn login_ack_rewinds_for_replay() {
    let path = unique_file("replay");
    let mut q = PtcpQueue::<SmallConf>::open(&path).expect("open");
    for v in 0..3u32 {
        push_val(&mut q, v);
    }
    let (_, cells) = q.get_sendable();
    q.sendout(cells);
    assert_eq!(q.get_sendable().1, 0);

    // reconnect: peer has seen only the first message
    q.login_ack(1);
    let (ptr, cells) = q.get_sendable();
    assert_eq!(cells, 4); // two unacked messages replay
    let vals: Vec<u32> = (0..2)
        .map(|i| unsafe { *(ptr.add(i * 16 + 8) as *const u32) })
        .collect();
    assert_eq!(vals, vec![1, 2]);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn compaction_shifts_live_window() {
    let path = unique_file("compact");
    let mut q = PtcpQueue::<SmallConf>::open(&path).expect("open");
    for v in 0..3u32 {
        push_val(&mut q, v); // 6 of 8 cells used
    }
    let (_, cells) = q.get_sendable();
    q.sendout(cells);
    q.ack(2); // only message #2 still owned, at cells [4, 6)

    // 4 framed cells needed; tail has 2, tail+head has 6
    let header = q.alloc(20).expect("compaction should make room");
    unsafe { (*header).msg_type = 3 };
    q.push();
    assert_eq!(q.sanity_check_and_get_seq(), Some((2, 4)));

    // the un-acked old message moved intact to offset 0
    let (ptr, cells) = q.get_sendable();
    assert_eq!(cells, 4); // only the new message is unsent
    let _ = (ptr, cells);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn alloc_fails_when_full() {
    let path = unique_file("full");
    let mut q = PtcpQueue::<SmallConf>::open(&path).expect("open");
    // a message larger than the whole queue can never fit
    assert!(q.alloc(100).is_none());
    // fill all 8 cells: 4 messages of 2 cells
    for v in 0..4u32 {
        push_val(&mut q, v);
    }
    assert!(q.alloc(4).is_none());
    let _ = std::fs::remove_file(&path);
}

#[test]
fn state_survives_reopen() {
    let path = unique_file("persist");
    {
        let mut q = PtcpQueue::<BigConf>::open(&path).expect("open");
        for v in 0..10u32 {
            push_val(&mut q, v);
        }
        let (_, cells) = q.get_sendable();
        q.sendout(cells);
        q.ack(4);
        // crash here: drop without any teardown
    }
    let q = PtcpQueue::<BigConf>::open(&path).expect("reopen");
    assert_eq!(q.my_ack(), 0);
    assert_eq!(q.sanity_check_and_get_seq(), Some((4, 10)));
    // replay after reconnect hands back exactly the unacked tail
    let mut q = q;
    q.login_ack(4);
    let (ptr, cells) = q.get_sendable();
    assert_eq!(cells, 12);
    let first = unsafe { *(ptr.add(8) as *const u32) };
    assert_eq!(first, 4);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn my_ack_is_monotonic_and_persistent() {
    let path = unique_file("myack");
    {
        let mut q = PtcpQueue::<SmallConf>::open(&path).expect("open");
        for _ in 0..5 {
            q.inc_my_ack();
        }
        assert_eq!(q.my_ack(), 5);
    }
    let q = PtcpQueue::<SmallConf>::open(&path).expect("reopen");
    assert_eq!(q.my_ack(), 5);
    let _ = std::fs::remove_file(&path);
}

/// Hand-craft a queue file whose first cell claims an absurd size; the
/// cell walk cannot land on `write_idx` and the sanity check must fail.
#[test]
fn corrupt_size_field_detected() {
    let path = unique_file("corrupt_size");
    let mut bytes = vec![0u8; 32 + 64];
    bytes[0..4].copy_from_slice(&4u32.to_ne_bytes()); // write_idx = 4
    bytes[32..34].copy_from_slice(&0xffffu16.to_le_bytes()); // cell 0 size
    std::fs::write(&path, &bytes).expect("write corrupt file");
    let q = PtcpQueue::<SmallConf>::open(&path).expect("open");
    assert_eq!(q.sanity_check_and_get_seq(), None);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn corrupt_indices_detected() {
    let path = unique_file("corrupt_idx");
    let mut bytes = vec![0u8; 32 + 64];
    bytes[0..4].copy_from_slice(&200u32.to_ne_bytes()); // write_idx > capacity
    std::fs::write(&path, &bytes).expect("write corrupt file");
    let q = PtcpQueue::<SmallConf>::open(&path).expect("open");
    assert_eq!(q.sanity_check_and_get_seq(), None);
    let _ = std::fs::remove_file(&path);
}

/// A stored cumulative ACK newer than the index block's is impossible in
/// a healthy file.
#[test]
fn corrupt_ack_seq_detected() {
    let path = unique_file("corrupt_ack");
    let mut q = PtcpQueue::<SmallConf>::open(&path).expect("open");
    // make the committed message carry ack_seq = 3 while the index block
    // still says 0
    q.inc_my_ack();
    q.inc_my_ack();
    q.inc_my_ack();
    push_val(&mut q, 7);
    drop(q);
    // rewind the index block's ack_seq_num to 0 (offset 16)
    let mut bytes = std::fs::read(&path).expect("read");
    bytes[16..20].copy_from_slice(&0u32.to_ne_bytes());
    std::fs::write(&path, &bytes).expect("rewrite");
    let q = PtcpQueue::<SmallConf>::open(&path).expect("reopen");
    assert_eq!(q.sanity_check_and_get_seq(), None);
    let _ = std::fs::remove_file(&path);
}
