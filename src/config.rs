// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Compile-time transport configuration, shared by both peers for the wire
// and queue-layout parts and extended per peer for buffers and limits.

/// Fixed length of peer names on the wire and in persistent files.
pub const NAME_SIZE: usize = 16;

/// Transport configuration policy.
///
/// The wire-affecting items (`TO_LITTLE_ENDIAN`, `SHM_QUEUE_BYTES`, the
/// login user-data types) must match between a client and its server; the
/// rest is local tuning. Times are nanoseconds.
pub trait Config: 'static {
    /// Wire byte order: true = little-endian. Pick the endianness of the
    /// majority of the hosts so conversion folds to the identity there.
    const TO_LITTLE_ENDIAN: bool = true;

    /// Bytes of the shared-memory ring cell array. Must be a power of two
    /// multiple of 64.
    const SHM_QUEUE_BYTES: u32 = 1024 * 1024;

    /// Bytes of the persistent TCP queue cell array. Must be a multiple of 8.
    const TCP_QUEUE_BYTES: u32 = 1024 * 1024;

    /// Initial receive buffer size; multiple of 8.
    const TCP_RECV_BUF_INIT_SIZE: u32 = 4096;
    /// Receive buffer hard limit (also the maximum message frame); multiple of 8.
    const TCP_RECV_BUF_MAX_SIZE: u32 = 65536;

    const TCP_NO_DELAY: bool = true;

    /// Close the connection when nothing is received for this long.
    const CONNECTION_TIMEOUT: i64 = 10_000_000_000;
    /// Send a heartbeat when nothing was sent for this long.
    const HEART_BEAT_INTERVAL: i64 = 3_000_000_000;
    /// Server side: drop a pre-login socket after this long.
    const NEW_CONNECTION_TIMEOUT: i64 = 3_000_000_000;

    /// Server side: pre-login slots available at any moment.
    const MAX_NEW_CONNECTIONS: usize = 5;
    const MAX_SHM_GRPS: usize = 1;
    const MAX_SHM_CONNS_PER_GRP: usize = 4;
    const MAX_TCP_GRPS: usize = 1;
    const MAX_TCP_CONNS_PER_GRP: usize = 4;

    /// Opaque login payload (client to server), e.g. credentials.
    type LoginUserData: Copy + Default;
    /// Opaque login-response payload (server to client).
    type LoginRspUserData: Copy + Default;
    /// Per-connection embedder state.
    type ConnectionUserData: Default;
}

/// Layout constraints that depend on the config; called at open points.
pub(crate) fn check_layout<C: Config>() {
    debug_assert!(C::TCP_QUEUE_BYTES % 8 == 0);
    debug_assert!(C::TCP_RECV_BUF_INIT_SIZE % 8 == 0);
    debug_assert!(C::TCP_RECV_BUF_MAX_SIZE % 8 == 0);
    debug_assert!(C::TCP_RECV_BUF_MAX_SIZE >= C::TCP_RECV_BUF_INIT_SIZE);
    let shm_cells = C::SHM_QUEUE_BYTES / 64;
    debug_assert!(shm_cells > 0 && shm_cells & (shm_cells - 1) == 0);
}
