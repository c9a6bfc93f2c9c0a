// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Login handshake wire format.
//
// A login frame is the only thing a server accepts on a fresh socket; the
// response decides whether the connection goes live and which channel
// (TCP or shared memory) will carry application data. Message types 1 and
// 2 are reserved for these frames only at the start of a connection, so
// applications may reuse them afterwards.

use std::mem::size_of;
use std::ptr;

use crate::config::{Config, NAME_SIZE};
use crate::endian::swap_if_in_place;
use crate::msg::{frame_bytes, MsgHeader, MSG_TYPE_LOGIN, MSG_TYPE_LOGIN_RSP};

/// Login accepted.
pub const LOGIN_STATUS_OK: u8 = 0;
/// Sequence windows of the two sides do not overlap; manual repair needed.
pub const LOGIN_STATUS_SEQ_MISMATCH: u8 = 1;
/// Any other rejection; see `error_msg`.
pub const LOGIN_STATUS_ERROR: u8 = 2;

/// Bytes of the free-form rejection text in a login response.
pub const ERROR_MSG_SIZE: usize = 32;

/// Login frame payload (client to server).
#[repr(C)]
pub struct LoginMsg<C: Config> {
    /// The client's persistent unacknowledged window `[start, end)`.
    pub client_seq_start: u32,
    pub client_seq_end: u32,
    /// Opaque to the transport; credentials and the like.
    pub user_data: C::LoginUserData,
    pub use_shm: u8,
    pub client_name: [u8; NAME_SIZE],
    /// Name of the server this client last talked to; a mismatch with the
    /// live server resets both sides' persistent state for this pair.
    pub last_server_name: [u8; NAME_SIZE],
}

impl<C: Config> Clone for LoginMsg<C> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<C: Config> Copy for LoginMsg<C> {}

impl<C: Config> LoginMsg<C> {
    fn convert_byte_order(&mut self) {
        swap_if_in_place(C::TO_LITTLE_ENDIAN, &mut self.client_seq_start);
        swap_if_in_place(C::TO_LITTLE_ENDIAN, &mut self.client_seq_end);
    }
}

/// Login response payload (server to client).
#[repr(C)]
pub struct LoginRsp<C: Config> {
    /// The server's persistent unacknowledged window `[start, end)`.
    pub server_seq_start: u32,
    pub server_seq_end: u32,
    pub user_data: C::LoginRspUserData,
    /// One of the `LOGIN_STATUS_*` values.
    pub status: u8,
    pub server_name: [u8; NAME_SIZE],
    /// Empty on success.
    pub error_msg: [u8; ERROR_MSG_SIZE],
}

impl<C: Config> Clone for LoginRsp<C> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<C: Config> Copy for LoginRsp<C> {}

impl<C: Config> LoginRsp<C> {
    fn convert_byte_order(&mut self) {
        swap_if_in_place(C::TO_LITTLE_ENDIAN, &mut self.server_seq_start);
        swap_if_in_place(C::TO_LITTLE_ENDIAN, &mut self.server_seq_end);
    }

    /// Store `s` into `error_msg`, truncated, NUL-padded.
    pub fn set_error_msg(&mut self, s: &str) {
        self.error_msg = [0; ERROR_MSG_SIZE];
        let n = s.len().min(ERROR_MSG_SIZE - 1);
        self.error_msg[..n].copy_from_slice(&s.as_bytes()[..n]);
    }

    pub fn error_msg_str(&self) -> &str {
        bytes_to_str(&self.error_msg)
    }
}

/// On-wire bytes of the framed login message.
pub const fn login_frame_size<C: Config>() -> usize {
    frame_bytes((size_of::<MsgHeader>() + size_of::<LoginMsg<C>>()) as u16)
}

/// On-wire bytes of the framed login response.
pub const fn login_rsp_frame_size<C: Config>() -> usize {
    frame_bytes((size_of::<MsgHeader>() + size_of::<LoginRsp<C>>()) as u16)
}

/// Encode `header ack + login` into `buf`; returns the frame length.
pub(crate) fn encode_login<C: Config>(buf: &mut [u8], ack_seq: u32, login: &LoginMsg<C>) -> usize {
    let frame = login_frame_size::<C>();
    buf[..frame].fill(0);
    let mut header = MsgHeader {
        size: (size_of::<MsgHeader>() + size_of::<LoginMsg<C>>()) as u16,
        msg_type: MSG_TYPE_LOGIN,
        ack_seq,
    };
    header.convert_byte_order(C::TO_LITTLE_ENDIAN);
    let mut msg = *login;
    msg.convert_byte_order();
    unsafe {
        ptr::write_unaligned(buf.as_mut_ptr() as *mut MsgHeader, header);
        ptr::write_unaligned(buf.as_mut_ptr().add(size_of::<MsgHeader>()) as *mut LoginMsg<C>, msg);
    }
    frame
}

/// Decode a login frame; `None` when the header does not describe one.
pub(crate) fn decode_login<C: Config>(buf: &[u8]) -> Option<(MsgHeader, LoginMsg<C>)> {
    if buf.len() < login_frame_size::<C>() {
        return None;
    }
    let mut header = unsafe { ptr::read_unaligned(buf.as_ptr() as *const MsgHeader) };
    header.convert_byte_order(C::TO_LITTLE_ENDIAN);
    if header.size as usize != size_of::<MsgHeader>() + size_of::<LoginMsg<C>>()
        || header.msg_type != MSG_TYPE_LOGIN
    {
        return None;
    }
    let mut msg = unsafe {
        ptr::read_unaligned(buf.as_ptr().add(size_of::<MsgHeader>()) as *const LoginMsg<C>)
    };
    msg.convert_byte_order();
    Some((header, msg))
}

/// Encode `header ack + login response` into `buf`; returns the frame length.
pub(crate) fn encode_login_rsp<C: Config>(buf: &mut [u8], ack_seq: u32, rsp: &LoginRsp<C>) -> usize {
    let frame = login_rsp_frame_size::<C>();
    buf[..frame].fill(0);
    let mut header = MsgHeader {
        size: (size_of::<MsgHeader>() + size_of::<LoginRsp<C>>()) as u16,
        msg_type: MSG_TYPE_LOGIN_RSP,
        ack_seq,
    };
    header.convert_byte_order(C::TO_LITTLE_ENDIAN);
    let mut msg = *rsp;
    msg.convert_byte_order();
    unsafe {
        ptr::write_unaligned(buf.as_mut_ptr() as *mut MsgHeader, header);
        ptr::write_unaligned(buf.as_mut_ptr().add(size_of::<MsgHeader>()) as *mut LoginRsp<C>, msg);
    }
    frame
}

/// Decode a login response frame; `None` when the header does not
/// describe one.
pub(crate) fn decode_login_rsp<C: Config>(buf: &[u8]) -> Option<(MsgHeader, LoginRsp<C>)> {
    if buf.len() < login_rsp_frame_size::<C>() {
        return None;
    }
    let mut header = unsafe { ptr::read_unaligned(buf.as_ptr() as *const MsgHeader) };
    header.convert_byte_order(C::TO_LITTLE_ENDIAN);
    if header.size as usize != size_of::<MsgHeader>() + size_of::<LoginRsp<C>>()
        || header.msg_type != MSG_TYPE_LOGIN_RSP
    {
        return None;
    }
    let mut msg = unsafe {
        ptr::read_unaligned(buf.as_ptr().add(size_of::<MsgHeader>()) as *const LoginRsp<C>)
    };
    msg.convert_byte_order();
    Some((header, msg))
}

/// Fixed-size peer name from a string: truncated to `NAME_SIZE - 1` bytes,
/// NUL-padded.
pub fn name_from_str(s: &str) -> [u8; NAME_SIZE] {
    let mut name = [0u8; NAME_SIZE];
    let n = s.len().min(NAME_SIZE - 1);
    name[..n].copy_from_slice(&s.as_bytes()[..n]);
    name
}

/// The printable prefix of a NUL-padded name buffer.
pub fn bytes_to_str(bytes: &[u8]) -> &str {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    std::str::from_utf8(&bytes[..end]).unwrap_or("<non-utf8>")
}
