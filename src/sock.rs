// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Thin POSIX socket helpers for the nonblocking polling state machines.
// All fds handed out here are raw; ownership and closing discipline belong
// to the connection objects.

use std::ffi::CString;
use std::mem;

use crate::mmap::SysError;

extern "C" {
    fn inet_pton(af: libc::c_int, src: *const libc::c_char, dst: *mut libc::c_void) -> libc::c_int;
}

/// Errno of the last failed call, 0 if unavailable.
pub fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

pub fn set_nonblock(fd: i32) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
}

fn sockaddr_in(ipv4: &str, port: u16) -> Result<libc::sockaddr_in, SysError> {
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();
    let c_ip = CString::new(ipv4).map_err(|_| SysError::plain("inet_pton"))?;
    let ret = unsafe {
        inet_pton(
            libc::AF_INET,
            c_ip.as_ptr(),
            &mut addr.sin_addr as *mut _ as *mut libc::c_void,
        )
    };
    if ret != 1 {
        return Err(SysError::plain("inet_pton"));
    }
    Ok(addr)
}

/// Create a nonblocking listening socket bound to `ipv4:port`.
pub fn tcp_listen(ipv4: &str, port: u16, no_delay: bool) -> Result<i32, SysError> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(SysError::last("socket"));
    }
    set_nonblock(fd);
    let yes: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &yes as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        let err = SysError::last("setsockopt SO_REUSEADDR");
        unsafe { libc::close(fd) };
        return Err(err);
    }
    if no_delay {
        if let Err(err) = set_nodelay(fd) {
            unsafe { libc::close(fd) };
            return Err(err);
        }
    }
    let addr = match sockaddr_in(ipv4, port) {
        Ok(a) => a,
        Err(err) => {
            unsafe { libc::close(fd) };
            return Err(err);
        }
    };
    let ret = unsafe {
        libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        let err = SysError::last("bind");
        unsafe { libc::close(fd) };
        return Err(err);
    }
    if unsafe { libc::listen(fd, 5) } < 0 {
        let err = SysError::last("listen");
        unsafe { libc::close(fd) };
        return Err(err);
    }
    Ok(fd)
}

/// Accept one pending connection; `None` when nothing is pending or the
/// accept failed (most accept errnos are transient and treated like EAGAIN).
pub fn tcp_accept(listenfd: i32) -> Option<(i32, libc::sockaddr_in)> {
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut addr_len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let fd = unsafe {
        libc::accept(
            listenfd,
            &mut addr as *mut _ as *mut libc::sockaddr,
            &mut addr_len,
        )
    };
    if fd < 0 {
        return None;
    }
    set_nonblock(fd);
    Some((fd, addr))
}

pub fn set_nodelay(fd: i32) -> Result<(), SysError> {
    let yes: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &yes as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(SysError::last("setsockopt TCP_NODELAY"));
    }
    Ok(())
}

fn set_timeout(fd: i32, opt: libc::c_int, secs: i64) -> Result<(), SysError> {
    let tv = libc::timeval {
        tv_sec: secs as libc::time_t,
        tv_usec: 0,
    };
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            opt,
            &tv as *const _ as *const libc::c_void,
            mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(SysError::last("setsockopt timeout"));
    }
    Ok(())
}

/// Create a blocking socket with send/recv timeouts and connect to the
/// server. Used only for the login exchange; the fd is switched to
/// nonblocking once the connection is live.
pub fn tcp_connect(ipv4: &str, port: u16, no_delay: bool, timeout_secs: i64) -> Result<i32, SysError> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(SysError::last("socket"));
    }
    let setup = (|| -> Result<(), SysError> {
        set_timeout(fd, libc::SO_RCVTIMEO, timeout_secs)?;
        set_timeout(fd, libc::SO_SNDTIMEO, timeout_secs)?;
        if no_delay {
            set_nodelay(fd)?;
        }
        let addr = sockaddr_in(ipv4, port)?;
        let ret = unsafe {
            libc::connect(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(SysError::last("connect"));
        }
        Ok(())
    })();
    if let Err(err) = setup {
        unsafe { libc::close(fd) };
        return Err(err);
    }
    Ok(fd)
}

/// `send(2)` with `MSG_NOSIGNAL`; returns bytes sent or -1 with errno set.
pub fn send(fd: i32, buf: &[u8]) -> isize {
    unsafe {
        libc::send(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            libc::MSG_NOSIGNAL,
        )
    }
}

/// `recv(2)`; returns bytes read, 0 on orderly shutdown, -1 with errno set.
pub fn recv(fd: i32, buf: &mut [u8]) -> isize {
    unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) }
}

/// Scatter read into `head` then `tail`; returns bytes read, 0 on orderly
/// shutdown, -1 with errno set.
pub fn readv2(fd: i32, head: &mut [u8], tail: &mut [u8]) -> isize {
    if tail.is_empty() {
        return unsafe {
            libc::read(fd, head.as_mut_ptr() as *mut libc::c_void, head.len())
        };
    }
    let vec = [
        libc::iovec {
            iov_base: head.as_mut_ptr() as *mut libc::c_void,
            iov_len: head.len(),
        },
        libc::iovec {
            iov_base: tail.as_mut_ptr() as *mut libc::c_void,
            iov_len: tail.len(),
        },
    ];
    unsafe { libc::readv(fd, vec.as_ptr(), 2) }
}

/// True when errno says "try again later".
pub fn errno_would_block(errno: i32) -> bool {
    errno == libc::EAGAIN || errno == libc::EWOULDBLOCK
}

pub fn close(fd: i32) {
    unsafe { libc::close(fd) };
}

/// Dotted-quad plus port of a peer address, for diagnostics.
pub fn format_addr(addr: &libc::sockaddr_in) -> String {
    let ip = u32::from_be(addr.sin_addr.s_addr);
    format!(
        "{}.{}.{}.{}:{}",
        (ip >> 24) & 0xff,
        (ip >> 16) & 0xff,
        (ip >> 8) & 0xff,
        ip & 0xff,
        u16::from_be(addr.sin_port)
    )
}
