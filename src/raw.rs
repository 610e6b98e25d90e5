//! Low-level socket creation and platform abstractions
//!
//! Listener sockets are created through the raw OS APIs rather than the
//! standard library so that buffer sizes, SO_REUSEPORT and the other options
//! in [`NetConfig`](crate::NetConfig) can be applied before `bind`. The
//! resulting handle is converted to a `std::net::TcpListener` and from there
//! into the reactor's event source.
//!
//! Unix systems go through POSIX calls on file descriptors; Windows goes
//! through WinSock2 with lazy WSA initialization. All `unsafe` stays inside
//! this module behind safe or explicitly-`unsafe fn` interfaces.

use std::io;
use std::net::SocketAddr;

/// IP protocol domain for sockets.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Domain {
    Ipv4,
    Ipv6,
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        use std::os::unix::io::{RawFd, FromRawFd};
        pub type OsSocket = RawFd;

        /// Platform-specific socket address storage.
        #[allow(non_camel_case_types)]
        #[derive(Debug)]
        pub enum SockAddr {
            V4(libc::sockaddr_in),
            V6(libc::sockaddr_in6),
        }

        /// Converts a `SocketAddr` to its platform representation.
        pub fn to_sockaddr(addr: SocketAddr) -> (Domain, SockAddr, libc::socklen_t) {
            match addr {
                SocketAddr::V4(a) => {
                    let mut s: libc::sockaddr_in = unsafe { std::mem::zeroed() };
                    s.sin_family = libc::AF_INET as _;
                    s.sin_port = a.port().to_be();
                    s.sin_addr = libc::in_addr { s_addr: u32::from_ne_bytes(a.ip().octets()).to_be() };
                    (Domain::Ipv4, SockAddr::V4(s), std::mem::size_of::<libc::sockaddr_in>() as _)
                }
                SocketAddr::V6(a) => {
                    let mut s: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
                    s.sin6_family = libc::AF_INET6 as _;
                    s.sin6_port = a.port().to_be();
                    s.sin6_flowinfo = a.flowinfo();
                    s.sin6_scope_id = a.scope_id();
                    s.sin6_addr = libc::in6_addr { s6_addr: a.ip().octets() };
                    (Domain::Ipv6, SockAddr::V6(s), std::mem::size_of::<libc::sockaddr_in6>() as _)
                }
            }
        }

        /// Creates a nonblocking-capable TCP stream socket.
        pub fn socket(domain: Domain) -> io::Result<OsSocket> {
            let d = match domain { Domain::Ipv4 => libc::AF_INET, Domain::Ipv6 => libc::AF_INET6 };
            let fd = unsafe { libc::socket(d, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, libc::IPPROTO_TCP) };
            if fd < 0 { return Err(io::Error::last_os_error()); }
            Ok(fd)
        }

        /// Binds the socket to an address.
        ///
        /// # Safety
        ///
        /// `os` must be a valid open socket of the same domain as `sa`.
        pub unsafe fn bind_raw(os: OsSocket, sa: &SockAddr, len: libc::socklen_t) -> io::Result<()> {
            let ptr = match sa {
                SockAddr::V4(s) => s as *const _ as *const libc::sockaddr,
                SockAddr::V6(s) => s as *const _ as *const libc::sockaddr,
            };
            if unsafe { libc::bind(os, ptr, len) } != 0 { return Err(io::Error::last_os_error()); }
            Ok(())
        }

        pub fn set_nonblocking(os: OsSocket, on: bool) -> io::Result<()> {
            unsafe {
                let flags = libc::fcntl(os, libc::F_GETFL);
                if flags < 0 { return Err(io::Error::last_os_error()); }
                let nb = if on { flags | libc::O_NONBLOCK } else { flags & !libc::O_NONBLOCK };
                if libc::fcntl(os, libc::F_SETFL, nb) != 0 { return Err(io::Error::last_os_error()); }
                Ok(())
            }
        }

        pub fn listen_raw(os: OsSocket, backlog: i32) -> io::Result<()> {
            if unsafe { libc::listen(os, backlog) } != 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
        }

        pub fn set_recv_buffer(os: OsSocket, sz: i32) -> io::Result<()> { setsockopt_int(os, libc::SOL_SOCKET, libc::SO_RCVBUF, sz) }
        pub fn set_send_buffer(os: OsSocket, sz: i32) -> io::Result<()> { setsockopt_int(os, libc::SOL_SOCKET, libc::SO_SNDBUF, sz) }
        #[cfg(any(target_os = "linux", target_os = "android"))]
        pub fn set_reuse_port(os: OsSocket, on: bool) -> io::Result<()> { setsockopt_int(os, libc::SOL_SOCKET, libc::SO_REUSEPORT, on as i32) }
        pub fn set_tcp_nodelay(os: OsSocket, on: bool) -> io::Result<()> { setsockopt_int(os, libc::IPPROTO_TCP, libc::TCP_NODELAY, on as i32) }
        #[cfg(any(target_os = "linux", target_os = "android"))]
        pub fn set_tcp_quickack(os: OsSocket, on: bool) -> io::Result<()> { setsockopt_int(os, libc::IPPROTO_TCP, 12, on as i32) }

        fn setsockopt_int(fd: RawFd, level: i32, opt: i32, val: i32) -> io::Result<()> {
            let v = val as libc::c_int;
            let rc = unsafe { libc::setsockopt(fd, level, opt, &v as *const _ as _, std::mem::size_of::<libc::c_int>() as _) };
            if rc != 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
        }

        /// Closes a raw socket that was never wrapped in a std type.
        pub fn close(os: OsSocket) {
            unsafe { libc::close(os) };
        }

        /// Wraps a configured, listening OS socket in a std listener.
        ///
        /// # Safety
        ///
        /// `fd` must be a valid listening TCP socket; ownership transfers to
        /// the returned listener.
        pub unsafe fn tcp_listener_from_os(fd: RawFd) -> std::net::TcpListener {
            unsafe { std::net::TcpListener::from_raw_fd(fd) }
        }

    } else {
        // Windows
        use std::sync::Once;
        use windows_sys::Win32::Networking::WinSock::*;
        use std::os::windows::io::{RawSocket, FromRawSocket};
        pub type OsSocket = RawSocket; // SOCKET

        static START: Once = Once::new();
        fn ensure_wsa() {
            START.call_once(|| unsafe {
                let mut data: WSADATA = std::mem::zeroed();
                let rc = WSAStartup(0x202, &mut data); // MAKEWORD(2,2)
                if rc != 0 { panic!("WSAStartup failed: {}", rc); }
            });
        }

        /// Platform-specific socket address storage.
        #[allow(non_camel_case_types, missing_debug_implementations)]
        pub enum SockAddr {
            V4(SOCKADDR_IN),
            V6(SOCKADDR_IN6),
        }

        /// Converts a `SocketAddr` to its platform representation.
        pub fn to_sockaddr(addr: SocketAddr) -> (Domain, SockAddr, i32) {
            match addr {
                SocketAddr::V4(a) => {
                    let mut s: SOCKADDR_IN = unsafe { std::mem::zeroed() };
                    s.sin_family = AF_INET as _;
                    s.sin_port = a.port().to_be();
                    s.sin_addr = IN_ADDR { S_un: IN_ADDR_0 { S_addr: u32::from_be_bytes(a.ip().octets()) } };
                    (Domain::Ipv4, SockAddr::V4(s), std::mem::size_of::<SOCKADDR_IN>() as _)
                }
                SocketAddr::V6(a) => {
                    let mut s: SOCKADDR_IN6 = unsafe { std::mem::zeroed() };
                    s.sin6_family = AF_INET6 as _;
                    s.sin6_port = a.port().to_be();
                    s.sin6_flowinfo = a.flowinfo();
                    s.Anonymous.sin6_scope_id = a.scope_id();
                    s.sin6_addr = IN6_ADDR { u: IN6_ADDR_0 { Byte: a.ip().octets() } };
                    (Domain::Ipv6, SockAddr::V6(s), std::mem::size_of::<SOCKADDR_IN6>() as _)
                }
            }
        }

        /// Creates a nonblocking-capable TCP stream socket.
        pub fn socket(domain: Domain) -> io::Result<OsSocket> {
            ensure_wsa();
            let d = match domain { Domain::Ipv4 => AF_INET, Domain::Ipv6 => AF_INET6 } as i32;
            let s = unsafe { WSASocketW(d, SOCK_STREAM as i32, 0, std::ptr::null_mut(), 0, WSA_FLAG_OVERLAPPED) };
            if s == INVALID_SOCKET { return Err(io::Error::from_raw_os_error(unsafe { WSAGetLastError() })); }
            Ok(s as _)
        }

        /// Binds the socket to an address.
        ///
        /// # Safety
        ///
        /// `os` must be a valid open socket of the same domain as `sa`.
        pub unsafe fn bind_raw(os: OsSocket, sa: &SockAddr, len: i32) -> io::Result<()> {
            ensure_wsa();
            let ptr = match sa {
                SockAddr::V4(s) => s as *const _ as *const SOCKADDR,
                SockAddr::V6(s) => s as *const _ as *const SOCKADDR,
            };
            let rc = unsafe { bind(os as usize, ptr, len) };
            if rc != 0 { return Err(io::Error::from_raw_os_error(unsafe { WSAGetLastError() })); }
            Ok(())
        }

        pub fn set_nonblocking(os: OsSocket, on: bool) -> io::Result<()> {
            ensure_wsa();
            let mut nb: u32 = if on { 1 } else { 0 };
            if unsafe { ioctlsocket(os as usize, FIONBIO, &mut nb) } != 0 { return Err(io::Error::from_raw_os_error(unsafe { WSAGetLastError() })); }
            Ok(())
        }

        pub fn listen_raw(os: OsSocket, backlog: i32) -> io::Result<()> {
            if unsafe { listen(os as usize, backlog) } != 0 { Err(io::Error::from_raw_os_error(unsafe { WSAGetLastError() })) } else { Ok(()) }
        }

        fn setsockopt_int(socket: OsSocket, level: i32, opt: i32, val: i32) -> io::Result<()> {
            unsafe {
                let rc = setsockopt(socket as usize, level, opt, &val as *const _ as _, std::mem::size_of::<i32>() as _);
                if rc != 0 { Err(io::Error::from_raw_os_error(WSAGetLastError())) } else { Ok(()) }
            }
        }
        pub fn set_recv_buffer(os: OsSocket, sz: i32) -> io::Result<()> { setsockopt_int(os, SOL_SOCKET as _, SO_RCVBUF as _, sz) }
        pub fn set_send_buffer(os: OsSocket, sz: i32) -> io::Result<()> { setsockopt_int(os, SOL_SOCKET as _, SO_SNDBUF as _, sz) }
        pub fn set_tcp_nodelay(os: OsSocket, on: bool) -> io::Result<()> { setsockopt_int(os, IPPROTO_TCP as _, TCP_NODELAY as _, if on {1} else {0}) }

        /// Closes a raw socket that was never wrapped in a std type.
        pub fn close(os: OsSocket) {
            unsafe { closesocket(os as usize) };
        }

        /// Wraps a configured, listening OS socket in a std listener.
        ///
        /// # Safety
        ///
        /// `s` must be a valid listening TCP socket; ownership transfers to
        /// the returned listener.
        pub unsafe fn tcp_listener_from_os(s: OsSocket) -> std::net::TcpListener {
            unsafe { std::net::TcpListener::from_raw_socket(s) }
        }
    }
}
