use std::cmp;
use std::fmt;
use std::io::{self, Error, ErrorKind, IoSlice, IoSliceMut};
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::{AsRawFd, RawFd};

use libc::{c_int, c_void, sockaddr, socklen_t, MSG_PEEK, SOCK_CLOEXEC, SOCK_NONBLOCK};

use super::common::{cvt, AsInner, FromInner, IntoInner};
use super::fd::FileDesc;

/// A non-blocking TCP/IP socket. Owns its fd for its whole lifetime; closed
/// exactly once on drop.
pub struct Socket(FileDesc);

impl Socket {
    /// `socket(2) | SOCK_NONBLOCK | SOCK_CLOEXEC`, aborting the process on
    /// failure — sockets are only ever created in contexts where failure
    /// means the process cannot continue (listener/client setup).
    pub fn create_nonblocking_or_die(family: c_int) -> Socket {
        match Self::new_raw(family, libc::SOCK_STREAM) {
            Ok(socket) => socket,
            Err(e) => panic!("failed to create socket: {}", e),
        }
    }

    fn new_raw(fam: c_int, ty: c_int) -> io::Result<Socket> {
        match syscall!(socket(fam, ty | SOCK_NONBLOCK | SOCK_CLOEXEC, 0)) {
            Ok(fd) => return Ok(Socket(FileDesc::new(fd))),
            Err(ref e) if e.raw_os_error() == Some(libc::EINVAL) => {}
            Err(e) => return Err(e),
        }

        let fd = syscall!(socket(fam, ty, 0))?;
        let fd = FileDesc::new(fd);
        fd.set_cloexec()?;
        set_nonblocking_raw(fd.raw(), true)?;
        Ok(Socket(fd))
    }

    pub fn bind(&self, addr: &SocketAddr) -> io::Result<()> {
        setsockopt(self, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1 as c_int)?;
        let (addrp, len) = addr.into_inner();
        syscall!(bind(self.0.raw(), addrp, len))?;
        Ok(())
    }

    pub fn set_reuseport(&self, reuseport: bool) -> io::Result<()> {
        setsockopt(self, libc::SOL_SOCKET, libc::SO_REUSEPORT, reuseport as c_int)
    }

    pub fn listen(&self, backlog: c_int) -> io::Result<()> {
        syscall!(listen(self.0.raw(), backlog))?;
        Ok(())
    }

    pub fn connect(&self, addr: &SocketAddr) -> io::Result<()> {
        let (addrp, len) = addr.into_inner();
        syscall!(connect(self.0.raw(), addrp, len))?;
        Ok(())
    }

    /// `accept4`, classifying the resulting errno: expected failures (peer
    /// already gone, signal interruption, local fd/system exhaustion) come
    /// back as a plain `Err`; anything else is a programming/environment
    /// error the caller cannot recover from.
    pub fn accept(&self) -> io::Result<(Socket, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of_val(&storage) as socklen_t;

        let res = syscall!(accept4(
            self.0.raw(),
            &mut storage as *mut _ as *mut sockaddr,
            &mut len,
            SOCK_NONBLOCK | SOCK_CLOEXEC
        ));

        let fd = match res {
            Ok(fd) => fd,
            Err(e) if is_expected_accept_error(&e) => return Err(e),
            Err(e) => fatal_accept_error(e),
        };

        let addr = sockaddr_to_addr(&storage, len as usize)?;
        Ok((Socket(FileDesc::new(fd)), addr))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        sockname(|storage, len| unsafe { libc::getsockname(self.0.raw(), storage, len) })
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        sockname(|storage, len| unsafe { libc::getpeername(self.0.raw(), storage, len) })
    }

    fn recv_with_flags(&self, buf: &mut [u8], flags: c_int) -> io::Result<usize> {
        let n = syscall!(recv(
            self.0.raw(),
            buf.as_mut_ptr() as *mut c_void,
            buf.len(),
            flags
        ))?;
        Ok(n as usize)
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.recv_with_flags(buf, 0)
    }

    pub fn peek(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.recv_with_flags(buf, MSG_PEEK)
    }

    pub fn read_vectored(&self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        self.0.read_vectored(bufs)
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    pub fn write_vectored(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        self.0.write_vectored(bufs)
    }

    /// `ioctl(FIONREAD)`; 4096 is used as a fallback on platforms without it,
    /// though on Linux the ioctl is always available.
    pub fn bytes_readable(&self) -> io::Result<usize> {
        let mut n: c_int = 0;
        syscall!(ioctl(self.0.raw(), libc::FIONREAD, &mut n as *mut c_int))?;
        Ok(cmp::max(n, 0) as usize)
    }

    pub fn shutdown(&self, how: std::net::Shutdown) -> io::Result<()> {
        let how = match how {
            std::net::Shutdown::Write => libc::SHUT_WR,
            std::net::Shutdown::Read => libc::SHUT_RD,
            std::net::Shutdown::Both => libc::SHUT_RDWR,
        };
        syscall!(shutdown(self.0.raw(), how))?;
        Ok(())
    }

    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        setsockopt(self, libc::IPPROTO_TCP, libc::TCP_NODELAY, nodelay as c_int)
    }

    pub fn nodelay(&self) -> io::Result<bool> {
        let raw: c_int = getsockopt(self, libc::IPPROTO_TCP, libc::TCP_NODELAY)?;
        Ok(raw != 0)
    }

    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        let raw: c_int = getsockopt(self, libc::SOL_SOCKET, libc::SO_ERROR)?;
        if raw == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(raw)))
        }
    }

    pub fn duplicate(&self) -> io::Result<Socket> {
        self.0.duplicate().map(Socket)
    }
}

fn set_nonblocking_raw(fd: c_int, nonblocking: bool) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
    let new_flags = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    syscall!(fcntl(fd, libc::F_SETFL, new_flags))?;
    Ok(())
}

/// `accept`'s expected-failure set: these are routine and the caller just
/// tries again later.
fn is_expected_accept_error(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EAGAIN)
            | Some(libc::ECONNABORTED)
            | Some(libc::EINTR)
            | Some(libc::EPROTO)
            | Some(libc::EPERM)
            | Some(libc::EMFILE)
    )
}

fn fatal_accept_error(e: io::Error) -> ! {
    panic!("accept() failed unexpectedly: {}", e);
}

pub fn setsockopt<T>(sock: &Socket, level: c_int, name: c_int, val: T) -> io::Result<()> {
    let fd: &RawFd = sock.0.as_inner();
    let payload = &val as *const T as *const c_void;
    syscall!(setsockopt(*fd, level, name, payload, mem::size_of::<T>() as socklen_t))?;
    Ok(())
}

pub fn getsockopt<T: Copy>(sock: &Socket, level: c_int, name: c_int) -> io::Result<T> {
    let fd: &RawFd = sock.0.as_inner();
    let mut slot: T = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<T>() as socklen_t;
    syscall!(getsockopt(*fd, level, name, &mut slot as *mut _ as *mut _, &mut len))?;
    assert_eq!(len as usize, mem::size_of::<T>());
    Ok(slot)
}

fn sockname<F>(f: F) -> io::Result<SocketAddr>
where
    F: FnOnce(*mut sockaddr, *mut socklen_t) -> c_int,
{
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of_val(&storage) as socklen_t;
        cvt(f(&mut storage as *mut _ as *mut _, &mut len))?;
        sockaddr_to_addr(&storage, len as usize)
    }
}

pub fn sockaddr_to_addr(storage: &libc::sockaddr_storage, len: usize) -> io::Result<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            assert!(len >= mem::size_of::<libc::sockaddr_in>());
            Ok(SocketAddr::V4(FromInner::from_inner(unsafe {
                *(storage as *const _ as *const libc::sockaddr_in)
            })))
        }
        libc::AF_INET6 => {
            assert!(len >= mem::size_of::<libc::sockaddr_in6>());
            Ok(SocketAddr::V6(FromInner::from_inner(unsafe {
                *(storage as *const _ as *const libc::sockaddr_in6)
            })))
        }
        _ => Err(Error::new(ErrorKind::InvalidInput, "invalid address family")),
    }
}

impl FromInner<libc::sockaddr_in> for SocketAddrV4 {
    fn from_inner(addr: libc::sockaddr_in) -> SocketAddrV4 {
        let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
        SocketAddrV4::new(ip, u16::from_be(addr.sin_port))
    }
}

impl FromInner<libc::sockaddr_in6> for SocketAddrV6 {
    fn from_inner(addr: libc::sockaddr_in6) -> SocketAddrV6 {
        let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
        SocketAddrV6::new(
            ip,
            u16::from_be(addr.sin6_port),
            u32::from_be(addr.sin6_flowinfo),
            addr.sin6_scope_id,
        )
    }
}

impl<'a> IntoInner<(*const sockaddr, socklen_t)> for &'a SocketAddr {
    fn into_inner(self) -> (*const sockaddr, socklen_t) {
        match *self {
            SocketAddr::V4(ref a) => {
                let raw = to_sockaddr_in(a);
                (
                    Box::leak(Box::new(raw)) as *const _ as *const sockaddr,
                    mem::size_of::<libc::sockaddr_in>() as socklen_t,
                )
            }
            SocketAddr::V6(ref a) => {
                let raw = to_sockaddr_in6(a);
                (
                    Box::leak(Box::new(raw)) as *const _ as *const sockaddr,
                    mem::size_of::<libc::sockaddr_in6>() as socklen_t,
                )
            }
        }
    }
}

fn to_sockaddr_in(addr: &SocketAddrV4) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: addr.port().to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from(*addr.ip()).to_be(),
        },
        sin_zero: [0; 8],
    }
}

fn to_sockaddr_in6(addr: &SocketAddrV6) -> libc::sockaddr_in6 {
    libc::sockaddr_in6 {
        sin6_family: libc::AF_INET6 as libc::sa_family_t,
        sin6_port: addr.port().to_be(),
        sin6_flowinfo: addr.flowinfo().to_be(),
        sin6_addr: libc::in6_addr {
            s6_addr: addr.ip().octets(),
        },
        sin6_scope_id: addr.scope_id(),
    }
}

/// `ToIpPort`: `ip:port`, IPv6 addresses bracket-wrapped.
pub fn to_ip_port(addr: &SocketAddr) -> String {
    match addr.ip() {
        IpAddr::V4(ip) => format!("{}:{}", ip, addr.port()),
        IpAddr::V6(ip) => format!("[{}]:{}", ip, addr.port()),
    }
}

/// `ToIp`: just the address, no port.
pub fn to_ip(addr: &SocketAddr) -> String {
    addr.ip().to_string()
}

/// `FromIpPort`: parses `"ip:port"` or `"[ipv6]:port"`.
pub fn from_ip_port(s: &str) -> io::Result<SocketAddr> {
    s.parse()
        .map_err(|_| Error::new(ErrorKind::InvalidInput, format!("not a valid address: {}", s)))
}

impl AsInner<c_int> for Socket {
    fn as_inner(&self) -> &c_int {
        self.0.as_inner()
    }
}

impl FromInner<c_int> for Socket {
    fn from_inner(fd: c_int) -> Socket {
        Socket(FileDesc::new(fd))
    }
}

impl IntoInner<c_int> for Socket {
    fn into_inner(self) -> c_int {
        self.0.into_raw()
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket").field("fd", &self.0.raw()).finish()
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.0.raw()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_ip_port_brackets_v6() {
        let addr: SocketAddr = "[::1]:8080".parse().unwrap();
        assert_eq!(to_ip_port(&addr), "[::1]:8080");
    }

    #[test]
    fn to_ip_port_v4() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        assert_eq!(to_ip_port(&addr), "127.0.0.1:8080");
    }

    #[test]
    fn from_ip_port_roundtrip() {
        let addr = from_ip_port("127.0.0.1:9000").unwrap();
        assert_eq!(to_ip_port(&addr), "127.0.0.1:9000");
    }

    #[test]
    fn bind_listen_connect_accept() {
        let listener = Socket::create_nonblocking_or_die(libc::AF_INET);
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        listener.bind(&addr).unwrap();
        listener.listen(128).unwrap();
        let bound = listener.local_addr().unwrap();

        let client = Socket::create_nonblocking_or_die(libc::AF_INET);
        match client.connect(&bound) {
            Ok(()) => {}
            Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => panic!("connect failed: {}", e),
        }

        std::thread::sleep(std::time::Duration::from_millis(20));
        let (_accepted, _peer) = listener.accept().unwrap();
    }
}
