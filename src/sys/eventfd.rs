use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

use super::common::syscall;
use super::fd::FileDesc;

pub const EFD_CLOEXEC: i32 = libc::EFD_CLOEXEC;
pub const EFD_NONBLOCK: i32 = libc::EFD_NONBLOCK;

/// A Linux `eventfd`, used as the cross-thread wake-up primitive for a cycle.
///
/// view: <http://man7.org/linux/man-pages/man2/eventfd.2.html>
#[derive(Debug)]
pub struct EventFd {
    inner: FileDesc,
}

impl EventFd {
    /// Creates an eventfd with initval 0 and flags `EFD_CLOEXEC | EFD_NONBLOCK`.
    pub fn new() -> io::Result<EventFd> {
        EventFd::with_options(0, EFD_CLOEXEC | EFD_NONBLOCK)
    }

    pub fn with_options(initval: u32, flags: i32) -> io::Result<EventFd> {
        let fd = syscall!(eventfd(initval, flags))?;
        Ok(EventFd {
            inner: FileDesc::new(fd),
        })
    }

    pub fn read(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        let n = self.inner.read(&mut buf)?;
        if n != 8 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short eventfd read"));
        }
        Ok(u64::from_ne_bytes(buf))
    }

    pub fn write(&self, val: u64) -> io::Result<()> {
        let buf = val.to_ne_bytes();
        let n = self.inner.write(&buf)?;
        if n != 8 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "short eventfd write"));
        }
        Ok(())
    }
}

impl FromRawFd for EventFd {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        EventFd {
            inner: FileDesc::new(fd),
        }
    }
}

impl IntoRawFd for EventFd {
    fn into_raw_fd(self) -> RawFd {
        self.inner.into_raw()
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.raw()
    }
}

#[cfg(test)]
mod tests {
    use super::EventFd;

    #[test]
    fn write_and_read() {
        let eventfd = EventFd::new().unwrap();
        eventfd.write(123).unwrap();
        let count = eventfd.read().unwrap();
        assert_eq!(123, count);
    }

    #[test]
    fn write_would_block() {
        let eventfd = EventFd::new().unwrap();

        assert!(eventfd.write(0xffff_ffff_ffff_fffe).is_ok());
        assert!(eventfd.write(0xffff_ffff_ffff_fffe).is_err());
    }
}
