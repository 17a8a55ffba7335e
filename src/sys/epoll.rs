use std::cmp;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use libc::{EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLPRI, EPOLLRDHUP};

use super::common::syscall;
use crate::flags::EventFlags;

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

/// Thin wrapper over a single `epoll` instance.
pub struct Epoll {
    id: usize,
    epfd: RawFd,
}

impl Epoll {
    pub fn new() -> io::Result<Epoll> {
        let epfd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed) + 1;

        Ok(Epoll { id, epfd })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn wait(&self, evts: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let timeout = timeout
            .map(|to| cmp::min(to.as_millis(), libc::c_int::MAX as u128) as libc::c_int)
            .unwrap_or(-1);

        let cnt = syscall!(epoll_wait(
            self.epfd,
            evts.events.as_mut_ptr(),
            evts.events.capacity() as i32,
            timeout
        ))?;

        unsafe { evts.events.set_len(cnt as usize) };

        Ok(())
    }

    pub fn add(&self, fd: RawFd, id: u64, interests: EventFlags) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: ioevent_to_epoll(interests),
            u64: id,
        };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut info))?;

        Ok(())
    }

    pub fn modify(&self, fd: RawFd, id: u64, interests: EventFlags) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: ioevent_to_epoll(interests),
            u64: id,
        };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut info))?;

        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let mut info = libc::epoll_event { events: 0, u64: 0 };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut info))?;

        Ok(())
    }
}

fn ioevent_to_epoll(interest: EventFlags) -> u32 {
    let mut kind = 0;

    if interest.is_readable() {
        kind |= EPOLLIN;
    }

    if interest.is_writable() {
        kind |= EPOLLOUT;
    }

    // RDHUP is always requested so a half-closed peer shows up without
    // a read ever returning 0.
    kind |= EPOLLRDHUP;

    if interest.is_edge_triggered() {
        kind |= EPOLLET;
    }

    kind as u32
}

impl AsRawFd for Epoll {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.epfd);
        }
    }
}

/// Growable buffer of raw epoll events, doubled in place whenever a `wait`
/// call fills it.
pub struct Events {
    events: Vec<libc::epoll_event>,
}

impl Events {
    pub fn with_capacity(cap: usize) -> Events {
        Events {
            events: Vec::with_capacity(cap),
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn capacity(&self) -> usize {
        self.events.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Doubles the underlying buffer; called when a `wait` returned a full
    /// batch, which means more events might be waiting.
    pub fn grow(&mut self) {
        let new_cap = cmp::max(self.events.capacity() * 2, 16);
        self.events.reserve(new_cap - self.events.capacity());
    }

    /// Returns `(id, flags)` for the event at `idx`, where `id` is whatever
    /// opaque tag was passed to `add`/`modify`.
    pub fn get(&self, idx: usize) -> Option<(u64, EventFlags)> {
        self.events.get(idx).map(|event| {
            let epoll = event.events as libc::c_int;
            let mut flags = EventFlags::empty();

            if (epoll & EPOLLIN) != 0 || (epoll & EPOLLPRI) != 0 {
                flags.insert(EventFlags::read());
            }

            if (epoll & EPOLLOUT) != 0 {
                flags.insert(EventFlags::write());
            }

            if (epoll & EPOLLRDHUP) != 0 {
                flags.insert(EventFlags::closed());
            }

            // an error, or a hangup without the peer having half-closed its
            // write side, is handed to both directions so whichever side is
            // armed gets a chance to notice it.
            if (epoll & EPOLLERR) != 0 || ((epoll & EPOLLHUP) != 0 && (epoll & EPOLLRDHUP) == 0) {
                flags.insert(EventFlags::read());
                flags.insert(EventFlags::write());
            }

            (event.u64, flags)
        })
    }
}
