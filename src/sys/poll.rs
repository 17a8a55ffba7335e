use std::cmp;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use indexmap::IndexMap;
use libc::{POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT, POLLRDHUP};

use super::common::syscall;
use crate::flags::EventFlags;

/// `poll(2)` backed reactor, used where `epoll` is unavailable.
///
/// Unlike epoll there is no kernel-side registration table: the whole
/// `pollfd` array is rebuilt into the syscall on every wait. `fds` and
/// `ids` are always the same length and move together; `index` maps a raw
/// fd back to its slot so update/remove are O(1) instead of a linear scan.
pub struct Poll {
    fds: Vec<libc::pollfd>,
    ids: Vec<u64>,
    index: IndexMap<RawFd, usize>,
}

impl Poll {
    pub fn new() -> io::Result<Poll> {
        Ok(Poll {
            fds: Vec::new(),
            ids: Vec::new(),
            index: IndexMap::new(),
        })
    }

    pub fn add(&mut self, fd: RawFd, id: u64, interests: EventFlags) -> io::Result<()> {
        let pfd = libc::pollfd {
            fd,
            events: ioevent_to_poll(interests),
            revents: 0,
        };

        let idx = self.fds.len();
        self.fds.push(pfd);
        self.ids.push(id);
        self.index.insert(fd, idx);

        Ok(())
    }

    pub fn modify(&mut self, fd: RawFd, id: u64, interests: EventFlags) -> io::Result<()> {
        let idx = *self
            .index
            .get(&fd)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "fd not registered"))?;

        self.fds[idx].events = ioevent_to_poll(interests);
        self.fds[idx].revents = 0;
        self.ids[idx] = id;

        Ok(())
    }

    pub fn delete(&mut self, fd: RawFd) -> io::Result<()> {
        let idx = self
            .index
            .swap_remove(&fd)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "fd not registered"))?;

        let last = self.fds.len() - 1;
        if idx != last {
            self.fds.swap(idx, last);
            self.ids.swap(idx, last);
            let swapped_fd = self.fds[idx].fd;
            self.index.insert(swapped_fd, idx);
        }
        self.fds.pop();
        self.ids.pop();

        Ok(())
    }

    /// Polls the full fd set and returns the number of fds with pending
    /// `revents`.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout = timeout
            .map(|to| cmp::min(to.as_millis(), libc::c_int::MAX as u128) as libc::c_int)
            .unwrap_or(-1);

        if self.fds.is_empty() {
            if timeout > 0 {
                std::thread::sleep(Duration::from_millis(timeout as u64));
            }
            return Ok(0);
        }

        let n = syscall!(poll(
            self.fds.as_mut_ptr(),
            self.fds.len() as libc::nfds_t,
            timeout
        ))?;

        Ok(n as usize)
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Iterates the registered fds in slot order, yielding `(id, flags)`
    /// for each one with a non-zero `revents`.
    pub fn active_events(&self) -> impl Iterator<Item = (u64, EventFlags)> + '_ {
        self.fds.iter().zip(self.ids.iter()).filter_map(|(pfd, &id)| {
            if pfd.revents == 0 {
                None
            } else {
                Some((id, poll_to_ioevent(pfd.revents)))
            }
        })
    }
}

fn ioevent_to_poll(interest: EventFlags) -> libc::c_short {
    let mut kind = 0;

    if interest.is_readable() {
        kind |= POLLIN;
    }

    if interest.is_writable() {
        kind |= POLLOUT;
    }

    kind |= POLLRDHUP;

    kind as libc::c_short
}

fn poll_to_ioevent(revents: libc::c_short) -> EventFlags {
    let revents = revents as libc::c_int;
    let mut flags = EventFlags::empty();

    // a kernel-reported error is handed to both directions so whichever
    // side is armed gets a chance to notice it.
    if (revents & (POLLHUP | POLLERR | POLLNVAL)) != 0 {
        flags.insert(EventFlags::read());
        flags.insert(EventFlags::write());
    }

    if (revents & POLLIN) != 0 {
        flags.insert(EventFlags::read());
    }

    if (revents & POLLOUT) != 0 {
        flags.insert(EventFlags::write());
    }

    if (revents & POLLRDHUP) != 0 {
        flags.insert(EventFlags::closed());
    }

    flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::eventfd::EventFd;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn add_wait_delete() {
        let efd = EventFd::new().unwrap();
        let mut poll = Poll::new().unwrap();

        poll.add(efd.as_raw_fd(), 42, EventFlags::read()).unwrap();
        assert_eq!(poll.len(), 1);

        efd.write(1).unwrap();
        let n = poll.wait(Some(std::time::Duration::from_millis(100))).unwrap();
        assert_eq!(n, 1);

        let active: Vec<_> = poll.active_events().collect();
        assert_eq!(active, vec![(42, EventFlags::read())]);

        poll.delete(efd.as_raw_fd()).unwrap();
        assert!(poll.is_empty());
    }

    #[test]
    fn swap_remove_keeps_remaining_fd_reachable() {
        let a = EventFd::new().unwrap();
        let b = EventFd::new().unwrap();
        let mut poll = Poll::new().unwrap();

        poll.add(a.as_raw_fd(), 1, EventFlags::read()).unwrap();
        poll.add(b.as_raw_fd(), 2, EventFlags::read()).unwrap();
        poll.delete(a.as_raw_fd()).unwrap();

        b.write(1).unwrap();
        let n = poll.wait(Some(std::time::Duration::from_millis(100))).unwrap();
        assert_eq!(n, 1);
        let active: Vec<_> = poll.active_events().collect();
        assert_eq!(active, vec![(2, EventFlags::read())]);
    }
}
