use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::config::ReactorKind;
use crate::event::EventId;
use crate::flags::EventFlags;
use crate::sys::epoll::{Epoll, Events as EpollEvents};
use crate::sys::poll::Poll;

const INIT_EVENTS_CNT: usize = 16;

/// Picks the backing OS polling mechanism. `Epoll` is the default on Linux;
/// `Poll` exists for environments without epoll (or for testing the two
/// backends against each other) and is selected explicitly.
enum Backend {
    Epoll(Epoll, EpollEvents),
    Poll(Poll),
}

/// The reactor backend: owns the raw OS polling object and translates
/// between its native event representation and `EventFlags`.
pub(crate) struct Reactor {
    backend: Backend,
}

impl Reactor {
    pub fn new(kind: ReactorKind) -> io::Result<Reactor> {
        let backend = match kind {
            ReactorKind::Epoll => Backend::Epoll(Epoll::new()?, EpollEvents::with_capacity(INIT_EVENTS_CNT)),
            ReactorKind::Poll => Backend::Poll(Poll::new()?),
        };
        Ok(Reactor { backend })
    }

    pub fn add(&mut self, fd: RawFd, id: EventId, flags: EventFlags) -> io::Result<()> {
        match &mut self.backend {
            Backend::Epoll(epoll, _) => epoll.add(fd, id.to_raw(), flags),
            Backend::Poll(poll) => poll.add(fd, id.to_raw(), flags),
        }
    }

    pub fn modify(&mut self, fd: RawFd, id: EventId, flags: EventFlags) -> io::Result<()> {
        match &mut self.backend {
            Backend::Epoll(epoll, _) => epoll.modify(fd, id.to_raw(), flags),
            Backend::Poll(poll) => poll.modify(fd, id.to_raw(), flags),
        }
    }

    pub fn delete(&mut self, fd: RawFd) -> io::Result<()> {
        match &mut self.backend {
            Backend::Epoll(epoll, _) => epoll.delete(fd),
            Backend::Poll(poll) => poll.delete(fd),
        }
    }

    /// Polls for active events, appending `(id, flags)` pairs to `out`.
    /// Returns the number of events appended.
    pub fn poll(&mut self, timeout: Option<Duration>, out: &mut Vec<(EventId, EventFlags)>) -> io::Result<usize> {
        match &mut self.backend {
            Backend::Epoll(epoll, events) => {
                epoll.wait(events, timeout)?;
                let n = events.len();
                if n == events.capacity() {
                    events.grow();
                }
                for i in 0..n {
                    if let Some((raw, flags)) = events.get(i) {
                        out.push((EventId::from_raw(raw), flags));
                    }
                }
                Ok(n)
            }
            Backend::Poll(poll) => {
                let n = poll.wait(timeout)?;
                for (raw, flags) in poll.active_events() {
                    out.push((EventId::from_raw(raw), flags));
                }
                Ok(n)
            }
        }
    }
}
