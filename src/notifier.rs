use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::{AcqRel, Acquire};

use crate::sys::eventfd::EventFd;

/// Cross-thread wake-up primitive for a `Cycle`.
///
/// Wraps an eventfd registered `PERSIST | READ` on the cycle's reactor.
/// `notify` only performs the (relatively expensive) eventfd write on the
/// 0 -> 1 transition of a pending-wakeup counter, mirroring the
/// pending-count/waker pattern used for the cross-thread task queue.
pub struct Notifier {
    fd: EventFd,
    pending: AtomicU64,
}

impl Notifier {
    pub fn new() -> io::Result<Notifier> {
        Ok(Notifier {
            fd: EventFd::new()?,
            pending: AtomicU64::new(0),
        })
    }

    /// Wakes the cycle if it isn't already due to wake (count was 0).
    pub fn notify(&self) -> io::Result<()> {
        if self.pending.fetch_add(1, AcqRel) == 0 {
            self.fd.write(1)?;
        }
        Ok(())
    }

    /// Clears the eventfd and resets the pending counter. Called from the
    /// cycle thread once the notifier fires.
    pub fn clear(&self) -> io::Result<()> {
        match self.fd.read() {
            Ok(_) => {
                self.pending.store(0, Acquire);
                Ok(())
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl AsRawFd for Notifier {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_then_clear() {
        let notifier = Notifier::new().unwrap();
        notifier.notify().unwrap();
        notifier.notify().unwrap();
        notifier.clear().unwrap();
        // a second clear with nothing pending must not block or error
        assert!(notifier.fd.read().is_err());
    }
}
