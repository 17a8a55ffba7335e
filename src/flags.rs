use std::{fmt, ops};

/// The runtime's event interest / readiness flag set.
///
/// Mirrors `EpollOpt`'s bitset idiom from the reactor backend: a newtype over
/// a small integer with the usual bitwise combinators.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct EventFlags(u8);

const READ: u8 = 0b0000_0001;
const WRITE: u8 = 0b0000_0010;
const CLOSED: u8 = 0b0000_0100;
const ET: u8 = 0b0000_1000;
const PERSIST: u8 = 0b0001_0000;
const TIMEOUT: u8 = 0b0010_0000;

impl EventFlags {
    pub const fn empty() -> EventFlags {
        EventFlags(0)
    }

    pub const fn read() -> EventFlags {
        EventFlags(READ)
    }

    pub const fn write() -> EventFlags {
        EventFlags(WRITE)
    }

    pub const fn closed() -> EventFlags {
        EventFlags(CLOSED)
    }

    pub const fn edge_triggered() -> EventFlags {
        EventFlags(ET)
    }

    pub const fn persist() -> EventFlags {
        EventFlags(PERSIST)
    }

    pub const fn timeout() -> EventFlags {
        EventFlags(TIMEOUT)
    }

    pub fn is_readable(self) -> bool {
        self.contains(EventFlags::read())
    }

    pub fn is_writable(self) -> bool {
        self.contains(EventFlags::write())
    }

    pub fn is_closed(self) -> bool {
        self.contains(EventFlags::closed())
    }

    pub fn is_edge_triggered(self) -> bool {
        self.contains(EventFlags::edge_triggered())
    }

    pub fn is_persist(self) -> bool {
        self.contains(EventFlags::persist())
    }

    pub fn is_timeout(self) -> bool {
        self.contains(EventFlags::timeout())
    }

    pub fn contains(self, other: EventFlags) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn insert(&mut self, other: EventFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: EventFlags) {
        self.0 &= !other.0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl ops::BitOr for EventFlags {
    type Output = EventFlags;

    fn bitor(self, other: EventFlags) -> EventFlags {
        EventFlags(self.0 | other.0)
    }
}

impl ops::BitAnd for EventFlags {
    type Output = EventFlags;

    fn bitand(self, other: EventFlags) -> EventFlags {
        EventFlags(self.0 & other.0)
    }
}

impl ops::Sub for EventFlags {
    type Output = EventFlags;

    fn sub(self, other: EventFlags) -> EventFlags {
        EventFlags(self.0 & !other.0)
    }
}

impl fmt::Debug for EventFlags {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let mut first = true;
        let flags = [
            (EventFlags::read(), "READ"),
            (EventFlags::write(), "WRITE"),
            (EventFlags::closed(), "CLOSED"),
            (EventFlags::edge_triggered(), "ET"),
            (EventFlags::persist(), "PERSIST"),
            (EventFlags::timeout(), "TIMEOUT"),
        ];

        for &(flag, name) in &flags {
            if self.contains(flag) {
                if !first {
                    write!(fmt, "|")?;
                }
                write!(fmt, "{}", name)?;
                first = false;
            }
        }

        if first {
            write!(fmt, "DEFAULT")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::EventFlags;

    #[test]
    fn combine_and_check() {
        let flags = EventFlags::read() | EventFlags::persist();
        assert!(flags.is_readable());
        assert!(flags.is_persist());
        assert!(!flags.is_writable());
    }

    #[test]
    fn remove() {
        let mut flags = EventFlags::read() | EventFlags::write();
        flags.remove(EventFlags::write());
        assert!(flags.is_readable());
        assert!(!flags.is_writable());
    }
}
