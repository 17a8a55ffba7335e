//! Every fallible operation in this crate returns `std::io::Result`.
//! Invariant breaches (using an event not attached to a cycle, running a
//! cycle from the wrong thread, setting both `PERSIST` and `TIMEOUT` on an
//! event) are programming errors, not recoverable I/O failures, and panic
//! instead.

pub use std::io::{Error, ErrorKind, Result};

pub(crate) fn invalid_input(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::InvalidInput, message.into())
}

pub(crate) fn not_found(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::NotFound, message.into())
}
