//! Platform glue: thin wrappers around the raw syscalls the reactor,
//! sockets, and eventfd notifier need.

pub(crate) mod common;
pub(crate) mod epoll;
pub(crate) mod eventfd;
pub(crate) mod fd;
pub(crate) mod poll;
pub(crate) mod socket;
