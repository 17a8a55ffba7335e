//! A single-threaded-reactor-per-thread, non-blocking network I/O runtime.
//!
//! The core primitive is a [`Cycle`]: an event loop owned by exactly one OS
//! thread, driving [`Session`]s (connected TCP sockets), [`Acceptor`]s
//! (listening sockets) and timers registered on it. [`Serve`] wires an
//! accept cycle to a fixed [`IoPool`] of worker cycles, handing each
//! accepted connection off to one; [`Client`] is the outbound counterpart.
//!
//! ```no_run
//! use cycle_io::{Cycle, Serve, Acceptor};
//!
//! let cycle = Cycle::new().unwrap();
//! let serve = Serve::new(cycle.clone(), "echo");
//! serve.set_new_session_callback(|session| {
//!     session.set_read_callback(Box::new(|session, buf, _now| {
//!         let mut bytes = vec![0u8; buf.len()];
//!         buf.remove(&mut bytes);
//!         session.send(&bytes);
//!     }));
//! });
//!
//! let acceptor = Acceptor::new(cycle.clone(), 0, false, true);
//! serve.add_acceptor(acceptor, 1024).unwrap();
//! serve.exec(4).unwrap();
//! ```

extern crate libc;

mod sys;

mod config;
mod error;
mod event;
mod flags;
mod hook;
mod notifier;
mod reactor;
mod timer;

mod buffer;
mod host_address;

mod acceptor;
mod client;
mod cycle;
mod io_pool;
mod serve;
mod session;

pub use buffer::Buffer;
pub use config::{BufferConfig, CycleConfig, ReactorKind, SessionConfig};
pub use cycle::Cycle;
pub use event::EventId;
pub use flags::EventFlags;
pub use hook::{set_hook, Hook, Kind as HookKind};
pub use host_address::HostAddress;

pub use acceptor::{Acceptor, NewConnectionCallback};
pub use client::{Client, DEFAULT_RETRY_DELAY, DEFAULT_RETRY_TIMES};
pub use io_pool::IoPool;
pub use serve::{NewSessionCallback, Serve};
pub use session::{
    ConnectCallback, DestroyCallback, HighWaterCallback, ReadCallback, Session, SessionEvent,
    SessionHandle, SessionState, WriteCallback,
};
