//! The listening endpoint: an event wrapping a bound, listening socket that
//! accepts until `EAGAIN`, handing each connection to a callback.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::io;
use std::os::unix::io::AsRawFd;
use std::rc::{Rc, Weak};

use crate::cycle::Cycle;
use crate::event::EventId;
use crate::flags::EventFlags;
use crate::hook::{error, trace};
use crate::host_address::HostAddress;
use crate::sys::socket::{self, Socket};

pub type NewConnectionCallback = Box<dyn FnMut(Socket, HostAddress, HostAddress)>;

/// A listening TCP socket registered on a `Cycle`.
///
/// Lives behind an `Rc`, tied to its own event the same way `Session` does,
/// so `listen` can be called any time after construction without the
/// caller juggling a separate activation step.
pub struct Acceptor {
    cycle: Cycle,
    self_weak: RefCell<Weak<Acceptor>>,
    event_id: Cell<Option<EventId>>,
    socket: Socket,
    port: u16,
    ipv6: bool,
    // Reserved fd kept open so a later `accept` under fd exhaustion has
    // something to close to let one more connection in, then reject it.
    // See "the special problem of accept()" in libev's docs.
    idle_fd: Cell<i32>,
    new_session_cb: RefCell<Option<NewConnectionCallback>>,
}

impl Acceptor {
    pub fn new(cycle: Cycle, port: u16, ipv6: bool, reuse_port: bool) -> Rc<Acceptor> {
        let family = if ipv6 { libc::AF_INET6 } else { libc::AF_INET };
        let socket = Socket::create_nonblocking_or_die(family);
        if let Err(e) = socket.set_reuseport(reuse_port) {
            error!("failed to set SO_REUSEPORT: {}", e);
        }

        let acceptor = Rc::new(Acceptor {
            cycle,
            self_weak: RefCell::new(Weak::new()),
            event_id: Cell::new(None),
            socket,
            port,
            ipv6,
            idle_fd: Cell::new(open_idle_fd()),
            new_session_cb: RefCell::new(None),
        });
        *acceptor.self_weak.borrow_mut() = Rc::downgrade(&acceptor);
        acceptor
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_new_session_callback(&self, cb: NewConnectionCallback) {
        *self.new_session_cb.borrow_mut() = Some(cb);
    }

    /// Binds, listens, and starts accepting. Must run on the owning
    /// cycle's thread.
    pub fn listen(self: &Rc<Self>, backlog: libc::c_int) -> io::Result<()> {
        debug_assert!(self.cycle.in_cycle_thread() || !self.cycle.is_running(), "acceptor must be listened on its cycle thread");

        let addr = HostAddress::new(self.port, false, self.ipv6);
        self.socket.bind(&addr.socket_addr())?;
        self.socket.listen(backlog)?;
        self.register_event();
        Ok(())
    }

    fn register_event(self: &Rc<Self>) {
        let weak = self.self_weak.borrow().clone();
        let fd = self.socket.as_raw_fd();
        let id = self.cycle.add_event(
            fd,
            EventFlags::persist(),
            0,
            Box::new(move |_, flags, _| {
                if let Some(acceptor) = weak.upgrade() {
                    acceptor.handle_event(flags);
                }
            }),
        );
        self.event_id.set(Some(id));
        self.cycle.tie_event(id, Rc::downgrade(self) as Weak<dyn Any>);
        self.cycle.enable_read(id);
    }

    fn handle_event(&self, flags: EventFlags) {
        if !flags.is_readable() {
            error!("unexpected operation of acceptor");
            return;
        }

        let local_addr = match HostAddress::local_address(&self.socket) {
            Ok(addr) => addr,
            Err(e) => {
                error!("cannot get local addr of acceptor: {}", e);
                return;
            }
        };

        let mut accepted = false;
        let mut last_errno = None;

        loop {
            match self.socket.accept() {
                Ok((conn, peer)) => {
                    accepted = true;
                    let peer_addr = HostAddress::from_socket_addr(peer);
                    trace!("accepts of {}", socket::to_ip_port(&peer));
                    match self.new_session_cb.borrow_mut().as_mut() {
                        Some(cb) => cb(conn, peer_addr, local_addr),
                        None => drop(conn),
                    }
                }
                Err(e) => {
                    last_errno = e.raw_os_error();
                    break;
                }
            }
        }

        if !accepted {
            error!("cannot accept new connection on acceptor fd {}", self.socket.as_raw_fd());
            if last_errno == Some(libc::EMFILE) {
                self.handle_file_descriptor_exhaustion();
            }
        }
    }

    /// The special problem of `accept()`-ing when you can't: with the fd
    /// table full, a pending connection would otherwise spin the cycle at
    /// 100% CPU (always readable, never acceptable). Free one fd, accept
    /// and immediately drop the connection, then reopen the reserve.
    fn handle_file_descriptor_exhaustion(&self) {
        unsafe {
            libc::close(self.idle_fd.get());
            let fd = libc::accept(self.socket.as_raw_fd(), std::ptr::null_mut(), std::ptr::null_mut());
            if fd >= 0 {
                libc::close(fd);
            }
            self.idle_fd.set(open_idle_fd());
        }
    }
}

fn open_idle_fd() -> i32 {
    let path = b"/dev/null\0".as_ptr() as *const libc::c_char;
    let fd = unsafe { libc::open(path, libc::O_RDONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        error!("failed to open /dev/null for the acceptor's reserve fd: {}", io::Error::last_os_error());
    }
    fd
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        if self.idle_fd.get() >= 0 {
            unsafe {
                libc::close(self.idle_fd.get());
            }
        }
    }
}
