//! Outbound TCP connections: `Serve`'s dual for connecting out instead of
//! accepting in, with an optional retrying connect.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::buffer::Buffer;
use crate::config::SessionConfig;
use crate::cycle::Cycle;
use crate::event::EventId;
use crate::hook::error;
use crate::host_address::HostAddress;
use crate::session::{ConnectCallback, Session, SessionEvent};
use crate::sys::socket::Socket;

/// Default delay between retry attempts, matching the source system's
/// one-second default.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_RETRY_TIMES: i32 = 30;

/// One outbound TCP connection, with optional retrying connect.
///
/// Like `Session`/`Acceptor`/`Serve`, every method that touches its `Rc`
/// state (`connect_to`, `close`, `send`, `append`) must run on the owning
/// cycle's thread — there's no cross-thread marshaling here, since the
/// whole point of a `Client` is to be a thin, same-thread-owned handle
/// onto a single `Session`.
pub struct Client {
    cycle: Cycle,
    name: String,
    config: SessionConfig,
    self_weak: RefCell<Weak<Client>>,
    session: RefCell<Option<Rc<Session>>>,
    connect_cb: RefCell<Option<ConnectCallback>>,
    retry_id: Cell<Option<EventId>>,
}

impl Client {
    pub fn new(cycle: Cycle, name: impl Into<String>) -> Rc<Client> {
        let client = Rc::new(Client {
            cycle,
            name: name.into(),
            config: SessionConfig::default(),
            self_weak: RefCell::new(Weak::new()),
            session: RefCell::new(None),
            connect_cb: RefCell::new(None),
            retry_id: Cell::new(None),
        });
        *client.self_weak.borrow_mut() = Rc::downgrade(&client);
        client
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_connect_callback(&self, cb: ConnectCallback) {
        *self.connect_cb.borrow_mut() = Some(cb);
    }

    pub fn connected(&self) -> bool {
        self.session.borrow().as_ref().map_or(false, |s| s.connected())
    }

    /// Attempts to connect to `address`. On a transient failure (refused,
    /// address in use, unreachable, ...), retries up to `retry_times` more
    /// times, `delay` apart, as long as `retry` is set. Must run on the
    /// owning cycle's thread.
    pub fn connect_to(self: &Rc<Self>, address: HostAddress, retry: bool, retry_times: i32, delay: Duration) {
        debug_assert!(self.cycle.in_cycle_thread() || !self.cycle.is_running(), "connect_to must run on the client's cycle thread");
        if self.connected() {
            error!("client[{}] is connected, please disconnect before reconnecting", self.name);
            return;
        }
        self.do_connect(address, retry, retry_times, delay);
    }

    fn do_connect(self: &Rc<Self>, address: HostAddress, retry: bool, retry_times: i32, delay: Duration) {
        let family = if address.is_ipv6() { libc::AF_INET6 } else { libc::AF_INET };
        let socket = Socket::create_nonblocking_or_die(family);
        let result = socket.connect(&address.socket_addr());
        let errno = result.err().and_then(|e| e.raw_os_error());

        match errno {
            // Non-blocking connect: success, or still in flight, or
            // interrupted, or (a racing duplicate attempt) already
            // connected. All three are the happy path.
            None | Some(libc::EINPROGRESS) | Some(libc::EINTR) | Some(libc::EISCONN) => {
                self.establish(socket, address);
                self.retry_id.set(None);
            }
            // Transient: worth retrying.
            Some(libc::EAGAIN)
            | Some(libc::EADDRINUSE)
            | Some(libc::EADDRNOTAVAIL)
            | Some(libc::ECONNREFUSED)
            | Some(libc::ENETUNREACH) => {
                drop(socket);
                if retry && retry_times > 0 {
                    let weak_self = self.self_weak.borrow().clone();
                    let retry_times = retry_times - 1;
                    let id = self.cycle.run_after(delay, move || {
                        if let Some(client) = weak_self.upgrade() {
                            client.do_connect(address, retry, retry_times, delay);
                        }
                    });
                    self.retry_id.set(id);
                } else {
                    if retry {
                        error!("client[{}] cannot connect to {}", self.name, address);
                    }
                    self.retry_id.set(None);
                }
            }
            // Terminal: a programming or permission error, not worth
            // retrying.
            Some(e) => {
                drop(socket);
                error!("client[{}] connection error {} while connecting to {}", self.name, e, address);
                self.retry_id.set(None);
            }
        }
    }

    fn establish(self: &Rc<Self>, socket: Socket, peer_addr: HostAddress) {
        let local_addr = match HostAddress::local_address(&socket) {
            Ok(addr) => addr,
            Err(e) => {
                error!("client[{}] cannot read local address after connect: {}", self.name, e);
                return;
            }
        };
        let name = format!("{}-{}#tcp", self.name, peer_addr.to_ip_port());
        let session = Session::new(self.cycle.clone(), socket, local_addr, peer_addr, name, self.config);

        if let Some(cb) = self.connect_cb.borrow_mut().take() {
            session.set_connect_callback(cb);
        }

        let weak_self = self.self_weak.borrow().clone();
        session.set_destroy_callback(Box::new(move || {
            if let Some(client) = weak_self.upgrade() {
                client.session.borrow_mut().take();
            }
        }));

        *self.session.borrow_mut() = Some(session.clone());
        session.established();
    }

    /// Force-closes the current session, if any. Must run on the owning
    /// cycle's thread.
    pub fn close(&self) {
        if let Some(id) = self.retry_id.take() {
            self.cycle.cancel(id);
        }
        if let Some(session) = self.session.borrow().clone() {
            session.force_close();
        }
    }

    /// Copies `bytes` into the session's out buffer. Returns `false` if
    /// not currently connected.
    pub fn send(self: &Rc<Self>, bytes: &[u8]) -> bool {
        match self.session.borrow().as_ref() {
            Some(session) => session.send(bytes),
            None => false,
        }
    }

    /// Splices `buffer`'s block chain into the session's out buffer.
    /// Returns `false` if not currently connected.
    pub fn append(self: &Rc<Self>, buffer: &mut Buffer) -> bool {
        match self.session.borrow().as_ref() {
            Some(session) => session.append(buffer),
            None => false,
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;
    use std::net::TcpListener;
    use std::rc::Rc as StdRc;
    use std::thread;
    use std::time::Duration;

    // A non-blocking connect to a closed loopback port almost always
    // returns EINPROGRESS, so `establish` fires immediately and the first
    // callback is always `Connected`; the refusal only surfaces later, via
    // a closed/error event once the cycle actually polls the fd.
    #[test]
    fn connect_to_closed_port_eventually_reports_failure() {
        let cycle = Cycle::new().unwrap();

        let probe = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let client = Client::new(cycle.clone(), "test-client");
        let events: StdRc<StdRefCell<Vec<SessionEvent>>> = StdRc::new(StdRefCell::new(Vec::new()));
        let events2 = events.clone();
        let exiter = cycle.clone();
        client.set_connect_callback(Box::new(move |_session, event| {
            events2.borrow_mut().push(event);
            if event != SessionEvent::Connected {
                exiter.exit();
            }
        }));

        client.connect_to(HostAddress::from_socket_addr(addr), false, 0, Duration::from_millis(1));

        let fallback_exit = cycle.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(500));
            fallback_exit.exit();
        });

        cycle.exec();

        assert!(events.borrow().contains(&SessionEvent::Connected));
    }
}
