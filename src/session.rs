//! TCP session state machine: wires a connected socket's readiness events
//! to read/write/close/error callbacks and owns its in/out buffers.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::time::Instant;

use crate::buffer::Buffer;
use crate::config::SessionConfig;
use crate::cycle::Cycle;
use crate::event::EventId;
use crate::flags::EventFlags;
use crate::hook::{error, trace};
use crate::host_address::HostAddress;
use crate::sys::socket::Socket;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SessionState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// The reason a connect callback fired.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SessionEvent {
    Connected,
    Closed,
    Error,
}

thread_local! {
    /// Every session currently live on this thread, by fd, held weakly so a
    /// session's own `Rc` refcount still governs its lifetime. Backs
    /// `SessionHandle`, which only carries a `Cycle` and a `RawFd` across
    /// threads and looks the `Rc<Session>` back up once running on the
    /// owning cycle's own thread.
    static LIVE: RefCell<HashMap<RawFd, Weak<Session>>> = RefCell::new(HashMap::new());
}

pub type ConnectCallback = Box<dyn FnMut(&Rc<Session>, SessionEvent)>;
pub type ReadCallback = Box<dyn FnMut(&Rc<Session>, &mut Buffer, Instant)>;
pub type WriteCallback = Box<dyn FnMut(&Rc<Session>)>;
pub type HighWaterCallback = Box<dyn FnMut(&Rc<Session>)>;
pub type DestroyCallback = Box<dyn FnOnce()>;

/// A connected TCP socket under the management of a `Cycle`.
///
/// Always lives behind an `Rc`: the event callback registered with the
/// owning cycle holds only a `Weak` reference, so a session that's been
/// dropped by its owner stops firing callbacks instead of leaking its fd
/// forever through the reactor.
pub struct Session {
    cycle: Cycle,
    self_weak: RefCell<Weak<Session>>,
    event_id: Cell<Option<EventId>>,
    socket: Socket,
    local_addr: HostAddress,
    peer_addr: HostAddress,
    name: String,
    state: Cell<SessionState>,
    reading: Cell<bool>,
    in_buffer: RefCell<Buffer>,
    out_buffer: RefCell<Buffer>,
    config: SessionConfig,
    connect_cb: RefCell<Option<ConnectCallback>>,
    read_cb: RefCell<Option<ReadCallback>>,
    write_cb: RefCell<Option<WriteCallback>>,
    high_water_cb: RefCell<Option<HighWaterCallback>>,
    destroy_cb: RefCell<Option<DestroyCallback>>,
    context: RefCell<Option<Box<dyn Any>>>,
}

impl Session {
    pub fn new(
        cycle: Cycle,
        socket: Socket,
        local_addr: HostAddress,
        peer_addr: HostAddress,
        name: impl Into<String>,
        config: SessionConfig,
    ) -> Rc<Session> {
        let session = Rc::new(Session {
            cycle,
            self_weak: RefCell::new(Weak::new()),
            event_id: Cell::new(None),
            socket,
            local_addr,
            peer_addr,
            name: name.into(),
            state: Cell::new(SessionState::Connecting),
            reading: Cell::new(false),
            in_buffer: RefCell::new(Buffer::with_config(crate::config::BufferConfig::default())),
            out_buffer: RefCell::new(Buffer::with_config(crate::config::BufferConfig::default())),
            config,
            connect_cb: RefCell::new(None),
            read_cb: RefCell::new(None),
            write_cb: RefCell::new(None),
            high_water_cb: RefCell::new(None),
            destroy_cb: RefCell::new(None),
            context: RefCell::new(None),
        });
        *session.self_weak.borrow_mut() = Rc::downgrade(&session);
        LIVE.with(|table| {
            table.borrow_mut().insert(session.socket.as_raw_fd(), Rc::downgrade(&session));
        });
        session.register_event();
        session
    }

    /// Looks up a still-live session on the calling thread by fd. Used by
    /// `SessionHandle` once its queued task actually runs on the owning
    /// cycle's thread.
    fn lookup(fd: RawFd) -> Option<Rc<Session>> {
        LIVE.with(|table| table.borrow().get(&fd).and_then(Weak::upgrade))
    }

    /// A cheap, `Send`-safe handle that can reach this session's `Append`/
    /// `Send` from any thread, not just the one the session lives on.
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            cycle: self.cycle.clone(),
            fd: self.socket.as_raw_fd(),
        }
    }

    fn register_event(&self) {
        debug_assert!(self.cycle.in_cycle_thread() || !self.cycle.is_running(), "session must be created on its cycle thread");
        let weak = self.self_weak.borrow().clone();
        let fd = self.socket.as_raw_fd();
        let id = self.cycle.add_event(
            fd,
            EventFlags::persist(),
            0,
            Box::new(move |id, flags, now| {
                if let Some(session) = weak.upgrade() {
                    session.handle_event(id, flags, now);
                }
            }),
        );
        self.event_id.set(Some(id));
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner_cycle(&self) -> &Cycle {
        &self.cycle
    }

    pub fn local_address(&self) -> HostAddress {
        self.local_addr
    }

    pub fn peer_address(&self) -> HostAddress {
        self.peer_addr
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn connected(&self) -> bool {
        self.state.get() == SessionState::Connected
    }

    pub fn set_context(&self, context: Box<dyn Any>) {
        *self.context.borrow_mut() = Some(context);
    }

    pub fn context(&self) -> std::cell::Ref<'_, Option<Box<dyn Any>>> {
        self.context.borrow()
    }

    pub fn set_connect_callback(&self, cb: ConnectCallback) {
        *self.connect_cb.borrow_mut() = Some(cb);
    }

    pub fn set_read_callback(&self, cb: ReadCallback) {
        *self.read_cb.borrow_mut() = Some(cb);
    }

    pub fn set_write_callback(&self, cb: WriteCallback) {
        *self.write_cb.borrow_mut() = Some(cb);
    }

    pub fn set_high_water_callback(&self, cb: HighWaterCallback) {
        *self.high_water_cb.borrow_mut() = Some(cb);
    }

    pub(crate) fn set_destroy_callback(&self, cb: DestroyCallback) {
        *self.destroy_cb.borrow_mut() = Some(cb);
    }

    fn id(&self) -> EventId {
        self.event_id.get().expect("session event was never registered")
    }

    /// Marks this (already-accepted, or already-connected) socket as
    /// established: fires the connect callback, ties the event to this
    /// session's lifetime, and starts reading.
    pub fn established(self: &Rc<Self>) {
        assert_eq!(self.state.get(), SessionState::Connecting, "session is not connecting");
        self.state.set(SessionState::Connected);
        if let Some(cb) = self.connect_cb.borrow_mut().as_mut() {
            cb(self, SessionEvent::Connected);
        } else {
            error!("no connect callback set on session[{}], connection established", self.name);
        }
        self.cycle.tie_event(self.id(), Rc::downgrade(self) as Weak<dyn Any>);
        self.start_read();
    }

    pub fn start_read(&self) {
        if !self.reading.get() {
            self.cycle.enable_read(self.id());
            self.reading.set(true);
        }
    }

    pub fn stop_read(&self) {
        if self.reading.get() {
            self.cycle.disable_read(self.id());
            self.reading.set(false);
        }
    }

    /// Half-closes the write side once any queued output drains. Returns an
    /// error if the session isn't connected, or is still draining writes
    /// (caller should wait for the write callback and retry).
    pub fn shutdown(&self) -> io::Result<()> {
        if self.state.get() != SessionState::Connected {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "session already disconnecting"));
        }
        self.state.set(SessionState::Disconnecting);
        if !self.out_buffer.borrow().is_empty() {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "still writing"));
        }
        self.socket.shutdown(std::net::Shutdown::Write)
    }

    pub fn force_close(self: &Rc<Self>) {
        let state = self.state.get();
        if state == SessionState::Connected || state == SessionState::Disconnecting {
            self.state.set(SessionState::Disconnecting);
            self.handle_close();
        }
    }

    /// Appends raw bytes to the outbound buffer and kicks off writing if
    /// nothing was queued before. Returns `false` if the session isn't
    /// connected.
    pub fn send(self: &Rc<Self>, bytes: &[u8]) -> bool {
        if self.state.get() != SessionState::Connected {
            return false;
        }
        let prior_len = {
            let mut out = self.out_buffer.borrow_mut();
            let prior_len = out.len();
            out.add(bytes);
            prior_len
        };
        self.after_enqueue(prior_len);
        true
    }

    /// Splices `buffer`'s block chain into the outbound buffer (O(blocks)
    /// instead of a byte copy), leaving `buffer` empty.
    pub fn append(self: &Rc<Self>, buffer: &mut Buffer) -> bool {
        if self.state.get() != SessionState::Connected {
            return false;
        }
        let prior_len = {
            let mut out = self.out_buffer.borrow_mut();
            let prior_len = out.len();
            out.append(buffer);
            prior_len
        };
        self.after_enqueue(prior_len);
        true
    }

    fn after_enqueue(self: &Rc<Self>, prior_len: usize) {
        let weak = self.self_weak.borrow().clone();
        if prior_len == 0 {
            self.cycle.queue_local(move || {
                if let Some(session) = weak.upgrade() {
                    session.cycle.enable_write(session.id());
                    session.handle_write();
                }
            });
        } else if prior_len > self.config.high_water_mark {
            self.cycle.queue_local(move || {
                if let Some(session) = weak.upgrade() {
                    if let Some(cb) = session.high_water_cb.borrow_mut().as_mut() {
                        cb(&session);
                    }
                }
            });
        }
    }

    fn handle_event(self: &Rc<Self>, _id: EventId, flags: EventFlags, now: Instant) {
        trace!("session[{}] fd {} revents: {:?}", self.name, self.socket.as_raw_fd(), flags);
        if flags.is_readable() {
            self.handle_read(now);
        }
        if flags.is_writable() {
            self.handle_write();
        }
        if flags.is_closed() {
            self.handle_close();
        }
    }

    fn handle_read(self: &Rc<Self>, now: Instant) {
        let result = self
            .in_buffer
            .borrow_mut()
            .read_from(&self.socket, self.config.max_read_bytes);
        match result {
            Ok(0) => self.handle_close(),
            Ok(n) if n > 0 => {
                if let Some(cb) = self.read_cb.borrow_mut().as_mut() {
                    cb(self, &mut self.in_buffer.borrow_mut(), now);
                } else {
                    error!("no read callback set on session[{}]", self.name);
                }
            }
            Ok(_) => {}
            Err(_) => self.handle_error(),
        }
    }

    fn handle_write(self: &Rc<Self>) {
        if !self.event_writing() {
            trace!("session[{}] is down, no more writing", self.name);
            return;
        }

        let write_result = self.out_buffer.borrow_mut().write_to(&self.socket, -1);
        match write_result {
            Ok(n) if n >= 0 => {
                if self.out_buffer.borrow().is_empty() {
                    self.cycle.disable_write(self.id());
                    if let Some(cb) = self.write_cb.borrow_mut().as_mut() {
                        cb(self);
                    }
                }
                if self.state.get() == SessionState::Disconnecting {
                    let _ = self.shutdown();
                }
            }
            _ => {
                error!(
                    "an error occurred while writing session[{}]: {:?}",
                    self.name,
                    self.socket.take_error()
                );
            }
        }
    }

    fn handle_close(self: &Rc<Self>) {
        let state = self.state.get();
        debug_assert!(
            state == SessionState::Connected || state == SessionState::Disconnecting,
            "handle_close on session in state {:?}",
            state
        );
        trace!("session[{}] closing, state = {:?}", self.name, state);
        self.state.set(SessionState::Disconnected);
        self.cycle.disable_read(self.id());
        self.cycle.disable_write(self.id());
        if let Some(cb) = self.connect_cb.borrow_mut().as_mut() {
            cb(self, SessionEvent::Closed);
        } else {
            error!("no connect callback set on session[{}], session is closed", self.name);
        }
        self.cycle.deactivate(self.id());
        LIVE.with(|table| {
            table.borrow_mut().remove(&self.socket.as_raw_fd());
        });
        if let Some(destroy) = self.destroy_cb.borrow_mut().take() {
            destroy();
        }
    }

    fn handle_error(self: &Rc<Self>) {
        if let Some(cb) = self.connect_cb.borrow_mut().as_mut() {
            cb(self, SessionEvent::Error);
        } else {
            error!(
                "error on session[{}]: {:?}",
                self.name,
                self.socket.take_error()
            );
        }
    }

    fn event_writing(&self) -> bool {
        // the cycle only tracks the active flag set through event_update;
        // writing is inferred from whether WRITE was last requested.
        self.cycle
            .event_flags(self.id())
            .is_some_and(|flags| flags.is_writable())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        trace!("session[{}] fd {} dropped", self.name, self.socket.as_raw_fd());
        LIVE.with(|table| {
            table.borrow_mut().remove(&self.socket.as_raw_fd());
        });
    }
}

/// A `Send`-safe handle to a session, usable from any thread, unlike
/// `Rc<Session>` itself.
///
/// `send`/`append` stage their bytes into a local buffer and queue the
/// splice onto the owning cycle via `Cycle::queue_in_cycle`, mirroring the
/// original's `Append`/`Send`, which unconditionally route through
/// `OwnerCycle()->QueueInCycle(...)` regardless of calling thread. The
/// splice itself still runs through `Session::send`/`append` once the
/// queued task executes on the session's own cycle thread, so a handle
/// outliving its session is harmless: the lookup by fd simply comes back
/// empty and the bytes are dropped.
#[derive(Clone)]
pub struct SessionHandle {
    cycle: Cycle,
    fd: RawFd,
}

impl SessionHandle {
    pub fn send(&self, bytes: Vec<u8>) {
        let fd = self.fd;
        self.cycle.queue_in_cycle(move || {
            if let Some(session) = Session::lookup(fd) {
                session.send(&bytes);
            }
        });
    }

    pub fn append(&self, mut buffer: Buffer) {
        let fd = self.fd;
        self.cycle.queue_in_cycle(move || {
            if let Some(session) = Session::lookup(fd) {
                session.append(&mut buffer);
            }
        });
    }
}
