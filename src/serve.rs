//! Accepts connections on one cycle and hands each established session off
//! to a worker cycle drawn from an `IoPool`.

use std::cell::{Cell, RefCell};
use std::io;
use std::os::unix::io::AsRawFd;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use crate::acceptor::Acceptor;
use crate::config::{CycleConfig, SessionConfig};
use crate::cycle::Cycle;
use crate::hook::{error, trace};
use crate::host_address::HostAddress;
use crate::io_pool::IoPool;
use crate::session::Session;
use crate::sys::socket::Socket;

/// Fires once per established session, on whichever worker thread ends up
/// owning it. `Send + Sync` because the same callback instance runs across
/// every worker in the pool; app state it touches needs to be shareable
/// across threads itself (an `Arc<Mutex<_>>`, a channel sender, and so on).
pub type NewSessionCallback = dyn Fn(&Rc<Session>) + Send + Sync;

/// The listening side of the runtime: one accept cycle plus a pool of
/// worker cycles that own the resulting sessions.
///
/// `add_acceptor`/`exec` are meant to be called from the same thread,
/// before the accept cycle starts running — mirroring how `Acceptor` and
/// `Session` assume same-thread registration rather than marshaling
/// `Rc`-based state across a `Send` boundary.
pub struct Serve {
    cycle: Cycle,
    name: String,
    worker_config: Cell<CycleConfig>,
    session_config: Cell<SessionConfig>,
    io_pool: RefCell<IoPool>,
    acceptors: RefCell<Vec<Rc<Acceptor>>>,
    self_weak: RefCell<Weak<Serve>>,
    next_session_id: Cell<u64>,
    new_session_cb: RefCell<Option<Arc<NewSessionCallback>>>,
    started: Cell<bool>,
}

impl Serve {
    pub fn new(cycle: Cycle, name: impl Into<String>) -> Rc<Serve> {
        let name = name.into();
        let serve = Rc::new(Serve {
            cycle,
            io_pool: RefCell::new(IoPool::new(format!("{}_WORKER", name))),
            name,
            worker_config: Cell::new(CycleConfig::default()),
            session_config: Cell::new(SessionConfig::default()),
            acceptors: RefCell::new(Vec::new()),
            self_weak: RefCell::new(Weak::new()),
            next_session_id: Cell::new(0),
            new_session_cb: RefCell::new(None),
            started: Cell::new(false),
        });
        *serve.self_weak.borrow_mut() = Rc::downgrade(&serve);
        serve
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.started.get()
    }

    pub fn set_worker_config(&self, config: CycleConfig) {
        debug_assert!(!self.started.get(), "worker config must be set before exec");
        self.worker_config.set(config);
    }

    pub fn set_session_config(&self, config: SessionConfig) {
        debug_assert!(!self.started.get(), "session config must be set before exec");
        self.session_config.set(config);
    }

    pub fn set_new_session_callback<F>(&self, cb: F)
    where
        F: Fn(&Rc<Session>) + Send + Sync + 'static,
    {
        *self.new_session_cb.borrow_mut() = Some(Arc::new(cb));
    }

    /// Registers `acceptor` on the accept cycle and starts it listening.
    /// Must run on the accept cycle's own thread, same as `Acceptor::listen`.
    pub fn add_acceptor(self: &Rc<Self>, acceptor: Rc<Acceptor>, backlog: libc::c_int) -> io::Result<()> {
        debug_assert!(self.cycle.in_cycle_thread() || !self.cycle.is_running(), "add_acceptor must run on the accept cycle's thread");

        let weak_serve = self.self_weak.borrow().clone();
        acceptor.set_new_session_callback(Box::new(move |socket, peer_addr, local_addr| {
            if let Some(serve) = weak_serve.upgrade() {
                serve.new_session(socket, peer_addr, local_addr);
            }
        }));

        if let Err(e) = acceptor.listen(backlog) {
            error!("acceptor[port={}] on serve[{}] cannot listen: {}", acceptor.port(), self.name, e);
            return Err(e);
        }

        trace!("add acceptor[port={}] to serve[{}]", acceptor.port(), self.name);
        self.acceptors.borrow_mut().push(acceptor);
        Ok(())
    }

    /// Picks a worker cycle, hands it the accepted socket, and constructs
    /// the session there so the `Rc<Session>` never has to cross threads.
    fn new_session(self: &Rc<Self>, socket: Socket, peer_addr: HostAddress, local_addr: HostAddress) {
        if !self.started.get() {
            error!("serve[{}] got a connection before exec() started it", self.name);
            return;
        }

        let worker_cycle = self
            .io_pool
            .borrow()
            .get_next()
            .unwrap_or_else(|| self.cycle.clone());
        let session_cycle = worker_cycle.clone();

        let session_id = self.next_session_id.get();
        self.next_session_id.set(session_id + 1);
        let name = format!("{}-{}#{}", self.name, local_addr.to_ip_port(), session_id);
        let config = self.session_config.get();
        let cb = self.new_session_cb.borrow().clone();

        trace!(
            "new session[{}] in serve[{}] from {}",
            name, self.name, peer_addr
        );

        worker_cycle.run_in_cycle(move || {
            let fd = socket.as_raw_fd();
            let session = Session::new(session_cycle, socket, local_addr, peer_addr, name, config);

            session.set_destroy_callback(Box::new(move || {
                IoPool::unregister_session(fd);
            }));
            IoPool::register_session(fd, session.clone());

            if let Some(cb) = cb.as_ref() {
                cb(&session);
            }
            session.established();
        });
    }

    /// Starts the worker pool, then runs the accept cycle to completion.
    /// Blocks until `exit` is called (from any thread).
    pub fn exec(self: &Rc<Self>, thread_count: usize) -> io::Result<()> {
        let ok = self
            .io_pool
            .borrow_mut()
            .start(self.worker_config.get(), thread_count);
        if !ok {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("serve[{}] failed to start its io pool", self.name),
            ));
        }

        self.started.set(true);
        trace!("serve[{}] running with {} worker(s)", self.name, thread_count);
        self.cycle.exec();
        self.started.set(false);

        trace!("serve[{}] cleaning up", self.name);
        self.io_pool.borrow_mut().stop();
        self.acceptors.borrow_mut().clear();

        Ok(())
    }

    pub fn exit(&self) {
        self.cycle.exit();
    }
}

impl Drop for Serve {
    fn drop(&mut self) {
        debug_assert!(!self.started.get(), "serve[{}] dropped while still running", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn exec_without_acceptors_runs_and_exits_cleanly() {
        let cycle = Cycle::new().unwrap();
        let serve = Serve::new(cycle.clone(), "test-serve");
        assert_eq!(serve.name(), "test-serve");
        assert!(!serve.is_running());

        let exit_cycle = cycle.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            exit_cycle.exit();
        });

        serve.exec(2).unwrap();
        handle.join().unwrap();
        assert!(!serve.is_running());
    }

    #[test]
    fn new_session_callback_can_be_replaced() {
        let cycle = Cycle::new().unwrap();
        let serve = Serve::new(cycle, "cb-serve");
        assert!(serve.new_session_cb.borrow().is_none());
        serve.set_new_session_callback(|_session| {});
        assert!(serve.new_session_cb.borrow().is_some());
    }
}
