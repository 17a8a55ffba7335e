//! A fixed pool of worker cycles, each running on its own thread, across
//! which `Serve` distributes accepted connections.
//!
//! Each worker's session table lives in thread-local storage rather than as
//! a field on `PoolWorker`: a `Rc<Session>` can't cross into a worker's
//! `thread::spawn` closure (`Rc` isn't `Send`), so the table has to be
//! created on the worker thread itself. Keying it by OS thread, rather than
//! threading a handle through, keeps `IoPool` ignorant of what a session
//! even is beyond its file descriptor.

use std::cell::RefCell;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use crate::config::CycleConfig;
use crate::cycle::Cycle;
use crate::hook::{error, trace};
use crate::session::Session;

thread_local! {
    static SESSIONS: RefCell<HashMap<RawFd, Rc<Session>>> = RefCell::new(HashMap::new());
}

struct PoolWorker {
    cycle: Cycle,
    thread: Option<JoinHandle<()>>,
}

/// Owns `thread_count` `Cycle`s, each driven by its own OS thread via
/// `exec`. `get_next`/`get_by_hash` hand out cheap `Cycle` clones; callers
/// reach worker-owned state only through `run_in_cycle`/`queue_in_cycle`.
pub struct IoPool {
    name: String,
    workers: Vec<PoolWorker>,
    next: std::cell::Cell<usize>,
}

impl IoPool {
    pub fn new(name: impl Into<String>) -> IoPool {
        IoPool {
            name: name.into(),
            workers: Vec::new(),
            next: std::cell::Cell::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        !self.workers.is_empty()
    }

    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    /// Spawns `thread_count` worker threads, each constructing and running
    /// its own `Cycle` to completion. Returns `false` (no-op) if already
    /// running or `thread_count == 0`.
    ///
    /// Each `Cycle` is built on the worker thread itself, not handed off
    /// from the caller's: a `Cycle` ties itself to whichever thread
    /// constructs it, so constructing all of them up front on the calling
    /// thread would trip that thread's one-cycle-per-thread check on the
    /// second worker.
    pub fn start(&mut self, config: CycleConfig, thread_count: usize) -> bool {
        if thread_count == 0 || self.is_running() {
            return false;
        }

        trace!("starting io pool[{}] with {} threads", self.name, thread_count);

        for i in 0..thread_count {
            let (tx, rx) = mpsc::channel::<Cycle>();
            let thread_name = format!("{}-{}", self.name, i);
            let pool_name = self.name.clone();
            let handle = thread::Builder::new()
                .name(thread_name)
                .spawn(move || {
                    let cycle = match Cycle::with_config(config) {
                        Ok(cycle) => cycle,
                        Err(e) => {
                            error!("io pool[{}] failed to create worker {} cycle: {}", pool_name, i, e);
                            return;
                        }
                    };
                    if tx.send(cycle.clone()).is_err() {
                        return;
                    }
                    cycle.exec();
                })
                .expect("failed to spawn io pool worker thread");

            match rx.recv() {
                Ok(cycle) => self.workers.push(PoolWorker {
                    cycle,
                    thread: Some(handle),
                }),
                Err(_) => {
                    let _ = handle.join();
                }
            }
        }

        self.next.set(0);
        true
    }

    /// Force-closes every session still open on each worker, then asks the
    /// worker cycles to exit and joins their threads.
    pub fn stop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        trace!("stopping io pool[{}]", self.name);
        for worker in &self.workers {
            let cycle = worker.cycle.clone();
            worker.cycle.run_in_cycle(move || {
                SESSIONS.with(|table| {
                    for (_, session) in table.borrow_mut().drain() {
                        session.force_close();
                    }
                });
                cycle.exit();
            });
        }
        for worker in &mut self.workers {
            if let Some(handle) = worker.thread.take() {
                let _ = handle.join();
            }
        }
        self.workers.clear();
    }

    /// Registers `session` in the session table of whichever thread calls
    /// this. Only meaningful called from inside a worker's own cycle.
    pub(crate) fn register_session(fd: RawFd, session: Rc<Session>) {
        SESSIONS.with(|table| {
            table.borrow_mut().insert(fd, session);
        });
    }

    /// Removes and returns a previously registered session, if any.
    pub(crate) fn unregister_session(fd: RawFd) -> Option<Rc<Session>> {
        SESSIONS.with(|table| table.borrow_mut().remove(&fd))
    }

    /// Round-robin worker selection.
    pub fn get_next(&self) -> Option<Cycle> {
        if self.workers.is_empty() {
            return None;
        }
        let index = self.next.get();
        self.next.set((index + 1) % self.workers.len());
        Some(self.workers[index].cycle.clone())
    }

    /// Same hash always maps to the same worker.
    pub fn get_by_hash(&self, hash_code: u64) -> Option<Cycle> {
        if self.workers.is_empty() {
            return None;
        }
        Some(self.workers[(hash_code as usize) % self.workers.len()].cycle.clone())
    }
}

impl Drop for IoPool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_twice_is_a_no_op() {
        let mut pool = IoPool::new("test-pool");
        assert!(pool.start(CycleConfig::default(), 3));
        assert_eq!(pool.thread_count(), 3);
        assert!(!pool.start(CycleConfig::default(), 2));
        assert_eq!(pool.thread_count(), 3);

        pool.stop();
        assert!(!pool.is_running());
    }

    #[test]
    fn get_by_hash_is_stable_for_the_same_key() {
        let mut pool = IoPool::new("hash-pool");
        pool.start(CycleConfig::default(), 4);
        let first = pool.get_by_hash(7);
        let second = pool.get_by_hash(7);
        assert!(!first.unwrap().in_cycle_thread());
        assert!(!second.unwrap().in_cycle_thread());
        pool.stop();
    }

    #[test]
    fn not_running_returns_none() {
        let pool = IoPool::new("idle-pool");
        assert!(pool.get_next().is_none());
        assert!(pool.get_by_hash(42).is_none());
    }
}
