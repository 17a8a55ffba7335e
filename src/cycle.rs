use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use crate::config::CycleConfig;
use crate::error::not_found;
use crate::event::{EventCallback, EventId, EventTable};
use crate::flags::EventFlags;
use crate::hook::{error, trace};
use crate::notifier::Notifier;
use crate::reactor::Reactor;
use crate::timer::TimerQueue;

type PendingTask = Box<dyn FnOnce() + Send>;

/// A one-shot synchronization point: `wait` blocks until `count_down` has
/// been called the number of times the latch was created with.
struct Latch {
    state: Mutex<u32>,
    condvar: Condvar,
}

impl Latch {
    fn new(count: u32) -> Latch {
        Latch {
            state: Mutex::new(count),
            condvar: Condvar::new(),
        }
    }

    fn count_down(&self) {
        let mut count = self.state.lock().unwrap();
        if *count > 0 {
            *count -= 1;
        }
        if *count == 0 {
            self.condvar.notify_all();
        }
    }

    fn wait(&self) {
        let mut count = self.state.lock().unwrap();
        while *count > 0 {
            count = self.condvar.wait(count).unwrap();
        }
    }
}

std::thread_local! {
    static RUNNING_CYCLE: Cell<bool> = const { Cell::new(false) };
    // Set for the lifetime of whichever `CycleInner` was constructed on this
    // thread, cleared when it's dropped. Distinct from `RUNNING_CYCLE`: this
    // one catches two cycles merely *existing* on the same thread, even if
    // neither has called `exec` yet; `RUNNING_CYCLE` catches a second,
    // foreign cycle's `exec` nesting into a thread that's already running a
    // different one.
    static HOSTED_CYCLE: Cell<bool> = const { Cell::new(false) };
}

struct CycleInner {
    reactor: RefCell<Reactor>,
    events: RefCell<EventTable>,
    timers: RefCell<TimerQueue>,
    pending: Mutex<VecDeque<PendingTask>>,
    // Same-thread-only counterpart to `pending`: deferred work that closes
    // over `Rc`-based session/acceptor state and so can never be `Send`.
    // Only ever pushed to and drained from the owning thread, so a plain
    // `RefCell` (not a `Mutex`) is enough.
    local_pending: RefCell<VecDeque<Box<dyn FnOnce()>>>,
    notifier: Notifier,
    notifier_id: Cell<Option<EventId>>,
    owner: Cell<Option<ThreadId>>,
    running: Cell<bool>,
    quit: Cell<bool>,
    epoch: Instant,
    config: CycleConfig,
}

// SAFETY: `reactor`, `events`, `timers`, `notifier_id`, `owner`, `running`
// and `quit` are only read or mutated from the single thread recorded in
// `owner` (enforced by `Cycle::exec`'s one-cycle-per-thread check). Every
// other thread reaches cycle state exclusively through `pending` (a
// `Mutex`) plus a blocking round trip onto the owning thread.
unsafe impl Sync for CycleInner {}

// SAFETY: registered event callbacks (in particular, session read/write
// handlers) routinely close over `Rc`/`RefCell` state and so are not
// `Send` themselves. That's fine: they are only ever invoked from the
// single thread recorded in `owner`. What needs to be `Send` is the
// `Arc<CycleInner>` handle, so a `Cycle` clone can be handed to another
// thread (stored in an I/O pool's worker table, captured by `Serve`) and
// used there only through `run_in_cycle`/`queue_in_cycle`, which never
// touch those closures directly from the calling thread.
unsafe impl Send for CycleInner {}

impl Drop for CycleInner {
    // Only correct if the thread that constructed this cycle is also the
    // one that drops its last `Arc` reference, same assumption the source
    // system makes (its destructor asserts `AssertInCycleThread`).
    fn drop(&mut self) {
        HOSTED_CYCLE.with(|flag| flag.set(false));
    }
}

/// A single-threaded reactor event loop.
///
/// `Cycle` is cheaply `Clone`-able — clones share the same underlying loop
/// through an `Arc`, the way the source system's shared_ptr<Cycle> handles
/// work. Exactly one OS thread may ever be inside `exec` for a given
/// `Cycle`, and a thread may not run two cycles concurrently.
#[derive(Clone)]
pub struct Cycle(Arc<CycleInner>);

impl Cycle {
    pub fn new() -> io::Result<Cycle> {
        Cycle::with_config(CycleConfig::default())
    }

    /// Builds a new cycle on the calling thread.
    ///
    /// Panics if this thread already hosts a cycle that hasn't been dropped
    /// yet: exactly one `Cycle` may exist per thread at a time, matching
    /// the source system's constructor-time `ThreadStoreData().cycle`
    /// check. A thread that wants to host more than one cycle over its
    /// lifetime (an I/O pool's worker threads, say) must drop the first
    /// before constructing the next, or simply never construct the second
    /// on that thread at all.
    pub fn with_config(config: CycleConfig) -> io::Result<Cycle> {
        HOSTED_CYCLE.with(|flag| {
            assert!(!flag.get(), "a thread may host only one cycle at a time");
        });

        let inner = CycleInner {
            reactor: RefCell::new(Reactor::new(config.reactor)?),
            events: RefCell::new(EventTable::new()),
            timers: RefCell::new(TimerQueue::new()),
            pending: Mutex::new(VecDeque::new()),
            local_pending: RefCell::new(VecDeque::new()),
            notifier: Notifier::new()?,
            notifier_id: Cell::new(None),
            owner: Cell::new(None),
            running: Cell::new(false),
            quit: Cell::new(false),
            epoch: Instant::now(),
            config,
        };

        HOSTED_CYCLE.with(|flag| flag.set(true));
        Ok(Cycle(Arc::new(inner)))
    }

    pub fn is_running(&self) -> bool {
        self.0.running.get()
    }

    pub fn in_cycle_thread(&self) -> bool {
        self.0.owner.get() == Some(std::thread::current().id())
    }

    /// Runs the loop on the calling thread until `exit` is called.
    ///
    /// Panics if this cycle is already running, or if the calling thread is
    /// already running a different cycle.
    pub fn exec(&self) {
        assert!(!self.0.running.get(), "cycle is already running");

        RUNNING_CYCLE.with(|flag| {
            assert!(!flag.get(), "a thread may run only one cycle at a time");
            flag.set(true);
        });

        self.0.owner.set(Some(std::thread::current().id()));
        self.0.running.set(true);
        self.0.quit.set(false);

        let notified = self.clone();
        let notifier_fd = self.0.notifier.as_raw_fd();
        let notifier_id = self.add_event(
            notifier_fd,
            EventFlags::read() | EventFlags::persist(),
            0,
            Box::new(move |_, _, _| {
                let _ = notified.0.notifier.clear();
            }),
        );
        self.0.notifier_id.set(Some(notifier_id));

        trace!("cycle started running");

        let mut active = Vec::with_capacity(self.0.config.initial_events_capacity);
        while !self.0.quit.get() {
            active.clear();
            let wait = self.wait_time();

            if let Err(e) = self.0.reactor.borrow_mut().poll(Some(wait), &mut active) {
                if e.kind() != io::ErrorKind::Interrupted {
                    error!("reactor poll failed: {}", e);
                }
                continue;
            }

            let now = Instant::now();
            for (id, flags) in active.drain(..) {
                self.dispatch(id, flags, now);
            }

            self.notify_timer(now);
            self.do_pending_functions();
        }

        if let Some(id) = self.0.notifier_id.take() {
            let _ = self.event_remove(id);
        }

        self.0.events.borrow_mut().clear();
        self.0.timers.borrow_mut().clear();
        self.0.pending.lock().unwrap().clear();
        self.0.running.set(false);
        self.0.owner.set(None);

        RUNNING_CYCLE.with(|flag| flag.set(false));

        trace!("cycle stopped running");
    }

    pub fn exit(&self) {
        self.0.quit.set(true);
        if !self.in_cycle_thread() {
            let _ = self.0.notifier.notify();
        }
    }

    pub fn run_in_cycle(&self, task: impl FnOnce() + Send + 'static) {
        if self.in_cycle_thread() {
            task();
        } else {
            self.queue_in_cycle(task);
        }
    }

    pub fn queue_in_cycle(&self, task: impl FnOnce() + Send + 'static) {
        self.0.pending.lock().unwrap().push_back(Box::new(task));
        if !self.in_cycle_thread() {
            let _ = self.0.notifier.notify();
        }
    }

    pub fn queue_size(&self) -> usize {
        self.0.pending.lock().unwrap().len()
    }

    /// Defers `task` to run later in this same iteration's pending-task
    /// drain. Unlike `queue_in_cycle`, `task` need not be `Send`: this is
    /// for deferring `Rc`-capturing work (a session re-entering its own
    /// write handler, a high-water callback) from within a call that's
    /// already running on the cycle thread, not for marshaling across an
    /// actual thread boundary.
    pub(crate) fn queue_local(&self, task: impl FnOnce() + 'static) {
        debug_assert!(self.in_cycle_thread(), "queue_local must run on the cycle's own thread");
        self.0.local_pending.borrow_mut().push_back(Box::new(task));
    }

    /// Schedules `task` to run once after `delay`. Returns `None` if the
    /// cycle isn't running. Must be called on the cycle's own thread, same
    /// as any other `Rc`-capturing registration (`Session`/`Acceptor`'s
    /// event setup): `task` is typically a closure over a `Weak<Session>`
    /// or similar, which rules out marshaling it across a real thread
    /// boundary the way `run_in_cycle`/`queue_in_cycle` do for plain data.
    pub fn run_after(&self, delay: Duration, task: impl FnMut() + 'static) -> Option<EventId> {
        self.schedule_timer(delay, false, task)
    }

    /// Schedules `task` to run every `interval`, starting after the first
    /// `interval` elapses. Returns `None` if the cycle isn't running. Same
    /// same-thread requirement as `run_after`.
    pub fn run_every(&self, interval: Duration, task: impl FnMut() + 'static) -> Option<EventId> {
        self.schedule_timer(interval, true, task)
    }

    fn schedule_timer(
        &self,
        delay: Duration,
        persist: bool,
        mut task: impl FnMut() + 'static,
    ) -> Option<EventId> {
        if !self.is_running() {
            return None;
        }
        debug_assert!(self.in_cycle_thread(), "timers must be scheduled on the cycle's own thread");

        let timeval = delay.as_micros() as i64;
        let mut flags = EventFlags::timeout();
        if persist {
            flags.insert(EventFlags::persist());
        }
        let callback: EventCallback = Box::new(move |_, _, _| task());
        Some(self.add_event(-1, flags, timeval, callback))
    }

    /// Removes the event with the given id. A no-op if it already fired or
    /// was never registered.
    pub fn cancel(&self, id: EventId) {
        if !self.is_running() {
            return;
        }
        self.run_sync(move |cycle| {
            let _ = cycle.event_remove(id);
        });
    }

    pub(crate) fn event_update(&self, id: EventId, flags: EventFlags) -> io::Result<()> {
        self.run_sync(move |cycle| cycle.do_event_update(id, flags))
    }

    pub(crate) fn event_remove(&self, id: EventId) -> io::Result<()> {
        self.run_sync(move |cycle| cycle.do_event_remove(id))
    }

    pub(crate) fn add_event(
        &self,
        fd: RawFd,
        mut flags: EventFlags,
        timeval: i64,
        callback: EventCallback,
    ) -> EventId {
        if flags.is_timeout() && flags.is_persist() {
            error!("event requested both TIMEOUT and PERSIST; clearing TIMEOUT");
            flags.remove(EventFlags::timeout());
        }

        let id = self.0.events.borrow_mut().insert(fd, flags, timeval, callback);

        // A negative fd always means a timer: registering it is never a
        // matter of the stored TIMEOUT bit, which a persisting timer no
        // longer carries once normalized above.
        if fd < 0 {
            let now = self.now_micros(Instant::now());
            self.0.timers.borrow_mut().push(now + timeval, id);
        } else if let Err(e) = self.0.reactor.borrow_mut().add(fd, id, flags) {
            error!("reactor add failed for fd {}: {}", fd, e);
        }

        id
    }

    /// Adds `EventFlags::read()` to `id`'s interest set, logging and
    /// no-oping if `id` isn't (or is no longer) registered.
    pub(crate) fn enable_read(&self, id: EventId) {
        self.toggle(id, EventFlags::read(), true);
    }

    pub(crate) fn disable_read(&self, id: EventId) {
        self.toggle(id, EventFlags::read(), false);
    }

    pub(crate) fn enable_write(&self, id: EventId) {
        self.toggle(id, EventFlags::write(), true);
    }

    pub(crate) fn disable_write(&self, id: EventId) {
        self.toggle(id, EventFlags::write(), false);
    }

    fn toggle(&self, id: EventId, flag: EventFlags, enable: bool) {
        let current = match self.0.events.borrow().get(id) {
            Some(slot) => slot.flags,
            None => {
                error!("event[{:?}] needs to be added to a cycle first", id);
                return;
            }
        };
        let mut flags = current;
        if enable {
            flags.insert(flag);
        } else {
            flags.remove(flag);
        }
        if let Err(e) = self.event_update(id, flags) {
            error!("event_update failed: {}", e);
        }
    }

    /// Current interest flags for `id`, or `None` if it isn't registered.
    pub(crate) fn event_flags(&self, id: EventId) -> Option<EventFlags> {
        self.0.events.borrow().get(id).map(|slot| slot.flags)
    }

    /// Requests removal of `id`.
    pub(crate) fn deactivate(&self, id: EventId) {
        if let Err(e) = self.event_remove(id) {
            error!("event_remove failed: {}", e);
        }
    }

    /// Ties `id`'s callback to `tie`'s lifetime: once `tie` has no strong
    /// references left, the callback stops firing (but the event itself is
    /// only actually removed the normal way).
    pub(crate) fn tie_event(&self, id: EventId, tie: std::rc::Weak<dyn std::any::Any>) {
        if let Some(slot) = self.0.events.borrow_mut().get_mut(id) {
            slot.tie = Some(tie);
        }
    }

    fn do_event_update(&self, id: EventId, flags: EventFlags) -> io::Result<()> {
        let fd = {
            let mut events = self.0.events.borrow_mut();
            match events.get_mut(id) {
                Some(slot) => {
                    slot.flags = flags;
                    slot.fd
                }
                None => return Err(not_found("event not registered on this cycle")),
            }
        };

        if fd >= 0 {
            self.0.reactor.borrow_mut().modify(fd, id, flags)?;
        }
        Ok(())
    }

    fn do_event_remove(&self, id: EventId) -> io::Result<()> {
        let slot = match self.0.events.borrow_mut().remove(id) {
            Some(slot) => slot,
            None => return Ok(()),
        };
        if slot.fd >= 0 {
            self.0.reactor.borrow_mut().delete(slot.fd)?;
        }
        Ok(())
    }

    fn dispatch(&self, id: EventId, flags: EventFlags, now: Instant) {
        let taken = {
            let mut events = self.0.events.borrow_mut();
            match events.get_mut(id) {
                Some(slot) => {
                    let alive = match &slot.tie {
                        Some(weak) => weak.upgrade().is_some(),
                        None => true,
                    };
                    let callback = std::mem::replace(&mut slot.callback, Box::new(|_, _, _| {}));
                    Some((callback, slot.flags.is_persist(), alive))
                }
                None => None,
            }
        };

        let (mut callback, persist, alive) = match taken {
            Some(v) => v,
            None => return,
        };

        if alive {
            callback(id, flags, now);
        }

        {
            let mut events = self.0.events.borrow_mut();
            if let Some(slot) = events.get_mut(id) {
                slot.callback = callback;
            }
        }

        if !persist {
            let _ = self.do_event_remove(id);
        }
    }

    fn notify_timer(&self, now: Instant) {
        let now_micros = self.now_micros(now);
        loop {
            let due = self.0.timers.borrow_mut().pop_due(now_micros);
            let id = match due {
                Some((_, id)) => id,
                None => break,
            };

            if !self.0.events.borrow().contains(id) {
                continue;
            }

            self.dispatch(id, EventFlags::timeout(), now);

            let reschedule = self.0.events.borrow().get(id).map(|slot| (slot.flags.is_persist(), slot.timeval));
            if let Some((true, timeval)) = reschedule {
                self.0.timers.borrow_mut().push(now_micros + timeval, id);
            }
        }
    }

    fn do_pending_functions(&self) {
        let tasks = {
            let mut pending = self.0.pending.lock().unwrap();
            std::mem::take(&mut *pending)
        };
        for task in tasks {
            task();
        }

        let local_tasks = std::mem::take(&mut *self.0.local_pending.borrow_mut());
        for task in local_tasks {
            task();
        }
    }

    fn wait_time(&self) -> Duration {
        let now = self.now_micros(Instant::now());
        self.0.timers.borrow().wait_time(now)
    }

    fn now_micros(&self, now: Instant) -> i64 {
        now.duration_since(self.0.epoch).as_micros() as i64
    }

    /// Runs `f` inline if already on the cycle thread, otherwise marshals
    /// it onto the cycle thread and blocks until it completes.
    fn run_sync<R: Send + 'static>(&self, f: impl FnOnce(&Cycle) -> R + Send + 'static) -> R {
        if self.in_cycle_thread() {
            f(self)
        } else {
            let latch = Arc::new(Latch::new(1));
            let result: Arc<Mutex<Option<R>>> = Arc::new(Mutex::new(None));
            let cycle = self.clone();
            let latch2 = Arc::clone(&latch);
            let result2 = Arc::clone(&result);

            self.queue_in_cycle(move || {
                let r = f(&cycle);
                *result2.lock().unwrap() = Some(r);
                latch2.count_down();
            });

            latch.wait();
            result.lock().unwrap().take().expect("run_sync task did not run")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;

    #[test]
    fn run_in_cycle_executes_immediately_when_not_running() {
        let cycle = Cycle::new().unwrap();
        let ran = StdArc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        // not running -> in_cycle_thread() is false (owner unset), so this
        // queues rather than runs inline; queue_in_cycle never panics.
        cycle.run_in_cycle(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(cycle.queue_size(), 1);
        let _ = ran;
    }

    #[test]
    fn exec_runs_queued_task_then_exits() {
        let cycle = Cycle::new().unwrap();
        let ran = StdArc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let exiter = cycle.clone();

        cycle.run_in_cycle(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
            exiter.exit();
        });

        cycle.exec();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(!cycle.is_running());
    }

    #[test]
    fn run_every_then_exit_stops_the_loop() {
        let cycle = Cycle::new().unwrap();
        let ticks = StdArc::new(AtomicUsize::new(0));
        let ticks2 = ticks.clone();
        let exiter = cycle.clone();

        cycle.run_in_cycle(move || {
            exiter.run_every(Duration::from_millis(5), move || {
                let n = ticks2.fetch_add(1, Ordering::SeqCst) + 1;
                if n >= 3 {
                    exiter.exit();
                }
            });
        });

        cycle.exec();
        assert!(ticks.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    #[should_panic(expected = "a thread may run only one cycle at a time")]
    fn nested_exec_of_a_foreign_cycle_on_the_same_thread_panics() {
        let outer = Cycle::new().unwrap();
        // Built on a throwaway thread so it never touches this thread's
        // hosted-cycle flag; only `outer`'s nested `exec` should trip here.
        let inner = std::thread::spawn(|| Cycle::new().unwrap()).join().unwrap();
        let inner_clone = inner.clone();
        let outer_exit = outer.clone();

        outer.run_in_cycle(move || {
            inner_clone.exec();
            outer_exit.exit();
        });

        outer.exec();
    }

    #[test]
    #[should_panic(expected = "a thread may host only one cycle at a time")]
    fn second_cycle_construction_on_same_thread_panics() {
        let _outer = Cycle::new().unwrap();
        let _inner = Cycle::new().unwrap();
    }

    #[test]
    fn cycle_construction_succeeds_again_after_the_first_is_dropped() {
        {
            let _first = Cycle::new().unwrap();
        }
        let _second = Cycle::new().unwrap();
    }
}
