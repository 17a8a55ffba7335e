//! S6 — 1000 tasks enqueued from one thread onto a cycle running on
//! another execute on the cycle's thread, in submission order.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use cycle_io::Cycle;

const TASK_COUNT: usize = 1000;

#[test]
fn queue_in_cycle_preserves_submission_order_across_threads() {
    let cycle = Cycle::new().unwrap();
    let observed_thread: Arc<Mutex<Option<thread::ThreadId>>> = Arc::new(Mutex::new(None));
    let order: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::with_capacity(TASK_COUNT)));

    let runner_cycle = cycle.clone();
    let runner_order = order.clone();
    let runner_thread = observed_thread.clone();
    let handle = thread::spawn(move || {
        for i in 0..TASK_COUNT {
            let order2 = runner_order.clone();
            let thread_slot = runner_thread.clone();
            runner_cycle.queue_in_cycle(move || {
                *thread_slot.lock().unwrap() = Some(thread::current().id());
                order2.lock().unwrap().push(i);
            });
        }

        // Give the cycle thread time to drain all 1000 before exiting.
        thread::sleep(Duration::from_millis(300));
        runner_cycle.exit();
    });

    let cycle_thread_id = thread::current().id();
    cycle.exec();
    handle.join().unwrap();

    let recorded = order.lock().unwrap();
    assert_eq!(recorded.len(), TASK_COUNT);
    assert!(recorded.iter().enumerate().all(|(i, &v)| i == v));

    let seen_thread = observed_thread.lock().unwrap().unwrap();
    assert_eq!(seen_thread, cycle_thread_id);
}
