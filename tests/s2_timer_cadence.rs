//! S2 — `run_every` fires roughly every 50 ms for 500 ms, then `cancel`
//! stops further invocations.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use cycle_io::{Cycle, EventId};

#[test]
fn run_every_fires_roughly_ten_times_then_cancel_stops_it() {
    let cycle = Cycle::new().unwrap();
    let count = Arc::new(AtomicU32::new(0));
    let timer_id: Arc<Mutex<Option<EventId>>> = Arc::new(Mutex::new(None));

    let setup_cycle = cycle.clone();
    let setup_count = count.clone();
    let setup_id = timer_id.clone();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        let schedule_count = setup_count.clone();
        let schedule_id = setup_id.clone();
        let cycle_for_timer = setup_cycle.clone();
        setup_cycle.run_in_cycle(move || {
            let id = cycle_for_timer.run_every(Duration::from_micros(50_000), move || {
                schedule_count.fetch_add(1, Ordering::SeqCst);
            });
            *schedule_id.lock().unwrap() = id;
        });
    });

    let cancel_cycle = cycle.clone();
    let cancel_id = timer_id.clone();
    let cancel_count = count.clone();
    let exit_cycle = cycle.clone();
    let count_at_cancel: Arc<Mutex<Option<u32>>> = Arc::new(Mutex::new(None));
    let after_cancel_slot = count_at_cancel.clone();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(520));
        if let Some(id) = *cancel_id.lock().unwrap() {
            cancel_cycle.cancel(id);
        }
        *after_cancel_slot.lock().unwrap() = Some(cancel_count.load(Ordering::SeqCst));

        thread::sleep(Duration::from_millis(150));
        exit_cycle.exit();
    });

    cycle.exec();

    let fired = count.load(Ordering::SeqCst);
    assert!(
        (8..=11).contains(&fired),
        "expected roughly 9-10 invocations in 500ms, got {}",
        fired
    );

    let at_cancel = count_at_cancel.lock().unwrap().unwrap();
    assert_eq!(fired, at_cancel, "no further invocations should fire after cancel");
}
