//! S3 — a session queues well past `high_water_mark` while its peer never
//! reads; the high-water callback fires once the crossing is observed.

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cycle_io::{Acceptor, Cycle, Serve, SessionConfig};

#[test]
fn high_water_callback_fires_once_queued_bytes_cross_the_mark() {
    let probe = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);

    let cycle = Cycle::new().unwrap();
    let serve = Serve::new(cycle.clone(), "s3-highwater");
    serve.set_session_config(SessionConfig {
        high_water_mark: 1024 * 1024,
        ..SessionConfig::default()
    });

    let fired = Arc::new(AtomicBool::new(false));
    let fired2 = fired.clone();

    serve.set_new_session_callback(move |session| {
        let fired3 = fired2.clone();
        session.set_high_water_callback(Box::new(move |_session| {
            fired3.store(true, Ordering::SeqCst);
        }));

        // A peer that never reads means the kernel send buffer fills fast;
        // several chunks are queued so at least one lands after the
        // previous enqueue already pushed `out_buffer` past the mark.
        let chunk = vec![0xABu8; 512 * 1024];
        for _ in 0..6 {
            session.send(&chunk);
        }
    });

    let acceptor = Acceptor::new(cycle.clone(), addr.port(), false, true);
    serve.add_acceptor(acceptor, 128).unwrap();

    let exit_cycle = cycle.clone();
    let client = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));

        // Connect but never read: let the OS socket buffers and our own
        // out_buffer do the backing up.
        let stream = TcpStream::connect(addr).unwrap();
        thread::sleep(Duration::from_millis(300));

        assert!(fired.load(Ordering::SeqCst), "high water callback never fired");

        drop(stream);
        thread::sleep(Duration::from_millis(50));
        exit_cycle.exit();
    });

    serve.exec(1).unwrap();
    client.join().unwrap();
}
