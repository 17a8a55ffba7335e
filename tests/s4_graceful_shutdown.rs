//! S4 — calling `shutdown` while a session still has pending output moves
//! it to `Disconnecting` immediately; the queued bytes still drain to the
//! peer, and the session eventually reports `Closed`.

use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use cycle_io::{Acceptor, Cycle, Serve, SessionEvent, SessionState};

const PAYLOAD_LEN: usize = 512 * 1024;

#[test]
fn shutdown_drains_pending_output_before_closing() {
    let probe = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);

    let cycle = Cycle::new().unwrap();
    let serve = Serve::new(cycle.clone(), "s4-shutdown");

    let state_after_shutdown: Arc<Mutex<Option<SessionState>>> = Arc::new(Mutex::new(None));
    let closed = Arc::new(AtomicBool::new(false));
    let (state_slot, closed2) = (state_after_shutdown.clone(), closed.clone());

    serve.set_new_session_callback(move |session| {
        let closed3 = closed2.clone();
        session.set_connect_callback(Box::new(move |_session, event| {
            if event == SessionEvent::Closed {
                closed3.store(true, Ordering::SeqCst);
            }
        }));

        let payload = vec![0x5Au8; PAYLOAD_LEN];
        session.send(&payload);

        // The write triggered by `send` is deferred to the next pending-task
        // drain, so `out_buffer` is still non-empty here: `shutdown` must
        // move to `Disconnecting` without waiting for the drain to finish.
        let _ = session.shutdown();
        *state_slot.lock().unwrap() = Some(session.state());
    });

    let acceptor = Acceptor::new(cycle.clone(), addr.port(), false, true);
    serve.add_acceptor(acceptor, 128).unwrap();

    let exit_cycle = cycle.clone();
    let client = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));

        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        let mut received = Vec::with_capacity(PAYLOAD_LEN);
        let mut buf = [0u8; 8192];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(e) => panic!("read failed before EOF: {}", e),
            }
        }
        assert_eq!(received.len(), PAYLOAD_LEN);
        drop(stream);

        thread::sleep(Duration::from_millis(100));

        assert_eq!(*state_after_shutdown.lock().unwrap(), Some(SessionState::Disconnecting));
        assert!(closed.load(Ordering::SeqCst), "session never reported Closed");

        exit_cycle.exit();
    });

    serve.exec(1).unwrap();
    client.join().unwrap();
}
