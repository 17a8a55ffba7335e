//! S1 — a client connects to a Serve, sends a line, the session echoes it
//! back verbatim, and both sides see a clean connect/close with no errors.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cycle_io::{Acceptor, Cycle, Serve};

#[test]
fn echo_round_trip_with_one_connect_and_one_close() {
    let probe = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);

    let cycle = Cycle::new().unwrap();
    let serve = Serve::new(cycle.clone(), "s1-echo");

    let connects = Arc::new(AtomicUsize::new(0));
    let closes = Arc::new(AtomicUsize::new(0));
    let errors = Arc::new(AtomicUsize::new(0));
    let (c1, c2, c3) = (connects.clone(), closes.clone(), errors.clone());

    serve.set_new_session_callback(move |session| {
        let (c1, c2, c3) = (c1.clone(), c2.clone(), c3.clone());
        session.set_connect_callback(Box::new(move |_session, event| {
            use cycle_io::SessionEvent::*;
            match event {
                Connected => {
                    c1.fetch_add(1, Ordering::SeqCst);
                }
                Closed => {
                    c2.fetch_add(1, Ordering::SeqCst);
                }
                Error => {
                    c3.fetch_add(1, Ordering::SeqCst);
                }
            }
        }));
        session.set_read_callback(Box::new(|session, buf, _now| {
            let mut bytes = vec![0u8; buf.len()];
            buf.remove(&mut bytes);
            session.send(&bytes);
        }));
    });

    let acceptor = Acceptor::new(cycle.clone(), addr.port(), false, true);
    serve.add_acceptor(acceptor, 128).unwrap();

    // `Serve`/`Session` are `Rc`-based and only ever run on the accept
    // cycle's own thread, so the blocking `exec` call stays on this (the
    // test's main) thread; the TCP client runs on a second thread instead.
    let exit_cycle = cycle.clone();
    let client = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));

        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        stream.write_all(b"hello\n").unwrap();

        let mut response = [0u8; 6];
        stream.read_exact(&mut response).unwrap();
        assert_eq!(&response, b"hello\n");

        drop(stream);
        thread::sleep(Duration::from_millis(100));
        exit_cycle.exit();
    });

    serve.exec(2).unwrap();
    client.join().unwrap();

    assert_eq!(connects.load(Ordering::SeqCst), 1);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert_eq!(errors.load(Ordering::SeqCst), 0);
}
