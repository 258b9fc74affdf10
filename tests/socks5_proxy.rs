//! S7 — SOCKS5 TCP proxy backpressure and byte conservation (spec §8).

mod util;

use std::io::{Read, Write};
use std::net::TcpStream as StdTcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use netreactor::socket::socks5::Socks5Server;
use netreactor::Reactor;

const PAYLOAD_LEN: usize = 4 * 1024 * 1024;

#[test]
fn proxy_never_drops_bytes_under_backpressure() {
    util::init();

    // A deliberately slow consumer: small reads with a short sleep between
    // them, so the proxy's destination side backs up and exercises
    // `is_write_blocked`/`ready_to_send` retry, not just a single send.
    let sink = std::net::TcpListener::bind(util::any_loopback()).expect("bind sink");
    let sink_addr = sink.local_addr().unwrap();
    let received = Arc::new(std::sync::Mutex::new(Vec::with_capacity(PAYLOAD_LEN)));
    let received2 = received.clone();
    thread::spawn(move || {
        let (mut stream, _peer) = sink.accept().expect("accept sink connection");
        let mut buf = [0u8; 2048];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    received2.lock().unwrap().extend_from_slice(&buf[..n]);
                    thread::sleep(Duration::from_micros(200));
                }
                Err(e) => panic!("sink read error: {e}"),
            }
        }
    });

    let mut reactor = Reactor::new().expect("reactor");
    let socks = Socks5Server::bind(&mut reactor, util::any_loopback(), 16).expect("bind socks5");
    let socks_addr = socks.borrow().local_addr().expect("socks addr");

    let sent_len = Arc::new(AtomicBool::new(false));
    let done = sent_len.clone();
    thread::spawn(move || {
        let mut stream = StdTcpStream::connect(socks_addr).expect("connect to socks5");
        stream.write_all(&[0x05, 0x01, 0x00]).unwrap();
        let mut greet_reply = [0u8; 2];
        stream.read_exact(&mut greet_reply).unwrap();

        let std::net::IpAddr::V4(v4) = sink_addr.ip() else { panic!("expected ipv4 loopback") };
        let mut req = vec![0x05, 0x01, 0x00, 0x01];
        req.extend_from_slice(&v4.octets());
        req.extend_from_slice(&sink_addr.port().to_be_bytes());
        stream.write_all(&req).unwrap();
        let mut connect_reply = [0u8; 10];
        stream.read_exact(&mut connect_reply).unwrap();
        assert_eq!(connect_reply[1], 0x00, "expected socks5 success reply");

        let payload: Vec<u8> = (0..PAYLOAD_LEN).map(|i| (i % 251) as u8).collect();
        stream.write_all(&payload).expect("write payload");
        stream.shutdown(std::net::Shutdown::Write).unwrap();
        done.store(true, Ordering::SeqCst);
    });

    util::run_until(&mut reactor, Duration::from_secs(30), || {
        sent_len.load(Ordering::SeqCst) && received.lock().unwrap().len() >= PAYLOAD_LEN
    });

    let received = received.lock().unwrap();
    assert_eq!(received.len(), PAYLOAD_LEN);
    let expected: Vec<u8> = (0..PAYLOAD_LEN).map(|i| (i % 251) as u8).collect();
    assert_eq!(*received, expected, "every byte must arrive, in order, exactly once");
}
