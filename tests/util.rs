// Not all functions are used by every test binary.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Once;
use std::time::{Duration, Instant};

use netreactor::Reactor;

pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::try_init();
    })
}

pub fn loopback(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().unwrap()
}

pub fn any_loopback() -> SocketAddr {
    loopback(0)
}

/// Drives `reactor` with `run_once` until `done()` returns `true` or
/// `timeout` elapses, then asserts it finished for the right reason.
pub fn run_until(reactor: &mut Reactor, timeout: Duration, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !done() {
        assert!(Instant::now() < deadline, "condition not met within {timeout:?}");
        reactor.run_once().expect("reactor tick");
    }
}
