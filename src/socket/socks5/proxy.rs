//! Bidirectional TCP byte pump (spec §4.6).

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;

use crate::reactor::Reactor;
use crate::socket::tcp::TcpSocket;
use crate::socket::{SendOutcome, Socket};

/// Forwards bytes between two already-connected [`TcpSocket`]s. Byte
/// counters are exposed for observability, never consulted for
/// correctness.
pub struct TcpProxy {
    client: Rc<RefCell<TcpSocket>>,
    remote: Rc<RefCell<TcpSocket>>,
    bytes_forwarded: [u64; 2],
}

impl TcpProxy {
    pub fn new(client: Rc<RefCell<TcpSocket>>, remote: Rc<RefCell<TcpSocket>>) -> Self {
        TcpProxy {
            client,
            remote,
            bytes_forwarded: [0, 0],
        }
    }

    pub fn bytes_forwarded(&self) -> [u64; 2] {
        self.bytes_forwarded
    }

    /// Pumps data newly arrived on `source` toward the other endpoint.
    /// Returns `false` on a hard error; the caller should tear both
    /// sockets down in that case.
    pub fn forward_from(&mut self, reactor: &mut Reactor, source: &Rc<RefCell<TcpSocket>>) -> bool {
        if Rc::ptr_eq(source, &self.client) {
            self.pump(reactor, 0)
        } else if Rc::ptr_eq(source, &self.remote) {
            self.pump(reactor, 1)
        } else {
            true
        }
    }

    /// Retries a previously short-written direction once `now_writable`
    /// reports `ready_to_send`.
    pub fn retry_into(&mut self, reactor: &mut Reactor, now_writable: &Rc<RefCell<TcpSocket>>) -> bool {
        if Rc::ptr_eq(now_writable, &self.remote) {
            self.pump(reactor, 0)
        } else if Rc::ptr_eq(now_writable, &self.client) {
            self.pump(reactor, 1)
        } else {
            true
        }
    }

    fn pump(&mut self, reactor: &mut Reactor, direction: usize) -> bool {
        let (source, destination) = if direction == 0 {
            (&self.client, &self.remote)
        } else {
            (&self.remote, &self.client)
        };
        if destination.borrow().is_write_blocked() {
            return true;
        }
        let data = Bytes::copy_from_slice(source.borrow().read_buffer());
        if data.is_empty() {
            return true;
        }
        let len = data.len();
        match destination.borrow_mut().send(reactor, data) {
            Ok(SendOutcome::Accepted(_)) | Ok(SendOutcome::SoftFail) => {
                source.borrow_mut().consume(len);
                self.bytes_forwarded[direction] += len as u64;
                true
            }
            Err(_) => false,
        }
    }
}

// See `tests/socks5_proxy.rs` for end-to-end byte-conservation coverage
// over real loopback sockets.
