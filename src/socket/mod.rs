//! Owned socket family (spec §3, §4.2-§4.6).
//!
//! Every socket is held behind a single `Rc<RefCell<_>>` owned by whoever
//! currently holds its handle; handing a socket to a new owner is an
//! ordinary clone of that `Rc`, so there is no separate "ref/unref" pooled
//! object protocol to implement. See `owner` for how owners are addressed.

pub mod owner;
pub mod socks5;
pub mod tcp;
pub mod udp;

use bytes::Bytes;

use crate::error::Result;
use crate::reactor::Reactor;

/// Outcome of a successful [`Socket::send`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// `n` bytes were written to the kernel (or queued) immediately.
    Accepted(usize),
    /// The write queue was non-empty or the socket was not writable; the
    /// whole payload was buffered for a future `ready_to_send`.
    SoftFail,
}

/// Operations common to every owned socket kind (spec §4.2).
///
/// Unlike the line-for-line description in the design notes, `send` and
/// `close` take `&mut Reactor` here: re-arming write readiness after a
/// partial write has to go through the reactor's FD registry, and sockets
/// deliberately hold no back-reference to the `Reactor` that drives them.
pub trait Socket {
    fn send(&mut self, reactor: &mut Reactor, bytes: Bytes) -> Result<SendOutcome>;
    fn read_buffer(&self) -> &[u8];
    fn consume(&mut self, n: usize);
    fn close(&mut self, reactor: &mut Reactor);
    fn is_closed(&self) -> bool;
}
