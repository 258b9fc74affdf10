//! Single-threaded event reactor, owned socket family, SOCKS5 proxy and
//! asynchronous DNS resolver.
//!
//! The reactor (`reactor::Reactor`) is a readiness-based scheduler built on
//! [`mio`]; it owns an FD registry, a timer heap, and a child-process
//! registry, and drives every socket in `socket`. The DNS resolver
//! (`dns::resolve`) is independent of the reactor and runs its own
//! short-lived `mio::Poll` loop.
//!
//! No part of this crate spawns a thread; callers choose their own
//! concurrency model around `Reactor::run`.

pub mod dns;
pub mod error;
pub mod reactor;
pub mod socket;
pub mod time;

pub use error::{ClosedReason, Error, Result};
pub use reactor::{Reactor, ShutdownHandle};
