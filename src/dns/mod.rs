//! Stand-alone asynchronous DNS resolver (spec §4.7).
//!
//! Entirely independent of [`crate::reactor::Reactor`]: `resolve` runs its
//! own short-lived `mio::Poll` loop and returns synchronously to its
//! caller.

pub mod message;
pub mod query;
pub mod record;
pub mod resolver;
pub mod socket_factory;

pub use record::{Record, RecordData, RecordType};
pub use resolver::{resolve, ServerConfig};
pub use socket_factory::{BoundInterfaceSocketFactory, DefaultSocketFactory, SocketFactory};
