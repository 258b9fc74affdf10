//! Owner-handle plumbing shared by every socket kind (spec §4.2).
//!
//! Each socket kind defines its own non-generic `*Owner` trait (see
//! `tcp::TcpSocketOwner`, `udp::UdpSocketOwner`, `socks5::Socks5ServerOwner`)
//! rather than a single trait generic over the socket type: this keeps
//! owner implementations concrete and lets a socket store its owner as a
//! plain `Weak<RefCell<dyn TcpSocketOwner>>` instead of threading a type
//! parameter through the whole module tree.

use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies a socket for the lifetime of the process; stable once
/// assigned, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub(crate) u64);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_socket_id() -> SocketId {
    SocketId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
}
