//! Error taxonomy shared by the reactor, socket family and DNS resolver.
//!
//! Variants map to semantic kinds (see spec §7), not to any one external
//! library's error type. Transport-level failures almost always surface as
//! a `closed`/`connect_failed` event rather than as one of these, per the
//! no-throw delivery discipline described in [`crate::socket`].

use std::fmt;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The operation would block; the caller should await `ready_to_send`
    /// or retry later. Not a hard failure.
    #[error("operation would block")]
    WouldBlock,

    /// A transient condition distinct from `WouldBlock` on sockets whose
    /// write path bundles several underlying causes (e.g. a still-draining
    /// write queue on a soft-full UDP socket).
    #[error("soft failure, retry after the next readiness event")]
    SoftFail,

    /// The socket has not completed connecting yet.
    #[error("socket is not connected")]
    NotConnected,

    /// The socket has already been closed.
    #[error("socket is closed")]
    Closed,

    /// The socket is not in a state compatible with the requested operation.
    #[error("socket is in the wrong state for this operation")]
    WrongState,

    /// A malformed argument, e.g. an empty send buffer.
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// DNS resolution did not complete before its overall timeout.
    #[error("operation timed out")]
    Timeout,

    /// DNS resolution produced no matching records.
    #[error("no matching records found")]
    NotFound,

    /// Any other OS-level failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for conditions a caller should treat as "try again later"
    /// rather than as a hard failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::WouldBlock | Error::SoftFail)
    }
}

/// Reason a socket's `closed` event carries, distinguishing a graceful
/// peer shutdown from an error condition (spec §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedReason {
    /// The peer sent FIN (orderly shutdown).
    Fin,
    /// The peer reset the connection (RST) or another I/O error occurred.
    Reset,
    /// The local side called `close()` itself.
    Local,
}

impl fmt::Display for ClosedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClosedReason::Fin => write!(f, "peer closed (FIN)"),
            ClosedReason::Reset => write!(f, "connection reset"),
            ClosedReason::Local => write!(f, "closed locally"),
        }
    }
}
