//! TCP socket and TCP server (spec §4.3).

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};

use bytes::{Bytes, BytesMut};
use mio::net::{TcpListener, TcpStream};
use mio::Interest;
use socket2::{Domain, SockRef, Socket as Socket2, Type};

use crate::error::{ClosedReason, Error, Result};
use crate::reactor::fd::FdReadyHandler;
use crate::reactor::Reactor;
use crate::socket::owner::{next_socket_id, SocketId};
use crate::socket::{SendOutcome, Socket};

/// Per-`read` cap applied to a connected socket's drain (spec §4.3).
pub const TCP_READ_CAP: usize = 64 * 1024;
/// Max connections accepted from one listener per readiness event.
pub const ACCEPT_BATCH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

/// Receives the five semantic events for a [`TcpSocket`] (spec §4.2).
///
/// All methods default to doing nothing, so an owner interested only in
/// `data_received`, say, need not implement the rest.
pub trait TcpSocketOwner {
    fn connected(&mut self, reactor: &mut Reactor, socket: &Rc<RefCell<TcpSocket>>) {
        let _ = (reactor, socket);
    }
    fn connect_failed(&mut self, reactor: &mut Reactor, socket: &Rc<RefCell<TcpSocket>>, err: &Error) {
        let _ = (reactor, socket, err);
    }
    fn data_received(&mut self, reactor: &mut Reactor, socket: &Rc<RefCell<TcpSocket>>) {
        let _ = (reactor, socket);
    }
    fn ready_to_send(&mut self, reactor: &mut Reactor, socket: &Rc<RefCell<TcpSocket>>) {
        let _ = (reactor, socket);
    }
    fn closed(&mut self, reactor: &mut Reactor, socket: &Rc<RefCell<TcpSocket>>, reason: ClosedReason) {
        let _ = (reactor, socket, reason);
    }
}

#[derive(Default)]
struct PendingEvents {
    data_received: bool,
    ready_to_send: bool,
}

enum TcpEventKind {
    Connected,
    ConnectFailed(Error),
    DataReceived,
    ReadyToSend,
    Closed(ClosedReason),
}

pub struct TcpSocket {
    id: SocketId,
    stream: TcpStream,
    fd: RawFd,
    state: TcpState,
    peer_addr: Option<SocketAddr>,
    read_buf: BytesMut,
    write_queue: VecDeque<Bytes>,
    owner: Option<Weak<RefCell<dyn TcpSocketOwner>>>,
    self_weak: Weak<RefCell<TcpSocket>>,
    pending: PendingEvents,
}

impl TcpSocket {
    /// Begins an outbound, non-blocking connection. Fires `connected` or
    /// `connect_failed` once writable readiness resolves `SO_ERROR`.
    pub fn connect(reactor: &mut Reactor, addr: SocketAddr) -> io::Result<Rc<RefCell<Self>>> {
        #[cfg(feature = "log")]
        log::debug!("tcp connect to {addr}");
        let stream = TcpStream::connect(addr)?;
        let fd = stream.as_raw_fd();
        let socket = Rc::new_cyclic(|weak| {
            RefCell::new(TcpSocket {
                id: next_socket_id(),
                stream,
                fd,
                state: TcpState::Connecting,
                peer_addr: Some(addr),
                read_buf: BytesMut::new(),
                write_queue: VecDeque::new(),
                owner: None,
                self_weak: weak.clone(),
                pending: PendingEvents::default(),
            })
        });
        let handler: Rc<RefCell<dyn FdReadyHandler>> = socket.clone();
        reactor.register_fd(fd, handler, Interest::READABLE.add(Interest::WRITABLE))?;
        Ok(socket)
    }

    /// Wraps a stream already returned by `accept()`, immediately `Connected`.
    pub(crate) fn from_accepted(reactor: &mut Reactor, stream: TcpStream) -> io::Result<Rc<RefCell<Self>>> {
        let fd = stream.as_raw_fd();
        let peer_addr = stream.peer_addr().ok();
        let socket = Rc::new_cyclic(|weak| {
            RefCell::new(TcpSocket {
                id: next_socket_id(),
                stream,
                fd,
                state: TcpState::Connected,
                peer_addr,
                read_buf: BytesMut::new(),
                write_queue: VecDeque::new(),
                owner: None,
                self_weak: weak.clone(),
                pending: PendingEvents::default(),
            })
        });
        let handler: Rc<RefCell<dyn FdReadyHandler>> = socket.clone();
        reactor.register_fd(fd, handler, Interest::READABLE)?;
        Ok(socket)
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// `true` while a previous short write is still draining; callers doing
    /// their own flow control (e.g. the SOCKS5 proxy pump) should hold off
    /// sending more until the next `ready_to_send`.
    pub fn is_write_blocked(&self) -> bool {
        !self.write_queue.is_empty()
    }

    pub fn set_owner(&mut self, owner: Weak<RefCell<dyn TcpSocketOwner>>) {
        self.owner = Some(owner);
    }

    /// Path-MTU-derived send-MSS hint, or `0` where the platform exposes no
    /// equivalent to Linux's `TCP_INFO.tcpi_snd_mss` (spec §4.3).
    #[cfg(target_os = "linux")]
    pub fn detected_mtu(&self) -> u32 {
        unsafe {
            let mut info: libc::tcp_info = std::mem::zeroed();
            let mut len = std::mem::size_of::<libc::tcp_info>() as libc::socklen_t;
            let rc = libc::getsockopt(
                self.fd,
                libc::IPPROTO_TCP,
                libc::TCP_INFO,
                &mut info as *mut _ as *mut libc::c_void,
                &mut len,
            );
            if rc == 0 {
                info.tcpi_snd_mss
            } else {
                0
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub fn detected_mtu(&self) -> u32 {
        0
    }

    fn finish_connect(&mut self, reactor: &mut Reactor) {
        let sock_ref = SockRef::from(&self.stream);
        let result = sock_ref.take_error();
        match result {
            Ok(None) => {
                self.state = TcpState::Connected;
                self.peer_addr = self.stream.peer_addr().ok();
                let _ = reactor.set_fd_events(self.fd, Interest::READABLE);
                self.schedule(reactor, TcpEventKind::Connected);
            }
            Ok(Some(err)) | Err(err) => {
                #[cfg(feature = "log")]
                log::debug!("tcp connect to {:?} failed: {err}", self.peer_addr);
                self.state = TcpState::Closed;
                reactor.close_fd(self.fd);
                self.schedule(reactor, TcpEventKind::ConnectFailed(Error::Io(err)));
            }
        }
    }

    fn drain_readable(&mut self, reactor: &mut Reactor) {
        let start = self.read_buf.len();
        self.read_buf.resize(start + TCP_READ_CAP, 0);
        match self.stream.read(&mut self.read_buf[start..]) {
            Ok(0) => {
                self.read_buf.truncate(start);
                self.transition_closed(reactor, ClosedReason::Fin);
            }
            Ok(n) => {
                self.read_buf.truncate(start + n);
                self.schedule(reactor, TcpEventKind::DataReceived);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.read_buf.truncate(start);
            }
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                self.read_buf.truncate(start);
                self.transition_closed(reactor, ClosedReason::Reset);
            }
            Err(_) => {
                self.read_buf.truncate(start);
                self.transition_closed(reactor, ClosedReason::Reset);
            }
        }
    }

    fn flush_write_queue(&mut self, reactor: &mut Reactor) {
        while let Some(front) = self.write_queue.front() {
            match self.stream.write(front) {
                Ok(0) => break,
                Ok(n) if n == front.len() => {
                    self.write_queue.pop_front();
                }
                Ok(n) => {
                    let remainder = front.slice(n..);
                    *self.write_queue.front_mut().expect("front checked above") = remainder;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(_) => {
                    self.transition_closed(reactor, ClosedReason::Reset);
                    return;
                }
            }
        }
        if self.write_queue.is_empty() {
            let _ = reactor.disable_write(self.fd);
            self.schedule(reactor, TcpEventKind::ReadyToSend);
        }
    }

    fn transition_closed(&mut self, reactor: &mut Reactor, reason: ClosedReason) {
        if self.state == TcpState::Closed {
            return;
        }
        #[cfg(feature = "log")]
        log::debug!("tcp socket {:?} closed: {reason}", self.id);
        self.state = TcpState::Closed;
        reactor.close_fd(self.fd);
        self.schedule(reactor, TcpEventKind::Closed(reason));
    }

    /// Schedules delivery of `kind` to the owner at end-of-loop, coalescing
    /// `DataReceived`/`ReadyToSend` while one is already pending (spec §4.2
    /// "Event coalescing").
    fn schedule(&mut self, reactor: &mut Reactor, kind: TcpEventKind) {
        match kind {
            TcpEventKind::DataReceived if self.pending.data_received => return,
            TcpEventKind::DataReceived => self.pending.data_received = true,
            TcpEventKind::ReadyToSend if self.pending.ready_to_send => return,
            TcpEventKind::ReadyToSend => self.pending.ready_to_send = true,
            _ => {}
        }
        let weak = self.self_weak.clone();
        reactor.subscribe_loop_end(move |reactor| {
            let Some(socket) = weak.upgrade() else { return };
            let owner = {
                let mut s = socket.borrow_mut();
                match &kind {
                    TcpEventKind::DataReceived => s.pending.data_received = false,
                    TcpEventKind::ReadyToSend => s.pending.ready_to_send = false,
                    _ => {}
                }
                s.owner.as_ref().and_then(Weak::upgrade)
            };
            let Some(owner) = owner else { return };
            let mut owner = owner.borrow_mut();
            match kind {
                TcpEventKind::Connected => owner.connected(reactor, &socket),
                TcpEventKind::ConnectFailed(err) => owner.connect_failed(reactor, &socket, &err),
                TcpEventKind::DataReceived => owner.data_received(reactor, &socket),
                TcpEventKind::ReadyToSend => owner.ready_to_send(reactor, &socket),
                TcpEventKind::Closed(reason) => owner.closed(reactor, &socket, reason),
            }
        });
    }
}

impl FdReadyHandler for TcpSocket {
    fn on_ready(&mut self, reactor: &mut Reactor, readable: bool, writable: bool) {
        match self.state {
            TcpState::Connecting => {
                if writable {
                    self.finish_connect(reactor);
                }
            }
            TcpState::Connected => {
                if writable {
                    self.flush_write_queue(reactor);
                }
                if readable && self.state == TcpState::Connected {
                    self.drain_readable(reactor);
                }
            }
            TcpState::Disconnected | TcpState::Closed => {}
        }
    }
}

impl Socket for TcpSocket {
    fn send(&mut self, reactor: &mut Reactor, bytes: Bytes) -> Result<SendOutcome> {
        match self.state {
            TcpState::Closed => return Err(Error::Closed),
            TcpState::Disconnected | TcpState::Connecting => return Err(Error::NotConnected),
            TcpState::Connected => {}
        }
        if !self.write_queue.is_empty() {
            self.write_queue.push_back(bytes);
            return Ok(SendOutcome::SoftFail);
        }
        let outcome = match self.stream.write(bytes.as_ref()) {
            Ok(n) if n == bytes.len() => SendOutcome::Accepted(n),
            Ok(n) => {
                self.write_queue.push_back(bytes.slice(n..));
                SendOutcome::Accepted(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.write_queue.push_back(bytes);
                SendOutcome::SoftFail
            }
            Err(e) => return Err(Error::Io(e)),
        };
        if !self.write_queue.is_empty() {
            let _ = reactor.set_fd_events(self.fd, Interest::READABLE.add(Interest::WRITABLE));
        }
        Ok(outcome)
    }

    fn read_buffer(&self) -> &[u8] {
        &self.read_buf
    }

    fn consume(&mut self, n: usize) {
        let n = n.min(self.read_buf.len());
        let _ = self.read_buf.split_to(n);
    }

    fn close(&mut self, reactor: &mut Reactor) {
        self.transition_closed(reactor, ClosedReason::Local);
    }

    fn is_closed(&self) -> bool {
        self.state == TcpState::Closed
    }
}

/// Receives accepted connections for a [`TcpServer`] (spec §4.3).
pub trait TcpServerOwner {
    fn incoming_tcp_connection(
        &mut self,
        reactor: &mut Reactor,
        server: &Rc<RefCell<TcpServer>>,
        socket: Rc<RefCell<TcpSocket>>,
        extra_data: u64,
    );
}

pub struct TcpServer {
    id: SocketId,
    listener: TcpListener,
    fd: RawFd,
    extra_data: u64,
    owner: Option<Weak<RefCell<dyn TcpServerOwner>>>,
    self_weak: Weak<RefCell<TcpServer>>,
    closed: bool,
}

impl TcpServer {
    /// Binds and listens with an explicit backlog (applied via
    /// `socket2::Socket::listen`, since `mio::net::TcpListener::bind` fixes
    /// its own backlog internally).
    pub fn bind(
        reactor: &mut Reactor,
        addr: SocketAddr,
        backlog: i32,
        extra_data: u64,
    ) -> io::Result<Rc<RefCell<Self>>> {
        let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let socket = Socket2::new(domain, Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog)?;
        let std_listener: std::net::TcpListener = socket.into();
        let listener = TcpListener::from_std(std_listener);
        let fd = listener.as_raw_fd();
        #[cfg(feature = "log")]
        log::info!("tcp server listening on {addr}");

        let server = Rc::new_cyclic(|weak| {
            RefCell::new(TcpServer {
                id: next_socket_id(),
                listener,
                fd,
                extra_data,
                owner: None,
                self_weak: weak.clone(),
                closed: false,
            })
        });
        let handler: Rc<RefCell<dyn FdReadyHandler>> = server.clone();
        reactor.register_fd(fd, handler, Interest::READABLE)?;
        Ok(server)
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn set_owner(&mut self, owner: Weak<RefCell<dyn TcpServerOwner>>) {
        self.owner = Some(owner);
    }

    pub fn close(&mut self, reactor: &mut Reactor) {
        if self.closed {
            return;
        }
        self.closed = true;
        reactor.close_fd(self.fd);
    }

    fn deliver_incoming(&mut self, reactor: &mut Reactor, stream: TcpStream) {
        let Ok(socket) = TcpSocket::from_accepted(reactor, stream) else {
            return;
        };
        let Some(server) = self.self_weak.upgrade() else { return };
        let extra_data = self.extra_data;
        let owner = self.owner.clone();
        reactor.subscribe_loop_end(move |reactor| {
            let Some(owner) = owner.and_then(|w| w.upgrade()) else { return };
            owner
                .borrow_mut()
                .incoming_tcp_connection(reactor, &server, socket, extra_data);
        });
    }
}

impl FdReadyHandler for TcpServer {
    fn on_ready(&mut self, reactor: &mut Reactor, readable: bool, _writable: bool) {
        if !readable || self.closed {
            return;
        }
        for _ in 0..ACCEPT_BATCH {
            match self.listener.accept() {
                Ok((stream, _peer)) => self.deliver_incoming(reactor, stream),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_on_disconnected_socket_is_rejected() {
        // `Connecting` state behaves as not-yet-connected for `send`.
        let mut reactor = Reactor::new().expect("reactor");
        let listener_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = TcpServer::bind(&mut reactor, listener_addr, 16, 0).expect("bind");
        let addr = server.borrow().local_addr().expect("local_addr");
        let socket = TcpSocket::connect(&mut reactor, addr).expect("connect");
        assert_eq!(socket.borrow().state(), TcpState::Connecting);
        let err = socket.borrow_mut().send(&mut reactor, Bytes::from_static(b"x"));
        assert!(matches!(err, Err(Error::NotConnected)));
    }
}
