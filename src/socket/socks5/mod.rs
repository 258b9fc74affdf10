//! RFC 1928 SOCKS5 server-side state machine (spec §4.5).

pub mod proxy;

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::rc::{Rc, Weak};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ClosedReason, Error};
use crate::reactor::Reactor;
use crate::socket::owner::SocketId;
use crate::socket::tcp::{TcpServer, TcpServerOwner, TcpSocket, TcpSocketOwner};
use crate::socket::Socket;
use proxy::TcpProxy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    AwaitGreeting,
    AwaitRequest,
    Replying,
    Relaying,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyCode {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl ReplyCode {
    /// Maps a failed outbound connect to the closest reply code (spec §9,
    /// an implementation choice left open by the design notes). Only
    /// stable `io::ErrorKind` variants are matched; anything finer needs
    /// the nightly `io_error_more` variants this crate's MSRV predates.
    fn from_connect_error(kind: io::ErrorKind) -> ReplyCode {
        match kind {
            io::ErrorKind::ConnectionRefused => ReplyCode::ConnectionRefused,
            io::ErrorKind::TimedOut => ReplyCode::TtlExpired,
            _ => ReplyCode::GeneralFailure,
        }
    }
}

/// How long a failed handshake's client socket lingers after its failure
/// reply is sent before being torn down, matching the source's own
/// fixed post-send grace on its error-reply close path (spec §9).
pub const FAILURE_CLOSE_GRACE: Duration = Duration::from_secs(1);

fn encode_reply(code: ReplyCode, bound: Option<SocketAddr>) -> Bytes {
    let mut buf = BytesMut::with_capacity(22);
    buf.put_u8(0x05);
    buf.put_u8(code as u8);
    buf.put_u8(0x00);
    match bound {
        Some(SocketAddr::V4(addr)) => {
            buf.put_u8(0x01);
            buf.extend_from_slice(&addr.ip().octets());
            buf.put_u16(addr.port());
        }
        Some(SocketAddr::V6(addr)) => {
            buf.put_u8(0x04);
            buf.extend_from_slice(&addr.ip().octets());
            buf.put_u16(addr.port());
        }
        None => {
            buf.put_u8(0x01);
            buf.extend_from_slice(&[0, 0, 0, 0]);
            buf.put_u16(0);
        }
    }
    buf.freeze()
}

/// Application-level hooks for a [`Socks5Server`] (spec §4.5).
///
/// Every method has a sensible default so an owner that only needs, say,
/// `new_outbound_tcp_link` for accounting need not implement the rest.
pub trait Socks5ServerOwner {
    /// Decides whether a CONNECT to `dest` should proceed. The default
    /// allows everything.
    fn tcp_connect_requested(&mut self, socket_id: SocketId, dest: SocketAddr) -> ReplyCode {
        let _ = (socket_id, dest);
        ReplyCode::Succeeded
    }

    /// Produces the outbound socket used to satisfy a CONNECT. The default
    /// dials `dest` directly with no interface binding.
    fn generate_outbound_tcp_socket(
        &mut self,
        reactor: &mut Reactor,
        dest: SocketAddr,
    ) -> io::Result<Rc<RefCell<TcpSocket>>> {
        TcpSocket::connect(reactor, dest)
    }

    fn new_outbound_tcp_link(
        &mut self,
        reactor: &mut Reactor,
        client: Rc<RefCell<TcpSocket>>,
        remote: Rc<RefCell<TcpSocket>>,
    ) {
        let _ = (reactor, client, remote);
    }
}

/// One accepted SOCKS5 connection and its negotiation state.
pub struct Socks5ServerSocket {
    client: Rc<RefCell<TcpSocket>>,
    outbound: Option<Rc<RefCell<TcpSocket>>>,
    proxy: Option<TcpProxy>,
    state: State,
    dest_addr: Option<SocketAddr>,
    /// Set once the client side has sent FIN while `outbound` still has
    /// unflushed bytes queued for the destination, so `teardown` is
    /// deferred until that backlog drains instead of dropping it.
    client_half_closed: bool,
    server: Weak<RefCell<Socks5Server>>,
    self_weak: Weak<RefCell<Socks5ServerSocket>>,
}

impl Socks5ServerSocket {
    pub fn state(&self) -> State {
        self.state
    }

    fn on_client_data(&mut self, reactor: &mut Reactor) {
        loop {
            let progressed = match self.state {
                State::AwaitGreeting => self.try_parse_greeting(reactor),
                State::AwaitRequest => self.try_parse_request(reactor),
                State::Replying | State::Relaying | State::Failed => false,
            };
            if !progressed {
                break;
            }
        }
    }

    fn try_parse_greeting(&mut self, reactor: &mut Reactor) -> bool {
        let (ver, methods) = {
            let client = self.client.borrow();
            let buf = client.read_buffer();
            if buf.len() < 2 {
                return false;
            }
            let nmethods = buf[1] as usize;
            if buf.len() < 2 + nmethods {
                return false;
            }
            (buf[0], buf[2..2 + nmethods].to_vec())
        };
        self.client.borrow_mut().consume(2 + methods.len());
        if ver != 5 {
            self.fail(reactor, None);
            return false;
        }
        if methods.contains(&0x00) {
            let _ = self.client.borrow_mut().send(reactor, encode_reply(ReplyCode::Succeeded, None));
            self.state = State::AwaitRequest;
        } else {
            self.fail(reactor, Some(Bytes::from_static(&[0x05, 0xFF])));
        }
        true
    }

    fn try_parse_request(&mut self, reactor: &mut Reactor) -> bool {
        let header = {
            let client = self.client.borrow();
            let buf = client.read_buffer();
            if buf.len() < 4 {
                return false;
            }
            (buf[0], buf[1], buf[3])
        };
        let (ver, cmd, atyp) = header;
        if ver != 5 {
            self.fail(reactor, None);
            return false;
        }
        let addr_len = match atyp {
            0x01 => 4,
            0x04 => 16,
            _ => {
                self.fail(reactor, Some(encode_reply(ReplyCode::AddressTypeNotSupported, None)));
                return false;
            }
        };
        let total = 4 + addr_len + 2;
        let dest = {
            let client = self.client.borrow();
            let buf = client.read_buffer();
            if buf.len() < total {
                return false;
            }
            let ip = match atyp {
                0x01 => IpAddr::V4(Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7])),
                0x04 => {
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(&buf[4..20]);
                    IpAddr::V6(Ipv6Addr::from(octets))
                }
                _ => unreachable!(),
            };
            let port = u16::from_be_bytes([buf[total - 2], buf[total - 1]]);
            SocketAddr::new(ip, port)
        };
        self.client.borrow_mut().consume(total);

        if cmd != 0x01 {
            self.fail(reactor, Some(encode_reply(ReplyCode::CommandNotSupported, None)));
            return false;
        }
        self.dest_addr = Some(dest);
        self.state = State::Replying;
        self.begin_connect(reactor);
        true
    }

    fn begin_connect(&mut self, reactor: &mut Reactor) {
        let id = self.client.borrow().id();
        let dest = self.dest_addr.expect("set before entering Replying");
        let owner = self.server.upgrade().and_then(|s| s.borrow().owner.clone()).and_then(|w| w.upgrade());

        let reply = owner
            .as_ref()
            .map(|o| o.borrow_mut().tcp_connect_requested(id, dest))
            .unwrap_or(ReplyCode::Succeeded);
        if reply != ReplyCode::Succeeded {
            self.fail(reactor, Some(encode_reply(reply, None)));
            return;
        }

        let outbound = match &owner {
            Some(o) => o.borrow_mut().generate_outbound_tcp_socket(reactor, dest),
            None => TcpSocket::connect(reactor, dest),
        };
        match outbound {
            Ok(remote) => {
                let owner_handle: Weak<RefCell<dyn TcpSocketOwner>> = self.self_weak.clone();
                remote.borrow_mut().set_owner(owner_handle);
                self.outbound = Some(remote);
            }
            Err(_) => self.fail(reactor, Some(encode_reply(ReplyCode::GeneralFailure, None))),
        }
    }

    fn outbound_connected(&mut self, reactor: &mut Reactor) {
        let Some(outbound) = self.outbound.clone() else { return };
        let bound = outbound.borrow().peer_addr();
        #[cfg(feature = "log")]
        log::debug!("socks5 relay established to {bound:?}");
        let _ = self.client.borrow_mut().send(reactor, encode_reply(ReplyCode::Succeeded, bound));
        self.state = State::Relaying;
        self.proxy = Some(TcpProxy::new(self.client.clone(), outbound.clone()));

        let owner = self.server.upgrade().and_then(|s| s.borrow().owner.clone()).and_then(|w| w.upgrade());
        if let Some(owner) = owner {
            owner.borrow_mut().new_outbound_tcp_link(reactor, self.client.clone(), outbound);
        }
    }

    /// Fails the handshake. `reply`, if given, is queued on the client
    /// socket before a [`FAILURE_CLOSE_GRACE`] timer tears the session
    /// down, so the bytes have a chance to clear the write queue/kernel
    /// instead of being discarded by an immediate `close`. Pass `None`
    /// only when no reply was ever queued (e.g. an unsupported SOCKS
    /// version, where the client gets nothing but a closed connection).
    fn fail(&mut self, reactor: &mut Reactor, reply: Option<Bytes>) {
        #[cfg(feature = "log")]
        log::debug!("socks5 request failed; reply queued: {}", reply.is_some());
        self.state = State::Failed;
        match reply {
            Some(bytes) => {
                let _ = self.client.borrow_mut().send(reactor, bytes);
                let weak = self.self_weak.clone();
                reactor.start_timer(FAILURE_CLOSE_GRACE, move |reactor| {
                    if let Some(this) = weak.upgrade() {
                        this.borrow_mut().teardown(reactor);
                    }
                });
            }
            None => self.teardown(reactor),
        }
    }

    fn teardown(&mut self, reactor: &mut Reactor) {
        if !self.client.borrow().is_closed() {
            self.client.borrow_mut().close(reactor);
        }
        if let Some(outbound) = self.outbound.take() {
            if !outbound.borrow().is_closed() {
                outbound.borrow_mut().close(reactor);
            }
        }
        if let Some(server) = self.server.upgrade() {
            let id = self.client.borrow().id();
            server.borrow_mut().sockets.remove(&id);
        }
    }
}

impl TcpSocketOwner for Socks5ServerSocket {
    fn connected(&mut self, reactor: &mut Reactor, socket: &Rc<RefCell<TcpSocket>>) {
        if self.outbound.as_ref().is_some_and(|o| Rc::ptr_eq(o, socket)) {
            self.outbound_connected(reactor);
        }
    }

    fn connect_failed(&mut self, reactor: &mut Reactor, socket: &Rc<RefCell<TcpSocket>>, err: &Error) {
        if !self.outbound.as_ref().is_some_and(|o| Rc::ptr_eq(o, socket)) {
            return;
        }
        let code = match err {
            Error::Io(e) => ReplyCode::from_connect_error(e.kind()),
            _ => ReplyCode::GeneralFailure,
        };
        self.outbound = None;
        self.fail(reactor, Some(encode_reply(code, None)));
    }

    fn data_received(&mut self, reactor: &mut Reactor, socket: &Rc<RefCell<TcpSocket>>) {
        if Rc::ptr_eq(socket, &self.client) && self.state != State::Relaying {
            self.on_client_data(reactor);
            return;
        }
        if let Some(proxy) = self.proxy.as_mut() {
            if !proxy.forward_from(reactor, socket) {
                self.teardown(reactor);
            }
        }
    }

    fn ready_to_send(&mut self, reactor: &mut Reactor, socket: &Rc<RefCell<TcpSocket>>) {
        if let Some(proxy) = self.proxy.as_mut() {
            if !proxy.retry_into(reactor, socket) {
                self.teardown(reactor);
                return;
            }
        }
        if self.client_half_closed {
            let drained = !self.outbound.as_ref().is_some_and(|o| o.borrow().is_write_blocked());
            if drained {
                self.teardown(reactor);
            }
        }
    }

    fn closed(&mut self, reactor: &mut Reactor, socket: &Rc<RefCell<TcpSocket>>, reason: ClosedReason) {
        // A client FIN while the outbound side is still draining a
        // write-blocked backlog must not discard those queued bytes; let
        // `ready_to_send` finish the flush and tear down once it's empty.
        if reason == ClosedReason::Fin
            && Rc::ptr_eq(socket, &self.client)
            && self.outbound.as_ref().is_some_and(|o| o.borrow().is_write_blocked())
        {
            self.client_half_closed = true;
            return;
        }
        self.teardown(reactor);
    }
}

/// A `TcpServer` whose accepted connections are each wrapped in a
/// [`Socks5ServerSocket`] (spec §4.5).
pub struct Socks5Server {
    listener: Rc<RefCell<TcpServer>>,
    sockets: HashMap<SocketId, Rc<RefCell<Socks5ServerSocket>>>,
    owner: Option<Weak<RefCell<dyn Socks5ServerOwner>>>,
    self_weak: Weak<RefCell<Socks5Server>>,
}

impl Socks5Server {
    pub fn bind(reactor: &mut Reactor, addr: SocketAddr, backlog: i32) -> io::Result<Rc<RefCell<Self>>> {
        let listener = TcpServer::bind(reactor, addr, backlog, 0)?;
        let server = Rc::new_cyclic(|weak| {
            RefCell::new(Socks5Server {
                listener: listener.clone(),
                sockets: HashMap::new(),
                owner: None,
                self_weak: weak.clone(),
            })
        });
        let owner_handle: Weak<RefCell<dyn TcpServerOwner>> = Rc::downgrade(&server);
        listener.borrow_mut().set_owner(owner_handle);
        Ok(server)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.borrow().local_addr()
    }

    pub fn set_owner(&mut self, owner: Weak<RefCell<dyn Socks5ServerOwner>>) {
        self.owner = Some(owner);
    }

    pub fn close(&mut self, reactor: &mut Reactor) {
        self.listener.borrow_mut().close(reactor);
        for socket in self.sockets.values() {
            socket.borrow_mut().teardown(reactor);
        }
        self.sockets.clear();
    }
}

impl TcpServerOwner for Socks5Server {
    fn incoming_tcp_connection(
        &mut self,
        _reactor: &mut Reactor,
        _server: &Rc<RefCell<TcpServer>>,
        socket: Rc<RefCell<TcpSocket>>,
        _extra_data: u64,
    ) {
        let id = socket.borrow().id();
        let server_weak = self.self_weak.clone();
        let wrapper = Rc::new_cyclic(|weak| {
            RefCell::new(Socks5ServerSocket {
                client: socket.clone(),
                outbound: None,
                proxy: None,
                state: State::AwaitGreeting,
                dest_addr: None,
                client_half_closed: false,
                server: server_weak,
                self_weak: weak.clone(),
            })
        });
        let owner_handle: Weak<RefCell<dyn TcpSocketOwner>> = Rc::downgrade(&wrapper);
        socket.borrow_mut().set_owner(owner_handle);
        self.sockets.insert(id, wrapper);
    }
}
