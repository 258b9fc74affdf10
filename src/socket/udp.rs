//! UDP socket (spec §4.4).

use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};

use bytes::Bytes;
use mio::net::UdpSocket as MioUdpSocket;
use mio::Interest;

use crate::error::{Error, Result};
use crate::reactor::fd::FdReadyHandler;
use crate::reactor::Reactor;
use crate::socket::owner::{next_socket_id, SocketId};

/// Largest datagram this crate will read in one `recv_from` call.
pub const UDP_READ_CAP: usize = 64 * 1024;

/// One received datagram, tagged with the sender's address (spec §4.4).
pub struct DatagramEvent {
    pub from: SocketAddr,
    pub bytes: Bytes,
}

/// Receives datagrams for a [`UdpSocket`] (spec §4.2, specialized for UDP's
/// one-event-per-datagram model rather than a shared read buffer).
pub trait UdpSocketOwner {
    fn data_received(&mut self, reactor: &mut Reactor, socket: &Rc<RefCell<UdpSocket>>, datagram: DatagramEvent) {
        let _ = (reactor, socket, datagram);
    }
    fn ready_to_send(&mut self, reactor: &mut Reactor, socket: &Rc<RefCell<UdpSocket>>) {
        let _ = (reactor, socket);
    }
    fn closed(&mut self, reactor: &mut Reactor, socket: &Rc<RefCell<UdpSocket>>) {
        let _ = (reactor, socket);
    }
}

pub struct UdpSocket {
    id: SocketId,
    socket: MioUdpSocket,
    fd: RawFd,
    owner: Option<Weak<RefCell<dyn UdpSocketOwner>>>,
    self_weak: Weak<RefCell<UdpSocket>>,
    blocked: bool,
    closed: bool,
}

impl UdpSocket {
    pub fn bind(reactor: &mut Reactor, addr: SocketAddr) -> io::Result<Rc<RefCell<Self>>> {
        let socket = MioUdpSocket::bind(addr)?;
        let fd = socket.as_raw_fd();
        let handle = Rc::new_cyclic(|weak| {
            RefCell::new(UdpSocket {
                id: next_socket_id(),
                socket,
                fd,
                owner: None,
                self_weak: weak.clone(),
                blocked: false,
                closed: false,
            })
        });
        let handler: Rc<RefCell<dyn FdReadyHandler>> = handle.clone();
        reactor.register_fd(fd, handler, Interest::READABLE)?;
        Ok(handle)
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn set_owner(&mut self, owner: Weak<RefCell<dyn UdpSocketOwner>>) {
        self.owner = Some(owner);
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Sends one datagram. All-or-nothing: a short kernel write is reported
    /// as `Error::SoftFail`, never buffered and retried (spec §4.4).
    pub fn send_to(&mut self, reactor: &mut Reactor, bytes: &[u8], to: SocketAddr) -> Result<usize> {
        if self.closed {
            return Err(Error::Closed);
        }
        match self.socket.send_to(bytes, to) {
            Ok(n) => {
                if self.blocked {
                    self.blocked = false;
                    let _ = reactor.disable_write(self.fd);
                }
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.blocked = true;
                let _ = reactor.set_fd_events(self.fd, Interest::READABLE.add(Interest::WRITABLE));
                Err(Error::WouldBlock)
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    pub fn close(&mut self, reactor: &mut Reactor) {
        if self.closed {
            return;
        }
        self.closed = true;
        reactor.close_fd(self.fd);
        let weak = self.self_weak.clone();
        reactor.subscribe_loop_end(move |reactor| {
            let Some(socket) = weak.upgrade() else { return };
            let owner = socket.borrow().owner.as_ref().and_then(Weak::upgrade);
            let Some(owner) = owner else { return };
            owner.borrow_mut().closed(reactor, &socket);
        });
    }

    fn drain_datagrams(&mut self, reactor: &mut Reactor) {
        let mut buf = [0u8; UDP_READ_CAP];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    let datagram = DatagramEvent { from, bytes: Bytes::copy_from_slice(&buf[..n]) };
                    let weak = self.self_weak.clone();
                    reactor.subscribe_loop_end(move |reactor| {
                        let Some(socket) = weak.upgrade() else { return };
                        let owner = socket.borrow().owner.as_ref().and_then(Weak::upgrade);
                        let Some(owner) = owner else { return };
                        owner.borrow_mut().data_received(reactor, &socket, datagram);
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
    }

    fn notify_writable(&mut self, reactor: &mut Reactor) {
        if !self.blocked {
            return;
        }
        self.blocked = false;
        let _ = reactor.disable_write(self.fd);
        let weak = self.self_weak.clone();
        reactor.subscribe_loop_end(move |reactor| {
            let Some(socket) = weak.upgrade() else { return };
            let owner = socket.borrow().owner.as_ref().and_then(Weak::upgrade);
            let Some(owner) = owner else { return };
            owner.borrow_mut().ready_to_send(reactor, &socket);
        });
    }
}

impl FdReadyHandler for UdpSocket {
    fn on_ready(&mut self, reactor: &mut Reactor, readable: bool, writable: bool) {
        if self.closed {
            return;
        }
        if readable {
            self.drain_datagrams(reactor);
        }
        if writable {
            self.notify_writable(reactor);
        }
    }
}
