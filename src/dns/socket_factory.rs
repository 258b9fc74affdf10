//! Pluggable per-query socket creation (spec §4.7).
//!
//! The `SocketFactory` trait is the safe-Rust replacement for the source's
//! thread-local `user_data` indirection: callers pass whatever context a
//! custom factory needs (an interface name, say) directly as a field on
//! their own factory type, rather than through a side channel.

use std::io;
use std::net::SocketAddr;

use mio::net::{TcpStream, UdpSocket};
use mio::{Interest, Registry, Token};
use socket2::{Domain, Socket as Socket2, Type};

/// Either transport a query can run over.
pub(crate) enum QuerySocket {
    Udp(UdpSocket),
    Tcp(TcpStream),
}

impl QuerySocket {
    pub(crate) fn register(&mut self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        match self {
            QuerySocket::Udp(s) => registry.register(s, token, interest),
            QuerySocket::Tcp(s) => registry.register(s, token, interest),
        }
    }

    pub(crate) fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        use std::io::Write;
        match self {
            QuerySocket::Udp(s) => s.send(buf),
            QuerySocket::Tcp(s) => s.write(buf),
        }
    }

    pub(crate) fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        use std::io::Read;
        match self {
            QuerySocket::Udp(s) => s.recv(buf),
            QuerySocket::Tcp(s) => s.read(buf),
        }
    }
}

/// Produces the sockets a resolver query runs over. Implementations decide
/// transport-level details (interface binding, source port) the resolver
/// itself has no opinion on.
pub trait SocketFactory {
    fn bind_udp(&self, server: SocketAddr) -> io::Result<UdpSocket>;
    fn connect_tcp(&self, server: SocketAddr) -> io::Result<TcpStream>;
}

/// Plain sockets with no interface binding — the common case.
pub struct DefaultSocketFactory;

impl SocketFactory for DefaultSocketFactory {
    fn bind_udp(&self, server: SocketAddr) -> io::Result<UdpSocket> {
        let bind_addr: SocketAddr = if server.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        UdpSocket::bind(bind_addr)
    }

    fn connect_tcp(&self, server: SocketAddr) -> io::Result<TcpStream> {
        TcpStream::connect(server)
    }
}

/// Binds every query socket to a named network interface.
///
/// On Linux this uses `SO_BINDTODEVICE` via `socket2::Socket::bind_device`.
/// Other platforms (the source additionally supports macOS's `IP_BOUND_IF`)
/// fall back to an unbound socket — see DESIGN.md.
pub struct BoundInterfaceSocketFactory {
    interface: String,
}

impl BoundInterfaceSocketFactory {
    pub fn new(interface: impl Into<String>) -> Self {
        BoundInterfaceSocketFactory { interface: interface.into() }
    }

    fn bind_device(&self, socket: &Socket2) -> io::Result<()> {
        #[cfg(target_os = "linux")]
        {
            socket.bind_device(Some(self.interface.as_bytes()))
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = socket;
            Ok(())
        }
    }
}

impl SocketFactory for BoundInterfaceSocketFactory {
    fn bind_udp(&self, server: SocketAddr) -> io::Result<UdpSocket> {
        let domain = if server.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let socket = Socket2::new(domain, Type::DGRAM, None)?;
        self.bind_device(&socket)?;
        socket.set_nonblocking(true)?;
        let bind_addr: SocketAddr = if server.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        socket.bind(&bind_addr.into())?;
        Ok(UdpSocket::from_std(socket.into()))
    }

    fn connect_tcp(&self, server: SocketAddr) -> io::Result<TcpStream> {
        let domain = if server.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let socket = Socket2::new(domain, Type::STREAM, None)?;
        self.bind_device(&socket)?;
        socket.set_nonblocking(true)?;
        match socket.connect(&server.into()) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => return Err(e),
        }
        Ok(TcpStream::from_std(socket.into()))
    }
}
