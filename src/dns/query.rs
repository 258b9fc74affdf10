//! Per-query transport state machine (spec §4.7 algorithm steps a-b),
//! grounded on the length-prefixed TCP framing in
//! `microsoft-openvmm`'s `net/dns_resolver/dns_tcp.rs`.

use std::io;
use std::net::SocketAddr;

use mio::{Poll, Token};
use rand::Rng;

use crate::dns::message::{self, ParsedMessage};
use crate::dns::record::RecordType;
use crate::dns::socket_factory::{QuerySocket, SocketFactory};

pub(crate) enum QueryStatus {
    Active,
    Done(ParsedMessage),
    NeedsTcpRetry,
    Errored,
}

pub(crate) struct ActiveQuery {
    pub(crate) server: SocketAddr,
    id: u16,
    is_tcp: bool,
    socket: QuerySocket,
    out: Vec<u8>,
    out_sent: usize,
    in_buf: Vec<u8>,
    tcp_expected: Option<u16>,
    pub(crate) status: QueryStatus,
}

impl ActiveQuery {
    pub(crate) fn spawn(
        poll: &mut Poll,
        token: Token,
        name: &str,
        qtype: RecordType,
        server: SocketAddr,
        force_tcp: bool,
        factory: &dyn SocketFactory,
    ) -> io::Result<Self> {
        let id: u16 = rand::rng().random();
        let payload = message::encode_query(id, qtype, name);
        let (mut socket, out, is_tcp) = if force_tcp {
            let stream = factory.connect_tcp(server)?;
            let mut framed = Vec::with_capacity(payload.len() + 2);
            framed.extend_from_slice(&(payload.len() as u16).to_be_bytes());
            framed.extend_from_slice(&payload);
            (QuerySocket::Tcp(stream), framed, true)
        } else {
            let udp = factory.bind_udp(server)?;
            udp.connect(server)?;
            (QuerySocket::Udp(udp), payload.to_vec(), false)
        };
        socket.register(poll.registry(), token, mio::Interest::READABLE.add(mio::Interest::WRITABLE))?;
        Ok(ActiveQuery {
            server,
            id,
            is_tcp,
            socket,
            out,
            out_sent: 0,
            in_buf: Vec::new(),
            tcp_expected: None,
            status: QueryStatus::Active,
        })
    }

    /// Advances this query's transport: flushes any unsent query bytes,
    /// drains whatever the server has sent back, and parses a complete
    /// response once one has fully arrived.
    pub(crate) fn step(&mut self, qtype: RecordType) {
        if !matches!(self.status, QueryStatus::Active) {
            return;
        }

        if self.out_sent < self.out.len() {
            match self.socket.send(&self.out[self.out_sent..]) {
                Ok(n) => self.out_sent += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(_) => {
                    self.status = QueryStatus::Errored;
                    return;
                }
            }
        }

        let mut scratch = [0u8; 2048];
        loop {
            match self.socket.recv(&mut scratch) {
                Ok(0) if self.is_tcp => {
                    self.status = QueryStatus::Errored;
                    return;
                }
                Ok(0) => break,
                Ok(n) => self.in_buf.extend_from_slice(&scratch[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => {
                    self.status = QueryStatus::Errored;
                    return;
                }
            }
        }

        let packet: &[u8] = if self.is_tcp {
            if self.tcp_expected.is_none() && self.in_buf.len() >= 2 {
                self.tcp_expected = Some(u16::from_be_bytes([self.in_buf[0], self.in_buf[1]]));
            }
            match self.tcp_expected {
                Some(len) if self.in_buf.len() >= 2 + len as usize => &self.in_buf[2..2 + len as usize],
                _ => return,
            }
        } else if self.in_buf.is_empty() {
            return;
        } else {
            &self.in_buf
        };

        match message::parse(packet, self.id, qtype) {
            Ok(parsed) => {
                self.status = if parsed.truncated && !self.is_tcp {
                    QueryStatus::NeedsTcpRetry
                } else {
                    QueryStatus::Done(parsed)
                };
            }
            Err(_) => self.status = QueryStatus::Errored,
        }
    }
}
