//! S4/S5 — DNS A lookup and truncation-triggers-TCP-retry (spec §8).

mod util;

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, UdpSocket};
use std::thread;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use netreactor::dns::{resolve, DefaultSocketFactory, RecordData, RecordType, ServerConfig};

const A_CODE: u16 = 1;

fn a_response(id: u16, ip: Ipv4Addr, ttl: u32, truncated: bool) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u16(id);
    buf.put_u16(if truncated { 0x8200 } else { 0x8000 });
    buf.put_u16(1); // qdcount
    buf.put_u16(if truncated { 0 } else { 1 }); // ancount
    buf.put_u16(0);
    buf.put_u16(0);
    encode_name(&mut buf, "example.test");
    buf.put_u16(A_CODE);
    buf.put_u16(1);
    if !truncated {
        encode_name(&mut buf, "example.test");
        buf.put_u16(A_CODE);
        buf.put_u16(1);
        buf.put_u32(ttl);
        buf.put_u16(4);
        buf.extend_from_slice(&ip.octets());
    }
    buf.to_vec()
}

fn encode_name(buf: &mut BytesMut, name: &str) {
    for label in name.split('.') {
        buf.put_u8(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.put_u8(0);
}

#[test]
fn resolves_a_record_over_udp() {
    util::init();
    let server = UdpSocket::bind("127.0.0.1:0").expect("bind mock dns server");
    let server_addr = server.local_addr().unwrap();

    thread::spawn(move || {
        let mut buf = [0u8; 512];
        let (n, from) = server.recv_from(&mut buf).expect("recv query");
        let id = u16::from_be_bytes([buf[0], buf[1]]);
        let _ = n;
        let reply = a_response(id, Ipv4Addr::new(192, 0, 2, 7), 60, false);
        server.send_to(&reply, from).expect("send reply");
    });

    let factory = DefaultSocketFactory;
    let records = resolve(
        "example.test",
        RecordType::A,
        &[ServerConfig::udp(server_addr)],
        &factory,
        Duration::from_secs(5),
    )
    .expect("resolve");

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].data, RecordData::A(Ipv4Addr::new(192, 0, 2, 7)));
    assert_eq!(records[0].ttl, 60);
}

#[test]
fn truncated_udp_answer_falls_back_to_tcp() {
    util::init();
    let udp = UdpSocket::bind("127.0.0.1:0").expect("bind mock dns udp server");
    let addr: SocketAddr = udp.local_addr().unwrap();
    // Reuse the same port number for a TCP listener: UDP and TCP occupy
    // independent port spaces, so this does not conflict.
    let tcp = TcpListener::bind(addr).expect("bind mock dns tcp server on same port");

    thread::spawn(move || {
        let mut buf = [0u8; 512];
        let (_n, from) = udp.recv_from(&mut buf).expect("recv udp query");
        let id = u16::from_be_bytes([buf[0], buf[1]]);
        let reply = a_response(id, Ipv4Addr::new(0, 0, 0, 0), 0, true);
        udp.send_to(&reply, from).expect("send truncated reply");
    });
    thread::spawn(move || {
        let (mut stream, _peer) = tcp.accept().expect("accept tcp retry");
        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).expect("read length prefix");
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut query = vec![0u8; len];
        stream.read_exact(&mut query).expect("read query body");
        let id = u16::from_be_bytes([query[0], query[1]]);

        let reply = a_response(id, Ipv4Addr::new(198, 51, 100, 9), 30, false);
        let mut framed = Vec::with_capacity(reply.len() + 2);
        framed.extend_from_slice(&(reply.len() as u16).to_be_bytes());
        framed.extend_from_slice(&reply);
        stream.write_all(&framed).expect("send tcp reply");
    });

    let factory = DefaultSocketFactory;
    let records = resolve(
        "example.test",
        RecordType::A,
        &[ServerConfig::udp(addr)],
        &factory,
        Duration::from_secs(5),
    )
    .expect("resolve");

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].data, RecordData::A(Ipv4Addr::new(198, 51, 100, 9)));
    assert_eq!(records[0].ttl, 30);
}
