//! S2/S3 — SOCKS5 CONNECT to a reachable and an unreachable origin (spec §8).

mod util;

use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::TcpStream as StdTcpStream;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use netreactor::socket::tcp::{TcpServer, TcpServerOwner, TcpSocket, TcpSocketOwner};
use netreactor::socket::socks5::Socks5Server;
use netreactor::socket::Socket;
use netreactor::Reactor;

struct Echo;

impl TcpSocketOwner for Echo {
    fn data_received(&mut self, reactor: &mut Reactor, socket: &Rc<RefCell<TcpSocket>>) {
        let bytes = Bytes::copy_from_slice(socket.borrow().read_buffer());
        let n = bytes.len();
        let _ = socket.borrow_mut().send(reactor, bytes);
        socket.borrow_mut().consume(n);
    }
}

struct EchoListener {
    echo: Rc<RefCell<Echo>>,
}

impl TcpServerOwner for EchoListener {
    fn incoming_tcp_connection(
        &mut self,
        _reactor: &mut Reactor,
        _server: &Rc<RefCell<TcpServer>>,
        socket: Rc<RefCell<TcpSocket>>,
        _extra_data: u64,
    ) {
        let owner: std::rc::Weak<RefCell<dyn TcpSocketOwner>> = Rc::downgrade(&self.echo);
        socket.borrow_mut().set_owner(owner);
    }
}

fn spawn_client(addr: std::net::SocketAddr, run: impl FnOnce(StdTcpStream) + Send + 'static) -> Arc<AtomicBool> {
    let done = Arc::new(AtomicBool::new(false));
    let done2 = done.clone();
    thread::spawn(move || {
        let stream = StdTcpStream::connect(addr).expect("connect to socks5 listener");
        run(stream);
        done2.store(true, Ordering::SeqCst);
    });
    done
}

#[test]
fn connect_to_reachable_origin_relays_bytes() {
    util::init();
    let mut reactor = Reactor::new().expect("reactor");

    let echo_server = TcpServer::bind(&mut reactor, util::any_loopback(), 16, 0).expect("bind echo");
    let echo_addr = echo_server.borrow().local_addr().expect("echo addr");
    let echo = Rc::new(RefCell::new(Echo));
    let echo_listener = Rc::new(RefCell::new(EchoListener { echo }));
    let owner: std::rc::Weak<RefCell<dyn TcpServerOwner>> = Rc::downgrade(&echo_listener);
    echo_server.borrow_mut().set_owner(owner);

    let socks = Socks5Server::bind(&mut reactor, util::any_loopback(), 16).expect("bind socks5");
    let socks_addr = socks.borrow().local_addr().expect("socks addr");

    let reply = Arc::new(std::sync::Mutex::new(Vec::new()));
    let echoed = Arc::new(std::sync::Mutex::new(Vec::new()));
    let reply2 = reply.clone();
    let echoed2 = echoed.clone();
    let done = spawn_client(socks_addr, move |mut stream| {
        stream.write_all(&[0x05, 0x01, 0x00]).unwrap();
        let mut greet_reply = [0u8; 2];
        stream.read_exact(&mut greet_reply).unwrap();
        assert_eq!(greet_reply, [0x05, 0x00]);

        let std::net::IpAddr::V4(v4) = echo_addr.ip() else { panic!("expected ipv4 loopback") };
        let mut req = vec![0x05, 0x01, 0x00, 0x01];
        req.extend_from_slice(&v4.octets());
        req.extend_from_slice(&echo_addr.port().to_be_bytes());
        stream.write_all(&req).unwrap();

        let mut connect_reply = [0u8; 10];
        stream.read_exact(&mut connect_reply).unwrap();
        *reply2.lock().unwrap() = connect_reply.to_vec();

        stream.write_all(b"hello-through-proxy").unwrap();
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).unwrap();
        *echoed2.lock().unwrap() = buf[..n].to_vec();
    });

    util::run_until(&mut reactor, Duration::from_secs(5), || done.load(Ordering::SeqCst));

    let reply = reply.lock().unwrap();
    assert_eq!(reply[0], 0x05);
    assert_eq!(reply[1], 0x00, "expected success reply code");
    assert_eq!(reply[3], 0x01, "expected IPv4 bound address type");
    assert_eq!(*echoed.lock().unwrap(), b"hello-through-proxy");
}

#[test]
fn connect_to_unreachable_origin_replies_connection_refused() {
    util::init();
    let mut reactor = Reactor::new().expect("reactor");

    // Bind then immediately drop a listener to reserve a port nothing is
    // listening on; the OS will refuse connections to it.
    let closed_port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);
        port
    };
    let unreachable = util::loopback(closed_port);

    let socks = Socks5Server::bind(&mut reactor, util::any_loopback(), 16).expect("bind socks5");
    let socks_addr = socks.borrow().local_addr().expect("socks addr");

    let reply = Arc::new(std::sync::Mutex::new(Vec::new()));
    let reply2 = reply.clone();
    let done = spawn_client(socks_addr, move |mut stream| {
        stream.write_all(&[0x05, 0x01, 0x00]).unwrap();
        let mut greet_reply = [0u8; 2];
        stream.read_exact(&mut greet_reply).unwrap();
        assert_eq!(greet_reply, [0x05, 0x00]);

        let std::net::IpAddr::V4(v4) = unreachable.ip() else { panic!("expected ipv4 loopback") };
        let mut req = vec![0x05, 0x01, 0x00, 0x01];
        req.extend_from_slice(&v4.octets());
        req.extend_from_slice(&unreachable.port().to_be_bytes());
        stream.write_all(&req).unwrap();

        let mut connect_reply = [0u8; 10];
        stream.read_exact(&mut connect_reply).unwrap();
        *reply2.lock().unwrap() = connect_reply.to_vec();

        // The server closes the client connection after a failure reply.
        let mut buf = [0u8; 8];
        let n = stream.read(&mut buf).unwrap();
        assert_eq!(n, 0, "expected FIN after a failure reply");
    });

    util::run_until(&mut reactor, Duration::from_secs(5), || done.load(Ordering::SeqCst));

    let reply = reply.lock().unwrap();
    assert_eq!(
        reply.as_slice(),
        &[0x05, 0x05, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
        "expected connection-refused reply",
    );
}
