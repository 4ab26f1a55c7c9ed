use std::net::SocketAddr;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ionet::{Error, ErrorCode, NetDriver, NetHandler, TcpHandle, UdpHandle};

#[derive(Debug)]
enum Event {
  Accepted { listener: TcpHandle, accepted: TcpHandle },
  Received { link: TcpHandle, packet: Vec<u8> },
  Disconnected { link: TcpHandle },
  Failed { link: TcpHandle, code: ErrorCode },
}

/// Forwards every callback into a channel the test thread drains.
struct Recorder {
  tx: Mutex<Sender<Event>>,
}

impl Recorder {
  fn new() -> (Arc<Self>, Receiver<Event>) {
    let (tx, rx) = channel();
    (Arc::new(Self { tx: Mutex::new(tx) }), rx)
  }

  fn send(&self, event: Event) {
    let _ = self.tx.lock().unwrap().send(event);
  }
}

impl NetHandler for Recorder {
  fn on_accepted(&self, listener: TcpHandle, accepted: TcpHandle) {
    self.send(Event::Accepted { listener, accepted });
  }

  fn on_received(&self, link: TcpHandle, packet: &[u8]) {
    self.send(Event::Received { link, packet: packet.to_vec() });
  }

  fn on_disconnected(&self, link: TcpHandle) {
    self.send(Event::Disconnected { link });
  }

  fn on_error(&self, link: TcpHandle, code: ErrorCode) {
    self.send(Event::Failed { link, code });
  }

  fn on_datagram(&self, _: UdpHandle, _: &[u8], _: SocketAddr) {}
  fn on_datagram_error(&self, _: UdpHandle, _: ErrorCode) {}
}

fn loopback() -> SocketAddr {
  "127.0.0.1:0".parse().unwrap()
}

fn next_event(rx: &Receiver<Event>) -> Event {
  rx.recv_timeout(Duration::from_secs(5)).expect("no event within timeout")
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
  (0..len).map(|i| (i as u8).wrapping_mul(17).wrapping_add(seed)).collect()
}

/// Binds a listener and returns it together with its bound address.
fn listening_link(
  driver: &NetDriver,
  handler: Arc<Recorder>,
) -> (TcpHandle, SocketAddr) {
  let server = driver.tcp_create(handler, loopback()).unwrap();
  driver.tcp_listen(server).unwrap();
  let addr = driver.tcp_local_addr(server).unwrap();
  (server, addr)
}

#[test]
fn accept_send_receive_roundtrip() {
  let driver = NetDriver::startup().unwrap();
  let (handler, rx) = Recorder::new();

  let (server, server_addr) = listening_link(&driver, handler.clone());
  let client = driver.tcp_create(handler.clone(), loopback()).unwrap();
  driver.tcp_connect(client, server_addr).unwrap();

  let accepted = match next_event(&rx) {
    Event::Accepted { listener, accepted } => {
      assert_eq!(listener, server);
      accepted
    }
    other => panic!("expected accept, got {other:?}"),
  };

  driver.tcp_send(client, b"hello").unwrap();
  match next_event(&rx) {
    Event::Received { link, packet } => {
      assert_eq!(link, accepted);
      assert_eq!(packet, b"hello");
    }
    other => panic!("expected message, got {other:?}"),
  }

  driver.tcp_send(accepted, b"world").unwrap();
  match next_event(&rx) {
    Event::Received { link, packet } => {
      assert_eq!(link, client);
      assert_eq!(packet, b"world");
    }
    other => panic!("expected reply, got {other:?}"),
  }
}

#[test]
fn three_messages_arrive_in_order() {
  let driver = NetDriver::startup().unwrap();
  let (handler, rx) = Recorder::new();

  let (_server, server_addr) = listening_link(&driver, handler.clone());
  let client = driver.tcp_create(handler.clone(), loopback()).unwrap();
  driver.tcp_connect(client, server_addr).unwrap();

  let accepted = match next_event(&rx) {
    Event::Accepted { accepted, .. } => accepted,
    other => panic!("expected accept, got {other:?}"),
  };

  // 70000 bytes exceeds one 64 KiB buffer, so the middle message exercises
  // the multi-segment send path and chunked reassembly.
  let payloads =
    [pattern(10, 1), pattern(70_000, 2), pattern(5, 3)];
  for payload in &payloads {
    driver.tcp_send(client, payload).unwrap();
  }

  for expected in &payloads {
    match next_event(&rx) {
      Event::Received { link, packet } => {
        assert_eq!(link, accepted);
        assert_eq!(&packet, expected);
      }
      other => panic!("expected message, got {other:?}"),
    }
  }
}

#[test]
fn peer_close_fires_disconnect_exactly_once() {
  let driver = NetDriver::startup().unwrap();
  let (handler, rx) = Recorder::new();

  let (_server, server_addr) = listening_link(&driver, handler.clone());
  let client = driver.tcp_create(handler.clone(), loopback()).unwrap();
  driver.tcp_connect(client, server_addr).unwrap();

  let accepted = match next_event(&rx) {
    Event::Accepted { accepted, .. } => accepted,
    other => panic!("expected accept, got {other:?}"),
  };

  // Destroying the client closes its socket; the server side observes a
  // zero-length receive.
  driver.tcp_destroy(client).unwrap();
  match next_event(&rx) {
    Event::Disconnected { link } => assert_eq!(link, accepted),
    other => panic!("expected disconnect, got {other:?}"),
  }

  // Exactly once: nothing else follows, in particular no empty receive.
  assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
  assert!(matches!(driver.tcp_send(accepted, b"x"), Err(Error::NotFound)));
}

#[test]
fn bad_magic_tears_the_link_down() {
  let driver = NetDriver::startup().unwrap();
  let (handler, rx) = Recorder::new();

  let (_server, server_addr) = listening_link(&driver, handler.clone());

  // A raw client that does not speak the framing protocol.
  let mut raw = std::net::TcpStream::connect(server_addr).unwrap();
  let accepted = match next_event(&rx) {
    Event::Accepted { accepted, .. } => accepted,
    other => panic!("expected accept, got {other:?}"),
  };

  use std::io::Write;
  raw.write_all(&[0xaa; 16]).unwrap();
  raw.flush().unwrap();

  match next_event(&rx) {
    Event::Failed { link, code } => {
      assert_eq!(link, accepted);
      assert_eq!(code, ErrorCode::Protocol);
    }
    other => panic!("expected protocol error, got {other:?}"),
  }
  // No partially parsed payload was delivered and the link is gone.
  assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
  assert!(matches!(driver.tcp_send(accepted, b"x"), Err(Error::NotFound)));
}

#[test]
fn reported_addresses_match() {
  let driver = NetDriver::startup().unwrap();
  let (handler, rx) = Recorder::new();

  let (_server, server_addr) = listening_link(&driver, handler.clone());
  let client = driver.tcp_create(handler.clone(), loopback()).unwrap();
  driver.tcp_connect(client, server_addr).unwrap();

  let accepted = match next_event(&rx) {
    Event::Accepted { accepted, .. } => accepted,
    other => panic!("expected accept, got {other:?}"),
  };

  assert_eq!(driver.tcp_remote_addr(client).unwrap(), server_addr);
  assert_eq!(
    driver.tcp_local_addr(client).unwrap(),
    driver.tcp_remote_addr(accepted).unwrap()
  );
}

#[test]
fn oversize_payload_is_rejected_before_io() {
  let driver = NetDriver::startup().unwrap();
  let (handler, rx) = Recorder::new();

  let (_server, server_addr) = listening_link(&driver, handler.clone());
  let client = driver.tcp_create(handler.clone(), loopback()).unwrap();
  driver.tcp_connect(client, server_addr).unwrap();
  let _accepted = next_event(&rx);

  let oversize = vec![0u8; ionet::MAX_TCP_PACKET_SIZE + 1];
  assert!(matches!(
    driver.tcp_send(client, &oversize),
    Err(Error::InvalidParameter(_))
  ));
  assert!(matches!(driver.tcp_send(client, b""), Err(Error::InvalidParameter(_))));
  // The link is still healthy afterwards.
  driver.tcp_send(client, b"still alive").unwrap();
  match next_event(&rx) {
    Event::Received { packet, .. } => assert_eq!(packet, b"still alive"),
    other => panic!("expected message, got {other:?}"),
  }
}

#[test]
fn operations_on_unknown_handles_fail() {
  let driver = NetDriver::startup().unwrap();

  assert!(matches!(driver.tcp_listen(TcpHandle::INVALID), Err(Error::NotFound)));
  assert!(matches!(driver.tcp_destroy(TcpHandle::INVALID), Err(Error::NotFound)));
  assert!(matches!(
    driver.tcp_send(TcpHandle::INVALID, b"x"),
    Err(Error::NotFound)
  ));
  assert!(matches!(
    driver.tcp_connect(TcpHandle::INVALID, loopback()),
    Err(Error::NotFound)
  ));
  assert!(matches!(driver.tcp_local_addr(TcpHandle::INVALID), Err(Error::NotFound)));
}

#[test]
fn listen_twice_is_rejected() {
  let driver = NetDriver::startup().unwrap();
  let (handler, _rx) = Recorder::new();

  let (server, _addr) = listening_link(&driver, handler.clone());
  assert!(driver.tcp_listen(server).is_err());
}

#[test]
fn shutdown_is_idempotent() {
  let driver = NetDriver::startup().unwrap();
  let (handler, _rx) = Recorder::new();
  let _link = driver.tcp_create(handler, loopback()).unwrap();

  driver.shutdown();
  driver.shutdown();
  // Posting after shutdown fails cleanly instead of hanging.
  assert!(driver.tcp_create(Recorder::new().0, loopback()).is_err());
}
