//! The resource manager: composes the dispatcher, the link registries and
//! the buffer pools behind the public handle-based API.
//!
//! A `NetDriver` is an explicitly constructed, explicitly owned context;
//! there is no process-wide singleton. Public calls validate their
//! parameters synchronously, post asynchronous work and return; everything
//! that happens later surfaces through the link's [`NetHandler`].

use std::{
  net::SocketAddr,
  sync::{Arc, Weak},
};

use socket2::{SockAddr, Socket};
use tracing::error;

use crate::{
  dispatcher::{Completion, Dispatcher, Op, OpBuf, Target},
  error::{Error, ErrorCode},
  handle::{MAX_TCP_PACKET_SIZE, MAX_UDP_PACKET_SIZE, TcpHandle, UdpHandle},
  handler::NetHandler,
  pool::{TcpBufPool, UdpBufPool},
  registry::Registry,
  tcp::TcpSock,
  udp::UdpSock,
};

// TCP and UDP handle spaces are independent; the dispatcher key carries the
// family in the upper bits.
const TCP_KEY_SPACE: u64 = 1 << 32;
const UDP_KEY_SPACE: u64 = 2 << 32;

fn tcp_key(handle: u32) -> u64 {
  TCP_KEY_SPACE | handle as u64
}

fn udp_key(handle: u32) -> u64 {
  UDP_KEY_SPACE | handle as u64
}

fn parallelism() -> usize {
  std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

struct DriverInner {
  dispatcher: Dispatcher,
  tcp: Registry<TcpSock>,
  udp: Registry<UdpSock>,
  tcp_pool: TcpBufPool,
  udp_pool: UdpBufPool,
}

/// The asynchronous networking engine.
///
/// Create one with [`startup`](NetDriver::startup); it owns the worker pool
/// and every link created through it. Dropping the driver (or calling
/// [`shutdown`](NetDriver::shutdown)) destroys all links and joins all
/// threads.
pub struct NetDriver {
  inner: Arc<DriverInner>,
}

impl NetDriver {
  /// Starts the completion dispatcher and its worker pool.
  pub fn startup() -> Result<Self, Error> {
    let inner = Arc::new(DriverInner {
      dispatcher: Dispatcher::new(),
      tcp: Registry::new(),
      udp: Registry::new(),
      tcp_pool: TcpBufPool::new(),
      udp_pool: UdpBufPool::new(),
    });
    let weak = Arc::downgrade(&inner);
    inner
      .dispatcher
      .init(Arc::new(move |completion| {
        if let Some(inner) = weak.upgrade() {
          inner.dispatch(completion);
        }
      }))
      .map_err(Error::Io)?;
    Ok(Self { inner })
  }

  /// Destroys every link and stops all worker threads. In-flight
  /// completions referencing destroyed links finish as silent no-ops.
  pub fn shutdown(&self) {
    for handle in self.inner.tcp.drain() {
      for buf in self.inner.dispatcher.unbind(tcp_key(handle)) {
        self.inner.recycle(buf);
      }
    }
    for handle in self.inner.udp.drain() {
      for buf in self.inner.dispatcher.unbind(udp_key(handle)) {
        self.inner.recycle(buf);
      }
    }
    self.inner.dispatcher.uninit();
  }

  /// Creates a TCP link bound to `addr` (port 0 requests an ephemeral
  /// port). The handler is shared by every callback of this link and is
  /// inherited by links accepted from it.
  pub fn tcp_create(
    &self,
    handler: Arc<dyn NetHandler>,
    addr: SocketAddr,
  ) -> Result<TcpHandle, Error> {
    let sock = TcpSock::create(handler)?;
    sock.bind(addr)?;
    let sock = Arc::new(sock);
    let handle =
      self.inner.tcp.add(Arc::clone(&sock)).ok_or(Error::HandleSpaceExhausted)?;
    if let Err(err) = self.inner.dispatcher.bind_socket(tcp_key(handle), sock.raw_fd()) {
      self.inner.tcp.remove(handle);
      return Err(Error::Io(err));
    }
    Ok(TcpHandle(handle))
  }

  /// Destroys a TCP link. In-flight operations are not cancelled; their
  /// completions find no registry entry and are dropped silently.
  pub fn tcp_destroy(&self, handle: TcpHandle) -> Result<(), Error> {
    if self.inner.remove_tcp(handle.0) { Ok(()) } else { Err(Error::NotFound) }
  }

  /// Starts listening and posts a backlog's worth of concurrent accepts.
  pub fn tcp_listen(&self, handle: TcpHandle) -> Result<(), Error> {
    let sock = self.inner.tcp.find(handle.0).ok_or(Error::NotFound)?;
    let backlog = 2 * parallelism();
    sock.listen(backlog as i32)?;
    for _ in 0..backlog {
      self.inner.post_tcp_accept(handle.0, &sock)?;
    }
    Ok(())
  }

  /// Performs the connect handshake (the one call allowed to block) and
  /// starts the steady-state receive loop.
  pub fn tcp_connect(&self, handle: TcpHandle, addr: SocketAddr) -> Result<(), Error> {
    let sock = self.inner.tcp.find(handle.0).ok_or(Error::NotFound)?;
    sock.connect(addr)?;
    self.inner.post_tcp_recv(handle.0, &sock)
  }

  /// Sends one framed message of up to 16 MiB. Oversize payloads are
  /// rejected before any I/O. If posting a middle segment fails, segments
  /// already posted stay in flight and the rest return to the pool.
  pub fn tcp_send(&self, handle: TcpHandle, packet: &[u8]) -> Result<(), Error> {
    if packet.is_empty() {
      return Err(Error::InvalidParameter("empty packet"));
    }
    if packet.len() > MAX_TCP_PACKET_SIZE {
      return Err(Error::InvalidParameter("packet exceeds 16 MiB"));
    }
    let sock = self.inner.tcp.find(handle.0).ok_or(Error::NotFound)?;
    let weak = Arc::downgrade(&sock);

    let mut first_failure = None;
    for mut buf in self.inner.tcp_pool.get_send_buffers(packet) {
      if first_failure.is_some() {
        self.inner.tcp_pool.return_send_buffer(buf);
        continue;
      }
      buf.link = handle.0;
      let op = Op { target: Target::Tcp(Weak::clone(&weak)), buf: OpBuf::Send(buf) };
      if let Err(failure) = self.inner.dispatcher.post(tcp_key(handle.0), op) {
        self.inner.recycle(failure.buf);
        first_failure = Some(failure.error);
      }
    }
    match first_failure {
      None => Ok(()),
      Some(err) => Err(Error::Post(err)),
    }
  }

  pub fn tcp_local_addr(&self, handle: TcpHandle) -> Result<SocketAddr, Error> {
    let sock = self.inner.tcp.find(handle.0).ok_or(Error::NotFound)?;
    Ok(sock.local_addr()?)
  }

  pub fn tcp_remote_addr(&self, handle: TcpHandle) -> Result<SocketAddr, Error> {
    let sock = self.inner.tcp.find(handle.0).ok_or(Error::NotFound)?;
    Ok(sock.peer_addr()?)
  }

  /// Creates a UDP link bound to `addr` and starts its receive loop.
  pub fn udp_create(
    &self,
    handler: Arc<dyn NetHandler>,
    addr: SocketAddr,
  ) -> Result<UdpHandle, Error> {
    self.udp_create_inner(handler, addr, false)
  }

  /// Like [`udp_create`](Self::udp_create), with `SO_BROADCAST` enabled.
  pub fn udp_create_broadcast(
    &self,
    handler: Arc<dyn NetHandler>,
    addr: SocketAddr,
  ) -> Result<UdpHandle, Error> {
    self.udp_create_inner(handler, addr, true)
  }

  fn udp_create_inner(
    &self,
    handler: Arc<dyn NetHandler>,
    addr: SocketAddr,
    broadcast: bool,
  ) -> Result<UdpHandle, Error> {
    let sock = UdpSock::create(handler, broadcast)?;
    sock.bind(addr)?;
    let sock = Arc::new(sock);
    let handle =
      self.inner.udp.add(Arc::clone(&sock)).ok_or(Error::HandleSpaceExhausted)?;
    if let Err(err) = self.inner.dispatcher.bind_socket(udp_key(handle), sock.raw_fd()) {
      self.inner.udp.remove(handle);
      return Err(Error::Io(err));
    }
    // Several receives stay outstanding so datagram bursts are not dropped
    // while one completion is being serviced.
    for _ in 0..parallelism() {
      if let Err(err) = self.inner.post_udp_recv(handle, &sock) {
        self.inner.remove_udp(handle);
        return Err(err);
      }
    }
    Ok(UdpHandle(handle))
  }

  pub fn udp_destroy(&self, handle: UdpHandle) -> Result<(), Error> {
    if self.inner.remove_udp(handle.0) { Ok(()) } else { Err(Error::NotFound) }
  }

  /// Sends one datagram of up to 8 KiB to `to`.
  pub fn udp_send_to(
    &self,
    handle: UdpHandle,
    packet: &[u8],
    to: SocketAddr,
  ) -> Result<(), Error> {
    if packet.is_empty() {
      return Err(Error::InvalidParameter("empty packet"));
    }
    if packet.len() > MAX_UDP_PACKET_SIZE {
      return Err(Error::InvalidParameter("packet exceeds 8 KiB"));
    }
    let sock = self.inner.udp.find(handle.0).ok_or(Error::NotFound)?;
    let mut buf = self.inner.udp_pool.get_send_buffer();
    buf.link = handle.0;
    buf.fill(packet, SockAddr::from(to));
    let op = Op { target: Target::Udp(Arc::downgrade(&sock)), buf: OpBuf::UdpSend(buf) };
    self.inner.dispatcher.post(udp_key(handle.0), op).map_err(|failure| {
      self.inner.recycle(failure.buf);
      Error::Post(failure.error)
    })
  }

  pub fn udp_local_addr(&self, handle: UdpHandle) -> Result<SocketAddr, Error> {
    let sock = self.inner.udp.find(handle.0).ok_or(Error::NotFound)?;
    Ok(sock.local_addr()?)
  }
}

impl Drop for NetDriver {
  fn drop(&mut self) {
    self.shutdown();
  }
}

impl DriverInner {
  /// Routes one completion by the kind tag of its buffer. Runs on the
  /// dispatcher's worker threads.
  fn dispatch(&self, completion: Completion) {
    match completion {
      Completion::TcpAccept(buf) => self.on_tcp_accept(buf),
      Completion::TcpSend(buf) => self.tcp_pool.return_send_buffer(buf),
      Completion::TcpRecv(buf) => self.on_tcp_recv(buf),
      Completion::UdpSend(buf) => self.udp_pool.return_send_buffer(buf),
      Completion::UdpRecv(buf) => self.on_udp_recv(buf),
      // Sentinels terminate the worker loop before routing.
      Completion::Shutdown => {}
    }
  }

  fn on_tcp_accept(&self, mut buf: crate::buffer::AcceptBuf) {
    let listen_handle = buf.link;
    let Some(listener) = self.tcp.find(listen_handle) else {
      // The listener is gone; the late completion is a silent no-op.
      self.tcp_pool.return_accept_buffer(buf);
      return;
    };
    if let Some((socket, _peer)) = buf.accepted.take() {
      self.register_accepted(listen_handle, &listener, socket);
    }

    // The buffer goes straight back out as the replacement accept.
    buf.reset();
    buf.link = listen_handle;
    let op =
      Op { target: Target::Tcp(Arc::downgrade(&listener)), buf: OpBuf::Accept(buf) };
    if let Err(failure) = self.dispatcher.post(tcp_key(listen_handle), op) {
      error!(handle = listen_handle, err = %failure.error, "accept re-post failed");
      self.recycle(failure.buf);
      self.tcp_error(listen_handle, listener.handler(), ErrorCode::PostAccept);
    }
  }

  /// Registers an accepted socket, starts its receive loop and only then
  /// notifies the handler, so the new link is usable from the callback.
  fn register_accepted(
    &self,
    listen_handle: u32,
    listener: &Arc<TcpSock>,
    socket: Socket,
  ) {
    let sock = TcpSock::from_accepted(socket, Arc::clone(listener.handler()));
    if let Err(err) = sock.set_accepted() {
      error!(%err, "failed to finalize accepted socket");
      return;
    }
    let sock = Arc::new(sock);
    let Some(handle) = self.tcp.add(Arc::clone(&sock)) else {
      error!("handle space exhausted, dropping accepted connection");
      return;
    };
    if let Err(err) = self.dispatcher.bind_socket(tcp_key(handle), sock.raw_fd()) {
      error!(%err, "failed to attach accepted socket");
      self.tcp.remove(handle);
      return;
    }
    let handler = Arc::clone(sock.handler());
    if let Err(Error::Post(err)) = self.post_tcp_recv(handle, &sock) {
      error!(handle, %err, "first receive post failed");
      self.tcp_error(handle, &handler, ErrorCode::PostRecv);
      return;
    }
    handler.on_accepted(TcpHandle(listen_handle), TcpHandle(handle));
  }

  fn on_tcp_recv(&self, mut buf: crate::buffer::RecvBuf) {
    let handle = buf.link;
    let Some(sock) = self.tcp.find(handle) else {
      self.tcp_pool.return_recv_buffer(buf);
      return;
    };
    let handler = Arc::clone(sock.handler());

    if buf.len == 0 {
      // Orderly peer shutdown: exactly one disconnect, then removal.
      self.tcp_pool.return_recv_buffer(buf);
      handler.on_disconnected(TcpHandle(handle));
      self.remove_tcp(handle);
      return;
    }

    let messages = match sock.consume(buf.received()) {
      Ok(messages) => messages,
      Err(bad) => {
        error!(handle, magic = bad.0, "framing magic mismatch");
        self.tcp_pool.return_recv_buffer(buf);
        self.tcp_error(handle, &handler, ErrorCode::Protocol);
        return;
      }
    };
    for message in &messages {
      handler.on_received(TcpHandle(handle), message);
    }

    // Keep exactly one receive outstanding.
    buf.reset();
    buf.link = handle;
    let op = Op { target: Target::Tcp(Arc::downgrade(&sock)), buf: OpBuf::Recv(buf) };
    if let Err(failure) = self.dispatcher.post(tcp_key(handle), op) {
      error!(handle, err = %failure.error, "receive re-post failed");
      self.recycle(failure.buf);
      self.tcp_error(handle, &handler, ErrorCode::PostRecv);
    }
  }

  fn on_udp_recv(&self, mut buf: crate::buffer::UdpRecvBuf) {
    let handle = buf.link;
    let Some(sock) = self.udp.find(handle) else {
      self.udp_pool.return_recv_buffer(buf);
      return;
    };
    let handler = Arc::clone(sock.handler());

    if let Some(from) = buf.from {
      handler.on_datagram(UdpHandle(handle), buf.received(), from);
    }

    buf.reset();
    buf.link = handle;
    let op = Op { target: Target::Udp(Arc::downgrade(&sock)), buf: OpBuf::UdpRecv(buf) };
    if let Err(failure) = self.dispatcher.post(udp_key(handle), op) {
      error!(handle, err = %failure.error, "datagram receive re-post failed");
      self.recycle(failure.buf);
      handler.on_datagram_error(UdpHandle(handle), ErrorCode::PostRecv);
      self.remove_udp(handle);
    }
  }

  fn post_tcp_accept(&self, handle: u32, sock: &Arc<TcpSock>) -> Result<(), Error> {
    let mut buf = self.tcp_pool.get_accept_buffer();
    buf.link = handle;
    let op = Op { target: Target::Tcp(Arc::downgrade(sock)), buf: OpBuf::Accept(buf) };
    self.dispatcher.post(tcp_key(handle), op).map_err(|failure| {
      self.recycle(failure.buf);
      Error::Post(failure.error)
    })
  }

  fn post_tcp_recv(&self, handle: u32, sock: &Arc<TcpSock>) -> Result<(), Error> {
    let mut buf = self.tcp_pool.get_recv_buffer();
    buf.link = handle;
    let op = Op { target: Target::Tcp(Arc::downgrade(sock)), buf: OpBuf::Recv(buf) };
    self.dispatcher.post(tcp_key(handle), op).map_err(|failure| {
      self.recycle(failure.buf);
      Error::Post(failure.error)
    })
  }

  fn post_udp_recv(&self, handle: u32, sock: &Arc<UdpSock>) -> Result<(), Error> {
    let mut buf = self.udp_pool.get_recv_buffer();
    buf.link = handle;
    let op = Op { target: Target::Udp(Arc::downgrade(sock)), buf: OpBuf::UdpRecv(buf) };
    self.dispatcher.post(udp_key(handle), op).map_err(|failure| {
      self.recycle(failure.buf);
      Error::Post(failure.error)
    })
  }

  /// Fires the terminal error callback, then removes the link.
  fn tcp_error(&self, handle: u32, handler: &Arc<dyn NetHandler>, code: ErrorCode) {
    error!(handle, %code, "tcp link error");
    handler.on_error(TcpHandle(handle), code);
    self.remove_tcp(handle);
  }

  fn remove_tcp(&self, handle: u32) -> bool {
    if self.tcp.remove(handle).is_none() {
      return false;
    }
    for buf in self.dispatcher.unbind(tcp_key(handle)) {
      self.recycle(buf);
    }
    true
  }

  fn remove_udp(&self, handle: u32) -> bool {
    if self.udp.remove(handle).is_none() {
      return false;
    }
    for buf in self.dispatcher.unbind(udp_key(handle)) {
      self.recycle(buf);
    }
    true
  }

  /// Returns a buffer that never ran to its pool.
  fn recycle(&self, buf: OpBuf) {
    match buf {
      OpBuf::Accept(buf) => self.tcp_pool.return_accept_buffer(buf),
      OpBuf::Send(buf) => self.tcp_pool.return_send_buffer(buf),
      OpBuf::Recv(buf) => self.tcp_pool.return_recv_buffer(buf),
      OpBuf::UdpSend(buf) => self.udp_pool.return_send_buffer(buf),
      OpBuf::UdpRecv(buf) => self.udp_pool.return_recv_buffer(buf),
    }
  }
}
