//! TCP socket wrapper: one OS socket, its connection state and the
//! per-connection reassembly state.

use std::{
  io,
  mem::MaybeUninit,
  net::SocketAddr,
  os::fd::{AsRawFd, RawFd},
  sync::Arc,
};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::error;

use crate::{
  frame::{BadMagic, FrameAssembler},
  handler::NetHandler,
  sync::Mutex,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TcpState {
  Created,
  Bound,
  Listening,
  Connected,
}

pub(crate) struct TcpSock {
  socket: Socket,
  handler: Arc<dyn NetHandler>,
  state: Mutex<TcpState>,
  /// Reassembly state. Serialized by construction: exactly one receive is
  /// outstanding per connection, so the lock is never contended.
  assembler: Mutex<FrameAssembler>,
}

impl TcpSock {
  /// Allocates the OS socket and records the notification target.
  pub fn create(handler: Arc<dyn NetHandler>) -> io::Result<Self> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    Ok(Self {
      socket,
      handler,
      state: Mutex::new(TcpState::Created),
      assembler: Mutex::new(FrameAssembler::new()),
    })
  }

  /// Wraps a socket produced by an accept completion. The socket is owned
  /// and moved in; [`set_accepted`](Self::set_accepted) finalizes it.
  pub fn from_accepted(socket: Socket, handler: Arc<dyn NetHandler>) -> Self {
    Self {
      socket,
      handler,
      state: Mutex::new(TcpState::Created),
      assembler: Mutex::new(FrameAssembler::new()),
    }
  }

  /// Disables send coalescing and enables address reuse, then binds.
  pub fn bind(&self, addr: SocketAddr) -> io::Result<()> {
    let mut state = self.state.lock();
    if *state != TcpState::Created {
      error!(state = ?*state, "bind rejected: socket already bound");
      return Err(invalid_state("socket already bound"));
    }
    self.socket.set_tcp_nodelay(true)?;
    self.socket.set_reuse_address(true)?;
    self.socket.bind(&SockAddr::from(addr))?;
    *state = TcpState::Bound;
    Ok(())
  }

  pub fn listen(&self, backlog: i32) -> io::Result<()> {
    let mut state = self.state.lock();
    match *state {
      TcpState::Bound => {}
      other => {
        error!(state = ?other, "listen rejected");
        return Err(invalid_state("listen requires a bound, idle socket"));
      }
    }
    self.socket.listen(backlog)?;
    self.socket.set_nonblocking(true)?;
    *state = TcpState::Listening;
    Ok(())
  }

  /// Performs the connect handshake. This is the one operation allowed to
  /// block the calling thread.
  pub fn connect(&self, addr: SocketAddr) -> io::Result<()> {
    let mut state = self.state.lock();
    match *state {
      TcpState::Bound => {}
      other => {
        error!(state = ?other, "connect rejected");
        return Err(invalid_state("connect requires a bound, idle socket"));
      }
    }
    self.socket.connect(&SockAddr::from(addr))?;
    self.socket.set_nonblocking(true)?;
    *state = TcpState::Connected;
    Ok(())
  }

  /// Finalizes a socket produced by an accept completion: it inherits the
  /// listening socket's options and is marked connected.
  pub fn set_accepted(&self) -> io::Result<()> {
    let mut state = self.state.lock();
    if *state != TcpState::Created {
      return Err(invalid_state("socket is not a fresh accepted socket"));
    }
    self.socket.set_tcp_nodelay(true)?;
    self.socket.set_nonblocking(true)?;
    *state = TcpState::Connected;
    Ok(())
  }

  /// Non-blocking accept on a listening socket.
  pub fn accept(&self) -> io::Result<(Socket, SockAddr)> {
    let (socket, peer) = self.socket.accept()?;
    Ok((socket, peer))
  }

  /// Non-blocking send; returns the number of bytes written.
  pub fn send(&self, data: &[u8]) -> io::Result<usize> {
    self.socket.send(data)
  }

  /// Non-blocking receive into `space`; zero means orderly peer shutdown.
  pub fn recv(&self, space: &mut [u8]) -> io::Result<usize> {
    // SAFETY: `&mut [u8]` and `&mut [MaybeUninit<u8>]` have the same
    // layout, and recv only ever writes initialized bytes into it.
    let space = unsafe {
      &mut *(space as *mut [u8] as *mut [MaybeUninit<u8>])
    };
    self.socket.recv(space)
  }

  /// Feeds one raw receive chunk to the reassembly state machine and drains
  /// the messages it completed, in arrival order.
  pub fn consume(&self, chunk: &[u8]) -> Result<Vec<Vec<u8>>, BadMagic> {
    let mut assembler = self.assembler.lock();
    assembler.consume(chunk)?;
    Ok(assembler.take_messages())
  }

  pub fn local_addr(&self) -> io::Result<SocketAddr> {
    as_inet(self.socket.local_addr()?)
  }

  pub fn peer_addr(&self) -> io::Result<SocketAddr> {
    as_inet(self.socket.peer_addr()?)
  }

  pub fn handler(&self) -> &Arc<dyn NetHandler> {
    &self.handler
  }

  pub fn raw_fd(&self) -> RawFd {
    self.socket.as_raw_fd()
  }
}

fn as_inet(addr: SockAddr) -> io::Result<SocketAddr> {
  addr
    .as_socket()
    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-inet socket address"))
}

fn invalid_state(what: &'static str) -> io::Error {
  io::Error::new(io::ErrorKind::InvalidInput, what)
}
