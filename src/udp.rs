//! UDP socket wrapper: one datagram socket plus its notification target.

use std::{
  io,
  mem::MaybeUninit,
  net::SocketAddr,
  os::fd::{AsRawFd, RawFd},
  sync::Arc,
};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::handler::NetHandler;

pub(crate) struct UdpSock {
  socket: Socket,
  handler: Arc<dyn NetHandler>,
}

impl UdpSock {
  /// Allocates the OS socket; `broadcast` additionally enables
  /// `SO_BROADCAST` for subnet-wide datagrams.
  pub fn create(handler: Arc<dyn NetHandler>, broadcast: bool) -> io::Result<Self> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    if broadcast {
      socket.set_broadcast(true)?;
    }
    Ok(Self { socket, handler })
  }

  pub fn bind(&self, addr: SocketAddr) -> io::Result<()> {
    self.socket.bind(&SockAddr::from(addr))?;
    self.socket.set_nonblocking(true)?;
    Ok(())
  }

  /// Non-blocking single-datagram send.
  pub fn send_to(&self, data: &[u8], to: &SockAddr) -> io::Result<usize> {
    self.socket.send_to(data, to)
  }

  /// Non-blocking receive of one datagram with its sender.
  pub fn recv_from(&self, space: &mut [u8]) -> io::Result<(usize, SockAddr)> {
    // SAFETY: `&mut [u8]` and `&mut [MaybeUninit<u8>]` have the same
    // layout, and recv_from only ever writes initialized bytes into it.
    let space = unsafe {
      &mut *(space as *mut [u8] as *mut [MaybeUninit<u8>])
    };
    self.socket.recv_from(space)
  }

  pub fn local_addr(&self) -> io::Result<SocketAddr> {
    self.socket.local_addr()?.as_socket().ok_or_else(|| {
      io::Error::new(io::ErrorKind::InvalidData, "non-inet socket address")
    })
  }

  pub fn handler(&self) -> &Arc<dyn NetHandler> {
    &self.handler
  }

  pub fn raw_fd(&self) -> RawFd {
    self.socket.as_raw_fd()
  }
}
