//! Pooled, kind-tagged I/O buffers.
//!
//! Every buffer records the handle of the link that owns the operation and
//! how many bytes have been transferred. The operation kind rides as the
//! enum wrapping the buffer (`OpBuf`/`Completion` in the dispatcher); that
//! tag is what completions are routed by. Buffers are recycled through
//! [`pool`](crate::pool) rather than allocated per operation.

use std::net::SocketAddr;

use socket2::{SockAddr, Socket};

/// Capacity of one TCP send/receive buffer.
pub(crate) const TCP_BUFFER_SIZE: usize = 64 * 1024;

/// Capacity of one UDP buffer; also the largest datagram payload.
pub(crate) const UDP_BUFFER_SIZE: usize = 8 * 1024;

/// Bookkeeping buffer for one outstanding accept operation.
///
/// The accepted OS socket is produced at completion time by `accept(2)` and
/// moved in by value; it never crosses the asynchronous boundary as a
/// borrowed pointer.
pub(crate) struct AcceptBuf {
  /// Handle of the listening link this accept was posted for.
  pub link: u32,
  /// Accepted socket and peer address, filled by the completion.
  pub accepted: Option<(Socket, SockAddr)>,
}

impl AcceptBuf {
  pub fn new() -> Self {
    Self { link: 0, accepted: None }
  }

  pub fn reset(&mut self) {
    self.link = 0;
    self.accepted = None;
  }
}

/// One TCP send segment. Only the first segment of a logical send carries
/// the frame header.
pub(crate) struct SendBuf {
  pub link: u32,
  data: Box<[u8]>,
  /// Valid bytes to transmit.
  len: usize,
  /// Bytes already written to the socket (partial-write progress).
  pub sent: usize,
}

impl SendBuf {
  pub fn new() -> Self {
    Self { link: 0, data: vec![0u8; TCP_BUFFER_SIZE].into_boxed_slice(), len: 0, sent: 0 }
  }

  /// Copies `src` into the buffer at `offset` and extends the valid length.
  pub fn write_at(&mut self, offset: usize, src: &[u8]) {
    self.data[offset..offset + src.len()].copy_from_slice(src);
    self.len = self.len.max(offset + src.len());
  }

  pub fn filled(&self) -> &[u8] {
    &self.data[..self.len]
  }

  /// Bytes still to be written to the socket.
  pub fn unsent(&self) -> &[u8] {
    &self.data[self.sent..self.len]
  }

  pub fn is_fully_sent(&self) -> bool {
    self.sent >= self.len
  }

  pub fn reset(&mut self) {
    self.link = 0;
    self.len = 0;
    self.sent = 0;
  }
}

/// One TCP receive buffer; `len` is the completed transfer size, with zero
/// meaning orderly peer shutdown.
pub(crate) struct RecvBuf {
  pub link: u32,
  data: Box<[u8]>,
  pub len: usize,
}

impl RecvBuf {
  pub fn new() -> Self {
    Self { link: 0, data: vec![0u8; TCP_BUFFER_SIZE].into_boxed_slice(), len: 0 }
  }

  /// Whole capacity, handed to the receive syscall.
  pub fn space(&mut self) -> &mut [u8] {
    &mut self.data
  }

  pub fn received(&self) -> &[u8] {
    &self.data[..self.len]
  }

  pub fn reset(&mut self) {
    self.link = 0;
    self.len = 0;
  }
}

/// One outgoing datagram with its destination.
pub(crate) struct UdpSendBuf {
  pub link: u32,
  data: Box<[u8]>,
  len: usize,
  pub to: Option<SockAddr>,
}

impl UdpSendBuf {
  pub fn new() -> Self {
    Self { link: 0, data: vec![0u8; UDP_BUFFER_SIZE].into_boxed_slice(), len: 0, to: None }
  }

  pub fn fill(&mut self, src: &[u8], to: SockAddr) {
    self.data[..src.len()].copy_from_slice(src);
    self.len = src.len();
    self.to = Some(to);
  }

  pub fn filled(&self) -> &[u8] {
    &self.data[..self.len]
  }

  pub fn reset(&mut self) {
    self.link = 0;
    self.len = 0;
    self.to = None;
  }
}

/// One incoming datagram with the sender's address.
pub(crate) struct UdpRecvBuf {
  pub link: u32,
  data: Box<[u8]>,
  pub len: usize,
  pub from: Option<SocketAddr>,
}

impl UdpRecvBuf {
  pub fn new() -> Self {
    Self { link: 0, data: vec![0u8; UDP_BUFFER_SIZE].into_boxed_slice(), len: 0, from: None }
  }

  pub fn space(&mut self) -> &mut [u8] {
    &mut self.data
  }

  pub fn received(&self) -> &[u8] {
    &self.data[..self.len]
  }

  pub fn reset(&mut self) {
    self.link = 0;
    self.len = 0;
    self.from = None;
  }
}
