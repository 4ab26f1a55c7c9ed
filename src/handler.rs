use std::net::SocketAddr;

use crate::{
  error::ErrorCode,
  handle::{TcpHandle, UdpHandle},
};

/// Notification interface implemented by the consumer of a
/// [`NetDriver`](crate::NetDriver).
///
/// One instance is shared per link (`Arc<dyn NetHandler>`), recorded at
/// `tcp_create`/`udp_create` time; links accepted from a listener inherit the
/// listener's handler. Callbacks run on the driver's worker threads, so
/// implementations must be `Send + Sync` and should not block for long.
///
/// At most one receive-path callback executes at a time per link: the next
/// receive is posted only after the previous completion has been fully
/// processed.
pub trait NetHandler: Send + Sync {
  /// A listening link accepted a new connection.
  ///
  /// `accepted` is fully registered and its receive loop is running before
  /// this fires, so it can be used for `tcp_send` from inside the callback.
  fn on_accepted(&self, listener: TcpHandle, accepted: TcpHandle);

  /// One complete reassembled message arrived on a TCP link.
  ///
  /// Fires once per framed message, never for a partial payload.
  fn on_received(&self, link: TcpHandle, packet: &[u8]);

  /// The peer closed the connection in an orderly fashion.
  ///
  /// Fires exactly once, from a zero-length receive; the link is removed
  /// right after.
  fn on_disconnected(&self, link: TcpHandle);

  /// A TCP link failed. The link is removed from the registry immediately
  /// after this returns.
  fn on_error(&self, link: TcpHandle, error: ErrorCode);

  /// One datagram arrived on a UDP link, with the sender's address.
  fn on_datagram(&self, link: UdpHandle, packet: &[u8], from: SocketAddr);

  /// A UDP link failed. The link is removed immediately after this returns.
  fn on_datagram_error(&self, link: UdpHandle, error: ErrorCode);
}
