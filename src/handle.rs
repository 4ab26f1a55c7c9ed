use std::fmt;

/// Largest payload accepted by [`NetDriver::tcp_send`](crate::NetDriver::tcp_send).
pub const MAX_TCP_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// Largest payload accepted by [`NetDriver::udp_send_to`](crate::NetDriver::udp_send_to).
pub const MAX_UDP_PACKET_SIZE: usize = 8 * 1024;

/// Opaque identifier for one TCP connection endpoint.
///
/// Handles are unique among live TCP links of one driver; `0` is reserved
/// invalid. TCP and UDP handle spaces are independent.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TcpHandle(pub(crate) u32);

/// Opaque identifier for one UDP endpoint.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct UdpHandle(pub(crate) u32);

impl TcpHandle {
  pub const INVALID: TcpHandle = TcpHandle(0);

  /// Raw integer value of the handle.
  pub fn get(self) -> u32 {
    self.0
  }

  pub fn is_valid(self) -> bool {
    self.0 != 0
  }
}

impl UdpHandle {
  pub const INVALID: UdpHandle = UdpHandle(0);

  pub fn get(self) -> u32 {
    self.0
  }

  pub fn is_valid(self) -> bool {
    self.0 != 0
  }
}

impl fmt::Display for TcpHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "tcp:{}", self.0)
  }
}

impl fmt::Display for UdpHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "udp:{}", self.0)
  }
}
