use std::{fmt, io};

/// Synchronous failure of a public [`NetDriver`](crate::NetDriver) operation.
///
/// Only the synchronous portion of a call is reported here; outcomes of the
/// asynchronous phase surface exclusively through the
/// [`NetHandler`](crate::NetHandler) callbacks.
#[derive(Debug)]
pub enum Error {
  /// A parameter was rejected before any I/O was issued (oversized payload,
  /// empty packet, invalid state transition).
  InvalidParameter(&'static str),
  /// No live link is registered under the given handle.
  NotFound,
  /// The 32-bit handle space of this driver is fully occupied.
  HandleSpaceExhausted,
  /// The OS declined to queue the operation. Buffers already handed to the
  /// pool have been returned.
  Post(io::Error),
  /// A socket-level failure during the synchronous part of a call.
  Io(io::Error),
}

impl std::error::Error for Error {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      Self::Post(err) | Self::Io(err) => Some(err),
      _ => None,
    }
  }
}

impl fmt::Display for Error {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::InvalidParameter(what) => write!(f, "invalid parameter: {what}"),
      Self::NotFound => f.write_str("no such handle"),
      Self::HandleSpaceExhausted => f.write_str("handle space exhausted"),
      Self::Post(err) => write!(f, "failed to post operation: {err}"),
      Self::Io(err) => err.fmt(f),
    }
  }
}

impl From<io::Error> for Error {
  fn from(err: io::Error) -> Self {
    Self::Io(err)
  }
}

/// Cause delivered through [`NetHandler::on_error`](crate::NetHandler::on_error)
/// and [`NetHandler::on_datagram_error`](crate::NetHandler::on_datagram_error).
///
/// The link is removed from the registry immediately after the callback fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
  /// Re-posting an accept operation on a listener failed.
  PostAccept = 1,
  /// The framing magic of an incoming stream did not match.
  Protocol = 3,
  /// Re-posting the steady-state receive failed.
  PostRecv = 4,
}

impl fmt::Display for ErrorCode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::PostAccept => f.write_str("accept re-post failed"),
      Self::Protocol => f.write_str("protocol violation"),
      Self::PostRecv => f.write_str("receive re-post failed"),
    }
  }
}
