//! # ionet - Handle-Based Async TCP/UDP Transport
//!
//! ionet is an asynchronous networking engine that serves many concurrent
//! connections from a fixed pool of worker threads, without a thread per
//! connection. Links are addressed by opaque integer handles and every
//! asynchronous outcome is delivered through a callback interface.
//!
//! ## Architecture
//!
//! - A [`NetDriver`] owns the engine: a completion dispatcher (poll loop +
//!   worker pool), one registry per protocol family and elastic buffer
//!   pools.
//! - Public calls validate synchronously, post asynchronous work and
//!   return. Results arrive later on the link's [`NetHandler`].
//! - TCP streams carry length-prefixed messages; the engine reassembles
//!   them across arbitrary fragmentation, so [`NetHandler::on_received`]
//!   always sees whole messages.
//! - Exactly one receive is outstanding per connection, re-posted after
//!   each completion, which serializes per-link callbacks by construction.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::net::SocketAddr;
//! use std::sync::Arc;
//!
//! use ionet::{ErrorCode, NetDriver, NetHandler, TcpHandle, UdpHandle};
//!
//! struct Echo {
//!     driver: Arc<NetDriver>,
//! }
//!
//! impl NetHandler for Echo {
//!     fn on_accepted(&self, listener: TcpHandle, accepted: TcpHandle) {
//!         println!("{listener} accepted {accepted}");
//!     }
//!
//!     fn on_received(&self, link: TcpHandle, packet: &[u8]) {
//!         // Echo every message back to its sender.
//!         let _ = self.driver.tcp_send(link, packet);
//!     }
//!
//!     fn on_disconnected(&self, link: TcpHandle) {
//!         println!("{link} went away");
//!     }
//!
//!     fn on_error(&self, link: TcpHandle, error: ErrorCode) {
//!         eprintln!("{link} failed: {error}");
//!     }
//!
//!     fn on_datagram(&self, _: UdpHandle, _: &[u8], _: SocketAddr) {}
//!     fn on_datagram_error(&self, _: UdpHandle, _: ErrorCode) {}
//! }
//!
//! fn main() -> Result<(), ionet::Error> {
//!     let driver = Arc::new(NetDriver::startup()?);
//!     let handler = Arc::new(Echo { driver: Arc::clone(&driver) });
//!
//!     let server = driver.tcp_create(handler, "0.0.0.0:9000".parse().unwrap())?;
//!     driver.tcp_listen(server)?;
//!
//!     // Accepted connections echo until the process exits.
//!     loop {
//!         std::thread::park();
//!     }
//! }
//! ```
//!
//! ## Threading
//!
//! Callbacks run on the driver's worker threads (2x the logical CPU count)
//! and must not block for long. Any worker may service any link; only the
//! per-link receive path is serialized. [`NetDriver::tcp_connect`] is the
//! single public call that blocks the caller, for the duration of the
//! handshake.
//!
//! ## Errors
//!
//! Public calls report only their synchronous outcome as a
//! [`Result`](std::result::Result); asynchronous failures surface through
//! [`NetHandler::on_error`] / [`NetHandler::on_datagram_error`], after which
//! the link is gone. Buffer and handle exhaustion degrade by growing, never
//! by failing, except at the absolute 32-bit handle ceiling.

mod buffer;
mod dispatcher;
mod driver;
mod error;
mod frame;
mod handle;
mod handler;
mod poller;
mod pool;
mod registry;
mod sync;
mod tcp;
mod udp;

pub use driver::NetDriver;
pub use error::{Error, ErrorCode};
pub use handle::{MAX_TCP_PACKET_SIZE, MAX_UDP_PACKET_SIZE, TcpHandle, UdpHandle};
pub use handler::NetHandler;
