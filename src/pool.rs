//! Elastic per-kind buffer pools.
//!
//! Each buffer kind owns an independent free list behind its own lock, so
//! growth or shrink of one kind never blocks another. Taking a buffer never
//! fails: an empty free list expands by the kind's batch size instead of
//! blocking or erroring. Returning a buffer resets it, pushes it back and
//! then applies the narrowing policy: shrink to half if the free size
//! reached twice the baseline, shrink by one baseline if it merely exceeds
//! it, otherwise leave the list alone.

use tracing::debug;

use crate::{
  buffer::{AcceptBuf, RecvBuf, SendBuf, TCP_BUFFER_SIZE, UdpRecvBuf, UdpSendBuf},
  frame::{HEADER_SIZE, encode_header},
  sync::Mutex,
};

/// Accept buffers are expanded in batches of this many.
pub(crate) const ACCEPT_POOL_BATCH: usize = 64;

/// TCP/UDP send and receive buffers are expanded in batches of this many.
pub(crate) const IO_POOL_BATCH: usize = 1024;

/// Usable payload capacity of the first send segment; it alone carries the
/// frame header.
pub(crate) const FIRST_SEGMENT_CAPACITY: usize = TCP_BUFFER_SIZE - HEADER_SIZE;

/// Growth past this many batches is logged; there is no hard cap.
const GROWTH_WARN_BATCHES: usize = 8;

/// Number of send segments a payload of `size` bytes splits into.
pub(crate) fn send_segment_count(size: usize) -> usize {
  if size <= FIRST_SEGMENT_CAPACITY {
    1
  } else {
    1 + (size - FIRST_SEGMENT_CAPACITY).div_ceil(TCP_BUFFER_SIZE)
  }
}

/// Free list of one buffer kind. Lives behind the kind's mutex.
struct Shelf<T> {
  free: Vec<T>,
  batch: usize,
  allocated: usize,
}

impl<T> Shelf<T> {
  fn new(batch: usize, make: fn() -> T) -> Self {
    let mut shelf = Self { free: Vec::new(), batch, allocated: 0 };
    shelf.expand(make);
    shelf
  }

  fn expand(&mut self, make: fn() -> T) {
    self.free.reserve(self.batch);
    for _ in 0..self.batch {
      self.free.push(make());
    }
    self.allocated += self.batch;
    if self.allocated > GROWTH_WARN_BATCHES * self.batch {
      debug!(allocated = self.allocated, "buffer pool grew past its baseline");
    }
  }

  fn take(&mut self, make: fn() -> T) -> T {
    if self.free.is_empty() {
      self.expand(make);
    }
    self.free.pop().expect("expand left the free list empty")
  }

  fn take_many(&mut self, count: usize, make: fn() -> T) -> Vec<T> {
    while self.free.len() < count {
      self.expand(make);
    }
    self.free.split_off(self.free.len() - count)
  }

  fn put(&mut self, item: T) {
    self.free.push(item);
    self.narrow();
  }

  fn narrow(&mut self) {
    let now = self.free.len();
    let drop_count = if now >= 2 * self.batch {
      now / 2
    } else if now > self.batch {
      self.batch
    } else {
      0
    };
    if drop_count > 0 {
      self.free.truncate(now - drop_count);
      self.allocated -= drop_count;
    }
  }
}

/// Pools for the three TCP buffer kinds.
pub(crate) struct TcpBufPool {
  accept: Mutex<Shelf<AcceptBuf>>,
  send: Mutex<Shelf<SendBuf>>,
  recv: Mutex<Shelf<RecvBuf>>,
}

impl TcpBufPool {
  pub fn new() -> Self {
    Self {
      accept: Mutex::new(Shelf::new(ACCEPT_POOL_BATCH, AcceptBuf::new)),
      send: Mutex::new(Shelf::new(IO_POOL_BATCH, SendBuf::new)),
      recv: Mutex::new(Shelf::new(IO_POOL_BATCH, RecvBuf::new)),
    }
  }

  pub fn get_accept_buffer(&self) -> AcceptBuf {
    self.accept.lock().take(AcceptBuf::new)
  }

  pub fn get_recv_buffer(&self) -> RecvBuf {
    self.recv.lock().take(RecvBuf::new)
  }

  /// Takes and fills every segment of one logical send.
  ///
  /// Segment 0 starts with the frame header for the whole payload; the
  /// remaining segments carry raw payload bytes. Concatenating the filled
  /// regions (header stripped from segment 0) reproduces `packet` exactly.
  pub fn get_send_buffers(&self, packet: &[u8]) -> Vec<SendBuf> {
    let count = send_segment_count(packet.len());
    let mut buffers = self.send.lock().take_many(count, SendBuf::new);

    let first = packet.len().min(FIRST_SEGMENT_CAPACITY);
    buffers[0].write_at(0, &encode_header(packet.len() as u32));
    buffers[0].write_at(HEADER_SIZE, &packet[..first]);

    let mut offset = first;
    for buffer in &mut buffers[1..] {
      let take = (packet.len() - offset).min(TCP_BUFFER_SIZE);
      buffer.write_at(0, &packet[offset..offset + take]);
      offset += take;
    }
    buffers
  }

  pub fn return_accept_buffer(&self, mut buffer: AcceptBuf) {
    buffer.reset();
    self.accept.lock().put(buffer);
  }

  pub fn return_send_buffer(&self, mut buffer: SendBuf) {
    buffer.reset();
    self.send.lock().put(buffer);
  }

  pub fn return_recv_buffer(&self, mut buffer: RecvBuf) {
    buffer.reset();
    self.recv.lock().put(buffer);
  }

  #[cfg(test)]
  fn accept_free_count(&self) -> usize {
    self.accept.lock().free.len()
  }

  #[cfg(test)]
  fn send_free_count(&self) -> usize {
    self.send.lock().free.len()
  }
}

/// Pools for the two UDP buffer kinds.
pub(crate) struct UdpBufPool {
  send: Mutex<Shelf<UdpSendBuf>>,
  recv: Mutex<Shelf<UdpRecvBuf>>,
}

impl UdpBufPool {
  pub fn new() -> Self {
    Self {
      send: Mutex::new(Shelf::new(IO_POOL_BATCH, UdpSendBuf::new)),
      recv: Mutex::new(Shelf::new(IO_POOL_BATCH, UdpRecvBuf::new)),
    }
  }

  pub fn get_send_buffer(&self) -> UdpSendBuf {
    self.send.lock().take(UdpSendBuf::new)
  }

  pub fn get_recv_buffer(&self) -> UdpRecvBuf {
    self.recv.lock().take(UdpRecvBuf::new)
  }

  pub fn return_send_buffer(&self, mut buffer: UdpSendBuf) {
    buffer.reset();
    self.send.lock().put(buffer);
  }

  pub fn return_recv_buffer(&self, mut buffer: UdpRecvBuf) {
    buffer.reset();
    self.recv.lock().put(buffer);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use proptest::prelude::*;

  fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
  }

  /// Strips the header from segment 0 and concatenates every segment's
  /// payload bytes.
  fn reassemble(buffers: &[SendBuf]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&buffers[0].filled()[HEADER_SIZE..]);
    for buffer in &buffers[1..] {
      out.extend_from_slice(buffer.filled());
    }
    out
  }

  #[test]
  fn get_then_return_leaves_free_count_unchanged() {
    let pool = TcpBufPool::new();
    let before = pool.accept_free_count();
    let buffer = pool.get_accept_buffer();
    pool.return_accept_buffer(buffer);
    assert_eq!(pool.accept_free_count(), before);

    let before = pool.send_free_count();
    let buffers = pool.get_send_buffers(b"ping");
    for buffer in buffers {
      pool.return_send_buffer(buffer);
    }
    assert_eq!(pool.send_free_count(), before);
  }

  #[test]
  fn segment_count_boundaries() {
    assert_eq!(send_segment_count(1), 1);
    assert_eq!(send_segment_count(FIRST_SEGMENT_CAPACITY), 1);
    assert_eq!(send_segment_count(FIRST_SEGMENT_CAPACITY + 1), 2);
    assert_eq!(send_segment_count(FIRST_SEGMENT_CAPACITY + TCP_BUFFER_SIZE), 2);
    assert_eq!(send_segment_count(FIRST_SEGMENT_CAPACITY + TCP_BUFFER_SIZE + 1), 3);
  }

  #[test]
  fn first_segment_carries_the_only_header() {
    let pool = TcpBufPool::new();
    let packet = pattern(FIRST_SEGMENT_CAPACITY + 2 * TCP_BUFFER_SIZE + 17);
    let buffers = pool.get_send_buffers(&packet);
    assert_eq!(buffers.len(), 4);

    let declared = u32::from_be_bytes(buffers[0].filled()[4..8].try_into().unwrap());
    assert_eq!(declared as usize, packet.len());
    assert_eq!(reassemble(&buffers), packet);

    // Middle segments are filled to capacity, the tail holds the remainder.
    assert_eq!(buffers[0].filled().len(), TCP_BUFFER_SIZE);
    assert_eq!(buffers[1].filled().len(), TCP_BUFFER_SIZE);
    assert_eq!(buffers[2].filled().len(), TCP_BUFFER_SIZE);
    assert_eq!(buffers[3].filled().len(), 17);
  }

  #[test]
  fn small_payload_fits_one_segment() {
    let pool = TcpBufPool::new();
    let buffers = pool.get_send_buffers(b"hello");
    assert_eq!(buffers.len(), 1);
    assert_eq!(buffers[0].filled().len(), HEADER_SIZE + 5);
    assert_eq!(&buffers[0].filled()[HEADER_SIZE..], b"hello");
  }

  #[test]
  fn exhausted_accept_pool_expands_then_narrows_back() {
    let pool = TcpBufPool::new();
    let mut held: Vec<_> =
      (0..ACCEPT_POOL_BATCH + 1).map(|_| pool.get_accept_buffer()).collect();
    // One take past the batch forced an expansion.
    assert_eq!(pool.accept_free_count(), ACCEPT_POOL_BATCH - 1);

    for buffer in held.drain(..) {
      pool.return_accept_buffer(buffer);
    }
    // The narrowing policy trimmed the pool back to its baseline.
    assert_eq!(pool.accept_free_count(), ACCEPT_POOL_BATCH);
  }

  proptest! {
    // Each case builds a fresh pool; keep the count modest.
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn split_reassembles_exactly(len in 1usize..400_000) {
      let pool = TcpBufPool::new();
      let packet = pattern(len);
      let buffers = pool.get_send_buffers(&packet);

      prop_assert_eq!(buffers.len(), send_segment_count(len));
      for buffer in &buffers {
        prop_assert!(buffer.filled().len() <= TCP_BUFFER_SIZE);
      }
      prop_assert_eq!(reassemble(&buffers), packet);
    }
  }
}
