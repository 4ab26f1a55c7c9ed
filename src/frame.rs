//! Length-prefixed message framing over a TCP byte stream.
//!
//! Every message is preceded by a fixed 12-byte header: a 4-byte magic flag,
//! the 4-byte payload length, and a 4-byte checksum field, all in network
//! byte order, followed by exactly `length` payload bytes with no padding or
//! delimiter. The checksum field is present on the wire but never computed
//! nor validated.
//!
//! [`FrameAssembler`] is driven with raw receive chunks whose boundaries are
//! arbitrary relative to message boundaries: a message may span many chunks
//! and a chunk may carry many messages.

use std::mem;

pub(crate) const FRAME_MAGIC: u32 = 0xfdfd_fdfd;
pub(crate) const HEADER_SIZE: usize = 12;

/// Magic flag mismatch while decoding a frame header. The connection is torn
/// down by the caller.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct BadMagic(pub u32);

/// Writes the header for a payload of `payload_len` bytes.
pub(crate) fn encode_header(payload_len: u32) -> [u8; HEADER_SIZE] {
  let mut header = [0u8; HEADER_SIZE];
  header[0..4].copy_from_slice(&FRAME_MAGIC.to_be_bytes());
  header[4..8].copy_from_slice(&payload_len.to_be_bytes());
  // bytes 8..12: checksum field, reserved and left zero
  header
}

/// Validates the magic flag and returns the declared payload length.
fn decode_header(header: &[u8]) -> Result<u32, BadMagic> {
  debug_assert_eq!(header.len(), HEADER_SIZE);
  let magic = u32::from_be_bytes(header[0..4].try_into().unwrap());
  if magic != FRAME_MAGIC {
    return Err(BadMagic(magic));
  }
  Ok(u32::from_be_bytes(header[4..8].try_into().unwrap()))
}

/// Incremental reassembly state for one TCP connection.
///
/// No lock is needed around this state: exactly one receive is outstanding
/// per connection, so chunks arrive strictly serialized.
pub(crate) struct FrameAssembler {
  /// Partial header bytes, `0..HEADER_SIZE` accumulated.
  header: Vec<u8>,
  /// Partial payload of the message currently being assembled.
  payload: Vec<u8>,
  /// Declared size of the message currently being assembled.
  expected: usize,
  /// Fully reassembled messages awaiting delivery, in arrival order.
  complete: Vec<Vec<u8>>,
}

impl FrameAssembler {
  pub fn new() -> Self {
    Self {
      header: Vec::with_capacity(HEADER_SIZE),
      payload: Vec::new(),
      expected: 0,
      complete: Vec::new(),
    }
  }

  /// Consumes one raw receive chunk, alternating header- and
  /// payload-accumulation until the chunk is exhausted.
  ///
  /// A chunk ending exactly on a header or payload boundary leaves the
  /// assembler ready for the next chunk; it never stalls.
  pub fn consume(&mut self, mut chunk: &[u8]) -> Result<(), BadMagic> {
    while !chunk.is_empty() {
      if self.header.len() < HEADER_SIZE {
        let take = (HEADER_SIZE - self.header.len()).min(chunk.len());
        self.header.extend_from_slice(&chunk[..take]);
        chunk = &chunk[take..];
        if self.header.len() == HEADER_SIZE {
          self.expected = decode_header(&self.header)? as usize;
          self.payload.clear();
          self.payload.reserve(self.expected);
          if self.expected == 0 {
            // An empty message completes on the header boundary alone.
            self.complete.push(Vec::new());
            self.header.clear();
          }
        }
        continue;
      }

      let take = (self.expected - self.payload.len()).min(chunk.len());
      self.payload.extend_from_slice(&chunk[..take]);
      chunk = &chunk[take..];
      if self.payload.len() == self.expected {
        self.complete.push(mem::take(&mut self.payload));
        self.header.clear();
        self.expected = 0;
      }
    }
    Ok(())
  }

  /// Drains every message completed so far, in arrival order.
  pub fn take_messages(&mut self) -> Vec<Vec<u8>> {
    mem::take(&mut self.complete)
  }
}
