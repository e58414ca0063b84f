//! APDU chaining support
//!
//! Long APDUs do not fit the chip's information-field size. The [`Chunker`]
//! walks an outgoing APDU in IFS-bounded slices, each destined for one
//! I-block with the more-data bit set on all but the last. The [`Assembler`]
//! concatenates the information fields of a chained response back into one
//! buffer.

use bytes::{BufMut, Bytes, BytesMut};

/// Splits an outgoing APDU into information-field sized chunks
///
/// The chunk size starts at the negotiated IFS and can be halved mid-chain
/// when the chip rejects a block for size, without losing position in the
/// source data.
#[derive(Debug)]
pub struct Chunker<'a> {
    data: &'a [u8],
    offset: usize,
    size: usize,
}

impl<'a> Chunker<'a> {
    /// Create a chunker over `data` with an initial chunk size of `ifs`
    pub fn new(data: &'a [u8], ifs: usize) -> Self {
        Self { data, offset: 0, size: ifs.max(1) }
    }

    /// The next chunk and whether more data follows it, if any remains
    ///
    /// Does not advance; the same chunk is returned again after a
    /// retransmission or a [`halve`](Self::halve).
    pub fn peek(&self) -> Option<(&'a [u8], bool)> {
        if self.offset >= self.data.len() {
            return None;
        }
        let end = (self.offset + self.size).min(self.data.len());
        Some((&self.data[self.offset..end], end < self.data.len()))
    }

    /// Mark `len` bytes as acknowledged and move past them
    pub fn advance(&mut self, len: usize) {
        self.offset = (self.offset + len).min(self.data.len());
    }

    /// Halve the chunk size after a size rejection, never below one byte
    pub fn halve(&mut self) {
        self.size = (self.size / 2).max(1);
    }

    /// Current chunk size
    pub const fn size(&self) -> usize {
        self.size
    }
}

/// Reassembles the information fields of a chained response
#[derive(Debug, Default)]
pub struct Assembler {
    buf: BytesMut,
}

impl Assembler {
    /// Create an empty assembler
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the information field of one received I-block
    pub fn push(&mut self, inf: &[u8]) {
        self.buf.put_slice(inf);
    }

    /// Number of bytes assembled so far
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been assembled yet
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finish the chain and take the assembled response
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}
