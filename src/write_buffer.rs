//! Coalescing write buffer in front of the archive sink.
//!
//! Grounded in amar.c's `flush_buffer`/`write_header`/`write_record`: a
//! single owned byte region that always keeps at least one preamble's
//! worth of headroom, flushing to the sink when a record would violate
//! that invariant, and escaping to a scatter/gather write for payloads
//! that would otherwise force a copy.
//!
//! The sink is a plain `std::io::Write`; there is no async variant of this
//! buffer, since flushing is the only blocking operation the synchronous
//! writer core needs, and `tokio`'s own `BufWriter` plus an explicit flush
//! call covers the async path without duplicating this logic (see
//! `writer::AsyncAttrWorker`, the only place this crate writes records from
//! an async context).

use std::io::{self, IoSlice, Write};

use tracing::trace;

use crate::error::{AmarError, Result};
use crate::record::RECORD_SIZE;

/// Size of the coalescing write buffer: 512 KiB, matching amar.c's own
/// `WRITE_BUFFER_SIZE`.
pub const WRITE_BUFFER_SIZE: usize = 512 * 1024;

/// A fixed-capacity byte buffer that coalesces small writes and escapes to
/// vectored I/O for large ones.
pub struct WriteBuffer<W> {
    sink: W,
    buf: Vec<u8>,
    /// Logical byte position of the archive, advanced by every byte that
    /// actually reaches the sink.
    position: u64,
}

impl<W: Write> WriteBuffer<W> {
    pub fn new(sink: W) -> Self {
        WriteBuffer {
            sink,
            buf: Vec::with_capacity(WRITE_BUFFER_SIZE),
            position: 0,
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Appends a pre-formatted, fixed-size record (the header, or a
    /// preamble with no payload) into the buffer, flushing first if the
    /// headroom invariant would otherwise be violated.
    pub fn append_small_record(&mut self, bytes: &[u8]) -> Result<()> {
        if self.buf.len() + bytes.len() >= WRITE_BUFFER_SIZE - RECORD_SIZE {
            self.flush()?;
        }
        self.buf.extend_from_slice(bytes);
        self.position += bytes.len() as u64;
        Ok(())
    }

    /// Appends a preamble followed by a payload. If the combined
    /// buffered-plus-new data would exceed the buffer's headroom, the
    /// pending buffer and the payload are written to the sink in a single
    /// vectored write; otherwise both are copied into the buffer.
    ///
    /// The preamble is always placed in the buffer first: the buffer is
    /// kept with room for at least one new record header at all times.
    pub fn write_record(&mut self, preamble: &[u8; RECORD_SIZE], payload: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(preamble);

        if self.buf.len() + payload.len() < WRITE_BUFFER_SIZE - RECORD_SIZE {
            if !payload.is_empty() {
                self.buf.extend_from_slice(payload);
            }
        } else {
            trace!(
                buffered = self.buf.len(),
                payload = payload.len(),
                "escaping to vectored write"
            );
            let slices = [IoSlice::new(&self.buf), IoSlice::new(payload)];
            write_all_vectored(&mut self.sink, &slices, self.position)?;
            self.buf.clear();
        }

        self.position += preamble.len() as u64 + payload.len() as u64;
        Ok(())
    }

    /// Empties the buffer to the sink in one write.
    pub fn flush(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        trace!(bytes = self.buf.len(), "flushing write buffer");
        self.sink
            .write_all(&self.buf)
            .map_err(|e| AmarError::io(e, self.position))?;
        self.buf.clear();
        Ok(())
    }

    /// Consumes the buffer, flushing any pending bytes and returning the
    /// underlying sink.
    pub fn into_inner(mut self) -> Result<W> {
        self.flush()?;
        Ok(self.sink)
    }
}

/// Writes the full contents of `slices` to `sink`, retrying on short
/// writes the way `write_all` does for a single buffer. `std::io::Write`
/// does not offer a "write_all_vectored", so this reimplements the retry
/// loop on top of `write_vectored`.
fn write_all_vectored<W: Write>(sink: &mut W, slices: &[IoSlice<'_>], position: u64) -> Result<()> {
    let mut slices: Vec<IoSlice<'_>> = slices.to_vec();
    // Skip leading empty slices; `write_vectored` is permitted to return 0
    // for them forever otherwise.
    while !slices.is_empty() && slices[0].is_empty() {
        slices.remove(0);
    }

    while !slices.is_empty() {
        let n = sink
            .write_vectored(&slices)
            .map_err(|e| AmarError::io(e, position))?;
        if n == 0 {
            return Err(AmarError::io(
                io::Error::new(io::ErrorKind::WriteZero, "failed to write whole buffer"),
                position,
            ));
        }
        IoSlice::advance_slices(&mut slices.as_mut_slice(), n);
        slices.retain(|s| !s.is_empty());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_records_are_coalesced() {
        let mut wb = WriteBuffer::new(Vec::new());
        wb.append_small_record(&[1, 2, 3]).unwrap();
        wb.append_small_record(&[4, 5]).unwrap();
        assert_eq!(wb.position(), 5);
        let sink = wb.into_inner().unwrap();
        assert_eq!(sink, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn write_record_copies_small_payload_into_buffer() {
        let mut wb = WriteBuffer::new(Vec::new());
        wb.write_record(&[0; 8], &[9, 9, 9]).unwrap();
        assert_eq!(wb.position(), 11);
        let sink = wb.into_inner().unwrap();
        assert_eq!(sink.len(), 11);
    }

    #[test]
    fn write_record_escapes_to_vectored_write_for_large_payload() {
        let mut wb = WriteBuffer::new(Vec::new());
        let payload = vec![7u8; WRITE_BUFFER_SIZE];
        wb.write_record(&[0; 8], &payload).unwrap();
        assert_eq!(wb.position(), 8 + payload.len() as u64);
        let sink = wb.into_inner().unwrap();
        assert_eq!(sink.len(), 8 + payload.len());
        assert!(sink[8..].iter().all(|&b| b == 7));
    }

    #[test]
    fn flush_is_a_no_op_on_empty_buffer() {
        let mut wb = WriteBuffer::new(Vec::new());
        wb.flush().unwrap();
        assert_eq!(wb.position(), 0);
    }
}
