//! Growable read-ahead buffer with seek-based skip.
//!
//! Grounded in amar.c's `buf_atleast_`/`buf_skip_`/`buf_ptr`: a window
//! into the source that grows or compacts as needed to satisfy
//! `ensure_at_least`, and a `skip` operation that prefers `lseek` over
//! reading-and-discarding, falling back to the latter (and latching "not
//! seekable" for the rest of the stream) the first time a seek fails with
//! `ESPIPE`.

use std::io::{Read, Seek, SeekFrom};

use tracing::trace;

use crate::error::{AmarError, Result};

/// Starting capacity for a read buffer: 64 KiB, matching `amar_read`'s
/// initial `buf_size`.
const INITIAL_CAPACITY: usize = 64 * 1024;

/// Anything that might support seeking. A blanket impl covers every
/// `Seek`; `NotSeekable` is used by readers built over a source that
/// can't, so the buffer always has something to call without requiring a
/// second generic parameter on `Reader`.
pub trait TrySeek {
    fn try_seek_cur(&mut self, offset: i64) -> std::io::Result<()>;
}

impl<S: Seek> TrySeek for S {
    fn try_seek_cur(&mut self, offset: i64) -> std::io::Result<()> {
        self.seek(SeekFrom::Current(offset)).map(|_| ())
    }
}

/// A source with no seek support at all; `skip` always falls back to
/// reading and discarding.
pub struct NotSeekable<R>(pub R);

impl<R: Read> Read for NotSeekable<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.read(buf)
    }
}

impl<R> TrySeek for NotSeekable<R> {
    fn try_seek_cur(&mut self, _offset: i64) -> std::io::Result<()> {
        Err(std::io::Error::from(std::io::ErrorKind::Unsupported))
    }
}

/// A growable window over an underlying `Read` source.
pub struct ReadBuffer<R> {
    source: R,
    buf: Vec<u8>,
    /// Offset of the first live byte within `buf`.
    offset: usize,
    /// Number of live bytes starting at `offset`.
    len: usize,
    /// Whether `source` has returned EOF; once true, no more reads happen.
    got_eof: bool,
    /// Whether the last operation on `source` was a seek, in which case
    /// the next `ensure_at_least` reads only what's needed rather than
    /// topping off the whole buffer.
    just_seeked: bool,
    /// Once a seek fails with "not supported", we stop trying and always
    /// fall back to read-and-discard for `skip`.
    seekable: bool,
    /// Logical byte position of the buffer's read cursor within the
    /// stream (distinct from `source`'s own position, which may be ahead
    /// of this by however much is buffered).
    position: u64,
}

impl<R: Read> ReadBuffer<R> {
    pub fn new(source: R) -> Self {
        ReadBuffer {
            source,
            buf: Vec::with_capacity(INITIAL_CAPACITY),
            offset: 0,
            len: 0,
            got_eof: false,
            just_seeked: false,
            seekable: false,
            position: 0,
        }
    }

    pub fn with_seek_support(source: R) -> Self {
        let mut rb = Self::new(source);
        rb.seekable = true;
        rb
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// The currently buffered, unconsumed bytes.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.offset..self.offset + self.len]
    }

    /// Ensures at least `atleast` bytes are buffered, growing or
    /// compacting the window and reading more from the source as needed.
    /// Returns `false` if EOF was reached before `atleast` bytes became
    /// available.
    pub fn ensure_at_least(&mut self, atleast: usize) -> Result<bool> {
        if self.len >= atleast {
            return Ok(true);
        }
        if self.got_eof {
            return Ok(false);
        }

        if self.buf.capacity() < atleast {
            if self.offset == 0 {
                self.buf.reserve(atleast - self.buf.capacity());
            } else {
                let mut newbuf = Vec::with_capacity(atleast);
                newbuf.extend_from_slice(&self.buf[self.offset..self.offset + self.len]);
                self.buf = newbuf;
                self.offset = 0;
            }
        } else if self.buf.capacity() - self.offset < atleast {
            self.buf.copy_within(self.offset..self.offset + self.len, 0);
            self.offset = 0;
        }

        let to_read = if self.just_seeked {
            atleast - self.len
        } else {
            self.buf.capacity() - self.offset - self.len
        };
        self.just_seeked = false;

        let write_at = self.offset + self.len;
        if self.buf.len() < write_at + to_read {
            self.buf.resize(write_at + to_read, 0);
        }
        let bytes_read = read_best_effort(
            &mut self.source,
            &mut self.buf[write_at..write_at + to_read],
            self.position,
        )?;
        if bytes_read < to_read {
            self.got_eof = true;
        }
        self.len += bytes_read;
        trace!(atleast, bytes_read, buffered = self.len, "ensure_at_least");

        Ok(self.len >= atleast)
    }

    /// Consumes `n` bytes from the front of the buffer. Caller must have
    /// already confirmed `n` bytes are available via `ensure_at_least`.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.len);
        self.offset += n;
        self.len -= n;
        self.position += n as u64;
    }
}

impl<R: Read + TrySeek> ReadBuffer<R> {
    /// Skips ahead by `skipbytes`, discarding buffered data first and
    /// falling back to a seek (or, failing that, read-and-discard) for
    /// the remainder. Returns `false` if EOF was reached first.
    pub fn skip(&mut self, mut skipbytes: u64) -> Result<bool> {
        if skipbytes <= self.len as u64 {
            self.advance(skipbytes as usize);
            return Ok(true);
        }

        self.position += self.len as u64;
        skipbytes -= self.len as u64;
        self.len = 0;
        self.offset = 0;

        if self.seekable {
            match self.source.try_seek_cur(skipbytes as i64) {
                Ok(()) => {
                    self.position += skipbytes;
                    self.just_seeked = true;
                    return Ok(true);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Unsupported => {
                    trace!("seek unsupported, falling back to read-and-discard");
                    self.seekable = false;
                }
                Err(_) => {
                    self.got_eof = true;
                    return Ok(false);
                }
            }
        }

        let mut discard = vec![0u8; self.buf.capacity().max(INITIAL_CAPACITY)];
        while skipbytes > 0 {
            let to_read = skipbytes.min(discard.len() as u64) as usize;
            let n = read_best_effort(&mut self.source, &mut discard[..to_read], self.position)?;
            if (n as u64) < to_read as u64 {
                self.got_eof = true;
                return Ok(false);
            }
            self.position += n as u64;
            skipbytes -= n as u64;
        }
        Ok(true)
    }
}

/// Reads until `buf` is full or the source is exhausted, returning the
/// number of bytes actually read (short only at EOF).
fn read_best_effort<R: Read>(source: &mut R, mut buf: &mut [u8], position: u64) -> Result<usize> {
    let mut total = 0;
    while !buf.is_empty() {
        match source.read(buf) {
            Ok(0) => break,
            Ok(n) => {
                total += n;
                buf = &mut buf[n..];
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(AmarError::io(e, position + total as u64)),
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn ensure_at_least_reads_from_source() {
        let mut rb = ReadBuffer::new(Cursor::new(b"hello world".to_vec()));
        assert!(rb.ensure_at_least(5).unwrap());
        assert_eq!(&rb.peek()[..5], b"hello");
    }

    #[test]
    fn ensure_at_least_false_at_eof() {
        let mut rb = ReadBuffer::new(Cursor::new(b"short".to_vec()));
        assert!(!rb.ensure_at_least(100).unwrap());
    }

    #[test]
    fn advance_consumes_and_tracks_position() {
        let mut rb = ReadBuffer::new(Cursor::new(b"0123456789".to_vec()));
        rb.ensure_at_least(10).unwrap();
        rb.advance(4);
        assert_eq!(rb.position(), 4);
        assert_eq!(&rb.peek()[..2], b"45");
    }

    #[test]
    fn skip_within_buffer_does_not_touch_source() {
        let mut rb = ReadBuffer::new(Cursor::new(b"0123456789".to_vec()));
        rb.ensure_at_least(10).unwrap();
        assert!(rb.skip(3).unwrap());
        assert_eq!(rb.position(), 3);
        assert_eq!(&rb.peek()[..1], b"3");
    }

    #[test]
    fn skip_past_buffer_uses_seek_when_seekable() {
        let mut rb = ReadBuffer::with_seek_support(Cursor::new(b"0123456789".to_vec()));
        rb.ensure_at_least(2).unwrap();
        assert!(rb.skip(5).unwrap());
        assert_eq!(rb.position(), 5);
        assert!(rb.ensure_at_least(1).unwrap());
        assert_eq!(&rb.peek()[..1], b"5");
    }

    #[test]
    fn skip_past_eof_returns_false() {
        let mut rb = ReadBuffer::new(Cursor::new(b"abc".to_vec()));
        assert!(!rb.skip(100).unwrap());
    }
}
