//! Archive writer and file/attribute handles.
//!
//! Grounded in amar.c's `amar_new`/`amar_new_file`/`amar_file_close`/
//! `amar_new_attr`/`amar_attr_add_data_buffer`/`amar_attr_add_data_fd`/
//! `amar_attr_add_data_fd_in_thread`. The hash tables of file/attribute
//! pointers become `Vec`s, since the number of files and attributes open
//! at once is expected to stay small; file-ID allocation keeps a sorted
//! `Vec<u16>` of file numbers in use, probed with `binary_search`, the
//! direct generalisation of a linear `do { ... } while` scan plus a hash
//! lookup.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::error::{AmarError, Result};
use crate::record::{
    self, Preamble, AMAR_ATTR_APP_START, AMAR_ATTR_EOF, AMAR_ATTR_FILENAME, HEADER_VERSION,
    MAGIC_FILENUM, MAX_RECORD_DATA_SIZE,
};
use crate::write_buffer::WriteBuffer;

/// An archive open for writing.
///
/// Owns the coalescing write buffer and the set of file numbers currently
/// in use. Files are short-lived handles borrowed from `Writer::new_file`;
/// the writer itself outlives every file and attribute handle it issues.
pub struct Writer<W> {
    sink: Arc<AsyncMutex<WriteBuffer<W>>>,
    /// File numbers currently allocated, kept sorted for `binary_search`.
    open_filenums: Vec<u16>,
    max_filenum: u16,
}

impl<W: Write> Writer<W> {
    /// Opens a new archive, writing the 28-byte header immediately.
    pub fn new(sink: W) -> Result<Self> {
        let mut buf = WriteBuffer::new(sink);
        let header = record::encode_header(HEADER_VERSION);
        buf.append_small_record(&header)?;

        Ok(Writer {
            sink: Arc::new(AsyncMutex::new(buf)),
            open_filenums: Vec::new(),
            max_filenum: 0,
        })
    }

    /// Current logical byte offset in the archive.
    pub fn position(&self) -> u64 {
        // Only used synchronously; `try_lock` never contends here because
        // no async feed can be in flight while the caller holds `&self`.
        self.sink
            .try_lock()
            .expect("writer position queried while a background feed is in flight")
            .position()
    }

    fn allocate_filenum(&mut self) -> Result<u16> {
        // Every u16 is a candidate filenum except 0 and MAGIC_FILENUM, so
        // at most 65534 can ever be open at once.
        if self.open_filenums.len() >= u16::MAX as usize - 1 {
            return Err(AmarError::out_of_space("no more file numbers available"));
        }
        loop {
            self.max_filenum = self.max_filenum.wrapping_add(1);
            if self.max_filenum == MAGIC_FILENUM || self.max_filenum == 0 {
                continue;
            }
            if let Err(idx) = self.open_filenums.binary_search(&self.max_filenum) {
                self.open_filenums.insert(idx, self.max_filenum);
                return Ok(self.max_filenum);
            }
        }
    }

    fn release_filenum(&mut self, filenum: u16) {
        if let Ok(idx) = self.open_filenums.binary_search(&filenum) {
            self.open_filenums.remove(idx);
        }
    }

    /// Starts a new logical file with the given name, returning a handle.
    /// Does not re-emit an archive header.
    pub fn new_file(&mut self, filename: &[u8]) -> Result<FileHandle<W>> {
        self.new_file_impl(filename, false).map(|(h, _)| h)
    }

    /// Starts a new logical file, first writing a fresh archive header at
    /// the current position and returning that position so the caller may
    /// seek back to it later (e.g. to support multi-volume splitting).
    pub fn new_file_with_header_offset(&mut self, filename: &[u8]) -> Result<(FileHandle<W>, u64)> {
        let (handle, offset) = self.new_file_impl(filename, true)?;
        Ok((handle, offset.expect("header offset requested")))
    }

    fn new_file_impl(
        &mut self,
        filename: &[u8],
        emit_header: bool,
    ) -> Result<(FileHandle<W>, Option<u64>)> {
        if filename.is_empty() {
            return Err(AmarError::invalid_argument("filename must not be empty"));
        }
        if filename.len() > MAX_RECORD_DATA_SIZE {
            return Err(AmarError::out_of_space(
                "filename is too long for an amanda archive",
            ));
        }

        let filenum = self.allocate_filenum()?;

        let header_offset = if emit_header {
            let mut buf = self.sink.try_lock().expect("no feed in flight");
            let offset = buf.position();
            let header = record::encode_header(HEADER_VERSION);
            buf.append_small_record(&header)?;
            Some(offset)
        } else {
            None
        };

        {
            let mut buf = self.sink.try_lock().expect("no feed in flight");
            write_record(&mut buf, filenum, AMAR_ATTR_FILENAME, true, filename)?;
        }

        debug!(filenum, "opened archive file");

        Ok((
            FileHandle {
                sink: Arc::clone(&self.sink),
                filenum,
                open_attrs: Arc::new(StdMutex::new(Vec::new())),
            },
            header_offset,
        ))
    }

    /// Closes a file handle: closes any attributes the caller left open,
    /// writes the EOF record, and releases the file number.
    pub fn close_file(&mut self, mut file: FileHandle<W>) -> Result<()> {
        file.close_remaining_attrs()?;
        {
            let mut buf = self.sink.try_lock().expect("no feed in flight");
            write_record(&mut buf, file.filenum, AMAR_ATTR_EOF, true, &[])?;
        }
        self.release_filenum(file.filenum);
        Ok(())
    }

    /// Flushes and finishes the archive. All files must already be closed.
    pub fn close(self) -> Result<W> {
        if !self.open_filenums.is_empty() {
            return Err(AmarError::invalid_argument(
                "cannot close archive with files still open",
            ));
        }
        let buf = Arc::try_unwrap(self.sink)
            .unwrap_or_else(|_| panic!("writer sink still shared at close"))
            .into_inner();
        buf.into_inner()
    }
}

/// Writes a preamble plus payload, splitting into multiple records if the
/// payload exceeds `MAX_RECORD_DATA_SIZE`. Mirrors
/// `amar_attr_add_data_buffer`'s chunking loop.
fn write_record<W: Write>(
    buf: &mut WriteBuffer<W>,
    filenum: u16,
    attrid: u16,
    eoa: bool,
    mut data: &[u8],
) -> Result<()> {
    loop {
        let (chunk, rest, chunk_eoa) = if data.len() > MAX_RECORD_DATA_SIZE {
            (&data[..MAX_RECORD_DATA_SIZE], &data[MAX_RECORD_DATA_SIZE..], false)
        } else {
            (data, &data[data.len()..], eoa)
        };
        let preamble = Preamble::new(filenum, attrid, chunk.len() as u32, chunk_eoa);
        buf.write_record(&preamble.encode(), chunk)?;
        data = rest;
        if data.is_empty() {
            return Ok(());
        }
    }
}

/// A handle to an open logical file within the archive.
///
/// Tracks the attribute IDs opened through `new_attr` that haven't yet
/// written their own EOA record, so `close_file` can finish them.
pub struct FileHandle<W> {
    sink: Arc<AsyncMutex<WriteBuffer<W>>>,
    filenum: u16,
    open_attrs: Arc<StdMutex<Vec<u16>>>,
}

impl<W: Write> FileHandle<W> {
    pub fn filenum(&self) -> u16 {
        self.filenum
    }

    /// Opens a new application attribute on this file. `attrid` must be
    /// `>= AMAR_ATTR_APP_START`.
    pub fn new_attr(&self, attrid: u16) -> Result<AttrHandle<W>> {
        if attrid < AMAR_ATTR_APP_START {
            return Err(AmarError::invalid_argument(
                "attribute ID is reserved by the format",
            ));
        }
        self.open_attrs.lock().unwrap().push(attrid);
        Ok(AttrHandle {
            sink: Arc::clone(&self.sink),
            filenum: self.filenum,
            attrid,
            size: 0,
            wrote_eoa: false,
            open_attrs: Arc::clone(&self.open_attrs),
        })
    }

    /// `amar_file_close` walks a hash table to close any attribute the
    /// caller left open; here that's whatever attribute IDs are still in
    /// `open_attrs`, each finished with an empty EOA record.
    fn close_remaining_attrs(&mut self) -> Result<()> {
        let remaining = std::mem::take(&mut *self.open_attrs.lock().unwrap());
        if remaining.is_empty() {
            return Ok(());
        }
        let mut buf = self.sink.try_lock().expect("no feed in flight");
        for attrid in remaining {
            debug!(filenum = self.filenum, attrid, "closing attribute left open at file close");
            write_record(&mut buf, self.filenum, attrid, true, &[])?;
        }
        Ok(())
    }
}

/// A handle to an open attribute on a file.
pub struct AttrHandle<W> {
    sink: Arc<AsyncMutex<WriteBuffer<W>>>,
    filenum: u16,
    attrid: u16,
    size: u64,
    wrote_eoa: bool,
    open_attrs: Arc<StdMutex<Vec<u16>>>,
}

impl<W> AttrHandle<W> {
    /// Removes this attribute's ID from its file's open-attribute list,
    /// so the file won't try to close it again once it's gone.
    fn mark_closed(&self) {
        if let Some(idx) = self
            .open_attrs
            .lock()
            .unwrap()
            .iter()
            .position(|&id| id == self.attrid)
        {
            self.open_attrs.lock().unwrap().remove(idx);
        }
    }
}

impl<W: Write + Send + 'static> AttrHandle<W> {
    pub fn attrid(&self) -> u16 {
        self.attrid
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Appends a buffer of data, chunked as needed, optionally ending the
    /// attribute. Mirrors `amar_attr_add_data_buffer`.
    pub fn append_buffer(&mut self, data: &[u8], eoa: bool) -> Result<()> {
        if self.wrote_eoa {
            return Err(AmarError::invalid_argument(
                "attribute already ended with EOA",
            ));
        }
        {
            let mut buf = self.sink.try_lock().expect("no feed in flight");
            write_record(&mut buf, self.filenum, self.attrid, eoa, data)?;
        }
        self.size += data.len() as u64;
        if eoa {
            self.wrote_eoa = true;
            self.mark_closed();
        }
        Ok(())
    }

    /// Drains `reader` to EOF, writing its contents as a sequence of
    /// records on this attribute, synchronously. Mirrors
    /// `amar_attr_add_data_fd`, generalized from a raw fd to `impl Read`.
    pub fn append_from_reader(&mut self, mut reader: impl Read, eoa: bool) -> Result<()> {
        if self.wrote_eoa {
            return Err(AmarError::invalid_argument(
                "attribute already ended with EOA",
            ));
        }
        let mut chunk = vec![0u8; MAX_RECORD_DATA_SIZE];
        loop {
            let n = reader
                .read(&mut chunk)
                .map_err(|e| AmarError::io(e, self.size))?;
            if n == 0 {
                break;
            }
            let mut buf = self.sink.try_lock().expect("no feed in flight");
            let preamble = Preamble::new(self.filenum, self.attrid, n as u32, false);
            buf.write_record(&preamble.encode(), &chunk[..n])?;
            drop(buf);
            self.size += n as u64;
        }
        if eoa {
            let mut buf = self.sink.try_lock().expect("no feed in flight");
            write_record(&mut buf, self.filenum, self.attrid, true, &[])?;
            self.wrote_eoa = true;
            drop(buf);
            self.mark_closed();
        }
        Ok(())
    }

    /// Spawns a background task that drains `reader` to EOF and feeds it
    /// into this attribute, matching `amar_attr_add_data_fd_in_thread`'s
    /// "return immediately, join on close" contract. The shared sink's
    /// `tokio::sync::Mutex` serializes this task against any other
    /// concurrent background feed on the same archive.
    pub fn append_from_reader_async<R>(&mut self, mut reader: R, eoa: bool) -> AsyncAttrWorker
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        use tokio::io::AsyncReadExt;

        let sink = Arc::clone(&self.sink);
        let filenum = self.filenum;
        let attrid = self.attrid;
        self.wrote_eoa = self.wrote_eoa || eoa;
        if eoa {
            self.mark_closed();
        }

        let handle = tokio::spawn(async move {
            let mut chunk = vec![0u8; MAX_RECORD_DATA_SIZE];
            let mut total = 0u64;
            loop {
                let n = reader
                    .read(&mut chunk)
                    .await
                    .map_err(|e| AmarError::io(e, total))?;
                if n == 0 {
                    break;
                }
                let mut buf = sink.lock().await;
                let preamble = Preamble::new(filenum, attrid, n as u32, false);
                buf.write_record(&preamble.encode(), &chunk[..n])?;
                drop(buf);
                total += n as u64;
            }
            if eoa {
                let mut buf = sink.lock().await;
                let preamble = Preamble::new(filenum, attrid, 0, true);
                buf.write_record(&preamble.encode(), &[])?;
            }
            Ok(total)
        });

        AsyncAttrWorker { handle }
    }

    /// Ends the attribute if it hasn't already, blocking on any in-flight
    /// background feed. Mirrors `amar_attr_close`.
    pub fn close(mut self) -> Result<()> {
        if !self.wrote_eoa {
            let mut buf = self.sink.try_lock().expect("no feed in flight");
            write_record(&mut buf, self.filenum, self.attrid, true, &[])?;
            self.wrote_eoa = true;
            drop(buf);
            self.mark_closed();
        }
        Ok(())
    }
}

/// Handle to a background attribute-feed task started by
/// `AttrHandle::append_from_reader_async`.
pub struct AsyncAttrWorker {
    handle: tokio::task::JoinHandle<Result<u64>>,
}

impl AsyncAttrWorker {
    /// Blocks the current thread until the feed finishes, returning the
    /// number of payload bytes written. For use from synchronous code
    /// that holds a `tokio::runtime::Handle`.
    pub fn join_blocking(self, rt: &tokio::runtime::Handle) -> Result<u64> {
        rt.block_on(self.handle)
            .map_err(|e| AmarError::invalid_argument_from_join(e))?
    }

    /// Awaits the feed to completion, returning the number of payload
    /// bytes written.
    pub async fn join(self) -> Result<u64> {
        self.handle
            .await
            .map_err(|e| AmarError::invalid_argument_from_join(e))?
    }
}

impl AmarError {
    fn invalid_argument_from_join(_e: tokio::task::JoinError) -> AmarError {
        AmarError::invalid_argument("background attribute feed task panicked")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::HEADER_SIZE;

    #[test]
    fn new_writer_emits_header() {
        let w = Writer::new(Vec::new()).unwrap();
        assert_eq!(w.position(), HEADER_SIZE as u64);
    }

    #[test]
    fn new_file_writes_filename_record() {
        let mut w = Writer::new(Vec::new()).unwrap();
        let file = w.new_file(b"hello.txt").unwrap();
        assert_eq!(file.filenum(), 1);
        w.close_file(file).unwrap();
        let bytes = w.close().unwrap();
        assert!(bytes.len() > HEADER_SIZE);
    }

    #[test]
    fn filenum_skips_magic_value() {
        let mut w = Writer::new(Vec::new()).unwrap();
        w.max_filenum = MAGIC_FILENUM - 1;
        let file = w.new_file(b"a").unwrap();
        assert_eq!(file.filenum(), MAGIC_FILENUM + 1);
        w.close_file(file).unwrap();
    }

    #[test]
    fn attribute_below_app_start_is_rejected() {
        let mut w = Writer::new(Vec::new()).unwrap();
        let file = w.new_file(b"a").unwrap();
        assert!(file.new_attr(AMAR_ATTR_EOF).is_err());
        w.close_file(file).unwrap();
    }

    #[test]
    fn append_buffer_tracks_size_and_eoa() {
        let mut w = Writer::new(Vec::new()).unwrap();
        let file = w.new_file(b"a").unwrap();
        let mut attr = file.new_attr(AMAR_ATTR_APP_START).unwrap();
        attr.append_buffer(b"hello", false).unwrap();
        attr.append_buffer(b"world", true).unwrap();
        assert_eq!(attr.size(), 10);
        attr.close().unwrap();
        w.close_file(file).unwrap();
    }

    #[test]
    fn append_from_reader_drains_to_eof() {
        let mut w = Writer::new(Vec::new()).unwrap();
        let file = w.new_file(b"a").unwrap();
        let mut attr = file.new_attr(AMAR_ATTR_APP_START).unwrap();
        let data = vec![5u8; 100];
        attr.append_from_reader(&data[..], true).unwrap();
        assert_eq!(attr.size(), 100);
        w.close_file(file).unwrap();
    }

    #[test]
    fn close_without_eoa_writes_it_automatically() {
        let mut w = Writer::new(Vec::new()).unwrap();
        let file = w.new_file(b"a").unwrap();
        let attr = file.new_attr(AMAR_ATTR_APP_START).unwrap();
        attr.close().unwrap();
        w.close_file(file).unwrap();
    }
}
