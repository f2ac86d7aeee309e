//! Event-driven reader.
//!
//! Grounded in amar.c's `amar_read_cb`/`amar_stop_read`/`amar_start_read`:
//! the non-blocking counterpart to `reader::Reader`, driven by repeated
//! readiness notifications rather than blocking reads. Here the
//! notification source is a `tokio::io::AsyncRead`, and the executor's
//! scheduler stands in for a libevent readiness callback —
//! `AsyncReader::run` is the `.await`-able loop that plays the role
//! `amar_read_cb` plays each time the event loop invokes it, and
//! `pause`/`resume` are `amar_stop_read`/`amar_start_read`, preserving
//! buffered state across the gap.

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace, warn};

use crate::error::{AmarError, Result};
use crate::reader::{AttrEvent, HandlerTable, HandlerTableBuilder, OpenAttr, OpenFile};
use crate::record::{
    self, Preamble, AMAR_ATTR_APP_START, AMAR_ATTR_EOF, AMAR_ATTR_FILENAME, HEADER_SIZE,
    HEADER_VERSION, MAX_RECORD_DATA_SIZE, RECORD_SIZE,
};

const NUL_PADDING_LEN: usize = 512 - RECORD_SIZE;

/// Amount read from the source per poll. `amar_read_cb` reads whatever
/// is left in its fixed buffer; this buffer is an unbounded growable
/// `Vec`, so the constant just bounds how much we ask the source for in
/// one `read` call.
const READ_CHUNK: usize = 64 * 1024;

type FileStartCallback = dyn FnMut(u16, &[u8]) -> Result<bool> + Send;
type FileFinishCallback = dyn FnMut(u16, bool) -> Result<()> + Send;

/// Why [`AsyncReader::run_until_paused_or_eof`] returned without an error.
enum RunOutcome {
    /// The reader was paused mid-stream; buffered state is left untouched.
    Paused,
    /// The source reached a clean end of stream.
    Eof,
}

/// Drives the record demultiplexer over a non-blocking, `AsyncRead`
/// source, processing only complete records per poll and leaving partial
/// records buffered for the next one.
pub struct AsyncReader<R> {
    source: R,
    buf: Vec<u8>,
    got_eof: bool,
    paused: bool,
    handlers: HandlerTable,
    file_start: Option<Box<FileStartCallback>>,
    file_finish: Option<Box<FileFinishCallback>>,
    open_files: Vec<OpenFile>,
    position: u64,
}

impl<R: AsyncRead + Unpin> AsyncReader<R> {
    pub fn new(source: R) -> Self {
        AsyncReader {
            source,
            buf: Vec::new(),
            got_eof: false,
            paused: false,
            handlers: HandlerTableBuilder::new().build(),
            file_start: None,
            file_finish: None,
            open_files: Vec::new(),
            position: 0,
        }
    }

    pub fn with_handlers(mut self, handlers: HandlerTable) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn on_file_start(
        mut self,
        callback: impl FnMut(u16, &[u8]) -> Result<bool> + Send + 'static,
    ) -> Self {
        self.file_start = Some(Box::new(callback));
        self
    }

    pub fn on_file_finish(
        mut self,
        callback: impl FnMut(u16, bool) -> Result<()> + Send + 'static,
    ) -> Self {
        self.file_finish = Some(Box::new(callback));
        self
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Stops consuming newly read bytes, leaving all buffered state
    /// (partial records, open files/attributes) intact. Mirrors
    /// `amar_stop_read`.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Resumes consumption after `pause`. Mirrors `amar_start_read`.
    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Runs until the source reaches EOF (with any still-open files
    /// finished as truncated), a protocol error is hit, or the reader is
    /// paused. Calling `run` again after `pause` continues from exactly
    /// where it left off.
    ///
    /// Pausing leaves buffered state alone since it isn't termination, but
    /// both a clean EOF and a protocol error finish every still-open file
    /// with `truncated = true` before this returns, matching the
    /// synchronous reader's cleanup guarantee.
    pub async fn run(&mut self) -> Result<()> {
        match self.run_until_paused_or_eof().await {
            Ok(RunOutcome::Paused) => Ok(()),
            Ok(RunOutcome::Eof) => self.finish_all_truncated(),
            Err(err) => match self.finish_all_truncated() {
                Ok(()) => Err(err),
                Err(cleanup_err) => {
                    warn!(error = %cleanup_err, "error finishing truncated files after a prior read error");
                    Err(err)
                }
            },
        }
    }

    async fn run_until_paused_or_eof(&mut self) -> Result<RunOutcome> {
        loop {
            if self.paused {
                return Ok(RunOutcome::Paused);
            }

            while let Some(consumed) = self.try_process_one()? {
                if !consumed {
                    break;
                }
                if self.paused {
                    return Ok(RunOutcome::Paused);
                }
            }

            if self.got_eof {
                break;
            }

            let mut chunk = vec![0u8; READ_CHUNK];
            let n = self
                .source
                .read(&mut chunk)
                .await
                .map_err(|e| AmarError::io(e, self.position))?;
            if n == 0 {
                self.got_eof = true;
                continue;
            }
            chunk.truncate(n);
            self.buf.extend_from_slice(&chunk);
            trace!(read = n, buffered = self.buf.len(), "async reader read chunk");
        }

        Ok(RunOutcome::Eof)
    }

    /// Attempts to process exactly one record from the buffer.
    /// `Ok(Some(true))` means a record was consumed and the caller should
    /// try again; `Ok(Some(false))` means there wasn't enough data for a
    /// complete record and the caller should read more; `Ok(None)` is
    /// never produced (kept `Option` for symmetry with a future
    /// early-return case).
    fn try_process_one(&mut self) -> Result<Option<bool>> {
        if self.buf.len() < RECORD_SIZE {
            return Ok(Some(false));
        }

        let mut preamble_bytes = [0u8; RECORD_SIZE];
        preamble_bytes.copy_from_slice(&self.buf[..RECORD_SIZE]);
        let preamble = Preamble::decode(&preamble_bytes);

        if preamble.is_header() {
            if self.buf.len() < HEADER_SIZE {
                return Ok(Some(false));
            }
            let header_bytes: [u8; HEADER_SIZE] = self.buf[..HEADER_SIZE]
                .try_into()
                .expect("length already checked");
            let version = record::parse_header(&header_bytes)
                .ok_or_else(|| AmarError::invalid_archive("invalid archive header", self.position))?;
            if version > HEADER_VERSION {
                return Err(AmarError::invalid_archive(
                    format!("archive version {version} is not supported"),
                    self.position,
                ));
            }
            self.advance(HEADER_SIZE);
            return Ok(Some(true));
        }

        if preamble.size as usize > MAX_RECORD_DATA_SIZE {
            return Err(AmarError::invalid_archive(
                format!("invalid record: data size must be at most {MAX_RECORD_DATA_SIZE}"),
                self.position,
            ));
        }

        // The full record (preamble + payload) must already be buffered
        // before we commit to processing it; unlike the blocking reader,
        // nothing here may perform another read. The preamble is only
        // actually consumed from `self.buf` inside each branch below, at
        // the same points `amar_read_cb`'s own buffer-offset arithmetic
        // does, since the NUL-padding branch needs to inspect bytes
        // beyond the preamble before deciding whether to consume it.
        if self.buf.len() < RECORD_SIZE + preamble.size as usize {
            return Ok(Some(false));
        }

        if preamble.attrid < AMAR_ATTR_APP_START {
            return self.handle_reserved_attr(&preamble);
        }

        self.advance(RECORD_SIZE);
        self.handle_app_attr(&preamble)?;
        Ok(Some(true))
    }

    fn advance(&mut self, n: usize) {
        self.buf.drain(..n);
        self.position += n as u64;
    }

    /// Returns `Some(true)` if a record was consumed, `Some(false)` if
    /// the caller should wait for more bytes (leaving the buffer
    /// untouched).
    fn handle_reserved_attr(&mut self, preamble: &Preamble) -> Result<Option<bool>> {
        if preamble.attrid == AMAR_ATTR_EOF {
            if preamble.size != 0 {
                return Err(AmarError::invalid_archive(
                    "archive contains an EOF record with nonzero size",
                    self.position,
                ));
            }
            self.advance(RECORD_SIZE);
            if let Some(idx) = self
                .open_files
                .iter()
                .position(|f| f.filenum == preamble.filenum)
            {
                let file = self.open_files.remove(idx);
                self.finish_file(file, false)?;
            }
            return Ok(Some(true));
        }

        if preamble.attrid == AMAR_ATTR_FILENAME {
            return self.handle_filename_record(preamble);
        }

        Err(AmarError::invalid_archive(
            format!(
                "unknown attribute id {} in archive file {}",
                preamble.attrid, preamble.filenum
            ),
            self.position,
        ))
    }

    fn handle_filename_record(&mut self, preamble: &Preamble) -> Result<Option<bool>> {
        if let Some(idx) = self
            .open_files
            .iter()
            .position(|f| f.filenum == preamble.filenum)
        {
            warn!(filenum = preamble.filenum, "previous file did not end correctly");
            let file = self.open_files.remove(idx);
            self.finish_file(file, true)?;
        }

        if preamble.size == 0 {
            // Detecting NUL padding needs a longer lookahead than the
            // basic "full record present" check already performed;
            // nothing is consumed until we know which way this goes.
            if self.buf.len() < RECORD_SIZE + NUL_PADDING_LEN {
                trace!("stream ends close to a zero-length filename record");
                return Ok(Some(false));
            }
            self.advance(RECORD_SIZE);
            let all_nul = self.buf[..NUL_PADDING_LEN].iter().all(|&b| b == 0);
            if all_nul {
                debug!("reached NUL padding, stream ends cleanly");
                self.got_eof = true;
                return Ok(Some(true));
            }
            return Err(AmarError::invalid_archive(
                format!("archive file {} has an empty filename", preamble.filenum),
                self.position,
            ));
        }

        if !preamble.eoa {
            return Err(AmarError::invalid_archive(
                format!(
                    "filename record for fileid {} does not have its EOA bit set",
                    preamble.filenum
                ),
                self.position,
            ));
        }

        self.advance(RECORD_SIZE);
        let filename = self.buf[..preamble.size as usize].to_vec();
        let ignore = match &mut self.file_start {
            Some(cb) => cb(preamble.filenum, &filename)?,
            None => false,
        };
        self.advance(preamble.size as usize);

        debug!(filenum = preamble.filenum, ignore, "opened file");
        self.open_files.push(OpenFile {
            filenum: preamble.filenum,
            ignore,
            open_attrs: Vec::new(),
        });
        Ok(Some(true))
    }

    fn handle_app_attr(&mut self, preamble: &Preamble) -> Result<()> {
        let file_idx = self
            .open_files
            .iter()
            .position(|f| f.filenum == preamble.filenum);
        let ignore = match file_idx {
            Some(idx) => self.open_files[idx].ignore,
            None => true,
        };
        if ignore {
            self.advance(preamble.size as usize);
            return Ok(());
        }
        let file_idx = file_idx.unwrap();

        let attr_idx = self.open_files[file_idx]
            .open_attrs
            .iter()
            .position(|a| a.attrid == preamble.attrid);
        let handler = match attr_idx {
            Some(idx) => self.open_files[file_idx].open_attrs[idx].handler,
            None => self.handlers.find(preamble.attrid),
        };

        if preamble.eoa && attr_idx.is_none() {
            let Some(handler_idx) = handler else {
                self.advance(preamble.size as usize);
                return Ok(());
            };
            let data = self.buf[..preamble.size as usize].to_vec();
            let cb = &mut self.handlers.entries[handler_idx].callback;
            cb(AttrEvent {
                filenum: preamble.filenum,
                attrid: preamble.attrid,
                data: &data,
                eoa: true,
                truncated: false,
            })?;
            self.advance(preamble.size as usize);
            return Ok(());
        }

        let attr_idx = match attr_idx {
            Some(idx) => idx,
            None => {
                self.open_files[file_idx].open_attrs.push(OpenAttr {
                    attrid: preamble.attrid,
                    handler,
                    buf: Vec::new(),
                    wrote_eoa: false,
                });
                self.open_files[file_idx].open_attrs.len() - 1
            }
        };

        let Some(handler_idx) = handler else {
            self.advance(preamble.size as usize);
            if preamble.eoa {
                let attr = self.open_files[file_idx].open_attrs.remove(attr_idx);
                let filenum = self.open_files[file_idx].filenum;
                self.finish_attr(filenum, attr, false)?;
            }
            return Ok(());
        };

        let data = self.buf[..preamble.size as usize].to_vec();
        self.deliver_hunk(file_idx, attr_idx, handler_idx, &data, preamble.eoa)?;
        self.advance(preamble.size as usize);

        if preamble.eoa {
            let attr = self.open_files[file_idx].open_attrs.remove(attr_idx);
            let filenum = self.open_files[file_idx].filenum;
            self.finish_attr(filenum, attr, false)?;
        }
        Ok(())
    }

    fn deliver_hunk(
        &mut self,
        file_idx: usize,
        attr_idx: usize,
        handler_idx: usize,
        data: &[u8],
        eoa: bool,
    ) -> Result<()> {
        let min_size = self.handlers.entries[handler_idx].min_size;
        let filenum = self.open_files[file_idx].filenum;
        let attrid = self.open_files[file_idx].open_attrs[attr_idx].attrid;
        let already_buffered = !self.open_files[file_idx].open_attrs[attr_idx].buf.is_empty();

        if min_size == 0 || (!already_buffered && data.len() >= min_size) {
            let cb = &mut self.handlers.entries[handler_idx].callback;
            cb(AttrEvent {
                filenum,
                attrid,
                data,
                eoa,
                truncated: false,
            })?;
            self.open_files[file_idx].open_attrs[attr_idx].wrote_eoa = eoa;
            return Ok(());
        }

        let attr = &mut self.open_files[file_idx].open_attrs[attr_idx];
        attr.buf.extend_from_slice(data);
        if attr.buf.len() >= min_size || eoa {
            let buffered = std::mem::take(&mut self.open_files[file_idx].open_attrs[attr_idx].buf);
            let cb = &mut self.handlers.entries[handler_idx].callback;
            cb(AttrEvent {
                filenum,
                attrid,
                data: &buffered,
                eoa,
                truncated: false,
            })?;
            self.open_files[file_idx].open_attrs[attr_idx].wrote_eoa = eoa;
        }
        Ok(())
    }

    fn finish_attr(&mut self, filenum: u16, attr: OpenAttr, truncated: bool) -> Result<()> {
        if !attr.wrote_eoa {
            if let Some(handler_idx) = attr.handler {
                let cb = &mut self.handlers.entries[handler_idx].callback;
                cb(AttrEvent {
                    filenum,
                    attrid: attr.attrid,
                    data: &attr.buf,
                    eoa: true,
                    truncated,
                })?;
            }
        }
        Ok(())
    }

    fn finish_file(&mut self, file: OpenFile, truncated: bool) -> Result<()> {
        let filenum = file.filenum;
        let ignore = file.ignore;
        for attr in file.open_attrs {
            self.finish_attr(filenum, attr, true)?;
        }
        if !ignore {
            if let Some(cb) = &mut self.file_finish {
                cb(filenum, truncated)?;
            }
        }
        Ok(())
    }

    fn finish_all_truncated(&mut self) -> Result<()> {
        let files = std::mem::take(&mut self.open_files);
        for file in files {
            self.finish_file(file, true)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::HandlerTableBuilder;
    use crate::writer::Writer;
    use std::sync::{Arc, Mutex};

    fn build_archive() -> Vec<u8> {
        let mut w = Writer::new(Vec::new()).unwrap();
        let file = w.new_file(b"a.bin").unwrap();
        let mut attr = file.new_attr(AMAR_ATTR_APP_START).unwrap();
        attr.append_buffer(b"async data", true).unwrap();
        attr.close().ok();
        w.close_file(file).unwrap();
        w.close().unwrap()
    }

    #[tokio::test]
    async fn reads_archive_built_by_writer() {
        let bytes = build_archive();
        let payloads: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let payloads2 = Arc::clone(&payloads);
        let handlers = HandlerTableBuilder::new()
            .on_attr(AMAR_ATTR_APP_START, 0, move |e: AttrEvent<'_>| {
                payloads2.lock().unwrap().extend_from_slice(e.data);
                Ok(())
            })
            .build();

        let mut r = AsyncReader::new(&bytes[..]).with_handlers(handlers);
        r.run().await.unwrap();
        assert_eq!(payloads.lock().unwrap().as_slice(), b"async data");
    }

    #[tokio::test]
    async fn pause_preserves_buffered_state() {
        let bytes = build_archive();
        let mut r = AsyncReader::new(&bytes[..]);
        r.pause();
        r.run().await.unwrap();
        assert_eq!(r.position(), 0);
        r.resume();
        r.run().await.unwrap();
        assert!(r.position() > 0);
    }

    #[tokio::test]
    async fn empty_stream_is_not_an_error() {
        let mut r = AsyncReader::new(&b""[..]);
        r.run().await.unwrap();
    }
}
