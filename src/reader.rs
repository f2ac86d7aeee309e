//! Synchronous record demultiplexer.
//!
//! Grounded directly in amar.c's `amar_read`: the blocking variant of the
//! reader, which drives a single `ReadBuffer` to completion rather than
//! being driven by a readiness callback (that's `async_reader`, grounded
//! in `amar_read_cb` instead). Both variants share the same
//! classification and dispatch rules; this module is where those rules
//! live, expressed once so `async_reader` can reuse them.

use std::io::{Read, Seek, Write};

use tracing::{debug, trace, warn};

use crate::error::{AmarError, Result};
use crate::read_buffer::{NotSeekable, ReadBuffer, TrySeek};
use crate::record::{
    self, Preamble, AMAR_ATTR_APP_START, AMAR_ATTR_EOF, AMAR_ATTR_FILENAME, HEADER_SIZE,
    HEADER_VERSION, MAX_RECORD_DATA_SIZE, RECORD_SIZE,
};

/// Minimum number of trailing bytes, after a zero-length filename record's
/// preamble, that must all be NUL for the stream to be considered cleanly
/// terminated. Matches amar.c's `512 - RECORD_SIZE`.
const NUL_PADDING_LEN: usize = 512 - RECORD_SIZE;

/// Data delivered to an application attribute's callback.
pub struct AttrEvent<'a> {
    pub filenum: u16,
    pub attrid: u16,
    pub data: &'a [u8],
    pub eoa: bool,
    /// `true` if the stream ended (or the file was superseded) before this
    /// attribute's EOA record arrived.
    pub truncated: bool,
}

type AttrCallback = dyn FnMut(AttrEvent<'_>) -> Result<()> + Send;
type FileStartCallback = dyn FnMut(u16, &[u8]) -> Result<bool> + Send;
type FileFinishCallback = dyn FnMut(u16, bool) -> Result<()> + Send;

pub(crate) struct HandlerEntry {
    pub(crate) attrid: u16,
    pub(crate) min_size: usize,
    pub(crate) callback: Box<AttrCallback>,
}

/// A table mapping application attribute IDs to handling policy: how much
/// data to accumulate before invoking the callback, and the callback
/// itself. Built with `HandlerTableBuilder`; there is no sentinel entry,
/// unlike the NUL-terminated array `amar_start_read` reads its handler
/// table from.
pub struct HandlerTable {
    pub(crate) entries: Vec<HandlerEntry>,
}

impl HandlerTable {
    fn find(&self, attrid: u16) -> Option<usize> {
        self.entries.iter().position(|e| e.attrid == attrid)
    }
}

/// Builds a [`HandlerTable`].
#[derive(Default)]
pub struct HandlerTableBuilder {
    entries: Vec<HandlerEntry>,
}

impl HandlerTableBuilder {
    pub fn new() -> Self {
        HandlerTableBuilder { entries: Vec::new() }
    }

    /// Registers a callback for `attrid`. `min_size` is the minimum chunk
    /// size to accumulate before invoking the callback when data arrives
    /// in pieces smaller than that (0 means "call back on every hunk,
    /// unbuffered").
    pub fn on_attr(
        mut self,
        attrid: u16,
        min_size: usize,
        callback: impl FnMut(AttrEvent<'_>) -> Result<()> + Send + 'static,
    ) -> Self {
        self.entries.push(HandlerEntry {
            attrid,
            min_size,
            callback: Box::new(callback),
        });
        self
    }

    pub fn build(self) -> HandlerTable {
        HandlerTable { entries: self.entries }
    }
}

pub(crate) struct OpenAttr {
    pub(crate) attrid: u16,
    pub(crate) handler: Option<usize>,
    pub(crate) buf: Vec<u8>,
    pub(crate) wrote_eoa: bool,
}

pub(crate) struct OpenFile {
    pub(crate) filenum: u16,
    pub(crate) ignore: bool,
    pub(crate) open_attrs: Vec<OpenAttr>,
}

/// Drives the record demultiplexer over a synchronous byte source.
pub struct Reader<B> {
    buf: ReadBuffer<B>,
    handlers: HandlerTable,
    file_start: Option<Box<FileStartCallback>>,
    file_finish: Option<Box<FileFinishCallback>>,
    open_files: Vec<OpenFile>,
}

impl<R: Read> Reader<NotSeekable<R>> {
    /// Opens a reader with no seek support; `skip` always reads and
    /// discards.
    pub fn new(source: R) -> Self {
        Reader::from_buffer(ReadBuffer::new(NotSeekable(source)))
    }
}

impl<R: Read + Seek> Reader<R> {
    /// Opens a reader that will use `lseek`-style seeking to skip large
    /// spans of uninteresting data, falling back to read-and-discard if
    /// the source turns out not to support it.
    pub fn new_seekable(source: R) -> Self {
        Reader::from_buffer(ReadBuffer::with_seek_support(source))
    }
}

impl<B: Read + TrySeek> Reader<B> {
    fn from_buffer(buf: ReadBuffer<B>) -> Self {
        Reader {
            buf,
            handlers: HandlerTableBuilder::new().build(),
            file_start: None,
            file_finish: None,
            open_files: Vec::new(),
        }
    }

    pub fn with_handlers(mut self, handlers: HandlerTable) -> Self {
        self.handlers = handlers;
        self
    }

    /// Registers a callback invoked when a new logical file's filename
    /// record is seen. Returning `true` marks the file to be ignored
    /// (its attribute records are skipped without being delivered).
    pub fn on_file_start(
        mut self,
        callback: impl FnMut(u16, &[u8]) -> Result<bool> + Send + 'static,
    ) -> Self {
        self.file_start = Some(Box::new(callback));
        self
    }

    /// Registers a callback invoked when a logical file ends, either via
    /// its EOF record or because the stream ended while it was still
    /// open (`truncated = true`).
    pub fn on_file_finish(
        mut self,
        callback: impl FnMut(u16, bool) -> Result<()> + Send + 'static,
    ) -> Self {
        self.file_finish = Some(Box::new(callback));
        self
    }

    pub fn position(&self) -> u64 {
        self.buf.position()
    }

    /// Runs the demultiplexer to completion: either a clean end of stream
    /// (optionally with some files left truncated-open) or the first
    /// protocol error encountered.
    ///
    /// Either way, every file still open when the loop stops has had its
    /// attributes and itself finished with `truncated = true` before this
    /// returns — including when it returns an error, not only on a clean
    /// end of stream. A secondary error from that cleanup pass is logged
    /// and discarded in favor of the original error.
    pub fn run(&mut self) -> Result<()> {
        let result = self.run_inner();
        match self.finish_all_truncated() {
            Ok(()) => result,
            Err(cleanup_err) => {
                if result.is_err() {
                    warn!(error = %cleanup_err, "error finishing truncated files after a prior read error");
                    result
                } else {
                    Err(cleanup_err)
                }
            }
        }
    }

    fn run_inner(&mut self) -> Result<()> {
        if self.buf.ensure_at_least(RECORD_SIZE)? {
            let preamble = self.decode_preamble();
            if !preamble.is_header() {
                return Err(AmarError::invalid_archive(
                    "archive read does not begin at a header record",
                    self.position(),
                ));
            }
        }

        loop {
            if !self.buf.ensure_at_least(RECORD_SIZE)? {
                break;
            }
            let preamble = self.decode_preamble();

            if preamble.is_header() {
                if !self.buf.ensure_at_least(HEADER_SIZE)? {
                    break;
                }
                self.handle_header()?;
                continue;
            }

            self.buf.advance(RECORD_SIZE);

            if preamble.size as usize > MAX_RECORD_DATA_SIZE {
                return Err(AmarError::invalid_archive(
                    format!(
                        "invalid record: data size must be at most {MAX_RECORD_DATA_SIZE}"
                    ),
                    self.position(),
                ));
            }

            if preamble.attrid < AMAR_ATTR_APP_START {
                if !self.handle_reserved_attr(&preamble)? {
                    break;
                }
                continue;
            }

            if !self.handle_app_attr(&preamble)? {
                break;
            }
        }

        Ok(())
    }

    fn decode_preamble(&self) -> Preamble {
        let mut bytes = [0u8; RECORD_SIZE];
        bytes.copy_from_slice(&self.buf.peek()[..RECORD_SIZE]);
        Preamble::decode(&bytes)
    }

    fn handle_header(&mut self) -> Result<()> {
        let header_bytes: [u8; HEADER_SIZE] = self.buf.peek()[..HEADER_SIZE]
            .try_into()
            .expect("ensure_at_least(HEADER_SIZE) already checked");
        let version = record::parse_header(&header_bytes).ok_or_else(|| {
            AmarError::invalid_archive("invalid archive header", self.position())
        })?;
        if version > HEADER_VERSION {
            return Err(AmarError::invalid_archive(
                format!("archive version {version} is not supported"),
                self.position(),
            ));
        }
        self.buf.advance(HEADER_SIZE);
        Ok(())
    }

    /// Handles an EOF or FILENAME record. Returns `Ok(false)` to signal
    /// the caller should stop the read loop cleanly (end of stream).
    fn handle_reserved_attr(&mut self, preamble: &Preamble) -> Result<bool> {
        if preamble.attrid == AMAR_ATTR_EOF {
            if preamble.size != 0 {
                return Err(AmarError::invalid_archive(
                    "archive contains an EOF record with nonzero size",
                    self.position(),
                ));
            }
            if let Some(idx) = self.open_files.iter().position(|f| f.filenum == preamble.filenum) {
                let file = self.open_files.remove(idx);
                self.finish_file(file, false)?;
            }
            return Ok(true);
        }

        if preamble.attrid == AMAR_ATTR_FILENAME {
            return self.handle_filename_record(preamble);
        }

        Err(AmarError::invalid_archive(
            format!(
                "unknown attribute id {} in archive file {}",
                preamble.attrid, preamble.filenum
            ),
            self.position(),
        ))
    }

    fn handle_filename_record(&mut self, preamble: &Preamble) -> Result<bool> {
        if let Some(idx) = self.open_files.iter().position(|f| f.filenum == preamble.filenum) {
            warn!(filenum = preamble.filenum, "previous file did not end correctly");
            let file = self.open_files.remove(idx);
            self.finish_file(file, true)?;
        }

        if preamble.size == 0 {
            if !self.buf.ensure_at_least(NUL_PADDING_LEN)? {
                trace!("stream ends close to a zero-length filename record");
                return Ok(false);
            }
            let padding = &self.buf.peek()[..NUL_PADDING_LEN];
            let all_nul = padding.iter().all(|&b| b == 0);
            if all_nul {
                debug!("reached NUL padding, stream ends cleanly");
                return Ok(false);
            }
            return Err(AmarError::invalid_archive(
                format!("archive file {} has an empty filename", preamble.filenum),
                self.position(),
            ));
        }

        if !preamble.eoa {
            return Err(AmarError::invalid_archive(
                format!(
                    "filename record for fileid {} does not have its EOA bit set",
                    preamble.filenum
                ),
                self.position(),
            ));
        }

        if !self.buf.ensure_at_least(preamble.size as usize)? {
            return Ok(false);
        }
        let filename = self.buf.peek()[..preamble.size as usize].to_vec();

        let ignore = match &mut self.file_start {
            Some(cb) => cb(preamble.filenum, &filename)?,
            None => false,
        };
        self.buf.advance(preamble.size as usize);

        debug!(filenum = preamble.filenum, ignore, "opened file");
        self.open_files.push(OpenFile {
            filenum: preamble.filenum,
            ignore,
            open_attrs: Vec::new(),
        });
        Ok(true)
    }

    /// Handles an application attribute record. Returns `Ok(false)` if the
    /// stream ended partway through the payload.
    fn handle_app_attr(&mut self, preamble: &Preamble) -> Result<bool> {
        let file_idx = self.open_files.iter().position(|f| f.filenum == preamble.filenum);
        let ignore = match file_idx {
            Some(idx) => self.open_files[idx].ignore,
            None => true,
        };
        if ignore {
            return self.skip_payload(preamble.size as usize);
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

        // Fast path: a one-record attribute with no prior accumulated state.
        if preamble.eoa && attr_idx.is_none() {
            return self.handle_fast_path(file_idx, preamble, handler);
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
            if !self.skip_payload(preamble.size as usize)? {
                return Ok(false);
            }
            if preamble.eoa {
                self.finish_attr_at(file_idx, attr_idx, false)?;
            }
            return Ok(true);
        };

        if !self.buf.ensure_at_least(preamble.size as usize)? {
            // deliver what we have, then stop; the remainder is lost when
            // the stream truncates here.
            let data = self.buf.peek().to_vec();
            let n = data.len();
            self.deliver_hunk(file_idx, attr_idx, handler_idx, &data, false)?;
            self.buf.advance(n);
            return Ok(false);
        }

        let data = self.buf.peek()[..preamble.size as usize].to_vec();
        self.deliver_hunk(file_idx, attr_idx, handler_idx, &data, preamble.eoa)?;
        self.buf.advance(preamble.size as usize);

        if preamble.eoa {
            self.finish_attr_at(file_idx, attr_idx, false)?;
        }
        Ok(true)
    }

    fn handle_fast_path(
        &mut self,
        file_idx: usize,
        preamble: &Preamble,
        handler: Option<usize>,
    ) -> Result<bool> {
        let Some(handler_idx) = handler else {
            return self.skip_payload(preamble.size as usize);
        };
        if !self.buf.ensure_at_least(preamble.size as usize)? {
            // The stream truncated mid-payload on what would otherwise have
            // been a single-record attribute. Fall back to the slow path's
            // bookkeeping so `finish_all_truncated` has an `OpenAttr` to
            // finish: register it, deliver what we have, then stop.
            self.open_files[file_idx].open_attrs.push(OpenAttr {
                attrid: preamble.attrid,
                handler: Some(handler_idx),
                buf: Vec::new(),
                wrote_eoa: false,
            });
            let attr_idx = self.open_files[file_idx].open_attrs.len() - 1;
            let data = self.buf.peek().to_vec();
            let n = data.len();
            self.deliver_hunk(file_idx, attr_idx, handler_idx, &data, false)?;
            self.buf.advance(n);
            return Ok(false);
        }
        let data = self.buf.peek()[..preamble.size as usize].to_vec();
        let cb = &mut self.handlers.entries[handler_idx].callback;
        cb(AttrEvent {
            filenum: preamble.filenum,
            attrid: preamble.attrid,
            data: &data,
            eoa: true,
            truncated: false,
        })?;
        self.buf.advance(preamble.size as usize);
        Ok(true)
    }

    /// Buffers or immediately delivers `data` for the attribute at
    /// `(file_idx, attr_idx)`, per the handler's `min_size`, mirroring
    /// `handle_hunk`.
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

    fn finish_attr_at(&mut self, file_idx: usize, attr_idx: usize, truncated: bool) -> Result<()> {
        let attr = self.open_files[file_idx].open_attrs.remove(attr_idx);
        self.finish_attr(self.open_files[file_idx].filenum, attr, truncated)
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

    fn skip_payload(&mut self, size: usize) -> Result<bool> {
        self.buf.skip(size as u64)
    }
}

/// A convenience passthrough handler: copies attribute payloads verbatim
/// into `sink` as they arrive, ignoring `min_size` buffering concerns by
/// registering with `min_size = 0`. Grounded in `amar_read_to`'s raw file
/// descriptor passthrough, generalized to any `Write`.
pub fn passthrough_handler<W: Write + Send + 'static>(
    mut sink: W,
) -> impl FnMut(AttrEvent<'_>) -> Result<()> + Send {
    move |event| {
        sink.write_all(event.data)
            .map_err(|e| AmarError::io(e, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::Writer;
    use std::sync::{Arc, Mutex};

    fn build_archive() -> Vec<u8> {
        let mut w = Writer::new(Vec::new()).unwrap();
        let file = w.new_file(b"hello.txt").unwrap();
        let mut attr = file.new_attr(AMAR_ATTR_APP_START).unwrap();
        attr.append_buffer(b"some data", true).unwrap();
        attr.close().ok();
        w.close_file(file).unwrap();
        w.close().unwrap()
    }

    #[test]
    fn reads_header_only_archive() {
        let w = Writer::new(Vec::new()).unwrap();
        let bytes = w.close().unwrap();
        let mut r = Reader::new(&bytes[..]);
        r.run().unwrap();
    }

    #[test]
    fn delivers_filename_and_attribute_data() {
        let bytes = build_archive();
        let names: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let payloads: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));

        let names2 = Arc::clone(&names);
        let payloads2 = Arc::clone(&payloads);

        let handlers = HandlerTableBuilder::new()
            .on_attr(AMAR_ATTR_APP_START, 0, move |event: AttrEvent<'_>| {
                payloads2.lock().unwrap().extend_from_slice(event.data);
                Ok(())
            })
            .build();

        let mut r = Reader::new(&bytes[..])
            .with_handlers(handlers)
            .on_file_start(move |_filenum, filename| {
                names2
                    .lock()
                    .unwrap()
                    .push(String::from_utf8_lossy(filename).into_owned());
                Ok(false)
            });

        r.run().unwrap();
        assert_eq!(names.lock().unwrap().as_slice(), &["hello.txt".to_string()]);
        assert_eq!(payloads.lock().unwrap().as_slice(), b"some data");
    }

    #[test]
    fn rejects_stream_not_starting_with_header() {
        let mut r = Reader::new(&b"garbage!"[..]);
        assert!(r.run().is_err());
    }

    #[test]
    fn ignored_file_skips_attribute_delivery() {
        let bytes = build_archive();
        let called = Arc::new(Mutex::new(false));
        let called2 = Arc::clone(&called);
        let handlers = HandlerTableBuilder::new()
            .on_attr(AMAR_ATTR_APP_START, 0, move |_event: AttrEvent<'_>| {
                *called2.lock().unwrap() = true;
                Ok(())
            })
            .build();
        let mut r = Reader::new(&bytes[..])
            .with_handlers(handlers)
            .on_file_start(|_filenum, _filename| Ok(true));
        r.run().unwrap();
        assert!(!*called.lock().unwrap());
    }

    #[test]
    fn finishes_truncated_file_on_clean_eof() {
        // Hand-built archive: header, filename record (EOA), one data
        // record without EOA, and nothing else -- simulates a stream
        // that's missing its trailing EOF/EOA records.
        let mut bytes = record::encode_header(HEADER_VERSION).to_vec();
        let filename_preamble = Preamble::new(1, AMAR_ATTR_FILENAME, 11, true);
        bytes.extend_from_slice(&filename_preamble.encode());
        bytes.extend_from_slice(b"partial.txt");
        let data_preamble = Preamble::new(1, AMAR_ATTR_APP_START, 7, false);
        bytes.extend_from_slice(&data_preamble.encode());
        bytes.extend_from_slice(b"partial");

        let finished = Arc::new(Mutex::new(None));
        let finished2 = Arc::clone(&finished);
        let mut r = Reader::new(&bytes[..]).on_file_finish(move |filenum, truncated| {
            *finished2.lock().unwrap() = Some((filenum, truncated));
            Ok(())
        });
        r.run().unwrap();
        assert_eq!(*finished.lock().unwrap(), Some((1, true)));
    }
}
