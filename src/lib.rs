//! Codec for the Amanda archive (AMAR) streaming container format.
//!
//! An AMAR archive multiplexes any number of logical files, each carrying
//! any number of named attributes, into one append-only byte stream: a
//! 28-byte header followed by a sequence of 8-byte-prefixed records. See
//! [`record`] for the wire format, [`writer`] for building an archive, and
//! [`reader`]/[`async_reader`] for reading one back.
//!
//! ```
//! use amar::record::AMAR_ATTR_APP_START;
//! use amar::writer::Writer;
//!
//! let mut writer = Writer::new(Vec::new()).unwrap();
//! let file = writer.new_file(b"greeting.txt").unwrap();
//! let mut attr = file.new_attr(AMAR_ATTR_APP_START).unwrap();
//! attr.append_buffer(b"hello, archive", true).unwrap();
//! attr.close().unwrap();
//! writer.close_file(file).unwrap();
//! let bytes = writer.close().unwrap();
//! assert!(!bytes.is_empty());
//! ```

pub mod async_reader;
pub mod error;
pub mod read_buffer;
pub mod reader;
pub mod record;
pub mod write_buffer;
pub mod writer;

pub use error::{AmarError, Result};
pub use reader::{AttrEvent, HandlerTable, HandlerTableBuilder, Reader};
pub use record::{
    AMAR_ATTR_APP_START, AMAR_ATTR_EOF, AMAR_ATTR_FILENAME, HEADER_VERSION, MAX_RECORD_DATA_SIZE,
};
pub use writer::{AttrHandle, FileHandle, Writer};
