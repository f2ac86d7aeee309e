//! Archive-level integration tests: build an archive through `Writer`,
//! decode it back through `Reader`, and assert on the recovered shape.
//! Styled after `ar_archive_writer`'s `round_trip.rs` (build, re-parse,
//! assert on structure) rather than byte-exact golden files.

use std::sync::{Arc, Mutex};

use pretty_assertions::assert_eq;

use amar::record::{AMAR_ATTR_APP_START, MAX_RECORD_DATA_SIZE};
use amar::{AttrEvent, HandlerTableBuilder, Reader, Writer};

#[test]
fn empty_archive_round_trips() {
    let w = Writer::new(Vec::new()).unwrap();
    let bytes = w.close().unwrap();

    let mut r = Reader::new(&bytes[..]);
    r.run().unwrap();
}

#[test]
fn single_file_single_attribute_round_trips() {
    let mut w = Writer::new(Vec::new()).unwrap();
    let file = w.new_file(b"report.txt").unwrap();
    let mut attr = file.new_attr(AMAR_ATTR_APP_START).unwrap();
    attr.append_buffer(b"line one\n", false).unwrap();
    attr.append_buffer(b"line two\n", true).unwrap();
    attr.close().unwrap();
    w.close_file(file).unwrap();
    let bytes = w.close().unwrap();

    let names = Arc::new(Mutex::new(Vec::new()));
    let payload = Arc::new(Mutex::new(Vec::new()));
    let finishes = Arc::new(Mutex::new(Vec::new()));

    let (names2, payload2, finishes2) = (
        Arc::clone(&names),
        Arc::clone(&payload),
        Arc::clone(&finishes),
    );

    let handlers = HandlerTableBuilder::new()
        .on_attr(AMAR_ATTR_APP_START, 0, move |event: AttrEvent<'_>| {
            payload2.lock().unwrap().extend_from_slice(event.data);
            assert!(!event.truncated);
            Ok(())
        })
        .build();

    let mut r = Reader::new(&bytes[..])
        .with_handlers(handlers)
        .on_file_start(move |filenum, filename| {
            names2
                .lock()
                .unwrap()
                .push((filenum, filename.to_vec()));
            Ok(false)
        })
        .on_file_finish(move |filenum, truncated| {
            finishes2.lock().unwrap().push((filenum, truncated));
            Ok(())
        });
    r.run().unwrap();

    assert_eq!(names.lock().unwrap().as_slice(), &[(1, b"report.txt".to_vec())]);
    assert_eq!(payload.lock().unwrap().as_slice(), b"line one\nline two\n");
    assert_eq!(finishes.lock().unwrap().as_slice(), &[(1, false)]);
}

#[test]
fn attribute_spanning_the_max_record_size_is_split_and_reassembled() {
    let mut w = Writer::new(Vec::new()).unwrap();
    let file = w.new_file(b"big.bin").unwrap();
    let mut attr = file.new_attr(AMAR_ATTR_APP_START).unwrap();

    let payload: Vec<u8> = (0..(MAX_RECORD_DATA_SIZE + 12345))
        .map(|i| (i % 256) as u8)
        .collect();
    attr.append_buffer(&payload, true).unwrap();
    attr.close().unwrap();
    w.close_file(file).unwrap();
    let bytes = w.close().unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let hunk_count = Arc::new(Mutex::new(0usize));
    let (received2, hunk_count2) = (Arc::clone(&received), Arc::clone(&hunk_count));

    let handlers = HandlerTableBuilder::new()
        .on_attr(AMAR_ATTR_APP_START, 0, move |event: AttrEvent<'_>| {
            received2.lock().unwrap().extend_from_slice(event.data);
            *hunk_count2.lock().unwrap() += 1;
            Ok(())
        })
        .build();

    let mut r = Reader::new(&bytes[..])
        .with_handlers(handlers)
        .on_file_start(|_, _| Ok(false));
    r.run().unwrap();

    assert_eq!(received.lock().unwrap().as_slice(), payload.as_slice());
    assert!(
        *hunk_count.lock().unwrap() >= 2,
        "a payload over MAX_RECORD_DATA_SIZE must arrive as more than one record"
    );
}

#[test]
fn min_size_buffers_small_hunks_until_threshold_reached_mid_stream() {
    let mut w = Writer::new(Vec::new()).unwrap();
    let file = w.new_file(b"chunked.bin").unwrap();
    let mut attr = file.new_attr(AMAR_ATTR_APP_START).unwrap();
    // Four small, non-final hunks, each well under the 16-byte threshold.
    attr.append_buffer(b"ab", false).unwrap();
    attr.append_buffer(b"cd", false).unwrap();
    attr.append_buffer(b"ef", false).unwrap();
    attr.append_buffer(b"ghijklmnopqrstuvwxyz", true).unwrap();
    attr.close().unwrap();
    w.close_file(file).unwrap();
    let bytes = w.close().unwrap();

    let deliveries: Arc<Mutex<Vec<(usize, bool)>>> = Arc::new(Mutex::new(Vec::new()));
    let deliveries2 = Arc::clone(&deliveries);

    let handlers = HandlerTableBuilder::new()
        .on_attr(AMAR_ATTR_APP_START, 16, move |event: AttrEvent<'_>| {
            deliveries2.lock().unwrap().push((event.data.len(), event.eoa));
            Ok(())
        })
        .build();

    let mut r = Reader::new(&bytes[..])
        .with_handlers(handlers)
        .on_file_start(|_, _| Ok(false));
    r.run().unwrap();

    // "ab" + "cd" + "ef" are only 6 bytes, below min_size, so they're held
    // until the final hunk pushes the buffered total over 16.
    let deliveries = deliveries.lock().unwrap();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0], (26, true));
}

#[test]
fn min_size_flushes_whatever_remains_at_eoa_even_if_under_threshold() {
    let mut w = Writer::new(Vec::new()).unwrap();
    let file = w.new_file(b"short.bin").unwrap();
    let mut attr = file.new_attr(AMAR_ATTR_APP_START).unwrap();
    attr.append_buffer(b"xy", true).unwrap();
    attr.close().unwrap();
    w.close_file(file).unwrap();
    let bytes = w.close().unwrap();

    let deliveries: Arc<Mutex<Vec<(Vec<u8>, bool)>>> = Arc::new(Mutex::new(Vec::new()));
    let deliveries2 = Arc::clone(&deliveries);

    let handlers = HandlerTableBuilder::new()
        .on_attr(AMAR_ATTR_APP_START, 1024, move |event: AttrEvent<'_>| {
            deliveries2
                .lock()
                .unwrap()
                .push((event.data.to_vec(), event.eoa));
            Ok(())
        })
        .build();

    let mut r = Reader::new(&bytes[..])
        .with_handlers(handlers)
        .on_file_start(|_, _| Ok(false));
    r.run().unwrap();

    let deliveries = deliveries.lock().unwrap();
    assert_eq!(deliveries.as_slice(), &[(b"xy".to_vec(), true)]);
}

#[test]
fn trailing_nul_padding_after_final_file_is_accepted_as_clean_eof() {
    let mut w = Writer::new(Vec::new()).unwrap();
    let file = w.new_file(b"a.txt").unwrap();
    let attr = file.new_attr(AMAR_ATTR_APP_START).unwrap();
    attr.close().unwrap();
    w.close_file(file).unwrap();
    let mut bytes = w.close().unwrap();

    // Simulate the archive being embedded in a fixed-size block device:
    // append a zero-length filename preamble (filenum reused is fine,
    // it's never opened) followed by 504 NUL bytes.
    let terminator = amar::record::Preamble::new(0, amar::record::AMAR_ATTR_FILENAME, 0, false);
    bytes.extend_from_slice(&terminator.encode());
    bytes.extend_from_slice(&[0u8; 504]);

    let mut r = Reader::new(&bytes[..]);
    r.run().unwrap();
}

#[test]
fn truncated_stream_reports_its_open_file_as_truncated() {
    // Build a well-formed archive through the public API, then truncate
    // the encoded bytes before the trailing EOF record to simulate a
    // connection that dropped mid-stream.
    let mut w = Writer::new(Vec::new()).unwrap();
    let file = w.new_file(b"half.txt").unwrap();
    let mut attr = file.new_attr(AMAR_ATTR_APP_START).unwrap();
    attr.append_buffer(b"not yet finished", false).unwrap();
    attr.close().unwrap();
    w.close_file(file).unwrap();
    let full = w.close().unwrap();

    // An EOF record has no payload, so it's exactly RECORD_SIZE (8) bytes
    // at the tail; drop it to leave the file open when the stream ends.
    let truncated = &full[..full.len() - 8];

    let finishes: Arc<Mutex<Vec<(u16, bool)>>> = Arc::new(Mutex::new(Vec::new()));
    let finishes2 = Arc::clone(&finishes);
    let deliveries: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));
    let deliveries2 = Arc::clone(&deliveries);

    let handlers = HandlerTableBuilder::new()
        .on_attr(AMAR_ATTR_APP_START, 0, move |event: AttrEvent<'_>| {
            deliveries2.lock().unwrap().push(event.eoa);
            Ok(())
        })
        .build();

    let mut r = Reader::new(truncated)
        .with_handlers(handlers)
        .on_file_start(|_, _| Ok(false))
        .on_file_finish(move |filenum, truncated| {
            finishes2.lock().unwrap().push((filenum, truncated));
            Ok(())
        });
    r.run().unwrap();

    assert_eq!(finishes.lock().unwrap().as_slice(), &[(1, true)]);
    // The attribute handler sees one delivery (the lone data hunk) and
    // since the stream ended without an EOA, `finish_attr` delivers a
    // final truncated=true call only if a handler is registered and the
    // attribute never wrote its own EOA -- here that's a second, empty
    // flush with eoa=true from `finish_attr`.
    assert!(deliveries.lock().unwrap().iter().any(|&eoa| eoa));
}
