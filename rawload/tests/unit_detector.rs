use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::Arc;
use std::thread;

use rand::{rngs::StdRng, Rng, SeedableRng};
use rawload::detector::{status_is_ok, ResponseLengthCache, ResponseReader};
use rawload_common::LoadError;

const HELLO: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nHELLO";

/// Serves `data` in the given chunk sizes; once the sizes run out, the rest goes in
/// as few reads as the caller's buffer allows.
struct ChunkedReader {
    data: Vec<u8>,
    pos: usize,
    chunks: VecDeque<usize>,
}

impl ChunkedReader {
    fn whole(data: &[u8]) -> Self {
        Self::split(data, &[])
    }

    fn split(data: &[u8], chunks: &[usize]) -> Self {
        Self { data: data.to_vec(), pos: 0, chunks: chunks.iter().copied().collect() }
    }

    fn consumed(&self) -> usize {
        self.pos
    }
}

impl Read for ChunkedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.data.len() - self.pos;
        let chunk = self.chunks.pop_front().unwrap_or(usize::MAX);
        let n = chunk.min(buf.len()).min(remaining);
        if chunk > n && n > 0 {
            // The caller's buffer cut this chunk short; deliver the rest next time.
            self.chunks.push_front(chunk - n);
        }
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Fails every read with the given error kind.
struct FailingReader(io::ErrorKind);

impl Read for FailingReader {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(self.0, "injected"))
    }
}

/// Interrupts every other read, otherwise delegates.
struct InterruptingReader {
    inner: ChunkedReader,
    interrupt: bool,
}

impl Read for InterruptingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.interrupt = !self.interrupt;
        if self.interrupt {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "signal"));
        }
        self.inner.read(buf)
    }
}

fn response(status: &str, before: &[&str], after: &[&str], body: &[u8]) -> Vec<u8> {
    let mut out = format!("HTTP/1.1 {status}\r\n").into_bytes();
    for header in before {
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    for header in after {
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}

fn reader(capacity: usize) -> ResponseReader {
    ResponseReader::new(capacity, Arc::new(ResponseLengthCache::new()))
}

/// Detect on a fresh cache; returns (status ok, cached length, bytes consumed).
fn detect(data: &[u8], chunks: &[usize], capacity: usize) -> (bool, Option<usize>, usize) {
    let mut reader = reader(capacity);
    let mut stream = ChunkedReader::split(data, chunks);
    let ok = reader.read_response(&mut stream).expect("detection failed");
    (ok, reader.cache().get(), stream.consumed())
}

#[test]
fn test_whole_response_detected() {
    // 38 header bytes (status line 17, Content-Length line 19, blank line 2) + 5 body bytes.
    assert_eq!(HELLO.len(), 43);

    let (ok, length, consumed) = detect(HELLO, &[], 65_536);
    assert!(ok);
    assert_eq!(length, Some(HELLO.len()));
    assert_eq!(consumed, HELLO.len());
}

#[test]
fn test_split_inside_content_length_marker() {
    // "Content-Length: " starts at byte 17; split 5 bytes into it.
    let whole = detect(HELLO, &[], 65_536);
    let split = detect(HELLO, &[22], 65_536);
    assert_eq!(split, whole);

    // Same split when the buffer is too small to hold the header in one go.
    assert_eq!(detect(HELLO, &[22], 32), whole);
}

#[test]
fn test_non_200_status_still_measured_and_drained() {
    let data = response("404 Not Found", &["Server: stub"], &[], b"missing");
    let (ok, length, consumed) = detect(&data, &[], 65_536);
    assert!(!ok);
    assert_eq!(length, Some(data.len()));
    assert_eq!(consumed, data.len());
}

#[test]
fn test_status_check_is_positional() {
    assert!(status_is_ok(b"HTTP/1.1 200 OK"));
    assert!(!status_is_ok(b"HTTP/1.1 201 Created"));
    // A protocol token of another length shifts the code; this reads as not OK.
    assert!(!status_is_ok(b"HTTP/2 200 OK"));
    assert!(!status_is_ok(b"HTTP/1.1 20"));

    let data = b"HTTP/2.0 500 ERR\r\nContent-Length: 0\r\n\r\n";
    let (ok, length, _) = detect(data, &[], 65_536);
    assert!(!ok);
    assert_eq!(length, Some(data.len()));
}

#[test]
fn test_small_buffer_with_long_headers() {
    let data = response(
        "200 OK",
        &["Server: a-rather-long-server-name/1.0", "Date: Mon, 01 Jan 2024 00:00:00 GMT"],
        &["Content-Type: application/json", "X-Trace: 0123456789abcdef"],
        br#"{"message":"Hello, World!"}"#,
    );
    for capacity in [32, 33, 40, 47, 64] {
        let (ok, length, consumed) = detect(&data, &[], capacity);
        assert!(ok, "capacity {capacity}");
        assert_eq!(length, Some(data.len()), "capacity {capacity}");
        assert_eq!(consumed, data.len(), "capacity {capacity}");
    }
}

#[test]
fn test_body_larger_than_buffer_is_drained() {
    let body = vec![b'x'; 10_000];
    let data = response("200 OK", &[], &[], &body);
    let (ok, length, consumed) = detect(&data, &[], 64);
    assert!(ok);
    assert_eq!(length, Some(data.len()));
    assert_eq!(consumed, data.len());
}

#[test]
fn test_chunk_boundaries_do_not_change_result() {
    let mut rng = StdRng::seed_from_u64(7);
    let bodies: [&[u8]; 3] = [b"", b"HELLO", &[b'z'; 300]];
    let layouts: [(&[&str], &[&str]); 3] = [
        (&[], &[]),
        (&["Server: stub", "Date: Mon, 01 Jan 2024 00:00:00 GMT"], &[]),
        (&["Server: stub"], &["Content-Type: text/plain", "Connection: keep-alive"]),
    ];

    for body in bodies {
        for (before, after) in layouts {
            let data = response("200 OK", before, after, body);
            for capacity in [32, 33, 50, 64, 65_536] {
                let expected = detect(&data, &[], capacity);
                assert_eq!(expected.1, Some(data.len()));

                for _ in 0..40 {
                    let chunks: Vec<usize> = (0..data.len()).map(|_| rng.gen_range(1..=24)).collect();
                    assert_eq!(
                        detect(&data, &chunks, capacity),
                        expected,
                        "capacity {capacity}, chunks {chunks:?}"
                    );
                }
            }
        }
    }
}

#[test]
fn test_single_byte_reads() {
    let chunks = vec![1; HELLO.len()];
    assert_eq!(detect(HELLO, &chunks, 32), (true, Some(HELLO.len()), HELLO.len()));
}

#[test]
fn test_cached_length_skips_detection() {
    // No Content-Length header: detection would fail, the cached path never looks.
    let data = b"HTTP/1.1 200 OK\r\nX-Len: none\r\n\r\nbody";
    let cache = Arc::new(ResponseLengthCache::with_length(data.len()));
    let mut reader = ResponseReader::new(32, cache);

    for _ in 0..3 {
        let mut stream = ChunkedReader::split(data, &[3, 7, 1]);
        assert!(reader.read_response(&mut stream).unwrap());
        assert_eq!(stream.consumed(), data.len());
    }
}

#[test]
fn test_detection_runs_once_per_connection() {
    let mut reader = reader(64);

    let mut first = ChunkedReader::whole(HELLO);
    assert!(reader.read_response(&mut first).unwrap());
    assert_eq!(reader.cache().get(), Some(HELLO.len()));

    // Same length, but without the headers detection needs.
    let mut headerless = b"HTTP/1.1 503 Service Unavailable\r\n\r\n".to_vec();
    headerless.resize(HELLO.len(), b'x');
    let mut second = ChunkedReader::split(&headerless, &[20]);
    assert!(!reader.read_response(&mut second).unwrap());
    assert_eq!(reader.last_read(), HELLO.len());
}

#[test]
fn test_shared_cache_between_connections() {
    let cache = Arc::new(ResponseLengthCache::new());
    let mut first = ResponseReader::new(64, Arc::clone(&cache));
    let mut second = ResponseReader::new(64, Arc::clone(&cache));

    first.read_response(&mut ChunkedReader::whole(HELLO)).unwrap();
    assert_eq!(cache.get(), Some(HELLO.len()));

    let headerless = vec![b'-'; HELLO.len()];
    let mut stream = ChunkedReader::whole(&headerless);
    assert!(!second.read_response(&mut stream).unwrap());
    assert_eq!(stream.consumed(), HELLO.len());
}

#[test]
fn test_cache_first_writer_wins() {
    let cache = ResponseLengthCache::new();
    assert_eq!(cache.get(), None);
    cache.store(41);
    cache.store(99);
    assert_eq!(cache.get(), Some(41));
}

#[test]
fn test_cache_concurrent_stores_settle_on_one_value() {
    let cache = Arc::new(ResponseLengthCache::new());
    let handles: Vec<_> = (1..=8)
        .map(|n| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || cache.store(n * 100))
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    let stored = cache.get().expect("a length must be stored");
    assert!(stored % 100 == 0 && (100..=800).contains(&stored));
}

#[test]
fn test_missing_content_length() {
    let data = b"HTTP/1.1 200 OK\r\nServer: stub\r\n\r\nbody";
    let mut stream = ChunkedReader::whole(data);
    let err = reader(64).read_response(&mut stream).unwrap_err();
    assert_eq!(err, LoadError::MissingContentLength);
}

#[test]
fn test_missing_header_terminator() {
    let data = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nServer: stub\r\n";
    let err = reader(32).read_response(&mut ChunkedReader::whole(data)).unwrap_err();
    assert_eq!(err, LoadError::MissingHeaderTerminator);

    // Stream ends in the middle of the value.
    let data = b"HTTP/1.1 200 OK\r\nContent-Length: 12";
    let err = reader(32).read_response(&mut ChunkedReader::whole(data)).unwrap_err();
    assert_eq!(err, LoadError::MissingHeaderTerminator);
}

#[test]
fn test_non_numeric_content_length() {
    let data = b"HTTP/1.1 200 OK\r\nContent-Length: abc\r\n\r\n";
    let err = reader(64).read_response(&mut ChunkedReader::whole(data)).unwrap_err();
    assert_eq!(err, LoadError::InvalidContentLength("abc".to_string()));

    let data = b"HTTP/1.1 200 OK\r\nContent-Length: \r\n\r\n";
    let err = reader(64).read_response(&mut ChunkedReader::whole(data)).unwrap_err();
    assert_eq!(err, LoadError::InvalidContentLength(String::new()));
}

#[test]
fn test_closed_before_status_line() {
    let err = reader(64).read_response(&mut ChunkedReader::whole(b"HTTP/1.1")).unwrap_err();
    assert_eq!(err, LoadError::ConnectionClosed);
}

#[test]
fn test_closed_while_draining_body() {
    let data = b"HTTP/1.1 200 OK\r\nContent-Length: 50\r\n\r\nshort";
    let err = reader(64).read_response(&mut ChunkedReader::whole(data)).unwrap_err();
    assert_eq!(err, LoadError::ConnectionClosed);
}

#[test]
fn test_read_timeout_is_fatal() {
    let err = reader(64).read_response(&mut FailingReader(io::ErrorKind::WouldBlock)).unwrap_err();
    assert_eq!(err, LoadError::ReadTimeout);

    let err = reader(64).read_response(&mut FailingReader(io::ErrorKind::ConnectionReset)).unwrap_err();
    assert!(matches!(err, LoadError::ConnectionError(_)));
}

#[test]
fn test_interrupted_reads_are_reissued() {
    let mut stream = InterruptingReader { inner: ChunkedReader::split(HELLO, &[4, 9, 13]), interrupt: false };
    let mut reader = reader(32);
    assert!(reader.read_response(&mut stream).unwrap());
    assert_eq!(reader.cache().get(), Some(HELLO.len()));
}

#[test]
fn test_capacity_has_floor() {
    assert_eq!(reader(4).capacity(), 32);
    assert_eq!(reader(4096).capacity(), 4096);
}
