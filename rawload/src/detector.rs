//! Response boundary detection over a raw byte stream.
//!
//! The detector never parses HTTP. It checks three status bytes at a fixed offset,
//! looks for the `Content-Length: ` header and the `\r\n\r\n` terminator, and from
//! those computes where the response ends. The computed length is cached so later
//! responses only need the status check and a drain.

use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use rawload_common::{LoadError, Result, MIN_BUFFER_CAPACITY};
use tracing::debug;

/// Status code position for a status line starting with exactly `HTTP/1.1 `.
const STATUS_OFFSET: usize = 9;
const STATUS_END: usize = 12;
const STATUS_OK: &[u8] = b"200";

const CONTENT_LENGTH: &[u8] = b"Content-Length: ";
const VALUE_END: u8 = b'\r';
const HEADER_END: &[u8] = b"\r\n\r\n";

/// Returns `true` when bytes 9..12 of `head` are `200`.
///
/// This is a byte-position check, not a parse: a status line whose protocol token
/// is not exactly nine bytes (`HTTP/2 200 OK`) is reported as not OK.
pub fn status_is_ok(head: &[u8]) -> bool {
    head.get(STATUS_OFFSET..STATUS_END) == Some(STATUS_OK)
}

/// Total response length shared by identically configured connections.
///
/// Reads are a single atomic load. The one assignment is serialized behind a
/// narrow lock and only the first writer wins; `0` means not yet known.
#[derive(Debug, Default)]
pub struct ResponseLengthCache {
    length: AtomicUsize,
    write_lock: Mutex<()>,
}

impl ResponseLengthCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache pre-seeded with a known response length.
    pub fn with_length(length: usize) -> Self {
        let cache = Self::default();
        cache.store(length);
        cache
    }

    pub fn get(&self) -> Option<usize> {
        match self.length.load(Ordering::Acquire) {
            0 => None,
            n => Some(n),
        }
    }

    /// Record `length` unless another connection already did.
    pub fn store(&self, length: usize) {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.length.load(Ordering::Relaxed) == 0 {
            self.length.store(length, Ordering::Release);
        }
    }
}

/// Per-connection reader owning the reusable response buffer.
///
/// Buffer bookkeeping for the response being read:
/// - `filled`: valid bytes at the front of `buf`
/// - `base`: stream offset (within the response) of `buf[0]`
/// - `total_read`: bytes pulled from the stream for this response
/// - `overlap`: bytes re-copied to the front on refills
///
/// `base` equals reads × capacity − overlap when every read fills the buffer, but
/// stays correct for short reads too.
pub struct ResponseReader {
    buf: Box<[u8]>,
    filled: usize,
    base: usize,
    total_read: usize,
    overlap: usize,
    cache: Arc<ResponseLengthCache>,
}

impl ResponseReader {
    pub fn new(capacity: usize, cache: Arc<ResponseLengthCache>) -> Self {
        Self {
            buf: vec![0; capacity.max(MIN_BUFFER_CAPACITY)].into_boxed_slice(),
            filled: 0,
            base: 0,
            total_read: 0,
            overlap: 0,
            cache,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn cache(&self) -> &ResponseLengthCache {
        &self.cache
    }

    /// Bytes consumed from the stream by the last call to [`read_response`](Self::read_response).
    pub fn last_read(&self) -> usize {
        self.total_read
    }

    /// Read one full response from `stream` and report whether its status was `200`.
    ///
    /// The first response on a connection group runs detection; once the length is
    /// cached, only the status bytes are inspected and the rest is drained.
    pub fn read_response<R: Read>(&mut self, stream: &mut R) -> Result<bool> {
        self.filled = 0;
        self.base = 0;
        self.total_read = 0;
        self.overlap = 0;

        match self.cache.get() {
            Some(length) => self.read_known(stream, length),
            None => self.detect(stream),
        }
    }

    fn read_known<R: Read>(&mut self, stream: &mut R, length: usize) -> Result<bool> {
        let ok = self.read_status(stream)?;
        self.drain(stream, length)?;
        Ok(ok)
    }

    fn detect<R: Read>(&mut self, stream: &mut R) -> Result<bool> {
        let ok = self.read_status(stream)?;

        let marker_end = self
            .scan_for(stream, STATUS_END, CONTENT_LENGTH)
            .map_err(|e| closed_as(e, LoadError::MissingContentLength))?;
        let (content_length, value_end) = self
            .read_content_length(stream, marker_end)
            .map_err(|e| closed_as(e, LoadError::MissingHeaderTerminator))?;
        let header_end = self
            .scan_for(stream, value_end, HEADER_END)
            .map_err(|e| closed_as(e, LoadError::MissingHeaderTerminator))?;

        let length = (self.base + header_end).saturating_add(content_length);
        debug!(
            length,
            content_length,
            overlap = self.overlap,
            capacity = self.buf.len(),
            "response length detected"
        );
        self.cache.store(length);

        self.drain(stream, length)?;
        Ok(ok)
    }

    fn read_status<R: Read>(&mut self, stream: &mut R) -> Result<bool> {
        while self.filled < STATUS_END {
            self.fill(stream)?;
        }
        Ok(status_is_ok(&self.buf[..self.filled]))
    }

    /// Scan `buf[cursor..filled]` for `marker`, refilling as needed, and return the
    /// buffer index just past it. On a miss the last `marker.len() - 1` bytes (never
    /// anything before `cursor`) move to the front so a match spanning the refill
    /// boundary is still found.
    fn scan_for<R: Read>(&mut self, stream: &mut R, mut cursor: usize, marker: &[u8]) -> Result<usize> {
        loop {
            if let Some(pos) = find(&self.buf[cursor..self.filled], marker) {
                return Ok(cursor + pos + marker.len());
            }
            let keep_from = self.filled.saturating_sub(marker.len() - 1).max(cursor);
            self.shift(keep_from);
            cursor = 0;
            self.fill(stream)?;
        }
    }

    /// Accumulate the digits starting at `cursor` up to the next `\r`. Returns the
    /// parsed value and the buffer index of that `\r`.
    fn read_content_length<R: Read>(&mut self, stream: &mut R, mut cursor: usize) -> Result<(usize, usize)> {
        let mut digits: Vec<u8> = Vec::with_capacity(8);
        loop {
            let pending = &self.buf[cursor..self.filled];
            if let Some(pos) = pending.iter().position(|&b| b == VALUE_END) {
                digits.extend_from_slice(&pending[..pos]);
                return parse_length(&digits).map(|value| (value, cursor + pos));
            }
            // Digits read so far live in the accumulator, nothing needs to be kept.
            digits.extend_from_slice(pending);
            self.shift(self.filled);
            cursor = 0;
            self.fill(stream)?;
        }
    }

    /// Keep reading until `length` bytes of this response came off the stream.
    fn drain<R: Read>(&mut self, stream: &mut R, length: usize) -> Result<()> {
        while self.total_read < length {
            self.shift(self.filled);
            self.fill(stream)?;
        }
        Ok(())
    }

    /// Drop `buf[..from]`, moving `buf[from..filled]` to the front.
    fn shift(&mut self, from: usize) {
        let kept = self.filled - from;
        self.buf.copy_within(from..self.filled, 0);
        self.base += from;
        self.overlap += kept;
        self.filled = kept;
    }

    /// One read into the free tail of the buffer. A zero-byte read is fatal.
    fn fill<R: Read>(&mut self, stream: &mut R) -> Result<usize> {
        loop {
            match stream.read(&mut self.buf[self.filled..]) {
                Ok(0) => return Err(LoadError::ConnectionClosed),
                Ok(n) => {
                    self.filled += n;
                    self.total_read += n;
                    return Ok(n);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

fn parse_length(digits: &[u8]) -> Result<usize> {
    let invalid = || LoadError::InvalidContentLength(String::from_utf8_lossy(digits).into_owned());
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(invalid());
    }
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(invalid)
}

/// A stream that ended mid-header is reported as the header that never showed up.
fn closed_as(err: LoadError, missing: LoadError) -> LoadError {
    match err {
        LoadError::ConnectionClosed => missing,
        other => other,
    }
}
