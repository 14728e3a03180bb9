//! Incremental HTTP/1.x framing.
//!
//! A [`Framer`] consumes one direction of one stream. Bytes are pushed as they
//! arrive and complete messages are pulled out with [`Framer::next_frame`].
//! Scanning state is kept between calls so a large body is never rescanned,
//! and the frames produced do not depend on how the input was split.

use std::collections::VecDeque;

use bytes::{Buf, Bytes, BytesMut};

use super::message::Direction;
use crate::error::FramingError;

pub const DEFAULT_MAX_HEAD_BYTES: usize = 64 * 1024;
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Longest accepted chunk-size line (size plus extensions).
const MAX_CHUNK_LINE: usize = 1024;

/// Requests remembered by a response framer to detect HEAD responses.
const MAX_TRACKED_REQUESTS: usize = 1024;

/// Memory bounds for a single framer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramerLimits {
    pub max_head_bytes: usize,
    pub max_frame_bytes: usize,
}

impl Default for FramerLimits {
    fn default() -> Self {
        Self {
            max_head_bytes: DEFAULT_MAX_HEAD_BYTES,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Looking for the end of a message head; `scanned` bytes hold no terminator.
    Head { scanned: usize },
    /// Frame ends at a known offset.
    Fixed { end: usize },
    /// Chunked body; `cursor` points at the next chunk-size line.
    Chunked { cursor: usize },
    /// Response body delimited by connection close.
    UntilClose,
}

/// Framing facts extracted from a message head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HeadInfo {
    pub status: Option<u16>,
    pub content_length: Option<usize>,
    pub chunked: bool,
    pub transfer_encoding: bool,
}

enum ChunkScan {
    Complete(usize),
    Partial(usize),
}

/// Splits one direction of a stream into complete HTTP messages.
#[derive(Debug)]
pub struct Framer {
    direction: Direction,
    limits: FramerLimits,
    buf: BytesMut,
    state: State,
    /// Response side only: whether each outstanding request was a HEAD.
    head_requests: VecDeque<bool>,
}

impl Framer {
    pub fn new(direction: Direction, limits: FramerLimits) -> Self {
        Self {
            direction,
            limits,
            buf: BytesMut::new(),
            state: State::Head { scanned: 0 },
            head_requests: VecDeque::new(),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Append bytes read from the stream.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes buffered but not yet part of a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Tell a response framer about a request seen on the same stream.
    ///
    /// Responses to HEAD carry no body whatever their headers say, so the
    /// response side has to know which request each response answers.
    pub fn note_request(&mut self, is_head: bool) {
        if self.head_requests.len() == MAX_TRACKED_REQUESTS {
            self.head_requests.pop_front();
        }
        self.head_requests.push_back(is_head);
    }

    /// Pull the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, FramingError> {
        loop {
            let state = self.state;
            match state {
                State::Head { scanned } => {
                    if scanned == 0 {
                        while self.buf.starts_with(b"\r\n") {
                            self.buf.advance(2);
                        }
                        if &self.buf[..] == b"\r" {
                            return Ok(None);
                        }
                    }

                    let from = scanned.saturating_sub(3);
                    let Some(pos) = find(&self.buf[from..], b"\r\n\r\n") else {
                        if self.buf.len() > self.limits.max_head_bytes {
                            return Err(FramingError::HeadTooLarge {
                                limit: self.limits.max_head_bytes,
                            });
                        }
                        self.state = State::Head {
                            scanned: self.buf.len(),
                        };
                        return Ok(None);
                    };

                    let head_end = from + pos + 4;
                    if head_end > self.limits.max_head_bytes {
                        return Err(FramingError::HeadTooLarge {
                            limit: self.limits.max_head_bytes,
                        });
                    }
                    let info = parse_head(&self.buf[..head_end], self.direction)?;
                    self.state = self.body_state(&info, head_end)?;
                }
                State::Fixed { end } => {
                    if self.buf.len() < end {
                        return Ok(None);
                    }
                    return Ok(Some(self.complete(end)));
                }
                State::Chunked { cursor } => {
                    match scan_chunks(&self.buf, cursor, self.limits.max_frame_bytes)? {
                        ChunkScan::Complete(end) => return Ok(Some(self.complete(end))),
                        ChunkScan::Partial(cursor) => {
                            self.check_frame_size()?;
                            self.state = State::Chunked { cursor };
                            return Ok(None);
                        }
                    }
                }
                State::UntilClose => {
                    self.check_frame_size()?;
                    return Ok(None);
                }
            }
        }
    }

    /// Lazily iterate over the frames currently buffered.
    pub fn frames(&mut self) -> Frames<'_> {
        Frames {
            framer: self,
            failed: false,
        }
    }

    /// The stream closed: complete a close-delimited body and drop any partial frame.
    pub fn finish(&mut self) -> Option<Bytes> {
        let frame = match self.state {
            State::UntilClose if !self.buf.is_empty() => Some(self.buf.split().freeze()),
            _ => None,
        };
        self.reset();
        frame
    }

    /// Discard all buffered state.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.state = State::Head { scanned: 0 };
        self.head_requests.clear();
    }

    fn complete(&mut self, end: usize) -> Bytes {
        self.state = State::Head { scanned: 0 };
        self.buf.split_to(end).freeze()
    }

    fn check_frame_size(&self) -> Result<(), FramingError> {
        if self.buf.len() > self.limits.max_frame_bytes {
            return Err(FramingError::FrameTooLarge {
                limit: self.limits.max_frame_bytes,
            });
        }
        Ok(())
    }

    fn body_state(&mut self, info: &HeadInfo, head_end: usize) -> Result<State, FramingError> {
        if info.chunked && info.content_length.is_some() {
            return Err(FramingError::ConflictingLength);
        }

        let bodyless = match self.direction {
            Direction::Request => false,
            Direction::Response => {
                let status = info.status.unwrap_or(200);
                if status < 200 {
                    true
                } else {
                    let answers_head = self.head_requests.pop_front().unwrap_or(false);
                    answers_head || status == 204 || status == 304
                }
            }
        };
        if bodyless {
            return Ok(State::Fixed { end: head_end });
        }

        if info.chunked {
            return Ok(State::Chunked { cursor: head_end });
        }
        if info.transfer_encoding {
            return match self.direction {
                Direction::Request => Err(FramingError::UnsupportedTransferEncoding),
                Direction::Response => Ok(State::UntilClose),
            };
        }

        match (info.content_length, self.direction) {
            (Some(len), _) => {
                let limit = self.limits.max_frame_bytes;
                let end = head_end
                    .checked_add(len)
                    .filter(|end| *end <= limit)
                    .ok_or(FramingError::FrameTooLarge { limit })?;
                Ok(State::Fixed { end })
            }
            (None, Direction::Request) => Ok(State::Fixed { end: head_end }),
            (None, Direction::Response) => Ok(State::UntilClose),
        }
    }
}

/// Iterator over buffered frames; stops after the first error.
pub struct Frames<'a> {
    framer: &'a mut Framer,
    failed: bool,
}

impl Iterator for Frames<'_> {
    type Item = Result<Bytes, FramingError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.framer.next_frame() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Parse a complete head (terminated by an empty line).
pub(crate) fn parse_head(head: &[u8], direction: Direction) -> Result<HeadInfo, FramingError> {
    let body = head.strip_suffix(b"\r\n\r\n").unwrap_or(head);
    let mut lines = split_crlf(body);

    let start = lines.next().ok_or(FramingError::MalformedStartLine)?;
    let status = match direction {
        Direction::Request => {
            validate_request_line(start)?;
            None
        }
        Direction::Response => Some(parse_status_line(start)?),
    };

    let mut info = HeadInfo {
        status,
        content_length: None,
        chunked: false,
        transfer_encoding: false,
    };

    for line in lines {
        // obs-fold continuation
        if matches!(line.first(), Some(b' ') | Some(b'\t')) {
            continue;
        }
        let (name, value) = split_header(line)?;

        if name.eq_ignore_ascii_case(b"content-length") {
            for part in value.split(|b| *b == b',') {
                let len = parse_decimal(trim(part)).ok_or(FramingError::InvalidContentLength)?;
                match info.content_length {
                    Some(prev) if prev != len => return Err(FramingError::InvalidContentLength),
                    _ => info.content_length = Some(len),
                }
            }
        } else if name.eq_ignore_ascii_case(b"transfer-encoding") {
            info.transfer_encoding = true;
            let last = value.rsplit(|b| *b == b',').next().map(trim).unwrap_or_default();
            info.chunked = last.eq_ignore_ascii_case(b"chunked");
        }
    }

    Ok(info)
}

pub(crate) fn split_header(line: &[u8]) -> Result<(&[u8], &[u8]), FramingError> {
    let colon = line
        .iter()
        .position(|b| *b == b':')
        .ok_or(FramingError::MalformedHeader)?;
    let name = &line[..colon];
    if name.is_empty() || name.iter().any(|b| b.is_ascii_whitespace()) {
        return Err(FramingError::MalformedHeader);
    }
    Ok((name, trim(&line[colon + 1..])))
}

pub(crate) fn split_crlf(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut rest = Some(data);
    std::iter::from_fn(move || {
        let current = rest?;
        match find(current, b"\r\n") {
            Some(pos) => {
                rest = Some(&current[pos + 2..]);
                Some(&current[..pos])
            }
            None => {
                rest = None;
                Some(current)
            }
        }
    })
}

fn validate_request_line(line: &[u8]) -> Result<(), FramingError> {
    let mut parts = line.split(|b| *b == b' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(FramingError::MalformedStartLine);
    };

    if method.is_empty() || !method.iter().all(|b| is_tchar(*b)) {
        return Err(FramingError::MalformedStartLine);
    }
    if target.is_empty() || target.iter().any(|b| b.is_ascii_control()) {
        return Err(FramingError::MalformedStartLine);
    }
    if !is_http1_version(version) {
        return Err(FramingError::MalformedStartLine);
    }
    Ok(())
}

fn parse_status_line(line: &[u8]) -> Result<u16, FramingError> {
    if line.len() < 12 || !is_http1_version(&line[..8]) || line[8] != b' ' {
        return Err(FramingError::MalformedStartLine);
    }
    if line.len() > 12 && line[12] != b' ' {
        return Err(FramingError::MalformedStartLine);
    }
    let code = &line[9..12];
    if !code.iter().all(u8::is_ascii_digit) {
        return Err(FramingError::MalformedStartLine);
    }
    Ok(code
        .iter()
        .fold(0u16, |acc, d| acc * 10 + u16::from(d - b'0')))
}

fn is_http1_version(version: &[u8]) -> bool {
    version.len() == 8 && version.starts_with(b"HTTP/1.") && version[7].is_ascii_digit()
}

fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

fn scan_chunks(buf: &[u8], mut cursor: usize, max_frame: usize) -> Result<ChunkScan, FramingError> {
    loop {
        let rest = &buf[cursor..];
        let Some(line_len) = find(rest, b"\r\n") else {
            if rest.len() > MAX_CHUNK_LINE {
                return Err(FramingError::InvalidChunk);
            }
            return Ok(ChunkScan::Partial(cursor));
        };
        if line_len > MAX_CHUNK_LINE {
            return Err(FramingError::InvalidChunk);
        }

        let size = parse_chunk_size(&rest[..line_len])?;
        let data_start = cursor + line_len + 2;

        if size == 0 {
            // Trailer section ends with an empty line.
            let mut pos = data_start;
            loop {
                let Some(len) = find(&buf[pos..], b"\r\n") else {
                    return Ok(ChunkScan::Partial(cursor));
                };
                if len == 0 {
                    return Ok(ChunkScan::Complete(pos + 2));
                }
                pos += len + 2;
            }
        }

        let data_end = data_start
            .checked_add(size)
            .filter(|end| end.saturating_add(2) <= max_frame)
            .ok_or(FramingError::FrameTooLarge { limit: max_frame })?;
        if buf.len() < data_end + 2 {
            return Ok(ChunkScan::Partial(cursor));
        }
        if &buf[data_end..data_end + 2] != b"\r\n" {
            return Err(FramingError::InvalidChunk);
        }
        cursor = data_end + 2;
    }
}

pub(crate) fn parse_chunk_size(line: &[u8]) -> Result<usize, FramingError> {
    let size = line.split(|b| *b == b';').next().map(trim).unwrap_or_default();
    if size.is_empty() || size.len() > 16 || !size.iter().all(u8::is_ascii_hexdigit) {
        return Err(FramingError::InvalidChunk);
    }
    let text = std::str::from_utf8(size).map_err(|_| FramingError::InvalidChunk)?;
    usize::from_str_radix(text, 16).map_err(|_| FramingError::InvalidChunk)
}

fn parse_decimal(digits: &[u8]) -> Option<usize> {
    if digits.is_empty() {
        return None;
    }
    digits.iter().try_fold(0usize, |acc, d| {
        if !d.is_ascii_digit() {
            return None;
        }
        acc.checked_mul(10)?.checked_add(usize::from(d - b'0'))
    })
}

pub(crate) fn trim(data: &[u8]) -> &[u8] {
    let start = data
        .iter()
        .position(|b| *b != b' ' && *b != b'\t')
        .unwrap_or(data.len());
    let end = data
        .iter()
        .rposition(|b| *b != b' ' && *b != b'\t')
        .map_or(start, |p| p + 1);
    &data[start..end]
}

pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
