//! Read-only views over framed HTTP payloads.
//!
//! Framing already validated the structure; these helpers only pull out what
//! Outputs and filters need (method, target, headers, status, body).

use bytes::Bytes;

use super::parser::{find, parse_chunk_size, split_crlf, split_header, trim};
use crate::error::FramingError;

/// A request payload split into its parts. Borrowed, no copies.
#[derive(Debug)]
pub struct RequestView<'a> {
    pub method: &'a str,
    pub target: &'a str,
    pub version: &'a str,
    pub headers: Vec<(&'a str, &'a [u8])>,
    /// Offset of the body inside the payload.
    pub body_offset: usize,
    pub chunked: bool,
}

impl<'a> RequestView<'a> {
    /// First value of a header, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&'a [u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| *v)
    }

    /// Path and query of the target, also for absolute-form targets.
    pub fn path_and_query(&self) -> &'a str {
        match self.target.find("://") {
            Some(scheme_end) => {
                let rest = &self.target[scheme_end + 3..];
                rest.find('/').map_or("/", |slash| &rest[slash..])
            }
            None => self.target,
        }
    }
}

/// Parse a complete request payload.
pub fn parse_request(payload: &[u8]) -> Result<RequestView<'_>, FramingError> {
    let head_end = find(payload, b"\r\n\r\n").ok_or(FramingError::MalformedStartLine)?;
    let mut lines = split_crlf(&payload[..head_end]);

    let start = lines.next().ok_or(FramingError::MalformedStartLine)?;
    let start = std::str::from_utf8(start).map_err(|_| FramingError::MalformedStartLine)?;
    let mut parts = start.split(' ');
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(FramingError::MalformedStartLine);
    };

    let mut headers = Vec::new();
    let mut chunked = false;
    for line in lines {
        if matches!(line.first(), Some(b' ') | Some(b'\t')) {
            continue;
        }
        let (name, value) = split_header(line)?;
        let name = std::str::from_utf8(name).map_err(|_| FramingError::MalformedHeader)?;
        if name.eq_ignore_ascii_case("transfer-encoding") {
            chunked = value
                .rsplit(|b| *b == b',')
                .next()
                .map(|last| trim(last).eq_ignore_ascii_case(b"chunked"))
                .unwrap_or(false);
        }
        headers.push((name, value));
    }

    Ok(RequestView {
        method,
        target,
        version,
        headers,
        body_offset: head_end + 4,
        chunked,
    })
}

/// Status code of a response payload.
pub fn response_status(payload: &[u8]) -> Option<u16> {
    let line = payload.get(..12)?;
    if !line.starts_with(b"HTTP/1.") || line[8] != b' ' {
        return None;
    }
    std::str::from_utf8(&line[9..12]).ok()?.parse().ok()
}

/// First line of a payload, for logs.
pub fn start_line(payload: &[u8]) -> String {
    let end = find(payload, b"\r\n").unwrap_or(payload.len().min(256));
    String::from_utf8_lossy(&payload[..end]).into_owned()
}

/// Whether a request payload uses the HEAD method.
pub fn is_head_request(payload: &[u8]) -> bool {
    payload.starts_with(b"HEAD ")
}

/// Decode a complete chunked body, dropping extensions and trailers.
pub fn decode_chunked(body: &[u8]) -> Result<Bytes, FramingError> {
    let mut decoded = Vec::with_capacity(body.len());
    let mut cursor = 0;
    loop {
        let rest = body.get(cursor..).ok_or(FramingError::InvalidChunk)?;
        let line_len = find(rest, b"\r\n").ok_or(FramingError::InvalidChunk)?;
        let size = parse_chunk_size(&rest[..line_len])?;
        let data_start = cursor + line_len + 2;
        if size == 0 {
            return Ok(Bytes::from(decoded));
        }
        let data_end = data_start
            .checked_add(size)
            .filter(|end| end + 2 <= body.len())
            .ok_or(FramingError::InvalidChunk)?;
        decoded.extend_from_slice(&body[data_start..data_end]);
        cursor = data_end + 2;
    }
}
