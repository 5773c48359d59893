//! Strict HTTP/1.1 framing
//!
//! Everything the daemon knows about HTTP wire syntax lives here: head
//! parsing, body-length determination per RFC 7230 §3.3.3, and an
//! incremental chunked-transfer decoder. The USB transport depends on this
//! code to find the exact end of every device response, so the rules are
//! deliberately strict: anything ambiguous is a protocol error, not a
//! guess.

use crate::err::{Error, Result};
use crate::http::message::{HeaderMap, Request, Response, Version};

/// Upper bound on a message head. Devices send small heads; anything
/// bigger indicates framing desynchronization.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

const MAX_CHUNK_LINE: usize = 256;

/// Offset just past the `\r\n\r\n` head terminator, if present.
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// Parse a request head (request-line + headers, terminator included).
pub fn parse_request_head(head: &[u8]) -> Result<(String, String, Version, HeaderMap)> {
    let mut lines = head_lines(head)?;
    let request_line = lines
        .next()
        .ok_or_else(|| Error::Protocol("empty request head".into()))?;

    let mut parts = request_line.split(' ');
    let method = parts
        .next()
        .filter(|m| !m.is_empty() && m.bytes().all(is_token_byte))
        .ok_or_else(|| Error::Protocol("bad request method".into()))?;
    let target = parts
        .next()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| Error::Protocol("bad request target".into()))?;
    let version = parts
        .next()
        .ok_or_else(|| Error::Protocol("missing HTTP version".into()))
        .and_then(parse_version)?;
    if parts.next().is_some() {
        return Err(Error::Protocol("malformed request line".into()));
    }

    let headers = parse_header_lines(lines)?;
    Ok((method.to_string(), target.to_string(), version, headers))
}

/// Parse a response head (status-line + headers, terminator included).
pub fn parse_response_head(head: &[u8]) -> Result<(Version, u16, String, HeaderMap)> {
    let mut lines = head_lines(head)?;
    let status_line = lines
        .next()
        .ok_or_else(|| Error::Protocol("empty response head".into()))?;

    let mut parts = status_line.splitn(3, ' ');
    let version = parts
        .next()
        .ok_or_else(|| Error::Protocol("missing HTTP version".into()))
        .and_then(parse_version)?;
    let status: u16 = parts
        .next()
        .filter(|s| s.len() == 3 && s.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Protocol("bad status code".into()))?;
    let reason = parts.next().unwrap_or("").to_string();

    let headers = parse_header_lines(lines)?;
    Ok((version, status, reason, headers))
}

fn parse_version(s: &str) -> Result<Version> {
    match s {
        "HTTP/1.1" => Ok(Version::Http11),
        "HTTP/1.0" => Ok(Version::Http10),
        other => Err(Error::Protocol(format!("unsupported version `{other}`"))),
    }
}

fn head_lines(head: &[u8]) -> Result<impl Iterator<Item = &str>> {
    let text = std::str::from_utf8(head)
        .map_err(|_| Error::Protocol("non-ASCII bytes in message head".into()))?;
    Ok(text
        .split("\r\n")
        .take_while(|line| !line.is_empty()))
}

fn parse_header_lines<'a>(lines: impl Iterator<Item = &'a str>) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for line in lines {
        if line.starts_with(' ') || line.starts_with('\t') {
            // Obsolete line folding, deprecated by RFC 7230 §3.2.4.
            return Err(Error::Protocol("folded header line".into()));
        }
        let colon = line
            .find(':')
            .ok_or_else(|| Error::Protocol(format!("header line without colon: `{line}`")))?;
        let name = &line[..colon];
        if name.is_empty() || !name.bytes().all(is_token_byte) {
            return Err(Error::Protocol(format!("bad header name: `{name}`")));
        }
        headers.add(name, line[colon + 1..].trim());
    }
    Ok(headers)
}

fn is_token_byte(b: u8) -> bool {
    matches!(b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' |
        b'^' | b'_' | b'`' | b'|' | b'~' | b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z')
}

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body at all.
    Empty,
    /// Exactly this many bytes.
    Length(u64),
    /// Chunked transfer coding through the zero-length chunk and trailers.
    Chunked,
    /// Delimited by end of input (responses only).
    Eof,
}

/// Body framing of a request, per RFC 7230 §3.3.3 rules 3-6. A request
/// body can never be close-delimited.
pub fn request_body_framing(headers: &HeaderMap) -> Result<BodyFraming> {
    if headers.contains("Transfer-Encoding") {
        if transfer_encoding_is_chunked(headers) {
            return Ok(BodyFraming::Chunked);
        }
        return Err(Error::Protocol(
            "request with non-chunked Transfer-Encoding".into(),
        ));
    }
    match content_length(headers)? {
        Some(0) | None => Ok(BodyFraming::Empty),
        Some(n) => Ok(BodyFraming::Length(n)),
    }
}

/// Body framing of a response to `method`, per RFC 7230 §3.3.3.
pub fn response_body_framing(method: &str, status: u16, headers: &HeaderMap) -> Result<BodyFraming> {
    if method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&status)
        || status == 204
        || status == 304
    {
        return Ok(BodyFraming::Empty);
    }
    if headers.contains("Transfer-Encoding") {
        if transfer_encoding_is_chunked(headers) {
            return Ok(BodyFraming::Chunked);
        }
        // Non-chunked transfer coding: length is unknowable, read to end.
        return Ok(BodyFraming::Eof);
    }
    match content_length(headers)? {
        Some(n) => Ok(BodyFraming::Length(n)),
        None => Ok(BodyFraming::Eof),
    }
}

/// True when the final transfer coding is `chunked`.
fn transfer_encoding_is_chunked(headers: &HeaderMap) -> bool {
    let mut last = None;
    for value in headers.get_all("Transfer-Encoding") {
        for token in value.split(',') {
            let token = token.trim();
            if !token.is_empty() {
                last = Some(token);
            }
        }
    }
    last.is_some_and(|t| t.eq_ignore_ascii_case("chunked"))
}

/// Validated Content-Length. Repeated values must agree.
fn content_length(headers: &HeaderMap) -> Result<Option<u64>> {
    let mut result = None;
    for value in headers.get_all("Content-Length") {
        let value = value.trim();
        if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::Protocol(format!("bad Content-Length `{value}`")));
        }
        let n: u64 = value
            .parse()
            .map_err(|_| Error::Protocol(format!("bad Content-Length `{value}`")))?;
        match result {
            None => result = Some(n),
            Some(prev) if prev == n => {}
            Some(_) => {
                return Err(Error::Protocol("conflicting Content-Length values".into()));
            }
        }
    }
    Ok(result)
}

/// Serialize a request head. The caller is responsible for having set the
/// framing headers that match how the body will be written.
pub fn write_request_head(out: &mut Vec<u8>, request: &Request) {
    out.extend_from_slice(request.method.as_bytes());
    out.push(b' ');
    out.extend_from_slice(request.target.as_bytes());
    out.push(b' ');
    out.extend_from_slice(request.version.to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
    write_headers(out, &request.headers);
}

/// Serialize a response head.
pub fn write_response_head(out: &mut Vec<u8>, response: &Response) {
    out.extend_from_slice(response.version.to_string().as_bytes());
    out.push(b' ');
    out.extend_from_slice(format!("{:03}", response.status).as_bytes());
    out.push(b' ');
    out.extend_from_slice(response.reason.as_bytes());
    out.extend_from_slice(b"\r\n");
    write_headers(out, &response.headers);
}

fn write_headers(out: &mut Vec<u8>, headers: &HeaderMap) {
    for (name, value) in headers.iter() {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
}

/// Chunk-size line for re-framing a body of unknown length.
pub fn chunk_header(len: usize) -> Vec<u8> {
    format!("{len:x}\r\n").into_bytes()
}

pub const CHUNK_TRAILER: &[u8] = b"\r\n";
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Incremental decoder for the chunked transfer coding. Feed it raw bytes
/// as they arrive; it appends decoded body bytes and reports completion
/// after the zero-length chunk and its (ignored) trailer section.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: ChunkState,
}

#[derive(Debug)]
enum ChunkState {
    SizeLine { line: Vec<u8> },
    Data { remaining: u64 },
    DataCr,
    DataLf,
    TrailerLine { line: Vec<u8> },
    Done,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            state: ChunkState::SizeLine { line: Vec::new() },
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, ChunkState::Done)
    }

    /// Consume `input`, appending decoded body bytes to `out`. Returns the
    /// number of input bytes consumed; anything after the final trailer is
    /// left unconsumed.
    pub fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<usize> {
        let mut pos = 0;

        while pos < input.len() {
            match &mut self.state {
                ChunkState::SizeLine { line } => {
                    let b = input[pos];
                    pos += 1;
                    if b == b'\n' {
                        let size = parse_chunk_size(line)?;
                        self.state = if size == 0 {
                            ChunkState::TrailerLine { line: Vec::new() }
                        } else {
                            ChunkState::Data { remaining: size }
                        };
                    } else {
                        if line.len() >= MAX_CHUNK_LINE {
                            return Err(Error::Protocol("oversized chunk-size line".into()));
                        }
                        line.push(b);
                    }
                }
                ChunkState::Data { remaining } => {
                    let take = (*remaining).min((input.len() - pos) as u64) as usize;
                    out.extend_from_slice(&input[pos..pos + take]);
                    pos += take;
                    *remaining -= take as u64;
                    if *remaining == 0 {
                        self.state = ChunkState::DataCr;
                    }
                }
                ChunkState::DataCr => {
                    if input[pos] != b'\r' {
                        return Err(Error::Protocol("missing CR after chunk data".into()));
                    }
                    pos += 1;
                    self.state = ChunkState::DataLf;
                }
                ChunkState::DataLf => {
                    if input[pos] != b'\n' {
                        return Err(Error::Protocol("missing LF after chunk data".into()));
                    }
                    pos += 1;
                    self.state = ChunkState::SizeLine { line: Vec::new() };
                }
                ChunkState::TrailerLine { line } => {
                    let b = input[pos];
                    pos += 1;
                    if b == b'\n' {
                        let empty = line.iter().all(|&c| c == b'\r');
                        if empty {
                            self.state = ChunkState::Done;
                        } else {
                            // Trailer field: consumed and ignored.
                            self.state = ChunkState::TrailerLine { line: Vec::new() };
                        }
                    } else {
                        if line.len() >= MAX_HEAD_SIZE {
                            return Err(Error::Protocol("oversized trailer line".into()));
                        }
                        line.push(b);
                    }
                }
                ChunkState::Done => break,
            }
        }

        Ok(pos)
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Hex chunk size; a `;` starts chunk extensions, which are ignored.
fn parse_chunk_size(line: &[u8]) -> Result<u64> {
    let line = match line.iter().position(|&b| b == b';') {
        Some(pos) => &line[..pos],
        None => line,
    };
    let text = std::str::from_utf8(line)
        .map_err(|_| Error::Protocol("bad chunk-size line".into()))?
        .trim_end_matches('\r')
        .trim();
    if text.is_empty() {
        return Err(Error::Protocol("empty chunk size".into()));
    }
    u64::from_str_radix(text, 16).map_err(|_| Error::Protocol(format!("bad chunk size `{text}`")))
}
