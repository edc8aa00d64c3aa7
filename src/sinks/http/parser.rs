// SPDX-License-Identifier: Apache-2.0

//! Hand-rolled HTTP/1.1 response parser.
//!
//! A tagged state machine fed from `recv` chunks of arbitrary size. Parsed
//! bytes are consumed from the head of an internal buffer after every step,
//! so a status line, header, or chunk boundary split across reads is
//! reassembled without any caller-side bookkeeping.

use memchr::memmem;
use thiserror::Error;

/// Upper bound for any single unparsed run (status line, header block,
/// chunk-length line). A peer that exceeds it is treated as broken.
pub const MAX_RESPONSE_BUF: usize = 8192;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("response exceeds {MAX_RESPONSE_BUF} bytes with no terminator")]
    Overflow,
    #[error("malformed status line")]
    StatusLine,
    #[error("malformed chunk framing")]
    Chunk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    StatusLine,
    Header,
    Body,
    ChunkLen,
    ChunkData,
    ChunkDataEnd,
    Trailer,
    Done,
}

#[derive(Debug)]
pub struct ResponseParser {
    state: State,
    buf: Vec<u8>,
    code: u16,
    content_length: Option<usize>,
    chunked: bool,
    chunk_remaining: usize,
    body: Vec<u8>,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseParser {
    pub fn new() -> Self {
        Self {
            state: State::StatusLine,
            buf: Vec::new(),
            code: 0,
            content_length: None,
            chunked: false,
            chunk_remaining: 0,
            body: Vec::new(),
        }
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Feed one received chunk. Returns true once the response is complete.
    pub fn push(&mut self, data: &[u8]) -> Result<bool, ParseError> {
        self.buf.extend_from_slice(data);
        self.parse()?;
        Ok(self.state == State::Done)
    }

    fn parse(&mut self) -> Result<(), ParseError> {
        loop {
            match self.state {
                State::StatusLine => {
                    let Some(line) = self.take_line()? else {
                        return Ok(());
                    };
                    self.code = parse_status_code(&line).ok_or(ParseError::StatusLine)?;
                    self.state = State::Header;
                }
                State::Header => {
                    let Some(line) = self.take_line()? else {
                        return Ok(());
                    };
                    if line.is_empty() {
                        self.state = self.body_state();
                        continue;
                    }
                    self.header_field(&line);
                }
                State::Body => {
                    let want = self.content_length.unwrap_or(0) - self.body.len();
                    let take = want.min(self.buf.len());
                    self.body.extend_from_slice(&self.buf[..take]);
                    self.buf.drain(..take);
                    if self.body.len() == self.content_length.unwrap_or(0) {
                        self.state = State::Done;
                        continue;
                    }
                    return Ok(());
                }
                State::ChunkLen => {
                    let Some(line) = self.take_line()? else {
                        return Ok(());
                    };
                    let len = parse_chunk_len(&line).ok_or(ParseError::Chunk)?;
                    if len == 0 {
                        self.state = State::Trailer;
                    } else {
                        self.chunk_remaining = len;
                        self.state = State::ChunkData;
                    }
                }
                State::ChunkData => {
                    let take = self.chunk_remaining.min(self.buf.len());
                    self.body.extend_from_slice(&self.buf[..take]);
                    self.buf.drain(..take);
                    self.chunk_remaining -= take;
                    if self.chunk_remaining == 0 {
                        self.state = State::ChunkDataEnd;
                        continue;
                    }
                    return Ok(());
                }
                State::ChunkDataEnd => {
                    // the CRLF closing the chunk may straddle reads
                    if self.buf.len() < 2 {
                        return Ok(());
                    }
                    if &self.buf[..2] != b"\r\n" {
                        return Err(ParseError::Chunk);
                    }
                    self.buf.drain(..2);
                    self.state = State::ChunkLen;
                }
                State::Trailer => {
                    let Some(line) = self.take_line()? else {
                        return Ok(());
                    };
                    if line.is_empty() {
                        self.state = State::Done;
                    }
                }
                State::Done => return Ok(()),
            }
        }
    }

    fn body_state(&self) -> State {
        if self.chunked {
            State::ChunkLen
        } else if self.content_length.unwrap_or(0) > 0 {
            State::Body
        } else {
            State::Done
        }
    }

    /// Take one CRLF-terminated line off the buffer head, or None when the
    /// terminator has not arrived yet.
    fn take_line(&mut self) -> Result<Option<Vec<u8>>, ParseError> {
        match memmem::find(&self.buf, b"\r\n") {
            Some(k) => {
                let line = self.buf[..k].to_vec();
                self.buf.drain(..k + 2);
                Ok(Some(line))
            }
            None => {
                if self.buf.len() > MAX_RESPONSE_BUF {
                    Err(ParseError::Overflow)
                } else {
                    Ok(None)
                }
            }
        }
    }

    fn header_field(&mut self, line: &[u8]) {
        let Some(colon) = memchr::memchr(b':', line) else {
            return;
        };
        let name = &line[..colon];
        let value = String::from_utf8_lossy(&line[colon + 1..]);
        let value = value.trim();

        if name.eq_ignore_ascii_case(b"content-length") {
            self.content_length = value.parse().ok();
        } else if name.eq_ignore_ascii_case(b"transfer-encoding") {
            self.chunked = value.to_ascii_lowercase().contains("chunked");
        }
    }
}

fn parse_status_code(line: &[u8]) -> Option<u16> {
    // HTTP/1.1 201 Created
    let text = std::str::from_utf8(line).ok()?;
    let mut parts = text.split(' ').filter(|p| !p.is_empty());
    let proto = parts.next()?;
    if !proto.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

fn parse_chunk_len(line: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(line).ok()?;
    // chunk extensions after ';' are ignored
    let hex = text.split(';').next()?.trim();
    usize::from_str_radix(hex, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(parser: &mut ResponseParser, data: &[u8]) -> Result<bool, ParseError> {
        parser.push(data)
    }

    /// Feed one byte at a time to exercise every split point.
    fn feed_bytewise(data: &[u8]) -> ResponseParser {
        let mut parser = ResponseParser::new();
        for b in data {
            parser.push(std::slice::from_ref(b)).unwrap();
        }
        parser
    }

    #[test]
    fn content_length_response() {
        let mut parser = ResponseParser::new();
        let done = feed_all(
            &mut parser,
            b"HTTP/1.1 201 Created\r\nContent-Length: 9\r\nContent-Type: application/json\r\n\r\n{\"ok\":1}\n",
        )
        .unwrap();
        assert!(done);
        assert_eq!(parser.code(), 201);
        assert_eq!(parser.body(), b"{\"ok\":1}\n");
    }

    #[test]
    fn zero_length_body() {
        let mut parser = ResponseParser::new();
        let done = feed_all(&mut parser, b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").unwrap();
        assert!(done);
        assert_eq!(parser.code(), 200);
        assert!(parser.body().is_empty());
    }

    #[test]
    fn no_length_no_chunking_means_empty_body() {
        let mut parser = ResponseParser::new();
        let done = feed_all(&mut parser, b"HTTP/1.1 429 Too Many Requests\r\n\r\n").unwrap();
        assert!(done);
        assert_eq!(parser.code(), 429);
    }

    #[test]
    fn response_split_at_every_byte() {
        let parser = feed_bytewise(
            b"HTTP/1.1 400 Bad Request\r\nContent-Length: 5\r\n\r\nerror",
        );
        assert!(parser.is_done());
        assert_eq!(parser.code(), 400);
        assert_eq!(parser.body(), b"error");
    }

    #[test]
    fn chunked_response() {
        let mut parser = ResponseParser::new();
        let done = feed_all(
            &mut parser,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n",
        )
        .unwrap();
        assert!(done);
        assert_eq!(parser.body(), b"Wikipedia");
    }

    #[test]
    fn chunk_boundaries_straddle_reads() {
        let parser = feed_bytewise(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\na\r\n0123456789\r\n3\r\nabc\r\n0\r\n\r\n",
        );
        assert!(parser.is_done());
        assert_eq!(parser.body(), b"0123456789abc");
    }

    #[test]
    fn chunked_with_extension_and_trailer() {
        let mut parser = ResponseParser::new();
        let done = feed_all(
            &mut parser,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3;ext=1\r\nxyz\r\n0\r\nX-Trailer: v\r\n\r\n",
        )
        .unwrap();
        assert!(done);
        assert_eq!(parser.body(), b"xyz");
    }

    #[test]
    fn status_line_overflow() {
        let mut parser = ResponseParser::new();
        let long = vec![b'a'; MAX_RESPONSE_BUF + 1];
        assert_eq!(parser.push(&long), Err(ParseError::Overflow));
    }

    #[test]
    fn garbage_status_line() {
        let mut parser = ResponseParser::new();
        assert_eq!(
            parser.push(b"SMTP ready\r\n"),
            Err(ParseError::StatusLine)
        );
    }

    #[test]
    fn bad_chunk_length() {
        let mut parser = ResponseParser::new();
        let res = parser.push(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n",
        );
        assert_eq!(res, Err(ParseError::Chunk));
    }
}
