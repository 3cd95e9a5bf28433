// src/http/parser.rs
//! Incremental HTTP/1.x request parser.
//!
//! Two nested machines: a line scanner that finds the next terminator in the
//! unscanned part of the buffer, and a request machine that consumes one
//! line at a time (request line, then headers) and finally waits for
//! `Content-Length` body bytes. The parser owns only offsets into the
//! caller's buffer, so a request delivered in any number of chunks parses
//! the same as one delivered at once.

use crate::http::request::{Method, Request, Version};
use memchr::{memchr, memchr2};
use std::mem;
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed line terminator")]
    BadLine,
    #[error("malformed request line")]
    BadRequestLine,
    #[error("unsupported method")]
    UnsupportedMethod,
    #[error("unsupported protocol version")]
    UnsupportedVersion,
    #[error("malformed header line")]
    BadHeader,
    #[error("invalid Content-Length")]
    BadContentLength,
    #[error("request does not fit the read buffer")]
    TooLarge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    /// A full line ends at `end`; its terminator has been zeroed.
    Ok { end: usize },
    /// No terminator yet.
    Open,
    /// A `CR` followed by something other than `LF`.
    Bad,
}

/// Scans `buf` from `cursor` for a `CRLF` or bare `LF`. On success the
/// terminator bytes are overwritten with NULs and `cursor` moves past them.
/// A trailing lone `CR` leaves `cursor` on it so the next scan sees the `LF`.
pub fn scan_line(buf: &mut [u8], cursor: &mut usize) -> LineStatus {
    let Some(tail) = buf.get(*cursor..) else {
        return LineStatus::Open;
    };
    let Some(off) = memchr2(b'\r', b'\n', tail) else {
        *cursor = buf.len();
        return LineStatus::Open;
    };
    let i = *cursor + off;
    if buf[i] == b'\n' {
        buf[i] = 0;
        *cursor = i + 1;
        return LineStatus::Ok { end: i };
    }
    if i + 1 == buf.len() {
        *cursor = i;
        return LineStatus::Open;
    }
    if buf[i + 1] != b'\n' {
        return LineStatus::Bad;
    }
    buf[i] = 0;
    buf[i + 1] = 0;
    *cursor = i + 2;
    LineStatus::Ok { end: i }
}

#[derive(Debug, Default)]
pub enum ParseState {
    #[default]
    RequestLine,
    Headers(Request),
    Body(Request),
}

enum Step {
    Next(ParseState),
    Done(Request),
    Fail(ParseError),
}

impl ParseState {
    fn on_line(self, line: &[u8], body_limit: usize) -> Step {
        match self {
            ParseState::RequestLine => request_line(line),
            ParseState::Headers(request) => header_line(request, line, body_limit),
            // The body is length-delimited, never line-delimited.
            body @ ParseState::Body(_) => Step::Next(body),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Progress {
    /// More bytes are needed; call again after the next read.
    Incomplete,
    /// A request is ready. `consumed` bytes of the buffer belong to it.
    Complete { request: Request, consumed: usize },
    Invalid(ParseError),
}

#[derive(Debug)]
pub struct RequestParser {
    state: ParseState,
    cursor: usize,
    line_start: usize,
    body_limit: usize,
    // version of the last accepted request line; survives a failure
    version: Option<Version>,
}

impl RequestParser {
    /// `body_limit` is the largest `Content-Length` that is accepted.
    pub fn new(body_limit: usize) -> Self {
        Self {
            state: ParseState::RequestLine,
            cursor: 0,
            line_start: 0,
            body_limit,
            version: None,
        }
    }

    pub fn state(&self) -> &ParseState {
        &self.state
    }

    /// Protocol version of the request being parsed, or of the one that
    /// just failed. `None` until a request line has been accepted.
    pub fn version(&self) -> Option<Version> {
        self.version
    }

    pub fn reset(&mut self) {
        self.state = ParseState::RequestLine;
        self.cursor = 0;
        self.line_start = 0;
        self.version = None;
    }

    /// Advances over whatever is in `buf`. `buf` must start where the previous
    /// call's buffer started and may only have grown at the end.
    pub fn parse(&mut self, buf: &mut [u8]) -> Progress {
        loop {
            match mem::take(&mut self.state) {
                ParseState::Body(mut request) => {
                    let end = self.line_start + request.content_length;
                    if buf.len() < end {
                        self.state = ParseState::Body(request);
                        return Progress::Incomplete;
                    }
                    request.body = buf[self.line_start..end].to_vec();
                    return self.finish(request, end);
                }
                state => {
                    let end = match scan_line(buf, &mut self.cursor) {
                        LineStatus::Ok { end } => end,
                        LineStatus::Open => {
                            self.state = state;
                            return Progress::Incomplete;
                        }
                        LineStatus::Bad => return self.fail(ParseError::BadLine),
                    };
                    let line = &buf[self.line_start..end];
                    self.line_start = self.cursor;
                    match state.on_line(line, self.body_limit) {
                        Step::Next(next) => {
                            if let ParseState::Headers(request) = &next {
                                self.version = Some(request.version);
                            }
                            self.state = next;
                        }
                        Step::Done(request) => {
                            let consumed = self.line_start;
                            return self.finish(request, consumed);
                        }
                        Step::Fail(err) => return self.fail(err),
                    }
                }
            }
        }
    }

    fn finish(&mut self, request: Request, consumed: usize) -> Progress {
        self.reset();
        Progress::Complete { request, consumed }
    }

    fn fail(&mut self, err: ParseError) -> Progress {
        let version = self.version;
        self.reset();
        self.version = version;
        Progress::Invalid(err)
    }
}

fn request_line(line: &[u8]) -> Step {
    let mut parts = line
        .split(u8::is_ascii_whitespace)
        .filter(|part| !part.is_empty());
    let (Some(method), Some(url), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Step::Fail(ParseError::BadRequestLine);
    };

    let Some(method) = Method::from_bytes(method) else {
        return Step::Fail(ParseError::UnsupportedMethod);
    };
    let Some(version) = Version::from_bytes(version) else {
        return Step::Fail(ParseError::UnsupportedVersion);
    };
    let Ok(url) = std::str::from_utf8(url) else {
        return Step::Fail(ParseError::BadRequestLine);
    };
    let url = match url {
        "/" => "/index.html",
        other => other,
    };

    Step::Next(ParseState::Headers(Request::new(method, url.to_string(), version)))
}

fn header_line(mut request: Request, line: &[u8], body_limit: usize) -> Step {
    if line.is_empty() {
        return if request.content_length > 0 {
            Step::Next(ParseState::Body(request))
        } else {
            Step::Done(request)
        };
    }

    let Some(colon) = memchr(b':', line) else {
        return Step::Fail(ParseError::BadHeader);
    };
    let name = line[..colon].trim_ascii();
    let value = line[colon + 1..].trim_ascii();

    if name.eq_ignore_ascii_case(b"Host") {
        request.host = Some(String::from_utf8_lossy(value).into_owned());
    } else if name.eq_ignore_ascii_case(b"Content-Length") {
        let parsed = std::str::from_utf8(value)
            .ok()
            .and_then(|v| v.parse::<i64>().ok());
        match parsed {
            Some(n) if n >= 0 => {
                let n = n as usize;
                if n > body_limit {
                    return Step::Fail(ParseError::TooLarge);
                }
                request.content_length = n;
            }
            _ => return Step::Fail(ParseError::BadContentLength),
        }
    } else if name.eq_ignore_ascii_case(b"Connection") {
        request.keep_alive = value.eq_ignore_ascii_case(b"keep-alive");
    }

    Step::Next(ParseState::Headers(request))
}
