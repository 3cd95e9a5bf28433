// src/http/conn.rs
use crate::buffer::ByteBuffer;
use crate::context::ServerContext;
use crate::error::EmberResult;
use crate::http::dispatch;
use crate::http::parser::{Progress, RequestParser};
use crate::http::request::{Request, Version};
use crate::http::response::{self, EMPTY_PAGE, Status};
use crate::resource::{MappedFile, Resolved};
use std::io::{self, IoSlice, Read, Write};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    /// Slot is free; no socket.
    #[default]
    Idle,
    /// Waiting for (more of) a request.
    Reading,
    /// A response is composed and being transmitted.
    Writing,
    /// Nothing more will be sent; tear the connection down.
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteProgress {
    /// The socket stopped accepting bytes; wait for write readiness.
    Pending,
    Complete,
}

/// One client connection: buffers, parse state and the response in flight.
pub struct Conn {
    socket: Option<OwnedFd>,
    peer: Option<SocketAddr>,
    // Bumped on every open so stale work for a reused slot can be detected.
    generation: u64,
    phase: Phase,
    read_buf: ByteBuffer,
    write_buf: ByteBuffer,
    parser: RequestParser,
    request: Option<Request>,
    status: Option<Status>,
    // Bytes of `read_buf` owned by the request being answered.
    consumed: usize,
    file: Option<MappedFile>,
    bytes_sent: usize,
    bytes_to_send: usize,
    keep_alive: bool,
}

impl Conn {
    pub fn new(read_capacity: usize, write_capacity: usize) -> Self {
        Self {
            socket: None,
            peer: None,
            generation: 0,
            phase: Phase::Idle,
            read_buf: ByteBuffer::with_capacity(read_capacity),
            write_buf: ByteBuffer::with_capacity(write_capacity),
            parser: RequestParser::new(read_capacity),
            request: None,
            status: None,
            consumed: 0,
            file: None,
            bytes_sent: 0,
            bytes_to_send: 0,
            keep_alive: false,
        }
    }

    /// Takes ownership of a freshly accepted socket.
    pub fn open(&mut self, socket: OwnedFd, peer: Option<SocketAddr>) {
        self.clear();
        self.socket = Some(socket);
        self.peer = peer;
        self.generation = self.generation.wrapping_add(1);
        self.phase = Phase::Reading;
    }

    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.socket.as_ref().map(|s| s.as_raw_fd())
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Last request parsed on this connection.
    pub fn request(&self) -> Option<&Request> {
        self.request.as_ref()
    }

    /// Status of the response in flight.
    pub fn status(&self) -> Option<Status> {
        self.status
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent
    }

    pub fn bytes_to_send(&self) -> usize {
        self.bytes_to_send
    }

    /// Unparsed bytes are waiting in the read buffer.
    pub fn has_buffered_bytes(&self) -> bool {
        !self.read_buf.is_empty()
    }

    /// Drains `src` into the read buffer until it would block or the buffer
    /// fills. An orderly close from the peer is reported as `UnexpectedEof`.
    pub fn read_from<R: Read>(&mut self, src: &mut R) -> io::Result<usize> {
        let mut total = 0;
        loop {
            let spare = self.read_buf.spare_mut();
            if spare.is_empty() {
                return Ok(total);
            }
            match src.read(spare) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed the connection",
                    ));
                }
                Ok(n) => {
                    self.read_buf.commit(n);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Parses what has been read so far and, once a request is complete,
    /// composes its response. Returns the phase the connection is now in.
    pub fn process(&mut self, ctx: &ServerContext) -> Phase {
        match self.parser.parse(self.read_buf.unconsumed_mut()) {
            Progress::Incomplete if self.read_buf.is_full() => {
                debug!("Request from {:?} overflows the read buffer", self.peer);
                let version = self.parser.version().unwrap_or_default();
                self.respond_error(version, Status::BadRequest);
            }
            Progress::Incomplete => self.phase = Phase::Reading,
            Progress::Complete { request, consumed } => {
                ctx.metrics.inc_req();
                self.consumed = consumed;
                self.do_request(request, ctx);
            }
            Progress::Invalid(err) => {
                debug!("Bad request from {:?}: {}", self.peer, err);
                let version = self.parser.version().unwrap_or_default();
                self.respond_error(version, Status::BadRequest);
            }
        }
        self.phase
    }

    fn do_request(&mut self, request: Request, ctx: &ServerContext) {
        self.keep_alive = request.keep_alive;
        let version = request.version;
        let url = dispatch::target_url(&request, ctx.credentials.as_ref());
        self.request = Some(request);

        let composed = match ctx.files.resolve(&url) {
            Resolved::NotFound => return self.respond_error(version, Status::NotFound),
            Resolved::Forbidden => return self.respond_error(version, Status::Forbidden),
            Resolved::File { len: 0, .. } => self.compose_inline(version, EMPTY_PAGE),
            Resolved::File { path, .. } => match ctx.files.map_file(&path) {
                Ok(file) => self.compose_file(version, file),
                Err(e) => {
                    warn!("Mapping {} failed: {}", path.display(), e);
                    return self.respond_error(version, Status::InternalError);
                }
            },
        };
        if let Err(e) = composed {
            warn!("Composing response for {} failed: {}", url, e);
            self.respond_error(version, Status::InternalError);
        }
    }

    fn compose_inline(&mut self, version: Version, body: &[u8]) -> EmberResult<()> {
        response::write_inline(&mut self.write_buf, version, Status::Ok, body, self.keep_alive)?;
        self.arm_send(Status::Ok);
        Ok(())
    }

    fn compose_file(&mut self, version: Version, file: MappedFile) -> EmberResult<()> {
        response::write_head(
            &mut self.write_buf,
            version,
            Status::Ok,
            file.len(),
            self.keep_alive,
        )?;
        self.file = Some(file);
        self.arm_send(Status::Ok);
        Ok(())
    }

    /// Replaces whatever was composed with an error response.
    fn respond_error(&mut self, version: Version, status: Status) {
        self.file = None;
        self.write_buf.clear();
        if status.forces_close() {
            self.keep_alive = false;
        }
        match response::write_error(&mut self.write_buf, version, status, self.keep_alive) {
            Ok(()) => self.arm_send(status),
            Err(e) => {
                warn!("Cannot fit a {} response: {}", status.code(), e);
                self.keep_alive = false;
                self.status = Some(status);
                self.phase = Phase::Closing;
            }
        }
    }

    fn arm_send(&mut self, status: Status) {
        self.status = Some(status);
        self.bytes_sent = 0;
        self.bytes_to_send = self.write_buf.len() + self.file.as_ref().map_or(0, MappedFile::len);
        self.phase = Phase::Writing;
    }

    /// Sends the header and the mapped file with vectored writes until done or
    /// until `dst` would block.
    pub fn write_to<W: Write>(&mut self, dst: &mut W) -> io::Result<WriteProgress> {
        loop {
            if self.bytes_sent >= self.bytes_to_send {
                return Ok(WriteProgress::Complete);
            }
            let head = self.write_buf.unconsumed();
            let body = self.file.as_ref().map_or(&[][..], MappedFile::as_bytes);
            let (head, body) = if self.bytes_sent < head.len() {
                (&head[self.bytes_sent..], body)
            } else {
                (&[][..], &body[self.bytes_sent - head.len()..])
            };
            let segments = [IoSlice::new(head), IoSlice::new(body)];

            match dst.write_vectored(&segments) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket accepted no bytes",
                    ));
                }
                Ok(n) => self.bytes_sent += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(WriteProgress::Pending);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Gets ready for the next request on a keep-alive connection. The mapping
    /// is released and the answered request's bytes leave the read buffer.
    pub fn reset_for_next(&mut self) {
        self.file = None;
        self.write_buf.clear();
        self.read_buf.consume(self.consumed);
        self.consumed = 0;
        self.parser.reset();
        self.status = None;
        self.bytes_sent = 0;
        self.bytes_to_send = 0;
        self.keep_alive = false;
        self.phase = Phase::Reading;
    }

    /// Releases every per-connection resource and hands back the socket so the
    /// caller can deregister it before it is closed.
    pub fn close(&mut self) -> Option<OwnedFd> {
        let socket = self.socket.take();
        self.clear();
        socket
    }

    fn clear(&mut self) {
        self.peer = None;
        self.phase = Phase::Idle;
        self.read_buf.clear();
        self.write_buf.clear();
        self.parser.reset();
        self.request = None;
        self.status = None;
        self.consumed = 0;
        self.file = None;
        self.bytes_sent = 0;
        self.bytes_to_send = 0;
        self.keep_alive = false;
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("fd", &self.raw_fd())
            .field("peer", &self.peer)
            .field("phase", &self.phase)
            .field("status", &self.status)
            .field("bytes_sent", &self.bytes_sent)
            .field("bytes_to_send", &self.bytes_to_send)
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::InMemoryCredentials;
    use crate::resource::FileStore;
    use std::collections::VecDeque;
    use std::fs;
    use std::sync::Arc;

    /// Yields queued chunks, then `WouldBlock`.
    struct Chunks(VecDeque<Vec<u8>>);

    impl Read for Chunks {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.front_mut() {
                None => Err(io::ErrorKind::WouldBlock.into()),
                Some(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    chunk.drain(..n);
                    if chunk.is_empty() {
                        self.0.pop_front();
                    }
                    Ok(n)
                }
            }
        }
    }

    fn chunks(parts: &[&[u8]]) -> Chunks {
        Chunks(parts.iter().map(|p| p.to_vec()).collect())
    }

    /// Accepts at most `per_call` bytes per write, and blocks every other call.
    struct Throttled {
        out: Vec<u8>,
        per_call: usize,
        block_next: bool,
    }

    impl Write for Throttled {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.block_next {
                self.block_next = false;
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.block_next = true;
            let n = buf.len().min(self.per_call);
            self.out.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn context() -> (tempfile::TempDir, ServerContext) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.html"), b"<h1>ember</h1>").unwrap();
        fs::write(dir.path().join("empty.html"), b"").unwrap();
        fs::write(dir.path().join("welcome.html"), b"welcome").unwrap();
        fs::write(dir.path().join("big.html"), vec![b'x'; 10_000]).unwrap();
        let ctx = ServerContext::new(
            FileStore::new(dir.path()),
            Arc::new(InMemoryCredentials::with_users([("root", "toor")])),
        );
        (dir, ctx)
    }

    fn respond(conn: &mut Conn, ctx: &ServerContext, input: &[&[u8]]) -> (Phase, Vec<u8>) {
        conn.read_from(&mut chunks(input)).unwrap();
        let phase = conn.process(ctx);
        let mut out = Vec::new();
        if phase == Phase::Writing {
            assert_eq!(conn.write_to(&mut out).unwrap(), WriteProgress::Complete);
        }
        (phase, out)
    }

    fn open_conn() -> Conn {
        let (_r, w) = crate::syscalls::create_pipe().unwrap();
        let mut conn = Conn::new(2048, 1024);
        conn.open(w, None);
        conn
    }

    #[test]
    fn serves_file_with_exact_length() {
        let (_dir, ctx) = context();
        let mut conn = open_conn();
        let (phase, out) = respond(&mut conn, &ctx, &[b"GET / HTTP/1.1\r\nHost: a\r\n\r\n"]);
        assert_eq!(phase, Phase::Writing);

        let text = String::from_utf8(out.clone()).unwrap();
        let head_len = text.find("\r\n\r\n").unwrap() + 4;
        assert!(text.starts_with("HTTP/1.1 200 OK\r\nContent-Length: 14\r\n"));
        assert!(text.contains("Connection: closed\r\n"));
        assert_eq!(out.len(), head_len + 14);
        assert_eq!(conn.bytes_sent(), conn.bytes_to_send());
        assert!(!conn.keep_alive());
    }

    #[test]
    fn partial_request_keeps_reading() {
        let (_dir, ctx) = context();
        let mut conn = open_conn();
        conn.read_from(&mut chunks(&[b"GET /index.html HT"])).unwrap();
        assert_eq!(conn.process(&ctx), Phase::Reading);
        conn.read_from(&mut chunks(&[b"TP/1.0\r\n\r\n"])).unwrap();
        assert_eq!(conn.process(&ctx), Phase::Writing);
        assert_eq!(conn.request().unwrap().url, "/index.html");
    }

    #[test]
    fn keep_alive_serves_second_request() {
        let (_dir, ctx) = context();
        let mut conn = open_conn();
        let req: &[u8] = b"GET /index.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n";
        let (_, first) = respond(&mut conn, &ctx, &[req]);
        assert!(conn.keep_alive());
        conn.reset_for_next();
        assert!(!conn.has_buffered_bytes());

        let (phase, second) = respond(&mut conn, &ctx, &[req]);
        assert_eq!(phase, Phase::Writing);
        assert_eq!(first, second);
        assert!(String::from_utf8(second).unwrap().contains("Connection: keep-alive"));
    }

    #[test]
    fn pipelined_request_stays_buffered() {
        let (_dir, ctx) = context();
        let mut conn = open_conn();
        let two: &[u8] = b"GET /index.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n\
GET /welcome.html HTTP/1.1\r\n\r\n";
        respond(&mut conn, &ctx, &[two]);
        conn.reset_for_next();
        assert!(conn.has_buffered_bytes());

        assert_eq!(conn.process(&ctx), Phase::Writing);
        assert_eq!(conn.request().unwrap().url, "/welcome.html");
        let mut out = Vec::new();
        conn.write_to(&mut out).unwrap();
        assert!(out.ends_with(b"welcome"));
    }

    #[test]
    fn malformed_request_gets_400_and_close() {
        let (_dir, ctx) = context();
        let mut conn = open_conn();
        let (_, out) = respond(
            &mut conn,
            &ctx,
            &[b"GET /index.html HTTP/1.1\r\nConnection: keep-alive\r\nContent-Length: -1\r\n\r\n"],
        );
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.contains("Connection: closed"));
        assert!(text.ends_with(Status::BadRequest.form()));
        assert!(!conn.keep_alive());
    }

    #[test]
    fn bad_request_echoes_the_parsed_version() {
        let (_dir, ctx) = context();
        let mut conn = open_conn();
        let (_, out) = respond(
            &mut conn,
            &ctx,
            &[b"GET /index.html HTTP/1.0\r\nno colon\r\n\r\n"],
        );
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.0 400 Bad Request\r\n"));

        // Nothing parsed yet, so the default version answers
        let mut conn = open_conn();
        let (_, out) = respond(&mut conn, &ctx, &[b"GET\r\n\r\n"]);
        assert!(out.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
    }

    #[test]
    fn missing_file_is_404_and_may_keep_alive() {
        let (_dir, ctx) = context();
        let mut conn = open_conn();
        let (_, out) = respond(
            &mut conn,
            &ctx,
            &[b"GET /missing.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n"],
        );
        assert!(out.starts_with(b"HTTP/1.1 404 Not Found\r\n"));
        assert_eq!(conn.status(), Some(Status::NotFound));
        assert!(conn.keep_alive());
    }

    #[test]
    fn empty_file_gets_placeholder_body() {
        let (_dir, ctx) = context();
        let mut conn = open_conn();
        let (_, out) = respond(&mut conn, &ctx, &[b"GET /empty.html HTTP/1.1\r\n\r\n"]);
        assert!(out.ends_with(EMPTY_PAGE));
    }

    #[test]
    fn login_redirects_to_welcome() {
        let (_dir, ctx) = context();
        let mut conn = open_conn();
        let (_, out) = respond(
            &mut conn,
            &ctx,
            &[b"POST /2CGISQL.cgi HTTP/1.1\r\nContent-Length: 23\r\n\r\nuser=root&password=toor"],
        );
        assert!(out.ends_with(b"welcome"));
    }

    #[test]
    fn oversized_request_is_rejected() {
        let (_dir, ctx) = context();
        let mut conn = Conn::new(64, 1024);
        let (_r, w) = crate::syscalls::create_pipe().unwrap();
        conn.open(w, None);
        let long = [b'a'; 100];
        conn.read_from(&mut chunks(&[b"GET /", &long])).unwrap();
        assert_eq!(conn.process(&ctx), Phase::Writing);
        assert_eq!(conn.status(), Some(Status::BadRequest));
    }

    #[test]
    fn slow_socket_resumes_across_partial_writes() {
        let (_dir, ctx) = context();
        let mut conn = open_conn();
        conn.read_from(&mut chunks(&[b"GET /big.html HTTP/1.1\r\n\r\n"]))
            .unwrap();
        assert_eq!(conn.process(&ctx), Phase::Writing);

        let mut sink = Throttled {
            out: Vec::new(),
            per_call: 4096,
            block_next: false,
        };
        let mut rounds = 0;
        while conn.write_to(&mut sink).unwrap() == WriteProgress::Pending {
            rounds += 1;
        }
        assert!(rounds >= 2);
        assert_eq!(sink.out.len(), conn.bytes_to_send());
        assert!(sink.out.ends_with(&[b'x'; 100]));
    }

    #[test]
    fn peer_close_is_an_error() {
        let mut conn = open_conn();
        let err = conn.read_from(&mut io::empty()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn close_returns_socket_and_frees_slot() {
        let (_dir, ctx) = context();
        let mut conn = open_conn();
        respond(&mut conn, &ctx, &[b"GET / HTTP/1.1\r\n\r\n"]);
        assert!(conn.close().is_some());
        assert!(!conn.is_open());
        assert_eq!(conn.phase(), Phase::Idle);
        assert!(conn.close().is_none());

        let generation = conn.generation();
        let (_r, w) = crate::syscalls::create_pipe().unwrap();
        conn.open(w, None);
        assert_eq!(conn.generation(), generation + 1);
    }
}
