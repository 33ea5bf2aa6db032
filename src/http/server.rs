//! The HTTP server connection state machine (`spec.md` §4.7):
//! `free -> server_request -> server_body -> client_response ->
//! client_body -> waiting`, reusing a pipelined connection by looping
//! back to `server_request` instead of closing.

use std::io::Write;
use std::time::Instant;

use crate::http::handler::ServerHandler;
use crate::http::message::{Request, Response, Version};
use crate::http::parser::{self, ChunkedDecoder, ChunkedStep};
use crate::http::{http_date, IoOutcome, Socket};

/// One slot's state tag, named exactly as `spec.md` §4.7's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Free,
    ServerRequest,
    ServerBody,
    ClientResponse,
    ClientBody,
    Waiting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flags {
    pub request_has_body: bool,
    pub response_has_body: bool,
    pub connection_close: bool,
}

impl Default for Flags {
    fn default() -> Flags {
        Flags { request_has_body: false, response_has_body: false, connection_close: false }
    }
}

/// What the caller (the protocol thread, `crate::thread`) should do
/// after a `step` call returns.
pub enum StepOutcome {
    /// No terminal condition; the connection wants `interest` next.
    Continue { interest: crate::epoll::Ready },
    /// The connection looped back to `waiting` or finished a pipelined
    /// exchange cleanly; still alive.
    Idle,
    /// `spec.md` §4.7 "abort": drop the connection without a response.
    Abort(crate::Error),
    /// The peer's `Connection: close` (or HTTP/1.0 default) was honored
    /// after a full response; close gracefully.
    Close,
}

pub struct ServerConnection {
    pub socket: Option<Socket>,
    pub state: ServerState,
    pub flags: Flags,
    header_buf: Vec<u8>,
    io_buf: Vec<u8>,
    header_buffer_size: usize,
    request: Option<Request>,
    response: Option<Response>,
    response_head_written: usize,
    response_head: Vec<u8>,
    chunked_decoder: Option<ChunkedDecoder>,
    content_length_remaining: Option<u64>,
    pub last_activity: Instant,
    pub requests_processed: u64,
    pub handler: Option<Box<dyn ServerHandler>>,
}

impl ServerConnection {
    pub fn new(socket: Socket, io_buffer_size: usize, header_buffer_size: usize) -> ServerConnection {
        ServerConnection {
            socket: Some(socket),
            state: ServerState::ServerRequest,
            flags: Flags::default(),
            header_buf: Vec::with_capacity(header_buffer_size.min(4096)),
            io_buf: vec![0u8; io_buffer_size],
            header_buffer_size,
            request: None,
            response: None,
            response_head_written: 0,
            response_head: Vec::new(),
            chunked_decoder: None,
            content_length_remaining: None,
            last_activity: Instant::now(),
            requests_processed: 0,
            handler: None,
        }
    }

    fn reset_for_next_request(&mut self) {
        self.state = ServerState::ServerRequest;
        self.flags = Flags::default();
        self.header_buf.clear();
        self.request = None;
        self.response = None;
        self.response_head_written = 0;
        self.response_head.clear();
        self.chunked_decoder = None;
        self.content_length_remaining = None;
    }

    /// Advances the state machine as far as non-blocking I/O allows.
    /// Called whenever the pollset reports readiness for this
    /// connection's current interest.
    pub fn step(&mut self) -> StepOutcome {
        self.last_activity = Instant::now();

        if let Some(outcome) = self.advance_handshake() {
            return outcome;
        }

        loop {
            match self.state {
                ServerState::Free | ServerState::Waiting => return StepOutcome::Idle,
                ServerState::ServerRequest => match self.read_request() {
                    Ok(Some(outcome)) => return outcome,
                    Ok(None) => continue,
                    Err(e) => return StepOutcome::Abort(e),
                },
                ServerState::ServerBody => match self.read_body() {
                    Ok(Some(outcome)) => return outcome,
                    Ok(None) => continue,
                    Err(e) => return StepOutcome::Abort(e),
                },
                ServerState::ClientResponse => match self.write_response_head() {
                    Ok(Some(outcome)) => return outcome,
                    Ok(None) => continue,
                    Err(e) => return StepOutcome::Abort(e),
                },
                ServerState::ClientBody => match self.write_response_body() {
                    Ok(Some(outcome)) => return outcome,
                    Ok(None) => continue,
                    Err(e) => return StepOutcome::Abort(e),
                },
            }
        }
    }

    fn socket_mut(&mut self) -> &mut Socket {
        self.socket.as_mut().expect("connection slot has no socket")
    }

    /// Drives a still-in-progress TLS handshake one step further.
    /// `spec.md` §4.3: the handshake is transparent to callers above the
    /// socket layer, but something still has to pump it on every
    /// readiness event before the state machine's own reads/writes mean
    /// anything. Returns `Some` when the caller should stop (still
    /// handshaking, or it failed); `None` once the socket is a plain
    /// established stream and `step` should proceed as usual.
    fn advance_handshake(&mut self) -> Option<StepOutcome> {
        if !self.socket.as_ref().map(Socket::is_handshaking).unwrap_or(false) {
            return None;
        }

        let socket = self.socket.take().expect("socket present while handshaking");
        match socket.resume_handshake() {
            Ok(socket) => {
                let still_handshaking = socket.is_handshaking();
                self.socket = Some(socket);
                still_handshaking
                    .then(|| StepOutcome::Continue { interest: crate::epoll::Ready::readable() | crate::epoll::Ready::writable() })
            }
            Err(e) => Some(StepOutcome::Abort(e)),
        }
    }

    fn read_request(&mut self) -> crate::Result<Option<StepOutcome>> {
        if self.header_buf.len() >= self.header_buffer_size {
            return Err(crate::Error::HeaderOverflow);
        }

        let mut chunk = [0u8; 4096];
        let outcome = self.socket_mut().read(&mut chunk);

        match outcome {
            IoOutcome::Done(n) => {
                self.header_buf.extend_from_slice(&chunk[..n]);
                if self.header_buf.len() > self.header_buffer_size {
                    return Err(crate::Error::HeaderOverflow);
                }

                let parsed = parser::parse_request(&self.header_buf)?;
                if let Some(request) = parsed.message {
                    self.on_request_parsed(request, parsed.consumed)?;
                    Ok(None)
                } else {
                    Ok(None)
                }
            }
            IoOutcome::WouldBlock => Ok(Some(StepOutcome::Continue { interest: crate::epoll::Ready::readable() })),
            IoOutcome::Eof => {
                if self.header_buf.is_empty() {
                    // Clean close between pipelined requests is not an
                    // error; treated identically to an idle keepalive
                    // close by the caller.
                    Err(crate::Error::UnexpectedEof)
                } else {
                    Err(crate::Error::UnexpectedEof)
                }
            }
            IoOutcome::Error(e) => Err(e.into()),
        }
    }

    fn on_request_parsed(&mut self, request: Request, consumed: usize) -> crate::Result<()> {
        self.flags.request_has_body = parser::content_length(&request.headers).unwrap_or(0) > 0
            || parser::is_chunked(&request.headers);

        if request.version == Version::Http11 && request.headers.get("Host").is_none() {
            return Err(crate::Error::ParseError("HTTP/1.1 request missing Host header".into()));
        }

        self.content_length_remaining = parser::content_length(&request.headers);
        if parser::is_chunked(&request.headers) {
            self.chunked_decoder = Some(ChunkedDecoder::new());
        }

        let handler = self.handler.as_mut().expect("handler must be assigned before parsing completes");
        handler.init();
        handler.handle_request(&request)?;

        self.request = Some(request);
        self.state = if self.flags.request_has_body { ServerState::ServerBody } else { ServerState::ClientResponse };

        // Bytes past the head in this same read are body bytes (or the
        // start of the next pipelined request) that already arrived;
        // a socket read here would just wait for data already in hand.
        let leftover = self.header_buf.split_off(consumed);
        self.header_buf.clear();
        if self.flags.request_has_body && !leftover.is_empty() {
            self.consume_request_body_chunk(&leftover)?;
        }

        Ok(())
    }

    fn consume_request_body_chunk(&mut self, chunk: &[u8]) -> crate::Result<()> {
        let handler = self.handler.as_mut().expect("handler present in ServerBody");

        if let Some(decoder) = self.chunked_decoder.as_mut() {
            let mut decoded = Vec::new();
            match decoder.decode(chunk, &mut decoded)? {
                ChunkedStep::Data { .. } => {
                    let _ = handler.read_request_body(&decoded);
                }
                ChunkedStep::Done { .. } => {
                    let _ = handler.read_request_body(&decoded);
                    let _ = handler.read_request_body(&[]);
                    self.state = ServerState::ClientResponse;
                }
                ChunkedStep::NeedMore => {}
            }
        } else {
            let _ = handler.read_request_body(chunk);
            if let Some(remaining) = self.content_length_remaining.as_mut() {
                *remaining = remaining.saturating_sub(chunk.len() as u64);
                if *remaining == 0 {
                    self.state = ServerState::ClientResponse;
                }
            }
        }

        Ok(())
    }

    fn read_body(&mut self) -> crate::Result<Option<StepOutcome>> {
        if let Some(remaining) = self.content_length_remaining {
            if remaining == 0 {
                self.state = ServerState::ClientResponse;
                return Ok(None);
            }
        }

        let mut chunk = vec![0u8; self.io_buf.len()];
        match self.socket_mut().read(&mut chunk) {
            IoOutcome::Done(n) => {
                self.consume_request_body_chunk(&chunk[..n])?;
                Ok(None)
            }
            IoOutcome::WouldBlock => Ok(Some(StepOutcome::Continue { interest: crate::epoll::Ready::readable() })),
            IoOutcome::Eof => Err(crate::Error::UnexpectedEof),
            IoOutcome::Error(e) => Err(e.into()),
        }
    }

    fn write_response_head(&mut self) -> crate::Result<Option<StepOutcome>> {
        if self.response.is_none() {
            let handler = self.handler.as_mut().expect("handler present before populate_response");
            let meta = handler.populate_response();
            let mut response = meta.response;
            response.headers.set("Date", http_date());
            self.flags.response_has_body = meta.response_has_body;
            self.flags.connection_close = connection_close(
                self.request.as_ref().map(|r| r.version).unwrap_or(Version::Http11),
                self.request.as_ref().and_then(|r| r.headers.get("Connection")),
            );
            response
                .headers
                .set("Connection", if self.flags.connection_close { "close" } else { "keep-alive" });

            let mut head = Vec::new();
            response.write_head(&mut head);
            self.response_head = head;
            self.response = Some(response);
        }

        if self.response_head_written < self.response_head.len() {
            match self.socket_mut().write(&self.response_head[self.response_head_written..]) {
                IoOutcome::Done(n) => {
                    self.response_head_written += n;
                    Ok(None)
                }
                IoOutcome::WouldBlock => {
                    Ok(Some(StepOutcome::Continue { interest: crate::epoll::Ready::writable() }))
                }
                IoOutcome::Eof => Err(crate::Error::UnexpectedEof),
                IoOutcome::Error(e) => Err(e.into()),
            }
        } else {
            self.state = if self.flags.response_has_body { ServerState::ClientBody } else { ServerState::Free };
            if self.state == ServerState::Free && self.finish_exchange() {
                return Ok(Some(StepOutcome::Close));
            }
            Ok(None)
        }
    }

    fn write_response_body(&mut self) -> crate::Result<Option<StepOutcome>> {
        let handler = self.handler.as_mut().expect("handler present in ClientBody");
        let mut buf = vec![0u8; self.io_buf.len()];

        match handler.write_response_body(&mut buf) {
            Ok(0) => {
                if self.finish_exchange() {
                    Ok(Some(StepOutcome::Close))
                } else {
                    Ok(None)
                }
            }
            Ok(n) => match self.socket_mut().write(&buf[..n]) {
                IoOutcome::Done(written) if written == n => Ok(None),
                IoOutcome::Done(written) => {
                    // Partial write: resend the remainder before asking
                    // the handler for more, to preserve issue order.
                    let mut remainder = buf[written..n].to_vec();
                    loop {
                        match self.socket_mut().write(&remainder) {
                            IoOutcome::Done(w) if w == remainder.len() => break,
                            IoOutcome::Done(w) => remainder.drain(..w),
                            IoOutcome::WouldBlock => {
                                return Ok(Some(StepOutcome::Continue { interest: crate::epoll::Ready::writable() }))
                            }
                            IoOutcome::Eof => return Err(crate::Error::UnexpectedEof),
                            IoOutcome::Error(e) => return Err(e.into()),
                        };
                    }
                    Ok(None)
                }
                IoOutcome::WouldBlock => Ok(Some(StepOutcome::Continue { interest: crate::epoll::Ready::writable() })),
                IoOutcome::Eof => Err(crate::Error::UnexpectedEof),
                IoOutcome::Error(e) => Err(e.into()),
            },
            Err(e) => Err(crate::Error::HandlerFailed(e.to_string())),
        }
    }

    /// Wraps up a finished exchange and reports whether the connection
    /// should now close (`spec.md` §4.7 `client_response`/`client_body`
    /// "-> close") instead of looping back to `waiting`.
    fn finish_exchange(&mut self) -> bool {
        if let Some(handler) = self.handler.as_mut() {
            handler.end_request();
        }
        self.requests_processed += 1;
        let close = self.should_close();
        self.state = ServerState::Waiting;
        self.reset_pipeline_scratch();
        close
    }

    fn reset_pipeline_scratch(&mut self) {
        let close = self.flags.connection_close;
        self.header_buf.clear();
        self.request = None;
        self.response = None;
        self.response_head_written = 0;
        self.response_head.clear();
        self.chunked_decoder = None;
        self.content_length_remaining = None;
        if !close {
            self.flags = Flags::default();
        }
    }

    /// Called by the protocol thread when a byte arrives while parked
    /// in `waiting`: a pipelined request has started.
    pub fn wake_for_pipelined_request(&mut self) {
        if self.state == ServerState::Waiting {
            self.reset_for_next_request();
        }
    }

    pub fn should_close(&self) -> bool {
        self.flags.connection_close
    }
}

/// `spec.md` §4.7: `connection_close` is deterministic from
/// `(http_version, connection_header)`.
pub fn connection_close(version: Version, connection_header: Option<&str>) -> bool {
    let keepalive = connection_header.map(|v| v.eq_ignore_ascii_case("keep-alive")).unwrap_or(false);
    let close = connection_header.map(|v| v.eq_ignore_ascii_case("close")).unwrap_or(false);

    match version {
        Version::Http10 => !keepalive,
        Version::Http11 => close,
    }
}

/// Serializes a full response with a fixed body into `out`, used by
/// handlers (e.g. the echo handler) that stage the entire body in
/// memory up front.
pub fn write_fixed_response(out: &mut impl Write, response: &Response, body: &[u8]) -> std::io::Result<()> {
    let mut head = Vec::new();
    response.write_head(&mut head);
    out.write_all(&head)?;
    out.write_all(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_close_table() {
        assert!(connection_close(Version::Http10, None));
        assert!(!connection_close(Version::Http10, Some("keep-alive")));
        assert!(!connection_close(Version::Http11, None));
        assert!(connection_close(Version::Http11, Some("close")));
        assert!(!connection_close(Version::Http11, Some("keep-alive")));
    }
}
