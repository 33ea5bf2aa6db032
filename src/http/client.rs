//! The HTTP client connection state machine (`spec.md` §4.8):
//! `free -> client_request -> client_body -> server_response ->
//! server_body -> waiting`, and the per-host connection pool `submit`
//! policy.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use crate::epoll::Ready;
use crate::http::handler::ClientHandler;
use crate::http::message::{Request, Response, Version};
use crate::http::parser::{self, ChunkedDecoder, ChunkedStep};
use crate::http::{IoOutcome, Socket};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Free,
    ClientRequest,
    ClientBody,
    ServerResponse,
    ServerBody,
    Waiting,
}

pub enum StepOutcome {
    Continue { interest: Ready },
    Idle,
    Abort(crate::Error),
}

struct PendingRequest {
    handler: Box<dyn ClientHandler>,
}

pub struct ClientConnection {
    pub socket: Option<Socket>,
    pub state: ClientState,
    pub remote_host: String,
    pub connection_close: bool,
    request_has_body: bool,
    response_has_body: bool,
    queue: VecDeque<PendingRequest>,
    request: Option<Request>,
    request_head: Vec<u8>,
    request_head_written: usize,
    header_buf: Vec<u8>,
    response: Option<Response>,
    chunked_decoder: Option<ChunkedDecoder>,
    content_length_remaining: Option<u64>,
    io_buf_len: usize,
    header_buffer_size: usize,
    pub last_activity: Instant,
    pub requests_processed: u64,
}

impl ClientConnection {
    pub fn new(socket: Socket, remote_host: String, io_buffer_size: usize, header_buffer_size: usize) -> ClientConnection {
        ClientConnection {
            socket: Some(socket),
            state: ClientState::Free,
            remote_host,
            connection_close: false,
            request_has_body: false,
            response_has_body: false,
            queue: VecDeque::new(),
            request: None,
            request_head: Vec::new(),
            request_head_written: 0,
            header_buf: Vec::with_capacity(4096),
            response: None,
            chunked_decoder: None,
            content_length_remaining: None,
            io_buf_len: io_buffer_size,
            header_buffer_size,
            last_activity: Instant::now(),
            requests_processed: 0,
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Appends a request and, if this connection was idle, starts
    /// sending it. Returns `true` if the caller must forward a
    /// `process_next_request` message to a processor thread (the queue
    /// was previously empty).
    pub fn enqueue(&mut self, handler: Box<dyn ClientHandler>) -> bool {
        let was_empty = self.queue.is_empty();
        self.queue.push_back(PendingRequest { handler });
        if was_empty && matches!(self.state, ClientState::Free | ClientState::Waiting) {
            self.begin_next_request();
        }
        was_empty
    }

    fn begin_next_request(&mut self) {
        if let Some(pending) = self.queue.front_mut() {
            let request = pending.handler.populate_request();
            self.request_has_body = parser::content_length(&request.headers).unwrap_or(0) > 0
                || parser::is_chunked(&request.headers);

            let mut head = Vec::new();
            head.extend_from_slice(format!("{} {} {}\r\n", request.method, request.path, request.version).as_bytes());
            for header in request.headers.iter() {
                head.extend_from_slice(format!("{}: {}\r\n", header.name, header.value).as_bytes());
            }
            head.extend_from_slice(b"\r\n");

            self.request = Some(request);
            self.request_head = head;
            self.request_head_written = 0;
            self.state = ClientState::ClientRequest;
        }
    }

    pub fn step(&mut self) -> StepOutcome {
        self.last_activity = Instant::now();

        if let Some(outcome) = self.advance_handshake() {
            return outcome;
        }

        loop {
            match self.state {
                ClientState::Free | ClientState::Waiting => return StepOutcome::Idle,
                ClientState::ClientRequest => match self.write_request_head() {
                    Ok(Some(outcome)) => return outcome,
                    Ok(None) => continue,
                    Err(e) => return self.fail_head(e),
                },
                ClientState::ClientBody => match self.write_request_body() {
                    Ok(Some(outcome)) => return outcome,
                    Ok(None) => continue,
                    Err(e) => return self.fail_head(e),
                },
                ClientState::ServerResponse => match self.read_response_head() {
                    Ok(Some(outcome)) => return outcome,
                    Ok(None) => continue,
                    Err(e) => return self.fail_head(e),
                },
                ClientState::ServerBody => match self.read_response_body() {
                    Ok(Some(outcome)) => return outcome,
                    Ok(None) => continue,
                    Err(e) => return self.fail_head(e),
                },
            }
        }
    }

    fn fail_head(&mut self, err: crate::Error) -> StepOutcome {
        if let Some(mut pending) = self.queue.pop_front() {
            pending.handler.handle_response(Err(err_for_handler(&err)));
        }
        StepOutcome::Abort(err)
    }

    fn socket_mut(&mut self) -> &mut Socket {
        self.socket.as_mut().expect("connection slot has no socket")
    }

    /// Mirrors `ServerConnection::advance_handshake`: pumps a
    /// still-in-progress TLS handshake before any of the request/response
    /// phases below touch the socket. A failed handshake fails every
    /// request queued on this connection, not just the head of the
    /// queue — `spec.md` §4.8's connect flow treats a handshake failure
    /// the same as a failed `connect`.
    fn advance_handshake(&mut self) -> Option<StepOutcome> {
        if !self.socket.as_ref().map(Socket::is_handshaking).unwrap_or(false) {
            return None;
        }

        let socket = self.socket.take().expect("socket present while handshaking");
        match socket.resume_handshake() {
            Ok(socket) => {
                let still_handshaking = socket.is_handshaking();
                self.socket = Some(socket);
                still_handshaking.then(|| StepOutcome::Continue { interest: Ready::readable() | Ready::writable() })
            }
            Err(e) => {
                self.fail_all_pending(err_for_handler(&e));
                Some(StepOutcome::Abort(e))
            }
        }
    }

    fn write_request_head(&mut self) -> crate::Result<Option<StepOutcome>> {
        if self.request_head_written < self.request_head.len() {
            match self.socket_mut().write(&self.request_head[self.request_head_written..]) {
                IoOutcome::Done(n) => {
                    self.request_head_written += n;
                    Ok(None)
                }
                IoOutcome::WouldBlock => Ok(Some(StepOutcome::Continue { interest: Ready::writable() })),
                IoOutcome::Eof => Err(crate::Error::UnexpectedEof),
                IoOutcome::Error(e) => Err(e.into()),
            }
        } else {
            self.state = if self.request_has_body { ClientState::ClientBody } else { ClientState::ServerResponse };
            Ok(None)
        }
    }

    fn write_request_body(&mut self) -> crate::Result<Option<StepOutcome>> {
        let handler = &mut self.queue.front_mut().expect("queue head present in ClientBody").handler;
        let mut buf = vec![0u8; self.io_buf_len];

        match handler.write_request_body(&mut buf) {
            Ok(0) => {
                self.state = ClientState::ServerResponse;
                Ok(None)
            }
            Ok(n) => match self.socket.as_mut().unwrap().write(&buf[..n]) {
                IoOutcome::Done(_) => Ok(None),
                IoOutcome::WouldBlock => Ok(Some(StepOutcome::Continue { interest: Ready::writable() })),
                IoOutcome::Eof => Err(crate::Error::UnexpectedEof),
                IoOutcome::Error(e) => Err(e.into()),
            },
            Err(e) => Err(crate::Error::HandlerFailed(e.to_string())),
        }
    }

    fn read_response_head(&mut self) -> crate::Result<Option<StepOutcome>> {
        if self.header_buf.len() >= self.header_buffer_size {
            return Err(crate::Error::HeaderOverflow);
        }

        let mut chunk = [0u8; 4096];
        match self.socket_mut().read(&mut chunk) {
            IoOutcome::Done(n) => {
                self.header_buf.extend_from_slice(&chunk[..n]);
                if self.header_buf.len() > self.header_buffer_size {
                    return Err(crate::Error::HeaderOverflow);
                }

                let parsed = parser::parse_response(&self.header_buf)?;
                if let Some(response) = parsed.message {
                    self.on_response_parsed(response, parsed.consumed)?;
                }
                Ok(None)
            }
            IoOutcome::WouldBlock => Ok(Some(StepOutcome::Continue { interest: Ready::readable() })),
            IoOutcome::Eof => Err(crate::Error::UnexpectedEof),
            IoOutcome::Error(e) => Err(e.into()),
        }
    }

    fn on_response_parsed(&mut self, response: Response, consumed: usize) -> crate::Result<()> {
        self.response_has_body = parser::content_length(&response.headers).unwrap_or(0) > 0
            || parser::is_chunked(&response.headers);
        self.content_length_remaining = parser::content_length(&response.headers);
        if parser::is_chunked(&response.headers) {
            self.chunked_decoder = Some(ChunkedDecoder::new());
        }

        self.connection_close = connection_close_client(
            self.request.as_ref().map(|r| r.version).unwrap_or(Version::Http11),
            response.headers.get("Connection"),
        );

        if !self.response_has_body {
            if let Some(pending) = self.queue.front_mut() {
                pending.handler.handle_response(Ok(&response));
            }
        }

        self.response = Some(response);
        self.state = if self.response_has_body { ClientState::ServerBody } else { ClientState::Free };

        // Bytes past the head in this same read are body bytes that
        // already arrived; feed them in before blocking on another read.
        let leftover = self.header_buf.split_off(consumed);
        self.header_buf.clear();

        if !self.response_has_body {
            self.complete_current_request();
        } else if !leftover.is_empty() {
            self.consume_response_body_chunk(&leftover)?;
        }

        Ok(())
    }

    fn consume_response_body_chunk(&mut self, chunk: &[u8]) -> crate::Result<()> {
        if self.chunked_decoder.is_some() {
            let mut decoded = Vec::new();
            let step = {
                let decoder = self.chunked_decoder.as_mut().unwrap();
                decoder.decode(chunk, &mut decoded)?
            };
            if let Some(pending) = self.queue.front_mut() {
                let _ = pending.handler.read_response_body(&decoded);
            }
            if matches!(step, ChunkedStep::Done { .. }) {
                self.finish_response_body();
            }
        } else {
            if let Some(pending) = self.queue.front_mut() {
                let _ = pending.handler.read_response_body(chunk);
            }
            if let Some(remaining) = self.content_length_remaining.as_mut() {
                *remaining = remaining.saturating_sub(chunk.len() as u64);
                if *remaining == 0 {
                    self.finish_response_body();
                }
            }
        }

        Ok(())
    }

    fn read_response_body(&mut self) -> crate::Result<Option<StepOutcome>> {
        if let Some(remaining) = self.content_length_remaining {
            if remaining == 0 {
                self.finish_response_body();
                return Ok(None);
            }
        }

        let mut chunk = vec![0u8; self.io_buf_len];
        match self.socket_mut().read(&mut chunk) {
            IoOutcome::Done(n) => {
                self.consume_response_body_chunk(&chunk[..n])?;
                Ok(None)
            }
            IoOutcome::WouldBlock => Ok(Some(StepOutcome::Continue { interest: Ready::readable() })),
            IoOutcome::Eof => Err(crate::Error::UnexpectedEof),
            IoOutcome::Error(e) => Err(e.into()),
        }
    }

    fn finish_response_body(&mut self) {
        if let Some(pending) = self.queue.front_mut() {
            let response = self.response.clone();
            pending.handler.handle_response(Ok(response.as_ref().unwrap()));
        }
        self.complete_current_request();
    }

    fn complete_current_request(&mut self) {
        if let Some(mut pending) = self.queue.pop_front() {
            pending.handler.end_request();
        }
        self.requests_processed += 1;
        self.header_buf.clear();
        self.response = None;
        self.chunked_decoder = None;
        self.content_length_remaining = None;
        self.request = None;
        self.request_head.clear();
        self.request_head_written = 0;

        if !self.queue.is_empty() {
            self.begin_next_request();
        } else {
            self.state = ClientState::Waiting;
        }
    }

    /// Fails every queued request with `connect_failed`/`connection_close`
    /// style terminal errors — used when the connect attempt itself
    /// fails (`spec.md` §4.8 "Connect flow").
    pub fn fail_all_pending(&mut self, err: crate::Error) {
        while let Some(mut pending) = self.queue.pop_front() {
            pending.handler.handle_response(Err(err_for_handler(&err)));
        }
    }
}

fn err_for_handler(err: &crate::Error) -> crate::Error {
    match err {
        crate::Error::Io(e) => crate::Error::Io(std::io::Error::new(e.kind(), e.to_string())),
        other => clone_error(other),
    }
}

fn clone_error(err: &crate::Error) -> crate::Error {
    use crate::Error::*;
    match err {
        ConfigInvalid(s) => ConfigInvalid(s.clone()),
        ResolveFailed(e) => ResolveFailed(std::io::Error::new(e.kind(), e.to_string())),
        ConnectFailed(e) => ConnectFailed(std::io::Error::new(e.kind(), e.to_string())),
        TlsHandshakeFailed(s) => TlsHandshakeFailed(s.clone()),
        TlsIoError(e) => TlsIoError(std::io::Error::new(e.kind(), e.to_string())),
        ParseError(s) => ParseError(s.clone()),
        HeaderOverflow => HeaderOverflow,
        BodyOverflow => BodyOverflow,
        UnexpectedEof => UnexpectedEof,
        HandlerFailed(s) => HandlerFailed(s.clone()),
        QueueFull => QueueFull,
        TimeoutIdle => TimeoutIdle,
        TimeoutKeepalive => TimeoutKeepalive,
        Io(e) => Io(std::io::Error::new(e.kind(), e.to_string())),
    }
}

/// `spec.md` §4.7's table applied to the client side's own request
/// version and the peer's response `Connection` header.
pub fn connection_close_client(version: Version, connection_header: Option<&str>) -> bool {
    super::server::connection_close(version, connection_header)
}

/// The per-host pool named in `spec.md` §3's engine-scoped per-protocol
/// state and §4.8's `submit` policy. Keyed by connection slot id so the
/// engine's slab remains the single owner of `ClientConnection` values;
/// the pool only orders ids for reuse.
#[derive(Default)]
pub struct HostPool {
    hosts: HashMap<String, VecDeque<usize>>,
}

impl HostPool {
    pub fn new() -> HostPool {
        HostPool { hosts: HashMap::new() }
    }

    /// Rotates `host`'s connection list and returns the first id whose
    /// predicate passes (e.g. "queue length below the cap"), per
    /// `spec.md` §4.8 submission policy 1 ("Rotate the host list to
    /// balance reuse").
    pub fn find_reusable(&mut self, host: &str, mut acceptable: impl FnMut(usize) -> bool) -> Option<usize> {
        let ids = self.hosts.get_mut(host)?;
        let len = ids.len();
        for _ in 0..len {
            let candidate = *ids.front()?;
            ids.rotate_left(1);
            if acceptable(candidate) {
                return Some(candidate);
            }
        }
        None
    }

    pub fn insert(&mut self, host: &str, connection_id: usize) {
        self.hosts.entry(host.to_string()).or_default().push_back(connection_id);
    }

    pub fn remove(&mut self, host: &str, connection_id: usize) {
        if let Some(ids) = self.hosts.get_mut(host) {
            ids.retain(|&id| id != connection_id);
            if ids.is_empty() {
                self.hosts.remove(host);
            }
        }
    }

    pub fn contains(&self, host: &str, connection_id: usize) -> bool {
        self.hosts.get(host).map(|ids| ids.contains(&connection_id)).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_pool_rotates_and_finds() {
        let mut pool = HostPool::new();
        pool.insert("a.example", 1);
        pool.insert("a.example", 2);
        pool.insert("a.example", 3);

        // Only id 3 is "acceptable"; rotation must still find it.
        let found = pool.find_reusable("a.example", |id| id == 3);
        assert_eq!(found, Some(3));
    }

    #[test]
    fn host_pool_remove_drops_empty_host() {
        let mut pool = HostPool::new();
        pool.insert("a.example", 1);
        pool.remove("a.example", 1);
        assert!(!pool.contains("a.example", 1));
    }
}
