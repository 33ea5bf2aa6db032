//! Handler interface (`spec.md` §4.9): the portion of HTTP semantics
//! above the framing layer. The state machine calls only the methods
//! appropriate to its current state; a handler's `*_body` method
//! returning `Ok(0)` signals end-of-body.

use std::io;

use super::message::{Request, Response};

/// Implemented by server-side handlers: "echo", "file", and anything a
/// deployment registers under `spec.md` §6's path-prefix routing table.
pub trait ServerHandler: Send {
    /// Resets per-request scratch state; called once a fresh request
    /// has been routed to this handler instance.
    fn init(&mut self) {}

    /// Inspects the finished request and decides the response's status
    /// line; the handler retains whatever state it needs to serve the
    /// body afterwards.
    fn handle_request(&mut self, request: &Request) -> crate::Result<()>;

    /// Feeds the handler bytes of a request body as they arrive, for
    /// handlers that accept a body (`spec.md` §4.9 `read_request_body`).
    /// The default accepts no body.
    fn read_request_body(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Ok(0)
    }

    /// Fills in the response status/headers the state machine will
    /// serialize; also decides `response.response_has_body` /
    /// `connection_close` via the returned `ResponseMeta`.
    fn populate_response(&mut self) -> ResponseMeta;

    /// Writes up to `buf.len()` bytes of the response body; `Ok(0)`
    /// means the body is complete.
    fn write_response_body(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn end_request(&mut self) {}
}

/// Implemented by client-side handlers driving one outbound request.
pub trait ClientHandler: Send {
    fn init(&mut self) {}

    /// Fills in the request this handler wants sent.
    fn populate_request(&mut self) -> Request;

    /// Writes up to `buf.len()` bytes of the request body; `Ok(0)`
    /// means the body is complete. Default: no request body.
    fn write_request_body(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Ok(0)
    }

    /// Feeds the handler bytes of the response body as they arrive.
    fn read_response_body(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Ok(0)
    }

    /// Called once the full response (head, and body if any) has been
    /// received, or with an error status if the request failed before
    /// a response arrived (`connect_failed`, timeout, etc).
    fn handle_response(&mut self, response: crate::Result<&Response>);

    fn end_request(&mut self) {}
}

/// What a server handler's `populate_response` hands back to the state
/// machine: the response object plus the two flags `spec.md` §3 keeps
/// on the connection slot.
pub struct ResponseMeta {
    pub response: Response,
    pub response_has_body: bool,
}
