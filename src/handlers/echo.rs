//! The canned echo handler: responds to any request with
//! `"echo" + request-path`, used by end-to-end scenario S1
//! (`spec.md` §8) and as the reference implementation a pluggable
//! handler follows. Grounded on
//! `examples/original_source/src/http_server_handler_func.cc`'s
//! `handle_request`/`populate_response`/`write_response_body` split.

use std::io;

use crate::http::handler::{ResponseMeta, ServerHandler};
use crate::http::message::{status_text, Request, Response, Version};

pub struct EchoHandler {
    body: Vec<u8>,
    written: usize,
    method_not_allowed: bool,
}

impl EchoHandler {
    pub fn new() -> EchoHandler {
        EchoHandler { body: Vec::new(), written: 0, method_not_allowed: false }
    }
}

impl Default for EchoHandler {
    fn default() -> EchoHandler {
        EchoHandler::new()
    }
}

impl ServerHandler for EchoHandler {
    fn init(&mut self) {
        self.body.clear();
        self.written = 0;
        self.method_not_allowed = false;
    }

    fn handle_request(&mut self, request: &Request) -> crate::Result<()> {
        self.method_not_allowed = !matches!(request.method.as_str(), "GET" | "HEAD");
        self.body = format!("echo{}", request.path).into_bytes();
        Ok(())
    }

    fn populate_response(&mut self) -> ResponseMeta {
        let status_code = if self.method_not_allowed { 405 } else { 200 };
        let mut response = Response::new(Version::Http11, status_code, status_text(status_code));
        response.headers.set("Content-Type", "text/plain");
        response.headers.set("Content-Length", self.body.len().to_string());

        ResponseMeta { response, response_has_body: true }
    }

    fn write_response_body(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = &self.body[self.written..];
        if remaining.is_empty() {
            return Ok(0);
        }
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.written += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::message::Headers;

    fn get(path: &str) -> Request {
        Request { method: "GET".into(), path: path.into(), version: Version::Http11, headers: Headers::new() }
    }

    #[test]
    fn echoes_request_path_with_expected_length() {
        let mut handler = EchoHandler::new();
        handler.handle_request(&get("/echo?msg=hello")).unwrap();
        let meta = handler.populate_response();

        assert_eq!(meta.response.status_code, 200);
        assert_eq!(meta.response.headers.get("Content-Type"), Some("text/plain"));
        assert_eq!(meta.response.headers.get("Content-Length"), Some("19"));

        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            let n = handler.write_response_body(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"echo/echo?msg=hello");
    }

    #[test]
    fn rejects_unsupported_methods() {
        let mut handler = EchoHandler::new();
        let req = Request { method: "POST".into(), path: "/echo".into(), version: Version::Http11, headers: Headers::new() };
        handler.handle_request(&req).unwrap();
        let meta = handler.populate_response();
        assert_eq!(meta.response.status_code, 405);
    }
}
