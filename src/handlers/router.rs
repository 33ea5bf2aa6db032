//! Dispatches an accepted connection's requests to the concrete handler
//! named by `spec.md` §6's longest-prefix routing table. One
//! `RouterHandler` is assigned per connection at accept time (the
//! state machine in `crate::http::server` expects a single handler for
//! the connection's lifetime); `handle_request` re-resolves the route
//! on every pipelined request, since two requests on the same
//! connection may hit different routes.

use std::io;
use std::sync::Arc;

use crate::config::Config;
use crate::http::handler::{ResponseMeta, ServerHandler};
use crate::http::message::{status_text, Request, Response, Version};

use super::{EchoHandler, FileHandler};

pub struct RouterHandler {
    config: Arc<Config>,
    current: Box<dyn ServerHandler>,
}

impl RouterHandler {
    pub fn new(config: Arc<Config>) -> RouterHandler {
        RouterHandler { config, current: Box::new(NotFoundHandler::default()) }
    }

    fn route(&self, path: &str) -> Box<dyn ServerHandler> {
        match self.config.route_for(path) {
            Some("echo") => Box::new(EchoHandler::new()),
            Some("file") => Box::new(FileHandler::new(self.config.file_root.clone())),
            _ => Box::new(NotFoundHandler::default()),
        }
    }
}

impl ServerHandler for RouterHandler {
    fn init(&mut self) {
        self.current.init();
    }

    fn handle_request(&mut self, request: &Request) -> crate::Result<()> {
        let mut handler = self.route(request.path_without_query());
        handler.init();
        handler.handle_request(request)?;
        self.current = handler;
        Ok(())
    }

    fn read_request_body(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.current.read_request_body(buf)
    }

    fn populate_response(&mut self) -> ResponseMeta {
        self.current.populate_response()
    }

    fn write_response_body(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.current.write_response_body(buf)
    }

    fn end_request(&mut self) {
        self.current.end_request();
    }
}

/// Answers 404 for any route prefix the configuration doesn't map.
#[derive(Default)]
struct NotFoundHandler;

impl ServerHandler for NotFoundHandler {
    fn handle_request(&mut self, _request: &Request) -> crate::Result<()> {
        Ok(())
    }

    fn populate_response(&mut self) -> ResponseMeta {
        let mut response = Response::new(Version::Http11, 404, status_text(404));
        response.headers.set("Content-Length", "0");
        ResponseMeta { response, response_has_body: false }
    }

    fn write_response_body(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Ok(0)
    }
}
