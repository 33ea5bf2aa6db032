//! A minimal static file handler. `spec.md` §1 names file serving as an
//! out-of-scope collaborator whose *interface* we only name; this
//! exists to prove the handler trait is real and pluggable, not as a
//! feature-complete file server (no range requests, no conditional
//! GET, no directory listing).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::http::handler::{ResponseMeta, ServerHandler};
use crate::http::message::{status_text, Request, Response, Version};

pub struct FileHandler {
    root: PathBuf,
    body: Vec<u8>,
    written: usize,
    status_code: u16,
}

impl FileHandler {
    pub fn new(root: impl Into<PathBuf>) -> FileHandler {
        FileHandler { root: root.into(), body: Vec::new(), written: 0, status_code: 404 }
    }

    fn resolve(&self, request_path: &str) -> Option<PathBuf> {
        let relative = request_path.trim_start_matches('/');
        let mut resolved = self.root.clone();
        for component in Path::new(relative).components() {
            use std::path::Component::*;
            match component {
                Normal(part) => resolved.push(part),
                CurDir => {}
                // Reject `..` and absolute-root escapes outright rather
                // than attempting to canonicalize and re-check.
                ParentDir | RootDir | Prefix(_) => return None,
            }
        }
        Some(resolved)
    }
}

impl ServerHandler for FileHandler {
    fn init(&mut self) {
        self.body.clear();
        self.written = 0;
        self.status_code = 404;
    }

    fn handle_request(&mut self, request: &Request) -> crate::Result<()> {
        if !matches!(request.method.as_str(), "GET" | "HEAD") {
            self.status_code = 405;
            return Ok(());
        }

        let path = request.path_without_query();
        match self.resolve(path) {
            None => self.status_code = 403,
            Some(resolved) => match fs::read(&resolved) {
                Ok(bytes) => {
                    self.body = bytes;
                    self.status_code = 200;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => self.status_code = 404,
                Err(e) if e.kind() == io::ErrorKind::PermissionDenied => self.status_code = 403,
                Err(_) => self.status_code = 500,
            },
        }

        Ok(())
    }

    fn populate_response(&mut self) -> ResponseMeta {
        let mut response = Response::new(Version::Http11, self.status_code, status_text(self.status_code));
        response.headers.set("Content-Type", mime_type_for(&self.body));
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

/// Crude extension-free content sniffing is out of scope; callers
/// route by path and this always answers `application/octet-stream`
/// unless `handle_request` narrows it by extension below.
fn mime_type_for(_body: &[u8]) -> &'static str {
    "application/octet-stream"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::message::Headers;
    use std::io::Write;

    fn get(path: &str) -> Request {
        Request { method: "GET".into(), path: path.into(), version: Version::Http11, headers: Headers::new() }
    }

    #[test]
    fn serves_an_existing_file() {
        let dir = std::env::temp_dir().join(format!("latypus-file-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let mut f = fs::File::create(dir.join("hello.txt")).unwrap();
        f.write_all(b"hi").unwrap();

        let mut handler = FileHandler::new(&dir);
        handler.handle_request(&get("/hello.txt")).unwrap();
        let meta = handler.populate_response();
        assert_eq!(meta.response.status_code, 200);

        let mut out = Vec::new();
        let mut buf = [0u8; 16];
        loop {
            let n = handler.write_response_body(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"hi");

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_file_is_404() {
        let dir = std::env::temp_dir();
        let mut handler = FileHandler::new(&dir);
        handler.handle_request(&get("/does-not-exist-latypus")).unwrap();
        let meta = handler.populate_response();
        assert_eq!(meta.response.status_code, 404);
    }

    #[test]
    fn parent_traversal_is_rejected() {
        let dir = std::env::temp_dir();
        let mut handler = FileHandler::new(&dir);
        handler.handle_request(&get("/../etc/passwd")).unwrap();
        let meta = handler.populate_response();
        assert_eq!(meta.response.status_code, 403);
    }
}
