//! Shared scaffolding for the end-to-end tests: spin up a real `Engine`
//! over a loopback port, talk to it with a plain blocking `TcpStream`,
//! and tear it down again. Each test picks its own fixed port to avoid
//! collisions between the handful of tests in this suite.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use latypus::config::Config;
use latypus::engine::{Engine, EngineState};

pub fn start_engine(config_text: &str) -> (Arc<EngineState>, JoinHandle<()>) {
    let config = Config::parse(config_text).expect("test config parses");
    let engine = Engine::new(config).expect("engine binds its listeners");
    let shared = engine.shared();

    let handle = thread::spawn(move || {
        engine.run().expect("engine runs to completion");
    });

    // Give the worker thread a moment to reach its epoll loop before the
    // test starts dialing in.
    thread::sleep(Duration::from_millis(50));

    (shared, handle)
}

pub fn stop_engine(shared: Arc<EngineState>, handle: JoinHandle<()>) {
    shared.shutdown();
    handle.join().expect("worker thread joins after shutdown");
}

pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Sends a bare HTTP/1.1 request over `stream` and parses back the
/// status line, headers, and a `Content-Length`-bounded body. Not a
/// general-purpose client: no chunked decoding, since nothing in this
/// suite exercises a chunked response.
pub fn send_request(stream: &mut TcpStream, method: &str, path: &str, host: &str, connection: &str) -> HttpResponse {
    let request = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\nConnection: {}\r\n\r\n",
        method, path, host, connection
    );
    stream.write_all(request.as_bytes()).expect("write request");
    read_response(stream)
}

pub fn read_response(stream: &mut TcpStream) -> HttpResponse {
    stream.set_read_timeout(Some(Duration::from_secs(5))).expect("set read timeout");

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
        let n = stream.read(&mut chunk).expect("read response head");
        assert!(n > 0, "connection closed before a full response head arrived");
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut lines = head.split("\r\n");
    let status_line = lines.next().expect("status line");
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .expect("status code")
        .parse()
        .expect("status code is numeric");

    let mut content_length = 0usize;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }

    let mut body = buf[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).expect("read response body");
        assert!(n > 0, "connection closed before the full body arrived");
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    HttpResponse { status, body }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}
