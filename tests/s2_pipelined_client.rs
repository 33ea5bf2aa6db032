//! End-to-end: three requests submitted for the same host with
//! `max_requests_per_connection = 4` share exactly one TCP connection,
//! answered in submit order (`spec.md` §8).

mod support;

use std::io;
use std::sync::mpsc;

use latypus::engine;
use latypus::http::handler::ClientHandler;
use latypus::http::message::{Headers, Request, Response, Version};

struct CollectingHandler {
    path: String,
    host: String,
    body: Vec<u8>,
    tx: mpsc::Sender<(u16, String)>,
}

impl ClientHandler for CollectingHandler {
    fn populate_request(&mut self) -> Request {
        let mut headers = Headers::new();
        headers.set("Host", self.host.clone());
        headers.set("Connection", "keep-alive");
        Request { method: "GET".into(), path: self.path.clone(), version: Version::Http11, headers }
    }

    fn read_response_body(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.body.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn handle_response(&mut self, response: crate::Result<&Response>) {
        let status = response.map(|r| r.status_code).unwrap_or(0);
        let body = String::from_utf8_lossy(&self.body).into_owned();
        let _ = self.tx.send((status, body));
    }
}

// `ClientHandler::handle_response` is declared against `crate::Result`
// in `latypus::http::handler`; since this file is its own crate root,
// re-export it here so `crate::Result` resolves the same way.
pub use latypus::Result;

#[test]
fn three_requests_share_one_connection() {
    const PORT: u16 = 18092;

    let config = format!(
        r#"
        io_buffer_size 8192;
        header_buffer_size 8192;
        max_requests_per_connection 4;

        listen {{
            addr "127.0.0.1";
            port {port};
            proto_kind http;
        }}

        route {{
            "/echo" echo;
        }}
        "#,
        port = PORT
    );

    let (shared, handle) = support::start_engine(&config);

    let (tx, rx) = mpsc::channel();

    for n in 1..=3 {
        let handler = CollectingHandler {
            path: format!("/echo?n={}", n),
            host: "127.0.0.1".to_string(),
            body: Vec::new(),
            tx: tx.clone(),
        };
        let submitted = engine::submit(&shared, "127.0.0.1".to_string(), PORT, false, Box::new(handler));
        assert!(submitted, "submit must accept the request");
    }

    let mut received = Vec::new();
    for _ in 0..3 {
        let (status, body) = rx.recv_timeout(std::time::Duration::from_secs(5)).expect("a response arrives");
        received.push((status, body));
    }

    assert_eq!(received.len(), 3);
    for (status, _) in &received {
        assert_eq!(*status, 200);
    }
    assert_eq!(received[0].1, "echo/echo?n=1");
    assert_eq!(received[1].1, "echo/echo?n=2");
    assert_eq!(received[2].1, "echo/echo?n=3");

    let occupied = shared.client_slots.iter().filter(|slot| slot.lock().unwrap().is_some()).count();
    assert_eq!(occupied, 1, "all three requests must share a single connection slot");

    support::stop_engine(shared, handle);
}
