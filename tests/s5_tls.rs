//! End-to-end: a client that trusts the server's CA completes a TLS GET
//! with 200 OK; a client pinned to an unrelated CA fails the handshake
//! and the server's slot comes back to the free-list either way
//! (`spec.md` §8 S5).

mod support;

use std::io;
use std::sync::mpsc;
use std::time::Duration;

use latypus::engine;
pub use latypus::Result;
use latypus::http::handler::ClientHandler;
use latypus::http::message::{Headers, Request, Response, Version};

const SERVER_CERT: &str = "tests/fixtures/server.crt";
const SERVER_KEY: &str = "tests/fixtures/server.pkcs8.key";
const RIGHT_CA: &str = "tests/fixtures/ca.crt";
const WRONG_CA: &str = "tests/fixtures/wrong_ca.crt";

struct CollectingHandler {
    body: Vec<u8>,
    tx: mpsc::Sender<Result<(u16, String)>>,
}

impl ClientHandler for CollectingHandler {
    fn populate_request(&mut self) -> Request {
        let mut headers = Headers::new();
        headers.set("Host", "localhost");
        headers.set("Connection", "close");
        Request { method: "GET".into(), path: "/echo?msg=tls".into(), version: Version::Http11, headers }
    }

    fn read_response_body(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.body.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn handle_response(&mut self, response: crate::Result<&Response>) {
        let result = response.map(|r| (r.status_code, String::from_utf8_lossy(&self.body).into_owned()));
        let _ = self.tx.send(result);
    }
}

fn server_config(port: u16) -> String {
    format!(
        r#"
        io_buffer_size 8192;
        header_buffer_size 8192;

        listen {{
            addr "127.0.0.1";
            port {port};
            proto_kind http;
            tls true;
        }}

        tls {{
            cert_file "{cert}";
            key_file "{key}";
        }}

        route {{
            "/echo" echo;
        }}
        "#,
        port = port,
        cert = SERVER_CERT,
        key = SERVER_KEY,
    )
}

#[test]
fn correct_ca_completes_tls_handshake_and_echoes() {
    const PORT: u16 = 18095;

    let client_config = format!(
        r#"
        io_buffer_size 8192;
        header_buffer_size 8192;

        tls {{
            ca_file "{ca}";
        }}
        "#,
        ca = RIGHT_CA,
    );

    let (server_shared, server_handle) = support::start_engine(&server_config(PORT));
    let (client_shared, client_handle) = support::start_engine(&client_config);

    let (tx, rx) = mpsc::channel();
    let handler = CollectingHandler { body: Vec::new(), tx };
    let submitted = engine::submit(&client_shared, "localhost".to_string(), PORT, true, Box::new(handler));
    assert!(submitted, "submit must accept the TLS request");

    let result = rx.recv_timeout(Duration::from_secs(5)).expect("a response arrives");
    let (status, body) = result.expect("handshake succeeds with the matching CA");
    assert_eq!(status, 200);
    assert_eq!(body, "echo/echo?msg=tls");

    support::stop_engine(client_shared, client_handle);
    support::stop_engine(server_shared, server_handle);
}

#[test]
fn wrong_ca_fails_handshake_and_server_slot_returns_to_free_list() {
    const PORT: u16 = 18096;

    let client_config = format!(
        r#"
        io_buffer_size 8192;
        header_buffer_size 8192;

        tls {{
            ca_file "{ca}";
        }}
        "#,
        ca = WRONG_CA,
    );

    let (server_shared, server_handle) = support::start_engine(&server_config(PORT));
    let (client_shared, client_handle) = support::start_engine(&client_config);

    let (tx, rx) = mpsc::channel();
    let handler = CollectingHandler { body: Vec::new(), tx };
    let submitted = engine::submit(&client_shared, "localhost".to_string(), PORT, true, Box::new(handler));
    assert!(submitted, "submit must accept the TLS request");

    let result = rx.recv_timeout(Duration::from_secs(5)).expect("handle_response fires even on failure");
    assert!(result.is_err(), "a client pinned to an unrelated CA must fail the handshake");

    // Give the server a moment to notice the aborted handshake and
    // return its slot.
    std::thread::sleep(Duration::from_millis(200));
    let occupied = server_shared.server_slots.iter().filter(|slot| slot.lock().unwrap().is_some()).count();
    assert_eq!(occupied, 0, "the server's slot must be back on the free-list after the failed handshake");

    support::stop_engine(client_shared, client_handle);
    support::stop_engine(server_shared, server_handle);
}
