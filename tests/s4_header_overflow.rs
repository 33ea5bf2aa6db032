//! End-to-end: a request whose headers exceed `header_buffer_size`
//! aborts the connection outright — no response, slot returned
//! (`spec.md` §8).

mod support;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

#[test]
fn oversized_headers_close_the_connection_without_a_response() {
    const PORT: u16 = 18094;

    let config = format!(
        r#"
        io_buffer_size 8192;
        header_buffer_size 16;

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

    let mut stream = TcpStream::connect(("127.0.0.1", PORT)).expect("connect to engine");
    stream.set_read_timeout(Some(Duration::from_secs(5))).expect("set read timeout");

    // Far more than the 16-byte header budget in one write, so the
    // overflow is detected on the very first read.
    let oversized = format!(
        "GET /echo?msg={} HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n",
        "x".repeat(200)
    );
    stream.write_all(oversized.as_bytes()).expect("write oversized request");

    let mut buf = [0u8; 64];
    let n = stream.read(&mut buf).expect("read after overflow");
    assert_eq!(n, 0, "server must close without writing any response bytes");

    support::stop_engine(shared, handle);
}
