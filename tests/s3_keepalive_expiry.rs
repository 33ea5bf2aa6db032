//! End-to-end: a server connection sitting idle in `waiting` gets
//! closed once `keepalive_timeout` elapses, and its slot goes back on
//! the free-list (`spec.md` §8).

mod support;

use std::io::Read;
use std::net::TcpStream;
use std::time::Duration;

#[test]
fn idle_keepalive_connection_is_closed_after_timeout() {
    const PORT: u16 = 18093;

    let config = format!(
        r#"
        io_buffer_size 8192;
        header_buffer_size 8192;
        connection_timeout 30;
        keepalive_timeout 1;

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
    let response = support::send_request(&mut stream, "GET", "/echo", "127.0.0.1", "keep-alive");
    assert_eq!(response.status, 200);

    // The connection is now parked in `waiting`. Give the keepalive
    // timeout (1s) plenty of margin to fire before checking for close.
    std::thread::sleep(Duration::from_millis(2500));

    stream.set_read_timeout(Some(Duration::from_secs(5))).expect("set read timeout");
    let mut buf = [0u8; 16];
    let n = stream.read(&mut buf).expect("read after keepalive expiry");
    assert_eq!(n, 0, "server must have closed the idle connection");

    support::stop_engine(shared, handle);
}
