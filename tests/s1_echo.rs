//! End-to-end: a plain GET against the echo route comes back 200 with
//! the body the echo handler promises (`spec.md` §8).

mod support;

use std::net::TcpStream;

#[test]
fn echo_route_answers_200_with_expected_body() {
    const PORT: u16 = 18091;

    let config = format!(
        r#"
        io_buffer_size 8192;
        header_buffer_size 8192;

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
    let response = support::send_request(&mut stream, "GET", "/echo?msg=hello", "127.0.0.1", "close");

    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"echo/echo?msg=hello");

    support::stop_engine(shared, handle);
}
