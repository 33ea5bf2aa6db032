use std::fmt;
use std::io;

/// Every error kind the core distinguishes, one variant per bullet of
/// the error-handling design.
///
/// Propagation policy: I/O and parse errors are handled locally by the
/// thread that owns the affected connection. The thread removes the fd
/// from its pollset, closes the socket, resets the slot and pushes it
/// back to the free-list; nothing propagates to another thread except
/// via that slot return.
#[derive(Debug)]
pub enum Error {
    /// Configuration failed to load or referenced an unknown key.
    ConfigInvalid(String),
    /// DNS resolution of a client target failed.
    ResolveFailed(io::Error),
    /// A non-blocking `connect` did not complete successfully.
    ConnectFailed(io::Error),
    /// TLS handshake did not complete.
    TlsHandshakeFailed(String),
    /// An I/O error occurred on an established TLS session.
    TlsIoError(io::Error),
    /// The HTTP/1.x grammar parser rejected the input.
    ParseError(String),
    /// Header buffer exhausted before the parser finished.
    HeaderOverflow,
    /// I/O buffer exhausted before the body finished transferring.
    BodyOverflow,
    /// The peer closed the connection before the parser reached
    /// `finished`.
    UnexpectedEof,
    /// A registered handler returned an error.
    HandlerFailed(String),
    /// A message send found the target thread's inbox full.
    QueueFull,
    /// `connection_timeout` expired mid-exchange.
    TimeoutIdle,
    /// `keepalive_timeout` expired while parked in `waiting`.
    TimeoutKeepalive,
    /// Any other I/O failure not covered above.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ConfigInvalid(msg) => write!(f, "invalid configuration: {}", msg),
            Error::ResolveFailed(e) => write!(f, "resolve failed: {}", e),
            Error::ConnectFailed(e) => write!(f, "connect failed: {}", e),
            Error::TlsHandshakeFailed(msg) => write!(f, "tls handshake failed: {}", msg),
            Error::TlsIoError(e) => write!(f, "tls io error: {}", e),
            Error::ParseError(msg) => write!(f, "parse error: {}", msg),
            Error::HeaderOverflow => write!(f, "header buffer overflow"),
            Error::BodyOverflow => write!(f, "body buffer overflow"),
            Error::UnexpectedEof => write!(f, "unexpected eof before parser finished"),
            Error::HandlerFailed(msg) => write!(f, "handler failed: {}", msg),
            Error::QueueFull => write!(f, "message queue full"),
            Error::TimeoutIdle => write!(f, "connection timed out"),
            Error::TimeoutKeepalive => write!(f, "keepalive timed out"),
            Error::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::ResolveFailed(e) | Error::ConnectFailed(e) | Error::TlsIoError(e) | Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Io(e)
    }
}

/// True for the error kinds that close a connection gracefully rather
/// than treating it as aborted — currently only a clean `timeout_keepalive`
/// expiry of an idle, reusable connection.
pub fn is_graceful_close(err: &Error) -> bool {
    matches!(err, Error::TimeoutKeepalive)
}

pub type Result<T> = std::result::Result<T, Error>;
