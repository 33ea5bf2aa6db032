//! HTTP/1.x connection state machines (`spec.md` §4.7, §4.8) hosted by
//! the protocol engine. This module owns the wire framing (header
//! buffer, body transfer, keepalive reuse) above the socket layer in
//! `crate::net` and below the handler trait in `handler`.

pub mod client;
pub mod handler;
pub mod message;
pub mod parser;
pub mod server;

use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;

use native_tls::{TlsAcceptor, TlsConnector};

use crate::epoll::{Epoll, EpollOpt, Ready, Source, Token};
use crate::net::tcp::TcpStream;
use crate::net::tls::{self, MidHandshake, TlsStream};

/// The result of one non-blocking read or write, matching the
/// `{bytes, status}` shape `spec.md` §4.3 names.
pub enum IoOutcome {
    Done(usize),
    WouldBlock,
    Eof,
    Error(io::Error),
}

/// A connection's transport: a plain TCP stream, or a TLS session that
/// may still be mid-handshake. `spec.md` §4.3: "TLS variants expose the
/// same surface; the handshake is transparent to callers" — `Socket`
/// is that surface; `direction_of_interest` is the one place a caller
/// must branch to re-arm the pollset correctly during a handshake.
pub enum Socket {
    Plain(TcpStream),
    Tls(MidHandshake<TcpStream>),
}

impl Socket {
    pub fn is_handshaking(&self) -> bool {
        matches!(self, Socket::Tls(MidHandshake::Handshake(_)))
    }

    /// Drives a TLS handshake one step further, consuming `self` and
    /// returning the advanced socket. A no-op for plain sockets and
    /// already-established TLS sessions.
    pub fn resume_handshake(self) -> crate::Result<Socket> {
        match self {
            Socket::Tls(MidHandshake::Handshake(mid)) => tls::resume(mid)
                .map(Socket::Tls)
                .map_err(|e| crate::Error::TlsHandshakeFailed(e.to_string())),
            other => Ok(other),
        }
    }

    pub fn read(&mut self, buf: &mut [u8]) -> IoOutcome {
        let result = match self {
            Socket::Plain(s) => s.read(buf),
            Socket::Tls(MidHandshake::Stream(s)) => s.read(buf),
            Socket::Tls(MidHandshake::Handshake(_)) => return IoOutcome::WouldBlock,
        };
        classify(result)
    }

    pub fn write(&mut self, buf: &[u8]) -> IoOutcome {
        let result = match self {
            Socket::Plain(s) => s.write(buf),
            Socket::Tls(MidHandshake::Stream(s)) => s.write(buf),
            Socket::Tls(MidHandshake::Handshake(_)) => return IoOutcome::WouldBlock,
        };
        classify(result)
    }

    pub fn register(&self, epoll: &Epoll, token: Token, interest: Ready, opts: EpollOpt) -> io::Result<()> {
        match self {
            Socket::Plain(s) => s.add(epoll, token, interest, opts),
            Socket::Tls(MidHandshake::Stream(s)) => s.add(epoll, token, interest, opts),
            Socket::Tls(MidHandshake::Handshake(mid)) => mid.get_ref().add(epoll, token, interest, opts),
        }
    }

    pub fn reregister(&self, epoll: &Epoll, token: Token, interest: Ready, opts: EpollOpt) -> io::Result<()> {
        match self {
            Socket::Plain(s) => s.modify(epoll, token, interest, opts),
            Socket::Tls(MidHandshake::Stream(s)) => s.modify(epoll, token, interest, opts),
            Socket::Tls(MidHandshake::Handshake(mid)) => mid.get_ref().modify(epoll, token, interest, opts),
        }
    }

    pub fn deregister(&self, epoll: &Epoll) -> io::Result<()> {
        match self {
            Socket::Plain(s) => s.delete(epoll),
            Socket::Tls(MidHandshake::Stream(s)) => s.delete(epoll),
            Socket::Tls(MidHandshake::Handshake(mid)) => mid.get_ref().delete(epoll),
        }
    }

    pub fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        match self {
            Socket::Plain(s) => s.as_raw_fd(),
            Socket::Tls(MidHandshake::Stream(s)) => s.as_raw_fd(),
            Socket::Tls(MidHandshake::Handshake(mid)) => mid.get_ref().as_raw_fd(),
        }
    }
}

fn classify(result: io::Result<usize>) -> IoOutcome {
    match result {
        Ok(0) => IoOutcome::Eof,
        Ok(n) => IoOutcome::Done(n),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => IoOutcome::WouldBlock,
        Err(e) => IoOutcome::Error(e),
    }
}

/// Begins the server side of a TLS handshake over an accepted
/// connection.
pub fn tls_accept(acceptor: &TlsAcceptor, stream: TcpStream) -> crate::Result<Socket> {
    tls::accept(acceptor, stream)
        .map(Socket::Tls)
        .map_err(|e| crate::Error::TlsHandshakeFailed(e.to_string()))
}

/// Begins the client side of a TLS handshake against `domain`.
pub fn tls_connect(connector: &TlsConnector, domain: &str, stream: TcpStream) -> crate::Result<Socket> {
    tls::connect(connector, domain, stream)
        .map(Socket::Tls)
        .map_err(|e| crate::Error::TlsHandshakeFailed(e.to_string()))
}

/// `Date` header value for server responses (`spec.md` §6).
pub fn http_date() -> String {
    httpdate_rfc7231(std::time::SystemTime::now())
}

/// Minimal RFC 7231 `Date` formatting (IMF-fixdate), with no external
/// date-formatting crate in the retrieved corpus to reach for.
fn httpdate_rfc7231(time: std::time::SystemTime) -> String {
    const DAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
    const MONTHS: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];

    let secs = time
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let days_since_epoch = secs / 86400;
    let time_of_day = secs % 86400;
    let (hour, minute, second) = (time_of_day / 3600, (time_of_day / 60) % 60, time_of_day % 60);
    // 1970-01-01 was a Thursday.
    let weekday = DAYS[((days_since_epoch + 4) % 7) as usize];

    let (year, month, day) = civil_from_days(days_since_epoch as i64);

    format!(
        "{}, {:02} {} {} {:02}:{:02}:{:02} GMT",
        weekday, day, MONTHS[(month - 1) as usize], year, hour, minute, second
    )
}

/// Howard Hinnant's days-from-civil algorithm, inverted: converts a
/// day count since the Unix epoch into `(year, month, day)`.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let y = if m <= 2 { y + 1 } else { y };
    (y, m, d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_known_epoch_date() {
        // 2021-01-01T00:00:00Z
        let t = std::time::UNIX_EPOCH + std::time::Duration::from_secs(1609459200);
        assert_eq!(httpdate_rfc7231(t), "Fri, 01 Jan 2021 00:00:00 GMT");
    }
}
