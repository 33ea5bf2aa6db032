use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};

use native_tls::{HandshakeError, MidHandshakeTlsStream, TlsConnector, TlsAcceptor};

use crate::epoll::{Epoll, EpollOpt, Ready, Source, Token};

use super::tcp::TcpStream;

/// A non-blocking TLS handshake in progress.
///
/// `native_tls` drives the handshake with blocking semantics by default;
/// since the underlying `TcpStream` is always non-blocking, every
/// handshake step can return `WouldBlock` and must be retried once the
/// socket becomes readable or writable again. This mirrors the
/// incremental handshake state the original engine kept per-connection
/// while waiting on the pollset.
pub enum MidHandshake<S> {
    Stream(TlsStream<S>),
    Handshake(MidHandshakeTlsStream<S>),
}

/// An established TLS session layered over an inner transport.
///
/// `TlsStream` wraps `native_tls::TlsStream<S>` and forwards the pollset
/// `Source` interest registration straight to the inner transport, since
/// TLS adds no additional file descriptor.
pub struct TlsStream<S> {
    inner: native_tls::TlsStream<S>,
}

impl<S: Read + Write> TlsStream<S> {
    pub fn get_ref(&self) -> &S {
        self.inner.get_ref()
    }

    pub fn get_mut(&mut self) -> &mut S {
        self.inner.get_mut()
    }
}

impl<S: Read + Write> Read for TlsStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<S: Read + Write> Write for TlsStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Source for TlsStream<TcpStream> {
    fn add(&self, epoll: &Epoll, token: Token, interest: Ready, opts: EpollOpt) -> io::Result<()> {
        self.inner.get_ref().add(epoll, token, interest, opts)
    }

    fn modify(&self, epoll: &Epoll, token: Token, interest: Ready, opts: EpollOpt) -> io::Result<()> {
        self.inner.get_ref().modify(epoll, token, interest, opts)
    }

    fn delete(&self, epoll: &Epoll) -> io::Result<()> {
        self.inner.get_ref().delete(epoll)
    }
}

impl AsRawFd for TlsStream<TcpStream> {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.get_ref().as_raw_fd()
    }
}

/// Begins the client side of a handshake, returning either a completed
/// stream or the in-progress state to resume once the socket is ready
/// again.
pub fn connect(
    connector: &TlsConnector,
    domain: &str,
    stream: TcpStream,
) -> io::Result<MidHandshake<TcpStream>> {
    match connector.connect(domain, stream) {
        Ok(stream) => Ok(MidHandshake::Stream(TlsStream { inner: stream })),
        Err(HandshakeError::WouldBlock(mid)) => Ok(MidHandshake::Handshake(mid)),
        Err(HandshakeError::Failure(e)) => {
            Err(io::Error::new(io::ErrorKind::Other, e))
        }
    }
}

/// Begins the server side of a handshake on an accepted connection.
pub fn accept(acceptor: &TlsAcceptor, stream: TcpStream) -> io::Result<MidHandshake<TcpStream>> {
    match acceptor.accept(stream) {
        Ok(stream) => Ok(MidHandshake::Stream(TlsStream { inner: stream })),
        Err(HandshakeError::WouldBlock(mid)) => Ok(MidHandshake::Handshake(mid)),
        Err(HandshakeError::Failure(e)) => {
            Err(io::Error::new(io::ErrorKind::Other, e))
        }
    }
}

/// Resumes a handshake previously interrupted by `WouldBlock`.
pub fn resume(mid: MidHandshakeTlsStream<TcpStream>) -> io::Result<MidHandshake<TcpStream>> {
    match mid.handshake() {
        Ok(stream) => Ok(MidHandshake::Stream(TlsStream { inner: stream })),
        Err(HandshakeError::WouldBlock(mid)) => Ok(MidHandshake::Handshake(mid)),
        Err(HandshakeError::Failure(e)) => {
            Err(io::Error::new(io::ErrorKind::Other, e))
        }
    }
}
