//! The protocol thread (`spec.md` §4.6): one cooperative event loop per
//! worker thread, owned exclusively by that thread once spawned. No
//! connection is ever touched from two threads at once; cross-thread
//! handoff happens only through `crate::engine::Message`.

use std::collections::HashSet;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use native_tls::{Certificate, Identity, TlsAcceptor, TlsConnector};

use crate::config::{Config, ListenEntry};
use crate::engine::{Action, EngineState, Message, SlotKind, TokenKind, WAKER_TOKEN};
use crate::epoll::{Epoll, EpollOpt, Events, Ready, Source};
use crate::handlers::RouterHandler;
use crate::http::client::ClientConnection;
use crate::http::server::{self, ServerConnection, StepOutcome as ServerStep};
use crate::http::client::StepOutcome as ClientStep;
use crate::http::Socket;
use crate::net::tcp::{TcpListener, TcpStream};
use crate::timer::{Timer, TimeoutKind};

const MAX_EVENTS: usize = 256;

pub struct ProtocolThread {
    index: usize,
    shared: Arc<EngineState>,
    epoll: Epoll,
    events: Events,
    listeners: Vec<(TcpListener, ListenEntry)>,
    server_timer: Timer,
    client_timer: Timer,
    owned_server: HashSet<usize>,
    owned_client: HashSet<usize>,
    tls_acceptor: Option<Arc<TlsAcceptor>>,
    tls_connector: Arc<TlsConnector>,
}

impl ProtocolThread {
    pub fn new(
        index: usize,
        shared: Arc<EngineState>,
        listeners: Vec<(TcpListener, ListenEntry)>,
    ) -> crate::Result<ProtocolThread> {
        let epoll = Epoll::new()?;

        epoll.add(&shared.wakers[index], WAKER_TOKEN, Ready::readable(), EpollOpt::edge())?;

        for (idx, (listener, _entry)) in listeners.iter().enumerate() {
            epoll.add(listener, shared.tokens.listener(idx), Ready::readable(), EpollOpt::edge())?;
        }

        let tls_acceptor = build_tls_acceptor(&shared.config)?;
        let tls_connector = Arc::new(build_tls_connector(&shared.config)?);

        Ok(ProtocolThread {
            index,
            shared,
            epoll,
            events: Events::with_capacity(MAX_EVENTS),
            listeners,
            server_timer: Timer::new(),
            client_timer: Timer::new(),
            owned_server: HashSet::new(),
            owned_client: HashSet::new(),
            tls_acceptor,
            tls_connector,
        })
    }

    /// The loop body of `spec.md` §4.6: compute the next wakeup, block
    /// on the pollset, dispatch readiness, drain the inbox, sweep
    /// expired deadlines. Runs until `EngineState::running` is cleared.
    pub fn run(&mut self) {
        info!("worker {} started ({} listener(s))", self.index, self.listeners.len());

        while self.shared.running.load(std::sync::atomic::Ordering::SeqCst) {
            let timeout = self.next_wakeup();

            match self.epoll.wait(&mut self.events, timeout) {
                Ok(_) => {}
                Err(e) => {
                    error!("worker {}: epoll wait failed: {}", self.index, e);
                    continue;
                }
            }

            let ready: Vec<_> = self.events.iter().collect();
            for event in ready {
                self.dispatch(event.token(), event.readiness());
            }

            self.drain_inbox();
            self.sweep_timeouts();
        }

        info!("worker {} stopped", self.index);
    }

    fn next_wakeup(&self) -> Option<Duration> {
        let candidates = [self.server_timer.next_deadline(), self.client_timer.next_deadline()];
        candidates.into_iter().flatten().min().or(Some(Duration::from_secs(1)))
    }

    fn dispatch(&mut self, token: crate::epoll::Token, readiness: Ready) {
        match self.shared.tokens.decode(token) {
            TokenKind::Listener(idx) => self.accept_all(idx),
            TokenKind::Server(id) => self.step_server(id, readiness),
            TokenKind::Client(id) => self.step_client(id, readiness),
        }
    }

    fn accept_all(&mut self, listener_idx: usize) {
        loop {
            let (stream, entry) = {
                let (listener, entry) = &self.listeners[listener_idx];
                match listener.accept() {
                    Ok((stream, _addr)) => (stream, entry.clone()),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                    Err(e) => {
                        warn!("worker {}: accept failed: {}", self.index, e);
                        return;
                    }
                }
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!("worker {}: set_nodelay failed: {}", self.index, e);
            }

            let socket = if entry.tls {
                match self.tls_acceptor.as_ref() {
                    Some(acceptor) => match crate::http::tls_accept(acceptor, stream) {
                        Ok(socket) => socket,
                        Err(e) => {
                            warn!("worker {}: tls accept failed: {}", self.index, e);
                            continue;
                        }
                    },
                    None => {
                        warn!("worker {}: listener {} wants tls but no certificate is configured", self.index, listener_idx);
                        continue;
                    }
                }
            } else {
                Socket::Plain(stream)
            };

            let Some(id) = self.shared.acquire_server_slot() else {
                warn!("worker {}: server connection slots exhausted", self.index);
                continue;
            };

            let mut connection = ServerConnection::new(socket, self.shared.config.io_buffer_size, self.shared.config.header_buffer_size);
            connection.handler = Some(Box::new(RouterHandler::new(self.shared.config.clone())));

            // A TLS handshake can block on either direction regardless
            // of which one just completed (`spec.md` §9: "expose the
            // direction-of-interest after every TLS op... do not assume
            // readable alone suffices"); arm both until it settles.
            let initial_interest = if connection.socket.as_ref().unwrap().is_handshaking() {
                Ready::readable() | Ready::writable()
            } else {
                Ready::readable()
            };

            if let Err(e) = connection.socket.as_ref().unwrap().register(
                &self.epoll,
                self.shared.tokens.server(id),
                initial_interest,
                EpollOpt::edge(),
            ) {
                warn!("worker {}: registering accepted connection failed: {}", self.index, e);
                self.shared.release_server_slot(id);
                continue;
            }

            *self.shared.server_slots[id].lock().unwrap() = Some(connection);
            self.owned_server.insert(id);
            self.server_timer.insert(id, self.shared.config.connection_timeout, TimeoutKind::ConnectionTimeout);
        }
    }

    fn step_server(&mut self, id: usize, readiness: Ready) {
        if readiness.is_hup() || readiness.is_error() {
            self.close_server(id, None);
            return;
        }

        let mut slot = self.shared.server_slots[id].lock().unwrap();
        let Some(conn) = slot.as_mut() else { return };

        if conn.state == server::ServerState::Waiting {
            conn.wake_for_pipelined_request();
        }

        match conn.step() {
            ServerStep::Continue { interest } => {
                let socket = conn.socket.as_ref().unwrap();
                let _ = socket.reregister(&self.epoll, self.shared.tokens.server(id), interest, EpollOpt::edge());
                self.server_timer.insert(id, self.shared.config.connection_timeout, TimeoutKind::ConnectionTimeout);
            }
            ServerStep::Idle => {
                self.server_timer.insert(id, self.shared.config.keepalive_timeout, TimeoutKind::KeepaliveTimeout);
            }
            ServerStep::Close => {
                drop(slot);
                self.close_server(id, None);
            }
            ServerStep::Abort(e) => {
                drop(slot);
                self.close_server(id, Some(e));
            }
        }
    }

    fn close_server(&mut self, id: usize, err: Option<crate::Error>) {
        if let Some(e) = err {
            debug!("worker {}: server connection {} closed: {}", self.index, id, e);
        }
        if let Some(conn) = self.shared.server_slots[id].lock().unwrap().as_ref() {
            let _ = conn.socket.as_ref().unwrap().deregister(&self.epoll);
        }
        self.owned_server.remove(&id);
        self.server_timer.remove(id);
        self.shared.release_server_slot(id);
    }

    fn step_client(&mut self, id: usize, readiness: Ready) {
        if readiness.is_hup() || readiness.is_error() {
            self.close_client(id, crate::Error::UnexpectedEof);
            return;
        }

        let mut slot = self.shared.client_slots[id].lock().unwrap();
        let Some(conn) = slot.as_mut() else { return };

        match conn.step() {
            ClientStep::Continue { interest } => {
                let socket = conn.socket.as_ref().unwrap();
                let _ = socket.reregister(&self.epoll, self.shared.tokens.client(id), interest, EpollOpt::edge());
                self.client_timer.insert(id, self.shared.config.connection_timeout, TimeoutKind::ConnectionTimeout);
            }
            ClientStep::Idle => {
                if self.shared.config.client_keepalive {
                    self.client_timer.insert(id, self.shared.config.keepalive_timeout, TimeoutKind::KeepaliveTimeout);
                } else {
                    drop(slot);
                    self.close_client(id, crate::Error::TimeoutKeepalive);
                }
            }
            ClientStep::Abort(e) => {
                drop(slot);
                self.close_client(id, e);
            }
        }
    }

    fn close_client(&mut self, id: usize, err: crate::Error) {
        debug!("worker {}: client connection {} closed: {}", self.index, id, err);
        let mut slot = self.shared.client_slots[id].lock().unwrap();
        if let Some(conn) = slot.as_mut() {
            let _ = conn.socket.as_ref().unwrap().deregister(&self.epoll);
            conn.fail_all_pending(clone_for_pending(&err));
            let mut host_pool = self.shared.host_pool.lock().unwrap();
            host_pool.remove(&conn.remote_host, id);
        }
        *slot = None;
        drop(slot);
        self.owned_client.remove(&id);
        self.client_timer.remove(id);
        self.shared.release_client_slot(id);
    }

    fn drain_inbox(&mut self) {
        let _ = self.shared.wakers[self.index].read();

        while let Some(msg) = self.shared.inboxes[self.index].pop_front() {
            self.handle_message(msg);
        }
    }

    fn handle_message(&mut self, msg: Message) {
        match msg.action {
            Action::RouteAccepted { listen_proto } => {
                debug!("worker {}: route_accepted ({}) for slot {}", self.index, listen_proto, msg.connection_id);
            }
            Action::ProcessNextRequest => {
                if msg.kind == SlotKind::Client {
                    self.step_client(msg.connection_id, Ready::writable());
                }
            }
            Action::ConnectHost { host, port, tls } => self.connect_host(msg.connection_id, host, port, tls),
        }
    }

    fn connect_host(&mut self, id: usize, host: String, port: u16, tls: bool) {
        let handler = self.shared.pending_handlers.lock().unwrap().remove(&id);
        let Some(mut handler) = handler else {
            warn!("worker {}: connect_host for slot {} with no pending handler", self.index, id);
            self.shared.release_client_slot(id);
            return;
        };

        let stream = match TcpStream::connect((host.as_str(), port)) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("worker {}: connect to {}:{} failed: {}", self.index, host, port, e);
                handler.handle_response(Err(crate::Error::ConnectFailed(e)));
                let mut host_pool = self.shared.host_pool.lock().unwrap();
                host_pool.remove(&host, id);
                self.shared.release_client_slot(id);
                return;
            }
        };

        let socket = if tls {
            match crate::http::tls_connect(&self.tls_connector, &host, stream) {
                Ok(socket) => socket,
                Err(e) => {
                    warn!("worker {}: tls connect to {} failed: {}", self.index, host, e);
                    handler.handle_response(Err(e));
                    let mut host_pool = self.shared.host_pool.lock().unwrap();
                    host_pool.remove(&host, id);
                    self.shared.release_client_slot(id);
                    return;
                }
            }
        } else {
            Socket::Plain(stream)
        };

        let mut connection = ClientConnection::new(socket, host, self.shared.config.io_buffer_size, self.shared.config.header_buffer_size);
        connection.enqueue(handler);

        let initial_interest = if connection.socket.as_ref().unwrap().is_handshaking() {
            Ready::readable() | Ready::writable()
        } else {
            Ready::writable()
        };

        if let Err(e) = connection.socket.as_ref().unwrap().register(
            &self.epoll,
            self.shared.tokens.client(id),
            initial_interest,
            EpollOpt::edge(),
        ) {
            warn!("worker {}: registering new client connection failed: {}", self.index, e);
            connection.fail_all_pending(crate::Error::Io(e));
            self.shared.release_client_slot(id);
            return;
        }

        *self.shared.client_slots[id].lock().unwrap() = Some(connection);
        self.owned_client.insert(id);
        self.client_timer.insert(id, self.shared.config.connection_timeout, TimeoutKind::ConnectionTimeout);
    }

    fn sweep_timeouts(&mut self) {
        while let Some((id, kind)) = self.server_timer.pop_expired() {
            if self.owned_server.contains(&id) {
                let err = match kind {
                    TimeoutKind::ConnectionTimeout => crate::Error::TimeoutIdle,
                    TimeoutKind::KeepaliveTimeout => crate::Error::TimeoutKeepalive,
                };
                self.close_server(id, Some(err));
            }
        }

        while let Some((id, kind)) = self.client_timer.pop_expired() {
            if self.owned_client.contains(&id) {
                let err = match kind {
                    TimeoutKind::ConnectionTimeout => crate::Error::TimeoutIdle,
                    TimeoutKind::KeepaliveTimeout => crate::Error::TimeoutKeepalive,
                };
                self.close_client(id, err);
            }
        }
    }
}

fn clone_for_pending(err: &crate::Error) -> crate::Error {
    match err {
        crate::Error::Io(e) => crate::Error::Io(std::io::Error::new(e.kind(), e.to_string())),
        crate::Error::TimeoutIdle => crate::Error::TimeoutIdle,
        crate::Error::TimeoutKeepalive => crate::Error::TimeoutKeepalive,
        crate::Error::UnexpectedEof => crate::Error::UnexpectedEof,
        other => crate::Error::HandlerFailed(other.to_string()),
    }
}

/// Builds the client-side connector, trusting the configured
/// `tls.ca_file` in addition to the platform's usual root store
/// (`spec.md` §6: "uses configured CA file for client verification").
/// With no `ca_file` set, this is just the platform default — same as
/// `TlsConnector::new()`.
fn build_tls_connector(config: &Config) -> crate::Result<TlsConnector> {
    let mut builder = TlsConnector::builder();

    if let Some(ca_path) = &config.tls.ca_file {
        let pem = fs::read(ca_path)?;
        let cert = Certificate::from_pem(&pem)
            .map_err(|e| crate::Error::TlsHandshakeFailed(e.to_string()))?;
        builder.add_root_certificate(cert);
    }

    builder.build().map_err(|e| crate::Error::TlsHandshakeFailed(e.to_string()))
}

fn build_tls_acceptor(config: &Config) -> crate::Result<Option<Arc<TlsAcceptor>>> {
    let (Some(cert_path), Some(key_path)) = (&config.tls.cert_file, &config.tls.key_file) else {
        return Ok(None);
    };

    let cert_pem = fs::read(cert_path)?;
    let key_pem = fs::read(key_path)?;
    let identity = Identity::from_pkcs8(&cert_pem, &key_pem)
        .map_err(|e| crate::Error::TlsHandshakeFailed(e.to_string()))?;
    let acceptor = TlsAcceptor::new(identity).map_err(|e| crate::Error::TlsHandshakeFailed(e.to_string()))?;

    Ok(Some(Arc::new(acceptor)))
}
