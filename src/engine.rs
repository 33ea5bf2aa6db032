//! The protocol engine (`spec.md` §4.5): owns configuration, the
//! thread pool, engine-scoped per-protocol state, and cross-thread
//! routing. `Engine::new` performs the five-step initialization of
//! `spec.md` §4.5; `Engine::run` launches the worker threads and
//! blocks until shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::Config;
use crate::epoll::Token;
use crate::http::client::{ClientConnection, HostPool};
use crate::http::handler::ClientHandler;
use crate::http::server::ServerConnection;
use crate::net::tcp::TcpListener;
use crate::queue::Queue;
use crate::registry::{ProtocolBuilder, RoleMask};
use crate::sys::eventfd::EventFd;
use crate::thread::ProtocolThread;

/// The two connection-slot pools named in `spec.md` §3: "two
/// free-lists (server-side and client-side)".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Server,
    Client,
}

/// A queued cross-thread message: `{action_id, connection_id}` in
/// `spec.md` §4.5, carrying `SlotKind` since the server and client
/// slabs share an index space independently.
pub struct Message {
    pub action: Action,
    pub connection_id: usize,
    pub kind: SlotKind,
}

pub enum Action {
    /// A connection was just accepted (or handed off by the accept
    /// thread) and needs adding to a processor thread's pollset.
    RouteAccepted { listen_proto: String },
    /// `spec.md` §4.8 submission policy 1: the connection's pending
    /// queue was empty and just received a new request.
    ProcessNextRequest,
    /// `spec.md` §4.8 submission policy 2 / "Connect flow": resolve and
    /// non-blocking-connect a fresh connection for the queued request(s)
    /// already stored in its slot.
    ConnectHost { host: String, port: u16, tls: bool },
}

/// Token-space layout: the pollset multiplexes listeners, server
/// slots, and client slots in one `Epoll`, so every registered fd
/// needs a `Token` unambiguous across all three.
#[derive(Debug, Clone, Copy)]
pub struct TokenSpace {
    server_capacity: usize,
    client_capacity: usize,
}

const LISTENER_TAG: usize = 1 << 62;
const CLIENT_TAG: usize = 1 << 61;
pub const WAKER_TOKEN: Token = Token(usize::MAX);

impl TokenSpace {
    pub fn new(server_capacity: usize, client_capacity: usize) -> TokenSpace {
        TokenSpace { server_capacity, client_capacity }
    }

    pub fn server(&self, index: usize) -> Token {
        debug_assert!(index < self.server_capacity);
        Token(index)
    }

    pub fn client(&self, index: usize) -> Token {
        debug_assert!(index < self.client_capacity);
        Token(index | CLIENT_TAG)
    }

    pub fn listener(&self, index: usize) -> Token {
        Token(index | LISTENER_TAG)
    }

    pub fn decode(&self, token: Token) -> TokenKind {
        let raw = token.0;
        if raw & LISTENER_TAG != 0 {
            TokenKind::Listener(raw & !LISTENER_TAG)
        } else if raw & CLIENT_TAG != 0 {
            TokenKind::Client(raw & !CLIENT_TAG)
        } else {
            TokenKind::Server(raw)
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum TokenKind {
    Server(usize),
    Client(usize),
    Listener(usize),
}

/// Engine-scoped per-protocol state (`spec.md` §3): the connection-slot
/// arrays, their free-lists, and the client-side host map, shared by
/// every worker thread behind `Arc`.
pub struct EngineState {
    pub config: Arc<Config>,
    pub tokens: TokenSpace,
    pub server_slots: Vec<Mutex<Option<ServerConnection>>>,
    pub client_slots: Vec<Mutex<Option<ClientConnection>>>,
    pub server_free: Queue<usize>,
    pub client_free: Queue<usize>,
    pub host_pool: Mutex<HostPool>,
    /// Handlers awaiting a connection slot: populated by `submit` for a
    /// fresh host, drained by the connect thread once it builds the
    /// `ClientConnection` and calls `enqueue` on it.
    pub pending_handlers: Mutex<HashMap<usize, Box<dyn ClientHandler>>>,
    pub inboxes: Vec<Queue<Message>>,
    pub wakers: Vec<EventFd>,
    pub roles: Vec<RoleMask>,
    pub role_threads: HashMap<String, Vec<usize>>,
    pub running: AtomicBool,
    next_thread: AtomicUsize,
}

impl EngineState {
    /// `spec.md` §4.5 routing: returns a thread index whose bitmap
    /// satisfies `role_mask`. Round-robins among the candidates.
    /// Flips the running flag and wakes every thread so it observes the
    /// flag on its next loop iteration (`spec.md` §4.5 Shutdown). Usable
    /// from any holder of `Arc<EngineState>`, not just the `Engine`
    /// value itself — a signal-handling thread typically only has the
    /// `Arc<EngineState>` clone, since `Engine::run` consumes `Engine`.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        for waker in &self.wakers {
            let _ = waker.write(1);
        }
    }

    pub fn choose_thread(&self, role_name: &str) -> Option<usize> {
        let candidates = self.role_threads.get(role_name)?;
        if candidates.is_empty() {
            return None;
        }
        let n = self.next_thread.fetch_add(1, Ordering::Relaxed);
        Some(candidates[n % candidates.len()])
    }

    /// `spec.md` §4.5 `send_message`: enqueues into the target's
    /// inbox; a full queue is the caller's cue to abort the connection
    /// (`spec.md` §7 `queue_full`).
    pub fn send_message(&self, thread: usize, msg: Message) -> Result<(), Message> {
        match self.inboxes[thread].try_push_back(msg) {
            Ok(()) => {
                let _ = self.wakers[thread].write(1);
                Ok(())
            }
            Err(msg) => Err(msg),
        }
    }

    pub fn acquire_server_slot(&self) -> Option<usize> {
        self.server_free.pop_front()
    }

    pub fn acquire_client_slot(&self) -> Option<usize> {
        self.client_free.pop_front()
    }

    pub fn release_server_slot(&self, index: usize) {
        *self.server_slots[index].lock().unwrap() = None;
        self.server_free.push_back(index);
    }

    pub fn release_client_slot(&self, index: usize) {
        *self.client_slots[index].lock().unwrap() = None;
        self.client_free.push_back(index);
    }
}

pub struct Engine {
    shared: Arc<EngineState>,
    listeners: Vec<(TcpListener, crate::config::ListenEntry)>,
    threads: Vec<std::thread::JoinHandle<()>>,
}

/// Builds the informational "http" protocol descriptor (`spec.md` §4.4):
/// registered once at startup purely for the name/id tables and debug
/// logging `examples/original_source/src/protocol.cc` shows; dispatch
/// itself is the direct state-machine code in `crate::http`, not a
/// callback indirection through this table.
pub fn describe_http_protocol() -> crate::registry::Protocol<()> {
    let mut builder: ProtocolBuilder<()> = ProtocolBuilder::new(0, "http");

    use crate::registry::SocketFlags;
    builder.register_socket_kind("listen", SocketFlags::TCP_LISTEN);
    builder.register_socket_kind("server_connection", SocketFlags::TCP_CONNECTION);
    builder.register_socket_kind("client_connection", SocketFlags::TCP_CONNECTION);
    builder.register_socket_kind("tls_connection", SocketFlags::TCP_CONNECTION | SocketFlags::TLS);

    builder.register_action("route_accepted", |_| {});
    builder.register_action("process_next_request", |_| {});
    builder.register_action("connect_host", |_| {});

    builder.register_state("server_request", |_| {});
    builder.register_state("server_body", |_| {});
    builder.register_state("client_response", |_| {});
    builder.register_state("client_body", |_| {});
    builder.register_state("waiting", |_| {});

    builder.register_role("listen", RoleMask::single(0));
    builder.register_role("accept", RoleMask::single(1));
    builder.register_role("processor", RoleMask::single(2));
    builder.register_role("keepalive", RoleMask::single(3));
    builder.register_role("connect", RoleMask::single(4));

    builder.build()
}

fn role_bit(name: &str) -> Option<u32> {
    match name {
        "listen" => Some(0),
        "accept" => Some(1),
        "processor" => Some(2),
        "keepalive" => Some(3),
        "connect" => Some(4),
        _ => None,
    }
}

impl Engine {
    /// `spec.md` §4.5 initialization steps 1-4 (step 5, `thread_init`,
    /// happens as each `ProtocolThread` starts its own loop).
    pub fn new(config: Config) -> crate::Result<Engine> {
        let descriptor = describe_http_protocol();
        info!(
            "protocol registered: {} ({} socket kinds, {} actions, {} states, {} roles)",
            descriptor.name, 4, 3, 5, 5
        );

        let server_capacity = config.server_connections.max(1);
        let client_capacity = config.client_connections.max(1);
        let tokens = crate::engine::TokenSpace::new(server_capacity, client_capacity);

        let server_slots = (0..server_capacity).map(|_| Mutex::new(None)).collect();
        let client_slots = (0..client_capacity).map(|_| Mutex::new(None)).collect();

        let server_free = Queue::with_capacity(server_capacity.next_power_of_two().max(2));
        for i in 0..server_capacity {
            server_free.push_back(i);
        }
        let client_free = Queue::with_capacity(client_capacity.next_power_of_two().max(2));
        for i in 0..client_capacity {
            client_free.push_back(i);
        }

        let thread_count: usize = config.threads.iter().map(|g| g.count.max(1)).sum::<usize>().max(1);
        let inboxes = (0..thread_count).map(|_| Queue::with_capacity(1024)).collect();
        let wakers = (0..thread_count)
            .map(|_| EventFd::new().map_err(crate::Error::from))
            .collect::<crate::Result<Vec<_>>>()?;

        let mut role_threads: HashMap<String, Vec<usize>> = HashMap::new();
        let mut roles = Vec::with_capacity(thread_count);
        let mut thread_index = 0usize;
        for group in &config.threads {
            let mask = group.role_mask(role_bit);
            for _ in 0..group.count.max(1) {
                roles.push(mask);
                for role_name in &group.roles {
                    role_threads.entry(role_name.clone()).or_default().push(thread_index);
                }
                thread_index += 1;
            }
        }
        // A configuration with no `threads { }` blocks still needs a
        // single thread that can do everything, so tests and small
        // deployments work without a full role matrix.
        if roles.is_empty() {
            roles.push(RoleMask::single(0) | RoleMask::single(1) | RoleMask::single(2) | RoleMask::single(3) | RoleMask::single(4));
            for name in ["listen", "accept", "processor", "keepalive", "connect"] {
                role_threads.entry(name.to_string()).or_default().push(0);
            }
        }

        let shared = Arc::new(EngineState {
            config: Arc::new(config),
            tokens,
            server_slots,
            client_slots,
            server_free,
            client_free,
            host_pool: Mutex::new(HostPool::new()),
            pending_handlers: Mutex::new(HashMap::new()),
            inboxes,
            wakers,
            roles,
            role_threads,
            running: AtomicBool::new(true),
            next_thread: AtomicUsize::new(0),
        });

        let listeners = Self::bind_listeners(&shared.config)?;

        Ok(Engine { shared, listeners, threads: Vec::new() })
    }

    fn bind_listeners(config: &Config) -> crate::Result<Vec<(TcpListener, crate::config::ListenEntry)>> {
        let mut listeners = Vec::new();
        for entry in &config.listen {
            let listener = TcpListener::bind((entry.addr, entry.port))?;
            info!("listening on {}:{} ({})", entry.addr, entry.port, entry.proto_kind);
            listeners.push((listener, entry.clone()));
        }
        Ok(listeners)
    }

    /// Launches one `ProtocolThread` per configured thread-role group
    /// (`spec.md` §4.5 step 4), assigns each listener to a thread whose
    /// role bitmap includes *listen*, then blocks until every thread
    /// exits (normally only after `shutdown`).
    pub fn run(mut self) -> crate::Result<()> {
        let listeners = std::mem::take(&mut self.listeners);
        let thread_count = self.shared.wakers.len();

        let mut per_thread_listeners: Vec<Vec<(TcpListener, crate::config::ListenEntry)>> =
            (0..thread_count).map(|_| Vec::new()).collect();

        for (listener, entry) in listeners {
            let idx = self.shared.choose_thread("listen").unwrap_or(0);
            per_thread_listeners[idx].push((listener, entry));
        }

        for (index, listeners) in per_thread_listeners.into_iter().enumerate() {
            let shared = self.shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("latypus-worker-{}", index))
                .spawn(move || {
                    match ProtocolThread::new(index, shared, listeners) {
                        Ok(mut thread) => thread.run(),
                        Err(e) => error!("worker {} failed to start: {}", index, e),
                    }
                })
                .map_err(|e| crate::Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;
            self.threads.push(handle);
        }

        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }

        Ok(())
    }

    /// Flips the running flag and wakes every thread so it observes
    /// the flag on its next loop iteration (`spec.md` §4.5 Shutdown).
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }

    pub fn shared(&self) -> Arc<EngineState> {
        self.shared.clone()
    }
}

/// Submits a client request against the engine's host connection pool,
/// following `spec.md` §4.8's two-branch `submit` policy. Returns
/// `false` if no thread could accept the routing message (treated as a
/// transient failure by the caller, per `spec.md` §5).
pub fn submit(shared: &Arc<EngineState>, host: String, port: u16, tls: bool, handler: Box<dyn ClientHandler>) -> bool {
    let max = shared.config.max_requests_per_connection;

    let mut host_pool = shared.host_pool.lock().unwrap();

    if max > 0 {
        if let Some(id) = host_pool.find_reusable(&host, |id| {
            shared.client_slots[id]
                .lock()
                .unwrap()
                .as_ref()
                .map(|c| c.queue_len() < max)
                .unwrap_or(false)
        }) {
            drop(host_pool);
            let mut slot = shared.client_slots[id].lock().unwrap();
            if let Some(conn) = slot.as_mut() {
                let was_empty = conn.enqueue(handler);
                drop(slot);
                if was_empty {
                    if let Some(thread) = shared.choose_thread("processor") {
                        let _ = shared.send_message(
                            thread,
                            Message { action: Action::ProcessNextRequest, connection_id: id, kind: SlotKind::Client },
                        );
                    }
                }
                return true;
            }
        }
    }

    let Some(id) = shared.acquire_client_slot() else {
        return false;
    };
    host_pool.insert(&host, id);
    drop(host_pool);

    // The connect thread constructs `ClientConnection` once the socket
    // is live and calls `enqueue(handler)` on it directly, so the slot
    // stays `None` in the shared table until then.
    shared.pending_handlers.lock().unwrap().insert(id, handler);

    match shared.choose_thread("connect") {
        Some(thread) => shared
            .send_message(thread, Message { action: Action::ConnectHost { host, port, tls }, connection_id: id, kind: SlotKind::Client })
            .is_ok(),
        None => false,
    }
}
