//! Configuration: loads the nested block/statement file named in
//! `spec.md` §6 into the immutable `Config` value named in `spec.md` §3.
//! Unknown keys are fatal at load, per `spec.md` §6.

mod ast;
mod lexer;

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;

use crate::error::Error;
use crate::registry::RoleMask;
use ast::Statement;

/// One `listen { ... }` block: a bound address, port, and which
/// registered protocol/socket-kind handles it.
#[derive(Debug, Clone)]
pub struct ListenEntry {
    pub addr: IpAddr,
    pub port: u16,
    pub proto_kind: String,
    pub tls: bool,
}

/// `threads { role "..."; count N; }` — one group of worker threads
/// sharing a role bitmap.
#[derive(Debug, Clone)]
pub struct ThreadGroup {
    pub roles: Vec<String>,
    pub count: usize,
}

impl ThreadGroup {
    pub fn role_mask(&self, role_bit: impl Fn(&str) -> Option<u32>) -> RoleMask {
        self.roles
            .iter()
            .filter_map(|r| role_bit(r))
            .fold(RoleMask::empty(), |acc, bit| acc | RoleMask::single(bit))
    }
}

#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

/// Engine-wide configuration, loaded once and immutable thereafter.
/// Field-for-field this is the schema named in `spec.md` §3.
#[derive(Debug, Clone)]
pub struct Config {
    pub io_buffer_size: usize,
    pub header_buffer_size: usize,
    pub connection_timeout: Duration,
    pub keepalive_timeout: Duration,
    pub server_connections: usize,
    pub client_connections: usize,
    pub listen: Vec<ListenEntry>,
    pub tls: TlsConfig,
    pub threads: Vec<ThreadGroup>,
    /// Longest-prefix-match routing table: path prefix -> handler kind name.
    pub routes: IndexMap<String, String>,
    /// Client-side request pipelining cap; `0` means unbounded (every
    /// `submit` opens a fresh connection), per `spec.md` §4.8 policy 1.
    pub max_requests_per_connection: usize,
    /// Open Question decision #1 (see `DESIGN.md`): whether a drained
    /// client connection parks in the keepalive pool or always closes.
    pub client_keepalive: bool,
    /// Root directory `FileHandler` serves from, for routes mapped to
    /// the "file" handler kind.
    pub file_root: PathBuf,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            io_buffer_size: 8192,
            header_buffer_size: 8192,
            connection_timeout: Duration::from_secs(30),
            keepalive_timeout: Duration::from_secs(60),
            server_connections: 1024,
            client_connections: 1024,
            listen: Vec::new(),
            tls: TlsConfig::default(),
            threads: Vec::new(),
            routes: IndexMap::new(),
            max_requests_per_connection: 0,
            client_keepalive: true,
            file_root: PathBuf::from("."),
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Config, Error> {
        let text = fs::read_to_string(path.as_ref())
            .map_err(|e| Error::ConfigInvalid(format!("reading {}: {}", path.as_ref().display(), e)))?;
        Config::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Config, Error> {
        let statements = ast::parse(text).map_err(|e| Error::ConfigInvalid(e.to_string()))?;
        build(&statements)
    }

    /// Routes are matched by longest path-prefix; absence of any match
    /// is the caller's cue to answer 404 (`spec.md` §6, handler
    /// registration).
    pub fn route_for<'a>(&'a self, path: &str) -> Option<&'a str> {
        self.routes
            .iter()
            .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, kind)| kind.as_str())
    }
}

fn build(statements: &[Statement]) -> Result<Config, Error> {
    let mut config = Config::default();

    for stmt in statements {
        match stmt.keyword.as_str() {
            "io_buffer_size" => config.io_buffer_size = parse_usize(stmt)?,
            "header_buffer_size" => config.header_buffer_size = parse_usize(stmt)?,
            "connection_timeout" => config.connection_timeout = Duration::from_secs(parse_u64(stmt)?),
            "keepalive_timeout" => config.keepalive_timeout = Duration::from_secs(parse_u64(stmt)?),
            "server_connections" => config.server_connections = parse_usize(stmt)?,
            "client_connections" => config.client_connections = parse_usize(stmt)?,
            "max_requests_per_connection" => config.max_requests_per_connection = parse_usize(stmt)?,
            "client_keepalive" => config.client_keepalive = parse_bool(stmt)?,
            "file_root" => config.file_root = PathBuf::from(single_arg(stmt)?),
            "listen" => config.listen.push(build_listen(stmt)?),
            "tls" => config.tls = build_tls(stmt)?,
            "threads" => config.threads.push(build_threads(stmt)?),
            "route" => config.routes.extend(build_routes(stmt)?),
            other => {
                return Err(Error::ConfigInvalid(format!("unknown configuration key '{}'", other)))
            }
        }
    }

    Ok(config)
}

fn single_arg<'a>(stmt: &'a Statement) -> Result<&'a str, Error> {
    match stmt.args.as_slice() {
        [value] => Ok(value.as_str()),
        _ => Err(Error::ConfigInvalid(format!(
            "'{}' expects exactly one value, got {}",
            stmt.keyword,
            stmt.args.len()
        ))),
    }
}

fn parse_usize(stmt: &Statement) -> Result<usize, Error> {
    single_arg(stmt)?
        .parse()
        .map_err(|_| Error::ConfigInvalid(format!("'{}' expects an integer", stmt.keyword)))
}

fn parse_u64(stmt: &Statement) -> Result<u64, Error> {
    single_arg(stmt)?
        .parse()
        .map_err(|_| Error::ConfigInvalid(format!("'{}' expects an integer", stmt.keyword)))
}

fn parse_bool(stmt: &Statement) -> Result<bool, Error> {
    match single_arg(stmt)? {
        "true" | "yes" | "on" => Ok(true),
        "false" | "no" | "off" => Ok(false),
        other => Err(Error::ConfigInvalid(format!("'{}' expects a boolean, got '{}'", stmt.keyword, other))),
    }
}

fn block_of<'a>(stmt: &'a Statement) -> Result<&'a [Statement], Error> {
    stmt.block
        .as_deref()
        .ok_or_else(|| Error::ConfigInvalid(format!("'{}' expects a {{ ... }} block", stmt.keyword)))
}

fn build_listen(stmt: &Statement) -> Result<ListenEntry, Error> {
    let mut addr: Option<IpAddr> = None;
    let mut port: Option<u16> = None;
    let mut proto_kind = "http".to_string();
    let mut tls = false;

    for field in block_of(stmt)? {
        match field.keyword.as_str() {
            "addr" => {
                addr = Some(
                    single_arg(field)?
                        .parse()
                        .map_err(|_| Error::ConfigInvalid("listen.addr is not a valid IP address".into()))?,
                )
            }
            "port" => port = Some(parse_usize(field)? as u16),
            "proto_kind" => proto_kind = single_arg(field)?.to_string(),
            "tls" => tls = parse_bool(field)?,
            other => return Err(Error::ConfigInvalid(format!("unknown listen key '{}'", other))),
        }
    }

    Ok(ListenEntry {
        addr: addr.ok_or_else(|| Error::ConfigInvalid("listen block missing 'addr'".into()))?,
        port: port.ok_or_else(|| Error::ConfigInvalid("listen block missing 'port'".into()))?,
        proto_kind,
        tls,
    })
}

fn build_tls(stmt: &Statement) -> Result<TlsConfig, Error> {
    let mut tls = TlsConfig::default();

    for field in block_of(stmt)? {
        match field.keyword.as_str() {
            "ca_file" => tls.ca_file = Some(PathBuf::from(single_arg(field)?)),
            "cert_file" => tls.cert_file = Some(PathBuf::from(single_arg(field)?)),
            "key_file" => tls.key_file = Some(PathBuf::from(single_arg(field)?)),
            other => return Err(Error::ConfigInvalid(format!("unknown tls key '{}'", other))),
        }
    }

    Ok(tls)
}

fn build_threads(stmt: &Statement) -> Result<ThreadGroup, Error> {
    let mut roles = Vec::new();
    let mut count = 1usize;

    for field in block_of(stmt)? {
        match field.keyword.as_str() {
            "role" => roles = single_arg(field)?.split(',').map(|s| s.trim().to_string()).collect(),
            "count" => count = parse_usize(field)?,
            other => return Err(Error::ConfigInvalid(format!("unknown threads key '{}'", other))),
        }
    }

    if roles.is_empty() {
        return Err(Error::ConfigInvalid("threads block missing 'role'".into()));
    }

    Ok(ThreadGroup { roles, count })
}

fn build_routes(stmt: &Statement) -> Result<IndexMap<String, String>, Error> {
    let mut routes = IndexMap::new();

    for field in block_of(stmt)? {
        let prefix = field.keyword.clone();
        let kind = single_arg(field)?.to_string();
        routes.insert(prefix, kind);
    }

    Ok(routes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        io_buffer_size 8192;
        header_buffer_size 4096;
        connection_timeout 30;
        keepalive_timeout 60;
        server_connections 1024;
        client_connections 1024;
        max_requests_per_connection 4;

        listen {
            addr "0.0.0.0";
            port 8080;
            proto_kind http;
        }

        threads {
            role "listen, accept, processor, keepalive";
            count 4;
        }

        route {
            "/echo" echo;
            "/" file;
        }
    "#;

    #[test]
    fn parses_a_complete_config() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.io_buffer_size, 8192);
        assert_eq!(config.header_buffer_size, 4096);
        assert_eq!(config.connection_timeout, Duration::from_secs(30));
        assert_eq!(config.max_requests_per_connection, 4);
        assert_eq!(config.listen.len(), 1);
        assert_eq!(config.listen[0].port, 8080);
        assert_eq!(config.threads.len(), 1);
        assert_eq!(config.threads[0].count, 4);
        assert_eq!(config.route_for("/echo?msg=hi"), Some("echo"));
        assert_eq!(config.route_for("/anything"), Some("file"));
    }

    #[test]
    fn unknown_key_is_fatal() {
        let err = Config::parse("bogus_key 1;").unwrap_err();
        match err {
            Error::ConfigInvalid(_) => {}
            other => panic!("expected ConfigInvalid, got {:?}", other),
        }
    }

    #[test]
    fn longest_prefix_wins() {
        let mut config = Config::default();
        config.routes.insert("/".into(), "file".into());
        config.routes.insert("/api/".into(), "api".into());
        assert_eq!(config.route_for("/api/v1/users"), Some("api"));
        assert_eq!(config.route_for("/index.html"), Some("file"));
        assert_eq!(config.route_for("anything"), None);
    }
}
