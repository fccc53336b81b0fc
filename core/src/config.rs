//! External configuration surface.
//!
//! Plain structs with `Default` impls and no grammar/parser of their own —
//! loading these from a config file or CLI flags is out of scope (spec.md's
//! Non-goals); something above this crate is expected to populate them.

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub connect_ms: u64,
    pub client_ms: u64,
    pub server_ms: u64,
    pub queue_ms: u64,
    pub tarpit_ms: u64,
    pub http_request_ms: u64,
    pub http_keep_alive_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect_ms: 5_000,
            client_ms: 30_000,
            server_ms: 30_000,
            queue_ms: 30_000,
            tarpit_ms: 0,
            http_request_ms: 10_000,
            http_keep_alive_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TuneParams {
    pub buf_size: usize,
    pub buf_reserve: usize,
    pub max_rewrite: usize,
    pub peer_event_capacity: usize,
}

impl Default for TuneParams {
    fn default() -> Self {
        Self { buf_size: 16 * 1024, buf_reserve: 1024, max_rewrite: 1024, peer_event_capacity: 256 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceAlgo {
    RoundRobin,
    LeastConn,
    Source,
}

#[derive(Debug, Clone)]
pub struct ServerDef {
    pub name: String,
    pub addr: std::net::SocketAddr,
    pub weight: u32,
    pub max_conn: u32,
    pub conn_retries: u32,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub name: String,
    pub bind: std::net::SocketAddr,
    pub mode_tcp: bool,
    pub timeouts: Timeouts,
    pub balance: BalanceAlgo,
    pub servers: Vec<ServerDef>,
    pub stats_uri: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct StickTableDef {
    pub name: String,
    pub size: usize,
    pub expire_ms: u64,
}

#[derive(Debug, Clone)]
pub struct PeerDef {
    pub name: String,
    pub addr: std::net::SocketAddr,
    pub is_local: bool,
}
