//! Binary-level configuration: how many worker threads, which proxies to
//! run, and how long to wait during a graceful shutdown.
//!
//! Like `rproxy_core::config`, this is a plain struct with no grammar of its
//! own (spec.md §1 names configuration parsing as an external collaborator).

use std::time::Duration;

use rproxy_core::config::ProxyConfig;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub worker_threads: usize,
    pub proxies: Vec<ProxyConfig>,
    pub shutdown_timeout: Duration,
    pub event_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            worker_threads: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            proxies: Vec::new(),
            shutdown_timeout: Duration::from_secs(30),
            event_capacity: 1024,
        }
    }
}
