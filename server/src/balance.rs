//! Minimal backend resolver.
//!
//! spec.md §1 names "resolve backend server for this session" as one of the
//! handful of interfaces the core session engine consumes from an external
//! collaborator and explicitly keeps load-balancing algorithms themselves
//! out of scope. This type is that collaborator's simplest possible
//! implementation — plain round robin over the configured server list — so
//! the session engine can be exercised end to end; it is not meant to stand
//! in for a real scheduler (weighted, least-conn, consistent-hash, ...).

use std::sync::atomic::{AtomicUsize, Ordering};

use rproxy_core::config::ServerDef;

pub struct RoundRobin {
    servers: Vec<ServerDef>,
    next: AtomicUsize,
}

impl RoundRobin {
    pub fn new(servers: Vec<ServerDef>) -> Self {
        Self { servers, next: AtomicUsize::new(0) }
    }

    /// Picks the next up server in rotation. Returns `None` if the pool is
    /// empty; does not consider `weight`/health beyond "the list is
    /// non-empty" since health checking is itself out of scope here.
    pub fn pick(&self) -> Option<&ServerDef> {
        if self.servers.is_empty() {
            return None;
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.servers.len();
        self.servers.get(i)
    }

    pub fn servers(&self) -> &[ServerDef] {
        &self.servers
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::SocketAddr;

    fn server(name: &str) -> ServerDef {
        ServerDef {
            name: name.into(),
            addr: "127.0.0.1:8080".parse::<SocketAddr>().unwrap(),
            weight: 1,
            max_conn: 100,
            conn_retries: 3,
        }
    }

    #[test]
    fn rotates_across_all_servers() {
        let rr = RoundRobin::new(vec![server("a"), server("b"), server("c")]);
        let picks: Vec<_> = (0..6).map(|_| rr.pick().unwrap().name.clone()).collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn empty_pool_yields_none() {
        let rr = RoundRobin::new(vec![]);
        assert!(rr.pick().is_none());
    }
}
