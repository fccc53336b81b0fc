//! Builds and runs the worker thread pool.
//!
//! A much-reduced relative of `xitca-server::Builder`: that builder
//! accumulates named listeners and `tokio`-async service factories across a
//! fluent chain. This one accumulates `ProxyConfig`s (spec.md §6's
//! configuration surface) and spawns one OS thread per proxy per worker
//! count, each running its own `Worker` event loop — no shared runtime, no
//! async factories, since the session engine beneath it is synchronous and
//! cooperative.

use std::io;
use std::thread::{self, JoinHandle};

use tracing::{error, info};

use rproxy_core::config::ProxyConfig;

use crate::config::ServerConfig;
use crate::signals::ShutdownSignal;
use crate::worker::Worker;

pub struct Builder {
    config: ServerConfig,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self { config: ServerConfig::default() }
    }

    pub fn worker_threads(mut self, num: usize) -> Self {
        assert_ne!(num, 0, "there must be at least one worker thread");
        self.config.worker_threads = num;
        self
    }

    pub fn shutdown_timeout_secs(mut self, secs: u64) -> Self {
        self.config.shutdown_timeout = std::time::Duration::from_secs(secs);
        self
    }

    pub fn proxy(mut self, proxy: ProxyConfig) -> Self {
        self.config.proxies.push(proxy);
        self
    }

    /// Spawns `worker_threads` OS threads per configured proxy and blocks
    /// the calling thread until every worker observes the installed
    /// shutdown signal and drains (or `shutdown_timeout` elapses).
    pub fn run(self) -> io::Result<()> {
        let shutdown = ShutdownSignal::install()?;
        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        for proxy in &self.config.proxies {
            for worker_idx in 0..self.config.worker_threads {
                let proxy = proxy.clone();
                let name = proxy.name.clone();
                let event_capacity = self.config.event_capacity;
                let shutdown_timeout = self.config.shutdown_timeout;
                let shutdown = shutdown.clone();

                let handle = thread::Builder::new()
                    .name(format!("rproxy-{name}-{worker_idx}"))
                    .spawn(move || {
                        let mut worker = match Worker::new(proxy, event_capacity, shutdown) {
                            Ok(w) => w,
                            Err(e) => {
                                error!(proxy = %name, "failed to start worker: {e}");
                                return;
                            }
                        };
                        info!(proxy = %name, worker_idx, "worker started");
                        worker.run(shutdown_timeout);
                        info!(proxy = %name, worker_idx, "worker stopped");
                    })?;
                handles.push(handle);
            }
        }

        for handle in handles {
            let _ = handle.join();
        }
        Ok(())
    }
}
