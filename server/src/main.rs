//! Binary entry point. Wires up tracing and a single hardcoded proxy
//! definition, since a config-file front end is explicitly out of scope
//! (spec.md §1); a real deployment would populate `ProxyConfig` from one.

use rproxy_core::config::{BalanceAlgo, ProxyConfig, ServerDef, Timeouts};
use rproxy_server::Builder;

fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let proxy = ProxyConfig {
        name: "default".into(),
        bind: "0.0.0.0:8080".parse().expect("valid bind address"),
        mode_tcp: false,
        timeouts: Timeouts::default(),
        balance: BalanceAlgo::RoundRobin,
        servers: vec![ServerDef {
            name: "app1".into(),
            addr: "127.0.0.1:9000".parse().expect("valid server address"),
            weight: 1,
            max_conn: 1000,
            conn_retries: 3,
        }],
        stats_uri: Some("/haproxy?stats".into()),
    };

    Builder::new().worker_threads(1).proxy(proxy).run()
}
