//! Worker pool, listener wiring and binary entry point for the rproxy
//! session engine (spec.md §1 "out of scope... the OS poller", §5
//! "Concurrency & resource model").
//!
//! `rproxy-core` describes the session engine in terms of a single
//! cooperative [`Scheduler`](rproxy_core::task::Scheduler) per worker; this
//! crate supplies the part the spec deliberately leaves external — the
//! thread pool, the `mio` listener/connector wiring, graceful-shutdown
//! signal handling and a minimal round-robin backend resolver to drive the
//! session engine end to end. Grounded on `xitca-server`'s
//! `builder`/`worker`/`signals` split, adapted from its tokio/async-await
//! model to the synchronous, level-triggered poll loop this spec's
//! scheduler requires.

pub mod balance;
pub mod builder;
pub mod config;
pub mod signals;
pub mod worker;

pub use balance::RoundRobin;
pub use builder::Builder;
pub use config::ServerConfig;
