//! Non-blocking transport abstraction and connection manager.
//!
//! The session engine in `rproxy-core` is transport-agnostic: a [`Stream
//! Interface`](https://docs.rs/rproxy-core) drives whatever implements
//! [`Transport`] without knowing if bytes cross a plain TCP socket or a TLS
//! session. Encryption, DNS and the specific poller syscalls are external
//! collaborators (per the session engine's spec) — this crate supplies only
//! the plain-TCP implementation and a `mio`-based connection manager, never
//! raw epoll/kqueue calls itself.

mod connector;
mod transport;

pub use connector::{ConnEvent, ConnManager, Token};
pub use transport::{PlainTcp, Transport};
