//! Session engine core: the buffer/channel model, stream-interface state
//! machine, HTTP/1 parser and analyser pipeline, cooperative task
//! scheduler, and the stats/peer-sync applets built on top of them.
//!
//! This crate has no socket or thread model of its own — `rproxy-io` owns
//! the `mio` transport and `rproxy-server` owns the worker loop that drives
//! [`task::Scheduler`] and feeds bytes into [`channel::Channel`]s. Kept this
//! way so the engine can be driven from a single-threaded test without any
//! of that machinery, the same separation `xitca-http` draws between its
//! protocol crate and `xitca-server`'s runtime.

pub mod applet;
pub mod buffer;
pub mod channel;
pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod session;
pub mod si;
pub mod task;

pub use buffer::Buffer;
pub use channel::Channel;
pub use clock::{Clock, Tick};
pub use error::{ErrKind, ErrPhase, SessionError};
pub use session::{Stream, StreamOutcome};
