//! Session-level error classification (spec.md §7).
//!
//! Kept as hand-written enums with manual `Display`/`Error` impls, matching
//! the style of `xitca-http`'s `h1::proto::error::ProtoError` rather than
//! pulling in `thiserror` for what is ultimately a closed, small set of
//! variants that also double as wire/log codes.

use std::fmt;

/// Where in the pipeline a session-ending error originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrKind {
    ClientAbort,
    ClientTimeout,
    ClientError,
    ServerAbort,
    ServerTimeout,
    ServerError,
    ConnectTimeout,
    ConnectRefused,
    ConnectError,
    QueueTimeout,
    QueueAbort,
    /// the proxy itself decided to end the session (tarpit expiry, a
    /// smuggling-defense rejection, an ACL deny) rather than any single
    /// client/server fault — `ERR_PRXCOND` in spec.md's GLOSSARY. Carries no
    /// fixed status of its own; the analyser that raises it always pairs it
    /// with [`SessionError::with_status`].
    ProxyCondition,
    Internal,
    Down,
    ResourceLimit,
}

impl ErrKind {
    /// Status code a gateway should synthesize toward the client, if a
    /// response has not already started, per spec.md §7.
    pub const fn status_code(self) -> Option<u16> {
        use ErrKind::*;
        match self {
            ClientAbort => None,
            ClientTimeout => Some(408),
            ClientError => Some(400),
            ServerAbort | ServerError => Some(502),
            ServerTimeout => Some(504),
            ConnectTimeout | ConnectRefused | ConnectError => Some(503),
            QueueTimeout => Some(503),
            QueueAbort => None,
            ProxyCondition => None,
            Internal => Some(500),
            Down => Some(503),
            ResourceLimit => Some(503),
        }
    }
}

impl fmt::Display for ErrKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrKind::ClientAbort => "client aborted",
            ErrKind::ClientTimeout => "client timeout",
            ErrKind::ClientError => "client protocol error",
            ErrKind::ServerAbort => "server aborted",
            ErrKind::ServerTimeout => "server timeout",
            ErrKind::ServerError => "server protocol error",
            ErrKind::ConnectTimeout => "connect timeout",
            ErrKind::ConnectRefused => "connection refused",
            ErrKind::ConnectError => "connect error",
            ErrKind::QueueTimeout => "queue timeout",
            ErrKind::QueueAbort => "queue aborted",
            ErrKind::ProxyCondition => "proxy condition",
            ErrKind::Internal => "internal error",
            ErrKind::Down => "no server available",
            ErrKind::ResourceLimit => "resource limit reached",
        };
        f.write_str(s)
    }
}

impl std::error::Error for ErrKind {}

/// The phase the stream was in when `ErrKind` occurred, for logs/stats (the
/// `FINST_*` family in spec.md's GLOSSARY: R/Q/C/H/D/L/T).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrPhase {
    /// waiting on/parsing the request.
    Request,
    /// queued behind `maxconn`.
    Queue,
    /// connecting to the backend.
    Connect,
    /// waiting on/parsing the response headers.
    Headers,
    /// request or response body transfer.
    Data,
    /// a local action (redirect, stats applet, synthesized error) ended the
    /// session rather than either peer.
    Local,
    /// deliberately delayed by a tarpit rule.
    Tarpit,
}

impl fmt::Display for ErrPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrPhase::Request => "R",
            ErrPhase::Queue => "Q",
            ErrPhase::Connect => "C",
            ErrPhase::Headers => "H",
            ErrPhase::Data => "D",
            ErrPhase::Local => "L",
            ErrPhase::Tarpit => "T",
        };
        f.write_str(s)
    }
}

/// A session-ending error, carrying enough context for both the client-facing
/// status synthesis and the stats/log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionError {
    pub kind: ErrKind,
    pub phase: ErrPhase,
    /// overrides `kind.status_code()` for cases the phase, not the kind,
    /// decides the status (tarpit always synthesizes 500; a smuggling
    /// rejection is 400 on the request side, 502 on the response side).
    status_override: Option<u16>,
}

impl SessionError {
    pub const fn new(kind: ErrKind, phase: ErrPhase) -> Self {
        Self { kind, phase, status_override: None }
    }

    pub const fn with_status(kind: ErrKind, phase: ErrPhase, status: u16) -> Self {
        Self { kind, phase, status_override: Some(status) }
    }

    /// The status a gateway should synthesize toward the client, if a
    /// response has not already started.
    pub const fn effective_status(&self) -> Option<u16> {
        match self.status_override {
            Some(s) => Some(s),
            None => self.kind.status_code(),
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (phase {})", self.kind, self.phase)
    }
}

impl std::error::Error for SessionError {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn connect_refused_maps_to_503() {
        assert_eq!(ErrKind::ConnectRefused.status_code(), Some(503));
    }

    #[test]
    fn client_abort_has_no_synthesized_status() {
        assert_eq!(ErrKind::ClientAbort.status_code(), None);
    }
}
