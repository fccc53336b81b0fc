use std::{
    io::{self, Read, Write},
    net::Shutdown,
};

use mio::{event::Source, net::TcpStream};

/// A wrapper trait for the byte-level transport backing a [Stream Interface].
///
/// `rproxy-core` never calls into a socket directly: every read/write/shutdown
/// observed by a session goes through this trait, so an encrypting transport
/// (TLS) can be substituted without the session engine changing a line. This
/// mirrors the seam `xitca-io::io::AsyncIo` draws between tokio's socket types
/// and `xitca-http`'s dispatcher, adapted to a synchronous, level-triggered
/// poll model instead of `async`/`await`.
///
/// [Stream Interface]: https://docs.rs/rproxy-core/latest/rproxy_core/si/
pub trait Transport: Read + Write + Source {
    /// Shut down one or both halves of the transport. `NOLINGER` abortive
    /// close is expressed by the caller setting `SO_LINGER{0,0}` before
    /// calling this, not by a separate method here.
    fn shutdown(&mut self, how: Shutdown) -> io::Result<()>;

    /// Best-effort hint: true if a write would currently succeed without
    /// blocking. Transports that can't cheaply answer (TLS with pending
    /// handshake bytes) may always return `true` and rely on `write`
    /// returning `WouldBlock`.
    fn is_write_ready(&self) -> bool {
        true
    }
}

/// Plain, unencrypted TCP transport. The default and only concrete
/// [`Transport`] this crate ships; TLS is out of scope (external
/// collaborator) per the session engine's spec.
pub struct PlainTcp(pub TcpStream);

impl PlainTcp {
    pub fn new(stream: TcpStream) -> Self {
        Self(stream)
    }

    pub fn peer_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.0.peer_addr()
    }
}

impl Read for PlainTcp {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for PlainTcp {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl Source for PlainTcp {
    fn register(&mut self, registry: &mio::Registry, token: mio::Token, interests: mio::Interest) -> io::Result<()> {
        self.0.register(registry, token, interests)
    }

    fn reregister(&mut self, registry: &mio::Registry, token: mio::Token, interests: mio::Interest) -> io::Result<()> {
        self.0.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &mio::Registry) -> io::Result<()> {
        self.0.deregister(registry)
    }
}

impl Transport for PlainTcp {
    fn shutdown(&mut self, how: Shutdown) -> io::Result<()> {
        self.0.shutdown(how)
    }
}
