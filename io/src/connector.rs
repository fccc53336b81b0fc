use std::{io, net::SocketAddr, time::Duration};

use mio::{net::TcpListener, Events, Interest, Poll};
use tracing::{debug, error, warn};

use crate::transport::PlainTcp;

/// Re-exported so callers never need to depend on `mio` directly to name a
/// connection.
pub type Token = mio::Token;

enum Slot {
    Listener(TcpListener),
    Stream(PlainTcp),
}

/// One non-blocking IO occurrence surfaced by [`ConnManager::poll`].
///
/// This is the seam between the OS poller (external to the session engine,
/// per spec) and the scheduler: every event here becomes a task wake-up.
pub enum ConnEvent {
    Accept { listener: Token, stream: Token, peer_addr: SocketAddr },
    Readable(Token),
    Writable(Token),
    /// The remote reset the connection or an unrecoverable IO error occurred;
    /// the slot has already been removed and deregistered.
    Error(Token, io::Error),
}

/// `mio`-backed table of listeners and established streams, keyed by
/// [`Token`].
///
/// Modeled on `flux-network::tcp::TcpConnector`'s connection table (token
/// allocation, listener vs. stream variants, non-blocking connect) but
/// stripped of its message-framing and reconnect-on-timer behavior: those are
/// the session/SI layer's job here, not the transport layer's. Connect
/// retries for a backend server are driven by the Stream Interface's CER
/// state (see `rproxy-core::si`), not by this type.
pub struct ConnManager {
    poll: Poll,
    events: Events,
    slots: Vec<(Token, Slot)>,
    next_token: usize,
}

impl ConnManager {
    pub fn new(event_capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(event_capacity),
            slots: Vec::new(),
            next_token: 0,
        })
    }

    fn alloc_token(&mut self) -> Token {
        let t = Token(self.next_token);
        self.next_token += 1;
        t
    }

    pub fn listen(&mut self, addr: SocketAddr) -> io::Result<Token> {
        let mut listener = TcpListener::bind(addr)?;
        let token = self.alloc_token();
        self.poll.registry().register(&mut listener, token, Interest::READABLE)?;
        self.slots.push((token, Slot::Listener(listener)));
        Ok(token)
    }

    /// Begin a non-blocking connect to `addr`. Returns the token immediately;
    /// completion (or failure) is observed as a `Writable`/`Error` event once
    /// polled, matching how a real `connect(2)` completes asynchronously.
    pub fn connect(&mut self, addr: SocketAddr) -> io::Result<Token> {
        let stream = mio::net::TcpStream::connect(addr)?;
        let mut transport = PlainTcp::new(stream);
        let token = self.alloc_token();
        self.poll
            .registry()
            .register(&mut transport, token, Interest::READABLE | Interest::WRITABLE)?;
        self.slots.push((token, Slot::Stream(transport)));
        Ok(token)
    }

    pub fn stream_mut(&mut self, token: Token) -> Option<&mut PlainTcp> {
        self.slots.iter_mut().find_map(|(t, s)| {
            if *t == token {
                match s {
                    Slot::Stream(io) => Some(io),
                    Slot::Listener(_) => None,
                }
            } else {
                None
            }
        })
    }

    pub fn remove(&mut self, token: Token) {
        if let Some(idx) = self.slots.iter().position(|(t, _)| *t == token) {
            let (_, mut slot) = self.slots.swap_remove(idx);
            let res = match &mut slot {
                Slot::Listener(l) => self.poll.registry().deregister(l),
                Slot::Stream(s) => self.poll.registry().deregister(s),
            };
            if let Err(e) = res {
                warn!(?token, "deregister failed during removal: {e}");
            }
        }
    }

    fn accept_all(&mut self, listener_token: Token, events: &mut Vec<ConnEvent>) {
        loop {
            let accepted = match self.slots.iter_mut().find(|(t, _)| *t == listener_token) {
                Some((_, Slot::Listener(l))) => l.accept(),
                _ => return,
            };
            match accepted {
                Ok((stream, peer_addr)) => {
                    let mut transport = PlainTcp::new(stream);
                    let token = self.alloc_token();
                    if let Err(e) = self
                        .poll
                        .registry()
                        .register(&mut transport, token, Interest::READABLE)
                    {
                        error!("failed to register accepted connection: {e}");
                        continue;
                    }
                    self.slots.push((token, Slot::Stream(transport)));
                    debug!(?peer_addr, ?token, "accepted connection");
                    events.push(ConnEvent::Accept {
                        listener: listener_token,
                        stream: token,
                        peer_addr,
                    });
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!("accept error on {listener_token:?}: {e}");
                    return;
                }
            }
        }
    }

    /// Poll once with the given timeout (use `Duration::ZERO` from within an
    /// already-running scheduler tick) and return the events observed.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<ConnEvent>> {
        self.poll.poll(&mut self.events, timeout)?;
        let mut out = Vec::new();
        for ev in self.events.iter() {
            let token = ev.token();
            let is_listener = matches!(
                self.slots.iter().find(|(t, _)| *t == token),
                Some((_, Slot::Listener(_)))
            );
            if is_listener {
                self.accept_all(token, &mut out);
                continue;
            }
            if ev.is_error() || ev.is_read_closed() && ev.is_write_closed() {
                let err = self
                    .stream_mut(token)
                    .and_then(|s| s.0.take_error().ok().flatten())
                    .unwrap_or_else(|| io::Error::from(io::ErrorKind::ConnectionReset));
                self.remove(token);
                out.push(ConnEvent::Error(token, err));
                continue;
            }
            if ev.is_readable() {
                out.push(ConnEvent::Readable(token));
            }
            if ev.is_writable() {
                out.push(ConnEvent::Writable(token));
            }
        }
        Ok(out)
    }
}
