//! Stream Interface: the per-side endpoint state machine.
//!
//! A [`StreamInterface`] drives one side of a [`Session`](crate::session)
//! through connect, half-close and error handling. It never touches bytes
//! itself — [`Channel`](crate::channel) owns the buffer — it only decides
//! when to issue `shutr`/`shutw`, when to retry a backend connect, and when
//! the side has reached its terminal `CLO` state.

use crate::channel::{Channel, ChannelFlags};
use crate::clock::Tick;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiState {
    /// not yet assigned anything to talk to.
    Init,
    /// a target (backend, applet) has been assigned.
    Req,
    /// waiting in the backend's admission queue (maxconn reached).
    Que,
    /// deliberately delayed per a tarpit rule.
    Tar,
    /// a concrete server has been picked; about to connect.
    Ass,
    /// connect() issued, awaiting completion.
    Con,
    /// connect failed; may retry (loops back to `Ass`) or terminate.
    Cer,
    /// connection established and usable for forwarding.
    Est,
    /// the peer closed its write half; this side may still have data to
    /// drain before fully closing.
    Dis,
    /// terminal: both directions closed, descriptor released.
    Clo,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SiFlags(u8);

impl SiFlags {
    pub const NOLINGER: u8 = 1 << 0;
    pub const NOHALF: u8 = 1 << 1;
    pub const WAIT_ROOM: u8 = 1 << 2;
    pub const CLEAN_ABRT: u8 = 1 << 3;

    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn insert(&mut self, bits: u8) {
        self.0 |= bits;
    }

    pub fn remove(&mut self, bits: u8) {
        self.0 &= !bits;
    }

    pub const fn contains(&self, bits: u8) -> bool {
        (self.0 & bits) == bits
    }
}

/// What this SI's bytes ultimately come from/go to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    None,
    Socket(mio_like::Token),
    /// driven by the scheduler invoking an applet handler instead of doing
    /// socket IO (the stats/admin interpreter, the peer-sync protocol).
    Applet,
}

/// A minimal standalone token type so this crate does not need to depend on
/// `rproxy-io`/`mio` just to name a connection; `rproxy-server` maps these to
/// real `mio::Token`s.
pub mod mio_like {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct Token(pub usize);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Retry { backoff_ms: u64 },
    Exhausted,
}

/// A signal an SI raises for its owner to act on; never produced by `update`
/// itself, only by explicit calls from `Session`/`Stream` at points that know
/// the transaction-level context `update`'s fixpoint loop doesn't see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiEvent {
    /// the backend connection this SI held reached a clean, reusable
    /// boundary — response fully drained, keep-alive negotiated, no
    /// transport error — and could be handed to an idle-connection pool
    /// instead of being closed outright. No pool is implemented here; this
    /// is only the hook a backend resolver's pool would consume.
    Recyclable,
}

pub struct StreamInterface {
    pub state: SiState,
    pub flags: SiFlags,
    pub endpoint: Endpoint,
    conn_retries_left: u32,
    conn_retries_total: u32,
    attempt: u32,
    backoff_base_ms: u64,
    pending_event: Option<SiEvent>,
}

impl StreamInterface {
    pub fn new(conn_retries: u32) -> Self {
        Self {
            state: SiState::Init,
            flags: SiFlags::empty(),
            endpoint: Endpoint::None,
            conn_retries_left: conn_retries,
            conn_retries_total: conn_retries,
            attempt: 0,
            backoff_base_ms: 50,
            pending_event: None,
        }
    }

    /// Raise [`SiEvent::Recyclable`] for this SI's owner to observe via
    /// [`StreamInterface::take_event`].
    pub fn mark_recyclable(&mut self) {
        self.pending_event = Some(SiEvent::Recyclable);
    }

    /// Take and clear any pending event, leaving `None` behind so it is
    /// reported exactly once.
    pub fn take_event(&mut self) -> Option<SiEvent> {
        self.pending_event.take()
    }

    pub fn assign_target(&mut self) {
        self.state = SiState::Req;
    }

    pub fn enqueue(&mut self) {
        self.state = SiState::Que;
    }

    pub fn dequeue_assign(&mut self, endpoint: Endpoint) {
        self.endpoint = endpoint;
        self.state = SiState::Ass;
    }

    pub fn tarpit(&mut self) {
        self.state = SiState::Tar;
    }

    pub fn begin_connect(&mut self) {
        self.state = SiState::Con;
    }

    pub fn connect_established(&mut self) {
        self.state = SiState::Est;
        self.conn_retries_left = self.conn_retries_total;
        self.attempt = 0;
    }

    /// A transport error occurred while in `Con`. Returns whether the caller
    /// should retry (looping `Cer` -> `Ass`) or give up (`503` to the
    /// client, per spec.md §7).
    pub fn connect_error(&mut self) -> ConnectOutcome {
        self.state = SiState::Cer;
        if self.conn_retries_left > 0 {
            self.conn_retries_left -= 1;
            let backoff_ms = jittered_backoff(self.backoff_base_ms, self.attempt);
            self.attempt += 1;
            ConnectOutcome::Retry { backoff_ms }
        } else {
            ConnectOutcome::Exhausted
        }
    }

    /// `Cer` -> `Ass`: a fresh attempt at the (possibly re-resolved) server.
    pub fn retry(&mut self) {
        self.state = SiState::Ass;
    }

    /// The peer half-closed (read returned EOF / `READ_NULL`). `NOHALF`
    /// promotes this straight to a full close instead of `Dis`.
    pub fn half_close_read(&mut self) {
        if self.flags.contains(SiFlags::NOHALF) {
            self.state = SiState::Clo;
        } else {
            self.state = SiState::Dis;
        }
    }

    pub fn close(&mut self) {
        self.state = SiState::Clo;
    }

    pub fn is_closed(&self) -> bool {
        self.state == SiState::Clo
    }

    /// `true` if this side should perform an abortive close (`SO_LINGER{0,0}`)
    /// instead of a graceful shutdown.
    pub fn wants_abortive_close(&self) -> bool {
        self.flags.contains(SiFlags::NOLINGER)
    }
}

fn jittered_backoff(base_ms: u64, attempt: u32) -> u64 {
    let exp = base_ms.saturating_mul(1u64 << attempt.min(10));
    let half = exp / 2;
    half + (rand::random::<u64>() % (half + 1))
}

/// Fixpoint driver reconciling a [`StreamInterface`] with the channels it
/// connects (`inbound` is the channel this side receives into, `outbound` is
/// the channel this side drains toward the peer). Issues `shutr`/`shutw` and
/// advances `Dis`/`Clo` transitions; does not perform any actual IO.
pub fn update(si: &mut StreamInterface, inbound: &mut Channel, outbound: &mut Channel, now: Tick) {
    let _ = now;

    if inbound.flags.contains(ChannelFlags::READ_NULL) && si.state == SiState::Est {
        si.half_close_read();
    }

    if outbound.flags.any(ChannelFlags::SHUTW_NOW) && outbound.buf().output_len() == 0 {
        outbound.shutw();
    }

    if si.state == SiState::Dis && inbound.buf().input_len() == 0 && inbound.to_forward() == 0 {
        si.close();
    }

    if outbound.flags.contains(ChannelFlags::SHUTW) && inbound.flags.contains(ChannelFlags::SHUTR) {
        si.close();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::channel::Channel;

    #[test]
    fn connect_retries_then_exhausts() {
        let mut si = StreamInterface::new(2);
        si.begin_connect();
        assert!(matches!(si.connect_error(), ConnectOutcome::Retry { .. }));
        assert_eq!(si.state, SiState::Cer);
        si.retry();
        assert_eq!(si.state, SiState::Ass);
        si.begin_connect();
        assert!(matches!(si.connect_error(), ConnectOutcome::Retry { .. }));
        si.retry();
        si.begin_connect();
        assert_eq!(si.connect_error(), ConnectOutcome::Exhausted);
    }

    #[test]
    fn nohalf_promotes_eof_to_full_close() {
        let mut si = StreamInterface::new(0);
        si.flags.insert(SiFlags::NOHALF);
        si.state = SiState::Est;
        si.half_close_read();
        assert_eq!(si.state, SiState::Clo);
    }

    #[test]
    fn without_nohalf_eof_only_half_closes() {
        let mut si = StreamInterface::new(0);
        si.state = SiState::Est;
        si.half_close_read();
        assert_eq!(si.state, SiState::Dis);
    }

    #[test]
    fn update_closes_dis_once_input_drained() {
        let mut si = StreamInterface::new(0);
        si.state = SiState::Dis;
        let mut inbound = Channel::new(16, 0, false);
        let mut outbound = Channel::new(16, 0, true);
        update(&mut si, &mut inbound, &mut outbound, 0);
        assert!(si.is_closed());
    }
}
