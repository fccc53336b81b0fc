//! Per-thread event loop: one `mio::Poll` instance, one cooperative
//! [`Scheduler`], one [`ConnManager`] table of listeners/streams.
//!
//! Grounded on `xitca-server::worker`'s per-worker `WorkerInner` (accept
//! loop + service dispatch) and `flux-network`'s token-keyed connection
//! table with non-blocking connect, adapted from async/tokio to the
//! session engine's synchronous, cooperative-scheduler model: instead of
//! spawning a task per connection on a runtime, every accepted connection
//! becomes one `rproxy_core::session::Stream` driven by one scheduler task,
//! and IO readiness observed by `ConnManager::poll` wakes that task instead
//! of completing a future.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, error, trace, warn};

use rproxy_core::channel::ChannelFlags;
use rproxy_core::clock::Tick;
use rproxy_core::config::ProxyConfig;
use rproxy_core::session::{Stream as SessionStream, StreamOutcome};
use rproxy_core::si::{mio_like, Endpoint, SiState};
use rproxy_core::task::{Scheduler, TaskId, TaskResult};

use rproxy_io::{ConnEvent, ConnManager, Token};

use crate::balance::RoundRobin;
use crate::signals::ShutdownSignal;

const TICK_MS: u64 = 100;
const MAX_DISPATCH_PER_TICK: usize = 256;

struct SessionCtx {
    stream: SessionStream,
    front: Token,
    back: Option<Token>,
    task: TaskId,
}

/// One worker thread's complete IO+scheduling state. Shared with spawned
/// task closures via `Rc<RefCell<_>>` rather than borrowed directly, since
/// `Scheduler::spawn` requires `'static + FnMut` closures that must own (or
/// share ownership of) everything they touch.
pub struct Worker {
    conns: ConnManager,
    scheduler: Scheduler,
    sessions: Rc<RefCell<HashMap<Token, Rc<RefCell<SessionCtx>>>>>,
    resolver: Rc<RoundRobin>,
    proxy: ProxyConfig,
    listener_token: Token,
    shutdown: ShutdownSignal,
}

impl Worker {
    pub fn new(proxy: ProxyConfig, event_capacity: usize, shutdown: ShutdownSignal) -> io::Result<Self> {
        let mut conns = ConnManager::new(event_capacity)?;
        let listener_token = conns.listen(proxy.bind)?;
        let resolver = Rc::new(RoundRobin::new(proxy.servers.clone()));
        Ok(Self {
            conns,
            scheduler: Scheduler::new(),
            sessions: Rc::new(RefCell::new(HashMap::new())),
            resolver,
            proxy,
            listener_token,
            shutdown,
        })
    }

    /// Runs until `shutdown` is observed and every in-flight session has
    /// drained, per `shutdown_timeout` (see `Scheduler::begin_soft_stop`).
    pub fn run(&mut self, shutdown_timeout: Duration) {
        trace!(proxy = %self.proxy.name, bind = %self.proxy.bind, "worker loop starting");
        let mut soft_stop_started: Option<Tick> = None;
        loop {
            let events = match self.conns.poll(Some(Duration::from_millis(TICK_MS))) {
                Ok(events) => events,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => Vec::new(),
                Err(e) => {
                    error!("poll error: {e}");
                    Vec::new()
                }
            };

            for event in events {
                self.handle_event(event);
            }

            self.scheduler.tick(TICK_MS);
            self.scheduler.run_once(MAX_DISPATCH_PER_TICK);

            if self.shutdown.should_stop() && soft_stop_started.is_none() {
                debug!("worker beginning soft stop");
                self.scheduler.begin_soft_stop();
                self.conns.remove(self.listener_token);
                soft_stop_started = Some(self.scheduler.now());
            }

            if let Some(start) = soft_stop_started {
                let drained = self.sessions.borrow().is_empty();
                let elapsed = Duration::from_millis(self.scheduler.now().saturating_sub(start));
                if drained || elapsed >= shutdown_timeout {
                    if !drained {
                        warn!("shutdown_timeout elapsed with sessions still open; forcing stop");
                    }
                    return;
                }
            }
        }
    }

    fn handle_event(&mut self, event: ConnEvent) {
        match event {
            ConnEvent::Accept { listener, stream, peer_addr } => {
                debug_assert_eq!(listener, self.listener_token);
                trace!(?peer_addr, ?stream, "accepted");
                self.spawn_session(stream);
            }
            ConnEvent::Readable(token) => self.pump(token, true, false),
            ConnEvent::Writable(token) => self.pump(token, false, true),
            ConnEvent::Error(token, err) => self.fail_token(token, err),
        }
    }

    fn spawn_session(&mut self, front: Token) {
        let tune = rproxy_core::config::TuneParams::default();
        // the concrete backend (and its own `conn_retries`) isn't picked
        // until `maybe_connect_backend` runs, once the request line has
        // parsed; use the pool's own default as the SI's retry budget until
        // then, same as HAProxy sizing a stream's retry counter off the
        // backend's `retries` directive before a server is chosen.
        let conn_retries = self.resolver.servers().first().map(|s| s.conn_retries).unwrap_or(3);
        let stream =
            SessionStream::with_tarpit_timeout(tune.buf_size, tune.buf_reserve, conn_retries, self.proxy.timeouts.tarpit_ms);
        let ctx = Rc::new(RefCell::new(SessionCtx { stream, front, back: None, task: TaskId::default() }));

        let sessions = Rc::clone(&self.sessions);
        let ctx_for_task = Rc::clone(&ctx);
        let task = self.scheduler.spawn(0, move |now| Self::drive(&ctx_for_task, &sessions, now));

        ctx.borrow_mut().task = task;
        self.sessions.borrow_mut().insert(front, Rc::clone(&ctx));
        self.scheduler.wake_now(task);
    }

    /// Task body for one session: runs the analyser pipeline and reports
    /// whether the task should be kept alive. IO is pumped separately by
    /// `pump` when `ConnManager::poll` reports readiness; this closure only
    /// re-evaluates protocol state, matching spec.md §4.5 "the process
    /// function... iterates all analyser bits... It must not loop if no
    /// analyser made progress."
    fn drive(ctx: &Rc<RefCell<SessionCtx>>, sessions: &Rc<RefCell<HashMap<Token, Rc<RefCell<SessionCtx>>>>>, now: Tick) -> TaskResult {
        let mut c = ctx.borrow_mut();
        match c.stream.process(now) {
            StreamOutcome::Continue => TaskResult::Keep,
            StreamOutcome::Done(err) => {
                if let Some(e) = err {
                    trace!(?e, "stream ended with error");
                }
                if let Some(event) = c.stream.take_backend_event() {
                    // no idle-connection pool exists in this worker yet; a
                    // backend resolver that owned one would consume `event`
                    // here instead of letting the fd drop with the session.
                    trace!(?event, "backend connection reached a poolable boundary");
                }
                let front = c.front;
                let back = c.back;
                drop(c);
                sessions.borrow_mut().remove(&front);
                if let Some(b) = back {
                    sessions.borrow_mut().remove(&b);
                }
                TaskResult::Destroy
            }
        }
    }

    fn pump(&mut self, token: Token, readable: bool, writable: bool) {
        let Some(ctx) = self.session_for(token) else { return };
        let is_front = ctx.borrow().front == token;

        if !is_front && writable {
            let mut c = ctx.borrow_mut();
            if c.stream.si_back.state == SiState::Con {
                c.stream.si_back.connect_established();
            }
        }

        if readable {
            let buf_side_full = {
                let c = ctx.borrow();
                let chan = if is_front { &c.stream.req } else { &c.stream.res };
                chan.buf().free() == 0
            };
            if !buf_side_full {
                self.read_into(token, &ctx, is_front);
            }
        }
        if writable {
            self.write_from(token, &ctx, is_front);
        }

        if is_front && ctx.borrow().back.is_none() {
            self.maybe_connect_backend(&ctx);
        }

        let task = ctx.borrow().task;
        self.scheduler.wake_now(task);
    }

    fn read_into(&mut self, token: Token, ctx: &Rc<RefCell<SessionCtx>>, is_front: bool) {
        let Some(transport) = self.conns.stream_mut(token) else { return };
        let mut tmp = [0u8; 16 * 1024];
        loop {
            match transport.read(&mut tmp) {
                Ok(0) => {
                    let mut c = ctx.borrow_mut();
                    let chan = if is_front { &mut c.stream.req } else { &mut c.stream.res };
                    chan.flags.insert(ChannelFlags::READ_NULL);
                    break;
                }
                Ok(n) => {
                    let mut c = ctx.borrow_mut();
                    let chan = if is_front { &mut c.stream.req } else { &mut c.stream.res };
                    let _ = chan.buf_mut().put_block(&tmp[..n]);
                    if n < tmp.len() {
                        break;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    let mut c = ctx.borrow_mut();
                    let chan = if is_front { &mut c.stream.req } else { &mut c.stream.res };
                    chan.flags.insert(ChannelFlags::READ_ERROR);
                    warn!(?token, "read error: {e}");
                    break;
                }
            }
        }
    }

    fn write_from(&mut self, token: Token, ctx: &Rc<RefCell<SessionCtx>>, is_front: bool) {
        // A front token drains the response channel's output toward the
        // client; a back token drains the request channel's output toward
        // the server. Opposite of `read_into`'s channel choice.
        loop {
            let chunk: Vec<u8> = {
                let c = ctx.borrow();
                let chan = if is_front { &c.stream.res } else { &c.stream.req };
                let len = chan.buf().output_len().min(16 * 1024);
                if len == 0 {
                    break;
                }
                let (slices, n) = chan.buf().get_block_nc(0, len);
                let mut v = Vec::with_capacity(n);
                v.extend_from_slice(slices[0]);
                v.extend_from_slice(slices[1]);
                v
            };
            let Some(transport) = self.conns.stream_mut(token) else { return };
            match transport.write(&chunk) {
                Ok(written) => {
                    let mut c = ctx.borrow_mut();
                    let chan = if is_front { &mut c.stream.res } else { &mut c.stream.req };
                    chan.buf_mut().skip(written);
                    if written < chunk.len() {
                        break;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    let mut c = ctx.borrow_mut();
                    let chan = if is_front { &mut c.stream.res } else { &mut c.stream.req };
                    chan.flags.insert(ChannelFlags::WRITE_ERROR);
                    warn!(?token, "write error: {e}");
                    break;
                }
            }
        }
    }

    /// Once the request's headers have cleared the frontend/backend
    /// analysers (`si_back` still `Init`, no tarpit pending), resolve a
    /// backend and begin a non-blocking connect. This is the concrete
    /// implementation of spec.md §1's "resolve backend server for this
    /// session" external collaborator; the algorithm itself (round robin)
    /// is explicitly out of scope for the core crate.
    fn maybe_connect_backend(&mut self, ctx: &Rc<RefCell<SessionCtx>>) {
        use rproxy_core::http::MsgState;
        let ready = {
            let c = ctx.borrow();
            c.stream.si_back.state == SiState::Init
                && !matches!(c.stream.txn.req.state, MsgState::Before | MsgState::StartLine | MsgState::Hdr)
        };
        if !ready {
            return;
        }
        let Some(server) = self.resolver.pick() else {
            warn!("no backend servers configured; cannot assign");
            return;
        };
        let addr: SocketAddr = server.addr;
        ctx.borrow_mut().stream.si_back.assign_target();
        match self.conns.connect(addr) {
            Ok(token) => {
                let mut c = ctx.borrow_mut();
                c.stream.si_back.dequeue_assign(Endpoint::Socket(mio_like::Token(token.0)));
                c.stream.si_back.begin_connect();
                c.back = Some(token);
                drop(c);
                self.sessions.borrow_mut().insert(token, Rc::clone(ctx));
            }
            Err(e) => {
                warn!(%addr, "connect failed immediately: {e}");
                let _ = ctx.borrow_mut().stream.si_back.connect_error();
            }
        }
    }

    fn fail_token(&mut self, token: Token, err: io::Error) {
        let Some(ctx) = self.session_for(token) else { return };
        let is_front = ctx.borrow().front == token;
        {
            let mut c = ctx.borrow_mut();
            let chan = if is_front { &mut c.stream.req } else { &mut c.stream.res };
            chan.flags.insert(ChannelFlags::READ_ERROR);
        }
        warn!(?token, "connection error: {err}");
        let task = ctx.borrow().task;
        self.scheduler.wake_now(task);
    }

    fn session_for(&self, token: Token) -> Option<Rc<RefCell<SessionCtx>>> {
        self.sessions.borrow().get(&token).cloned()
    }
}
