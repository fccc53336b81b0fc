//! Session/stream pairing: two [`StreamInterface`]s and two [`Channel`]s
//! wired around one HTTP transaction (spec.md §4, §5).
//!
//! A `Stream` is the unit the scheduler drives: each wakeup calls
//! [`Stream::process`], which runs both analyser pipelines against the
//! current buffer contents, then reconciles each `StreamInterface` via
//! [`si::update`] before reporting how the stream wants to be rescheduled.

use crate::channel::Channel;
use crate::clock::Tick;
use crate::error::SessionError;
use crate::http::{analyzers, AnalyzeCtx, HttpMessage};
use crate::si::{self, Endpoint, SiState, StreamInterface};

/// One HTTP transaction: the request/response message pair an `htx`less
/// (legacy) analyser chain walks. Reused across keep-alive requests on the
/// same stream via [`Txn::reset_for_next_message`].
pub struct Txn {
    pub req: HttpMessage,
    pub res: HttpMessage,
    pub ctx: AnalyzeCtx,
}

impl Txn {
    pub fn new() -> Self {
        Self { req: HttpMessage::new(false), res: HttpMessage::new(true), ctx: AnalyzeCtx::default() }
    }

    pub fn reset_for_next_message(&mut self) {
        self.req.reset_for_next_message();
        self.res.reset_for_next_message();
        self.ctx = AnalyzeCtx::default();
    }
}

impl Default for Txn {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// still has work pending; caller should keep the stream's task alive
    /// and re-wake it when its channels or timers are next signalled.
    Continue,
    /// both directions reached a terminal state: the stream is done and may
    /// be destroyed (or, on a clean keep-alive boundary, recycled for the
    /// next request — see `Stream::try_recycle`).
    Done(Option<SessionError>),
}

pub struct Stream {
    /// client-facing side.
    pub si_front: StreamInterface,
    /// server-facing side.
    pub si_back: StreamInterface,
    pub req: Channel,
    pub res: Channel,
    pub txn: Txn,
    /// `timeout.tarpit`, in ms; what `process_fe` arms `ctx.tarpit_until`
    /// with once a rule calls [`AnalyzeCtx::request_tarpit`].
    tarpit_ms: u64,
}

impl Stream {
    pub fn new(buf_capacity: usize, buf_reserve: usize, conn_retries: u32) -> Self {
        Self::with_tarpit_timeout(buf_capacity, buf_reserve, conn_retries, 0)
    }

    pub fn with_tarpit_timeout(buf_capacity: usize, buf_reserve: usize, conn_retries: u32, tarpit_ms: u64) -> Self {
        let mut req = Channel::new(buf_capacity, buf_reserve, false);
        let mut res = Channel::new(buf_capacity, buf_reserve, true);
        req.analysers = analyzers::REQUEST_PIPELINE;
        res.analysers = analyzers::AN_RES_WAIT_HTTP | analyzers::AN_RES_HTTP_XFER_BODY;
        Self {
            si_front: StreamInterface::new(0),
            si_back: StreamInterface::new(conn_retries),
            req,
            res,
            txn: Txn::new(),
            tarpit_ms,
        }
    }

    pub fn process(&mut self, now: Tick) -> StreamOutcome {
        let req_result = analyzers::run_request(&mut self.txn.req, &mut self.req, &mut self.txn.ctx, now, self.tarpit_ms);
        if let analyzers::AnResult::Terminate(e) = req_result {
            self.si_front.close();
            self.si_back.close();
            return StreamOutcome::Done(Some(e));
        }

        // Once `process_fe` arms a tarpit, hold the backend SI in `Tar`
        // instead of letting it ever reach `Init -> Req -> Ass -> Con`: the
        // request is held, not forwarded (spec.md §4.7/§8).
        if self.txn.ctx.tarpit_until != crate::clock::ETERNITY && self.si_back.state == SiState::Init {
            self.si_back.tarpit();
        }

        self.maybe_send_100_continue();

        if self.si_back.endpoint != Endpoint::None {
            let res_result = analyzers::run_response(&mut self.txn.res, &mut self.res, &mut self.txn.ctx);
            if let analyzers::AnResult::Terminate(e) = res_result {
                self.si_front.close();
                self.si_back.close();
                return StreamOutcome::Done(Some(e));
            }
        }

        si::update(&mut self.si_front, &mut self.req, &mut self.res, now);
        si::update(&mut self.si_back, &mut self.res, &mut self.req, now);

        if self.si_front.is_closed() && self.si_back.is_closed() {
            if self.txn.ctx.mode == analyzers::ConnectionMode::KeepAlive
                && self.txn.req.state == crate::http::MsgState::Done
                && self.txn.res.state == crate::http::MsgState::Done
            {
                self.si_back.mark_recyclable();
            }
            StreamOutcome::Done(None)
        } else {
            StreamOutcome::Continue
        }
    }

    /// Drain the backend SI's pending pool-reuse signal, if any (spec.md §4.5
    /// leaves idle-connection pooling to the backend resolver; this is the
    /// hook that collaborator would consume — see `maybe_connect_backend` in
    /// the `server` crate's worker for where a pool lookup would plug in).
    pub fn take_backend_event(&mut self) -> Option<si::SiEvent> {
        self.si_back.take_event()
    }

    /// Inject the interim `100 Continue` response onto the response channel
    /// once `process_req_common`/`process_fe` has recognized `Expect:
    /// 100-continue` on a 1.1 request (spec.md §4.7). Owns this because it is
    /// the one place holding `&mut` access to both the request analyser
    /// context and the response channel; the request analyser itself cannot
    /// reach `self.res`.
    fn maybe_send_100_continue(&mut self) {
        if !self.txn.ctx.expect_100 || self.txn.ctx.continue_sent {
            return;
        }
        const INTERIM: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";
        if self.res.buf_mut().put_block(INTERIM).is_ok() {
            self.res.buf_mut().advance(INTERIM.len());
            self.txn.ctx.continue_sent = true;
        }
    }

    /// `true` once both messages of the current transaction have completed
    /// and the negotiated connection mode allows starting another on the
    /// same sockets.
    pub fn can_recycle(&self) -> bool {
        use crate::http::MsgState;
        self.txn.req.state == MsgState::Done
            && self.txn.res.state == MsgState::Done
            && self.txn.ctx.mode == analyzers::ConnectionMode::KeepAlive
    }

    /// Reset transaction state for the next pipelined/keep-alive request
    /// while keeping the established backend connection (`si_back` stays in
    /// `Est`; only `si_front`'s per-message bookkeeping and the channels'
    /// analyser bitmasks are rearmed).
    pub fn recycle(&mut self) {
        self.txn.reset_for_next_message();
        self.req.analysers = analyzers::REQUEST_PIPELINE;
        self.res.analysers = analyzers::AN_RES_WAIT_HTTP | analyzers::AN_RES_HTTP_XFER_BODY;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stream_reports_done_on_malformed_request() {
        let mut s = Stream::new(4096, 64, 0);
        s.req.buf_mut().put_block(b"not a request\r\n\r\n").unwrap();
        let outcome = s.process(0);
        assert!(matches!(outcome, StreamOutcome::Done(Some(_))));
    }

    #[test]
    fn stream_continues_while_awaiting_more_request_bytes() {
        let mut s = Stream::new(4096, 64, 0);
        s.req.buf_mut().put_block(b"GET / HTTP/1.1\r\n").unwrap();
        let outcome = s.process(0);
        assert_eq!(outcome, StreamOutcome::Continue);
    }

    #[test]
    fn expect_100_continue_is_injected_onto_response_channel_once() {
        let mut s = Stream::new(4096, 64, 0);
        s.req
            .buf_mut()
            .put_block(b"POST /up HTTP/1.1\r\nHost: x\r\nExpect: 100-continue\r\nTransfer-Encoding: chunked\r\n\r\n")
            .unwrap();
        s.process(0);
        assert!(s.txn.ctx.continue_sent);
        let (parts, n) = s.res.buf().get_block_nc(0, s.res.buf().output_len());
        let mut sent = parts[0].to_vec();
        sent.extend_from_slice(&parts[1][..n.saturating_sub(parts[0].len())]);
        assert_eq!(sent, b"HTTP/1.1 100 Continue\r\n\r\n");

        // a second pass must not re-send the interim response.
        let before = s.res.buf().output_len();
        s.process(0);
        assert_eq!(s.res.buf().output_len(), before);
    }

    #[test]
    fn clean_keepalive_close_marks_backend_recyclable() {
        let mut s = Stream::new(4096, 64, 0);
        s.txn.ctx.mode = analyzers::ConnectionMode::KeepAlive;
        s.txn.req.state = crate::http::MsgState::Done;
        s.txn.res.state = crate::http::MsgState::Done;
        s.si_front.close();
        s.si_back.close();

        let outcome = s.process(0);
        assert_eq!(outcome, StreamOutcome::Done(None));
        assert_eq!(s.take_backend_event(), Some(si::SiEvent::Recyclable));
        // reported once.
        assert_eq!(s.take_backend_event(), None);
    }

    #[test]
    fn close_without_keepalive_does_not_mark_recyclable() {
        let mut s = Stream::new(4096, 64, 0);
        s.si_front.close();
        s.si_back.close();
        let outcome = s.process(0);
        assert_eq!(outcome, StreamOutcome::Done(None));
        assert_eq!(s.take_backend_event(), None);
    }

    #[test]
    fn armed_tarpit_holds_backend_si_and_never_reaches_connect() {
        let mut s = Stream::with_tarpit_timeout(4096, 64, 3, 1000);
        s.txn.ctx.request_tarpit();
        s.req.buf_mut().put_block(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n").unwrap();

        let outcome = s.process(0);
        assert_eq!(outcome, StreamOutcome::Continue);
        assert_eq!(s.si_back.state, si::SiState::Tar);

        // still held short of the deadline.
        let outcome = s.process(999);
        assert_eq!(outcome, StreamOutcome::Continue);
        assert_eq!(s.si_back.state, si::SiState::Tar);

        // expiry ends the session with a synthesized 500/FINST_T, having
        // never left `Init`/`Tar` for `Ass`/`Con`.
        let outcome = s.process(1000);
        match outcome {
            StreamOutcome::Done(Some(e)) => {
                assert_eq!(e.effective_status(), Some(500));
                assert_eq!(e.phase, crate::error::ErrPhase::Tarpit);
            }
            other => panic!("expected a tarpit termination, got {other:?}"),
        }
    }
}
