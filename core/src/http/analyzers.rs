//! Ordered HTTP analyser pipeline (spec.md §5.2, §5.3).
//!
//! Each analyser owns one bit in [`Channel::analysers`](crate::channel::Channel);
//! the session driver calls [`run_request`]/[`run_response`] once per wakeup,
//! which walks the bits from least to most significant, invoking whichever
//! analyser owns the lowest still-set bit and re-checking from the bottom
//! after every call (an analyser may set a bit below the one it just
//! cleared, e.g. a redirect rule re-arming `WAIT_HTTP` for a synthesized
//! response) until nothing clears or the channel can no longer progress.

use crate::channel::{Channel, ChannelFlags};
use crate::clock::Tick;
use crate::error::{ErrKind, ErrPhase, SessionError};

use super::message::{BodyCoding, ChunkedState, HttpMessage, MsgState};
use super::parser::{self, ParseError, StepOutcome};

// Bit order follows spec.md §4.7's request-side list exactly: WAIT_HTTP,
// HTTP_BODY, HTTP_PROCESS_FE, HTTP_PROCESS_BE, HTTP_TARPIT, HTTP_XFER_BODY.
pub const AN_REQ_WAIT_HTTP: u32 = 1 << 0;
pub const AN_REQ_HTTP_BODY: u32 = 1 << 1;
pub const AN_REQ_HTTP_PROCESS_FE: u32 = 1 << 2;
pub const AN_REQ_HTTP_PROCESS_BE: u32 = 1 << 3;
pub const AN_REQ_HTTP_TARPIT: u32 = 1 << 4;
pub const AN_REQ_HTTP_XFER_BODY: u32 = 1 << 5;

pub const AN_RES_WAIT_HTTP: u32 = 1 << 6;
pub const AN_RES_HTTP_PROCESS: u32 = 1 << 7;
pub const AN_RES_HTTP_XFER_BODY: u32 = 1 << 8;

pub const REQUEST_PIPELINE: u32 = AN_REQ_WAIT_HTTP
    | AN_REQ_HTTP_BODY
    | AN_REQ_HTTP_PROCESS_FE
    | AN_REQ_HTTP_PROCESS_BE
    | AN_REQ_HTTP_TARPIT
    | AN_REQ_HTTP_XFER_BODY;
pub const RESPONSE_PIPELINE: u32 = AN_RES_WAIT_HTTP | AN_RES_HTTP_PROCESS | AN_RES_HTTP_XFER_BODY;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    KeepAlive,
    Close,
    Tunnel,
}

/// Per-stream ambient knobs an analyser consults but does not own, kept
/// separate from `HttpMessage` so request/response analysers can share them
/// without both needing a `&mut` handle to each other's message state.
pub struct AnalyzeCtx {
    pub tarpit_until: Tick,
    /// set by an external rule-evaluation hook (ACL matching is out of scope
    /// here, spec.md §1) to request that [`process_fe`] arm `tarpit_until`
    /// the next time it runs. See [`AnalyzeCtx::request_tarpit`].
    pub tarpit_requested: bool,
    /// mirrors `tarpit_requested`/`tarpit_until`'s shape for
    /// `wait_for_request_body`: `ETERNITY` means no rule asked to hold the
    /// request for full-body inspection, so the analyser is a no-op.
    pub wait_body_until: Tick,
    pub mode: ConnectionMode,
    pub expect_100: bool,
    pub continue_sent: bool,
    /// the request's method was `CONNECT`; combined with a 2xx response this
    /// flips the transaction to [`ConnectionMode::Tunnel`].
    pub request_is_connect: bool,
}

impl Default for AnalyzeCtx {
    fn default() -> Self {
        Self {
            tarpit_until: crate::clock::ETERNITY,
            tarpit_requested: false,
            wait_body_until: crate::clock::ETERNITY,
            mode: ConnectionMode::KeepAlive,
            expect_100: false,
            continue_sent: false,
            request_is_connect: false,
        }
    }
}

impl AnalyzeCtx {
    /// Ask the pipeline to tarpit this request once it reaches
    /// [`process_fe`]. The caller (a future ACL/rule engine, or a test)
    /// decides *whether* to tarpit; this only arms the mechanism.
    pub fn request_tarpit(&mut self) {
        self.tarpit_requested = true;
    }
}

#[derive(Debug)]
pub enum AnResult {
    /// one or more bits were cleared; caller should re-scan from the
    /// lowest bit.
    Progressed,
    /// the lowest set bit's analyser needs more data or a timer to fire;
    /// stop scanning until the channel is re-signalled.
    Suspended,
    /// the stream must end with this error.
    Terminate(SessionError),
}

/// `ParseError::TeNotLast` is a request-smuggling defense tripping, not a
/// plain protocol violation: spec.md classifies it `ERR_PRXCOND` with a
/// status fixed by which side detected it, independent of `ErrKind`'s usual
/// per-kind mapping.
fn parse_error_to_session(e: ParseError, is_response: bool) -> SessionError {
    let phase = if is_response { ErrPhase::Headers } else { ErrPhase::Request };
    if e == ParseError::TeNotLast {
        let status = if is_response { 502 } else { 400 };
        return SessionError::with_status(ErrKind::ProxyCondition, phase, status);
    }
    let kind = if is_response { ErrKind::ServerError } else { ErrKind::ClientError };
    SessionError::new(kind, phase)
}

fn wait_http(msg: &mut HttpMessage, chan: &mut Channel, ctx: &mut AnalyzeCtx, bit: u32) -> AnResult {
    loop {
        if !chan.analysers_can_progress() {
            let err_kind = if msg.is_response { ErrKind::ServerAbort } else { ErrKind::ClientAbort };
            let phase = if msg.is_response { ErrPhase::Headers } else { ErrPhase::Request };
            return AnResult::Terminate(SessionError::new(err_kind, phase));
        }
        match parser::step(msg, chan.buf_mut()) {
            Ok(StepOutcome::Progress) => continue,
            Ok(StepOutcome::NeedMore) => return AnResult::Suspended,
            Ok(StepOutcome::Done) => {
                if msg.is_response
                    && (msg.status_code == 101 || (ctx.request_is_connect && (200..300).contains(&msg.status_code)))
                {
                    msg.body = super::message::BodyCoding::Tunnel;
                    msg.state = MsgState::Tunnel;
                    ctx.mode = ConnectionMode::Tunnel;
                }
                chan.analysers &= !bit;
                return AnResult::Progressed;
            }
            Err(e) => return AnResult::Terminate(parse_error_to_session(e, msg.is_response)),
        }
    }
}

/// Holds the request until its body has fully arrived, for a rule that needs
/// to inspect it before `process_request` runs. Same no-op-until-armed shape
/// as [`tarpit`]: `wait_body_until == ETERNITY` means no rule asked for this,
/// so the bit just clears. Predicate evaluation deciding whether to wait is
/// out of scope here (spec.md §1); only the waiting mechanism is implemented.
fn wait_for_request_body(ctx: &mut AnalyzeCtx, chan: &mut Channel, now: Tick, bit: u32) -> AnResult {
    if ctx.wait_body_until == crate::clock::ETERNITY || crate::clock::is_expired(ctx.wait_body_until, now) {
        chan.analysers &= !bit;
        return AnResult::Progressed;
    }
    if !chan.analysers_can_progress() {
        chan.analysers &= !bit;
        return AnResult::Progressed;
    }
    chan.set_analyse_exp(ctx.wait_body_until);
    AnResult::Suspended
}

/// On expiry this is not a silent no-op: spec.md §4.7/§8 requires a tarpit
/// timing out to end the session with a synthesized 500 and `FINST_T`,
/// without ever having connected to the backend.
fn tarpit(chan: &mut Channel, ctx: &mut AnalyzeCtx, now: Tick, bit: u32) -> AnResult {
    if ctx.tarpit_until == crate::clock::ETERNITY {
        chan.analysers &= !bit;
        return AnResult::Progressed;
    }
    if crate::clock::is_expired(ctx.tarpit_until, now) {
        return AnResult::Terminate(SessionError::with_status(ErrKind::ProxyCondition, ErrPhase::Tarpit, 500));
    }
    chan.set_analyse_exp(ctx.tarpit_until);
    AnResult::Suspended
}

fn header_value<'a>(msg: &HttpMessage, bytes: &'a [u8], name: &str) -> Option<&'a [u8]> {
    msg.headers.find(bytes, name).next().map(|h| &bytes[h.value.start as usize..h.value.end as usize])
}

/// Computes keep-alive vs close from the `Connection` header and HTTP
/// version, the same precedence `xitca-http` applies in its h1 codec:
/// HTTP/1.0 defaults to close unless `Connection: keep-alive` is present;
/// HTTP/1.1 defaults to keep-alive unless `Connection: close` is present.
fn compute_connection_mode(msg: &HttpMessage, bytes: &[u8]) -> ConnectionMode {
    let conn = header_value(msg, bytes, "connection");
    let says_close = conn.map(|v| v.eq_ignore_ascii_case(b"close")).unwrap_or(false);
    let says_keepalive = conn.map(|v| v.eq_ignore_ascii_case(b"keep-alive")).unwrap_or(false);

    if says_close {
        ConnectionMode::Close
    } else if msg.version_minor == 0 {
        if says_keepalive { ConnectionMode::KeepAlive } else { ConnectionMode::Close }
    } else {
        ConnectionMode::KeepAlive
    }
}

fn process_fe(msg: &mut HttpMessage, chan: &mut Channel, ctx: &mut AnalyzeCtx, now: Tick, tarpit_ms: u64, bit: u32) -> AnResult {
    let len = chan.buf().len();
    let (parts, _) = chan.buf().get_block_nc(0, len);
    let bytes = parts[0];

    ctx.mode = compute_connection_mode(msg, bytes);
    ctx.request_is_connect = msg.method.map(|(s, e)| &bytes[s as usize..e as usize] == b"CONNECT").unwrap_or(false);
    ctx.expect_100 = msg.version_minor == 1
        && header_value(msg, bytes, "expect").map(|v| v.eq_ignore_ascii_case(b"100-continue")).unwrap_or(false);

    if ctx.expect_100 {
        // The interim response is queued by `Stream::process` once it sees
        // this flag (it owns the response channel `process_fe` does not);
        // the header is stripped here so it never reaches the backend.
        let removed = parser::strip_headers_named(chan.buf_mut(), &mut msg.headers, "expect");
        msg.cursor -= removed;
    }

    if ctx.tarpit_requested && ctx.tarpit_until == crate::clock::ETERNITY {
        ctx.tarpit_until = crate::clock::add_ms(now, tarpit_ms);
    }

    chan.analysers &= !bit;
    AnResult::Progressed
}

fn process_be(chan: &mut Channel, bit: u32) -> AnResult {
    chan.analysers &= !bit;
    AnResult::Progressed
}

fn process_res(ctx: &mut AnalyzeCtx, msg: &HttpMessage, chan: &mut Channel, bit: u32) -> AnResult {
    let len = chan.buf().input_len() + chan.buf().output_len();
    let (parts, _) = chan.buf().get_block_nc(0, len);
    let bytes = parts[0];
    if ctx.mode != ConnectionMode::Close {
        ctx.mode = compute_connection_mode(msg, bytes);
    }
    chan.analysers &= !bit;
    AnResult::Progressed
}

/// Forwards body bytes transparently, driving `BodyCoding` to completion.
/// `Length` and `Eof` bodies are just `Channel::forward` windows; `Chunked`
/// additionally walks [`parser::chunk_step`] one byte at a time over the
/// buffered input to find chunk boundaries before forwarding.
fn xfer_body(msg: &mut HttpMessage, chan: &mut Channel, bit: u32) -> AnResult {
    loop {
        match &mut msg.body {
            BodyCoding::None => {
                msg.state = MsgState::Done;
                chan.analysers &= !bit;
                return AnResult::Progressed;
            }
            BodyCoding::Length(remaining) => {
                let avail = chan.buf().input_len() as u64;
                if *remaining == 0 {
                    msg.state = MsgState::Done;
                    chan.analysers &= !bit;
                    return AnResult::Progressed;
                }
                if avail == 0 {
                    if !chan.analysers_can_progress() {
                        let kind = if msg.is_response { ErrKind::ServerAbort } else { ErrKind::ClientAbort };
                        return AnResult::Terminate(SessionError::new(kind, ErrPhase::Data));
                    }
                    return AnResult::Suspended;
                }
                let take = avail.min(*remaining);
                chan.forward(take);
                let moved = chan.forward_available();
                *remaining -= moved;
                if *remaining == 0 {
                    msg.state = MsgState::Done;
                    chan.analysers &= !bit;
                    return AnResult::Progressed;
                }
                return AnResult::Suspended;
            }
            BodyCoding::Eof => {
                let avail = chan.buf().input_len() as u64;
                if avail > 0 {
                    chan.forward(avail);
                    chan.forward_available();
                }
                if chan.flags.contains(ChannelFlags::READ_NULL) {
                    msg.state = MsgState::Done;
                    chan.analysers &= !bit;
                    return AnResult::Progressed;
                }
                return AnResult::Suspended;
            }
            BodyCoding::Chunked { state, remaining } => {
                if *state == ChunkedState::End {
                    msg.state = MsgState::Done;
                    chan.analysers &= !bit;
                    return AnResult::Progressed;
                }
                if *remaining > 0 {
                    let avail = chan.buf().input_len() as u64;
                    if avail == 0 {
                        return AnResult::Suspended;
                    }
                    let take = avail.min(*remaining);
                    chan.forward(take);
                    let moved = chan.forward_available();
                    *remaining -= moved;
                    if *remaining == 0 {
                        *state = ChunkedState::BodyCr;
                    }
                    continue;
                }
                let len = chan.buf().input_len();
                if len == 0 {
                    return AnResult::Suspended;
                }
                let (parts, _) = chan.buf().get_block_nc(chan.buf().output_len(), 1);
                let byte = match parts[0].first().or_else(|| parts[1].first()) {
                    Some(b) => *b,
                    None => return AnResult::Suspended,
                };
                match parser::chunk_step(*state, byte, *remaining) {
                    Ok((next, new_size)) => {
                        *state = next;
                        *remaining = new_size;
                        chan.buf_mut().drop_input(1);
                    }
                    Err(_) => {
                        let kind = if msg.is_response { ErrKind::ServerError } else { ErrKind::ClientError };
                        return AnResult::Terminate(SessionError::new(kind, ErrPhase::Data));
                    }
                }
            }
        }
    }
}

/// Runs the request-side pipeline until it suspends, terminates, or every
/// bit in `chan.analysers & REQUEST_PIPELINE` has cleared. `tarpit_ms` is the
/// `timeout.tarpit` value `process_fe` arms `tarpit_until` with when a rule
/// requests a tarpit (see [`AnalyzeCtx::request_tarpit`]).
pub fn run_request(msg: &mut HttpMessage, chan: &mut Channel, ctx: &mut AnalyzeCtx, now: Tick, tarpit_ms: u64) -> AnResult {
    loop {
        let active = chan.analysers & REQUEST_PIPELINE;
        if active == 0 {
            return AnResult::Progressed;
        }
        let bit = 1u32 << active.trailing_zeros();
        let result = match bit {
            AN_REQ_WAIT_HTTP => wait_http(msg, chan, ctx, bit),
            AN_REQ_HTTP_BODY => wait_for_request_body(ctx, chan, now, bit),
            AN_REQ_HTTP_PROCESS_FE => process_fe(msg, chan, ctx, now, tarpit_ms, bit),
            AN_REQ_HTTP_PROCESS_BE => process_be(chan, bit),
            AN_REQ_HTTP_TARPIT => tarpit(chan, ctx, now, bit),
            AN_REQ_HTTP_XFER_BODY => xfer_body(msg, chan, bit),
            _ => unreachable!("bit not in REQUEST_PIPELINE"),
        };
        match result {
            AnResult::Progressed => continue,
            other => return other,
        }
    }
}

pub fn run_response(msg: &mut HttpMessage, chan: &mut Channel, ctx: &mut AnalyzeCtx) -> AnResult {
    loop {
        let active = chan.analysers & RESPONSE_PIPELINE;
        if active == 0 {
            return AnResult::Progressed;
        }
        let bit = 1u32 << active.trailing_zeros();
        let result = match bit {
            AN_RES_WAIT_HTTP => wait_http(msg, chan, ctx, bit),
            AN_RES_HTTP_PROCESS => process_res(ctx, msg, chan, bit),
            AN_RES_HTTP_XFER_BODY => xfer_body(msg, chan, bit),
            _ => unreachable!("bit not in RESPONSE_PIPELINE"),
        };
        match result {
            AnResult::Progressed => continue,
            other => return other,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::channel::Channel;

    #[test]
    fn request_pipeline_runs_to_completion_on_full_buffer() {
        let mut chan = Channel::new(4096, 0, false);
        chan.buf_mut().put_block(b"GET / HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n").unwrap();
        chan.analysers = REQUEST_PIPELINE;
        let mut msg = HttpMessage::new(false);
        let mut ctx = AnalyzeCtx::default();
        let result = run_request(&mut msg, &mut chan, &mut ctx, 0, 0);
        assert!(matches!(result, AnResult::Progressed));
        assert_eq!(chan.analysers, 0);
        assert_eq!(ctx.mode, ConnectionMode::Close);
    }

    #[test]
    fn request_pipeline_suspends_on_incomplete_headers() {
        let mut chan = Channel::new(4096, 0, false);
        chan.buf_mut().put_block(b"GET / HTTP/1.1\r\n").unwrap();
        chan.analysers = REQUEST_PIPELINE;
        let mut msg = HttpMessage::new(false);
        let mut ctx = AnalyzeCtx::default();
        let result = run_request(&mut msg, &mut chan, &mut ctx, 0, 0);
        assert!(matches!(result, AnResult::Suspended));
    }

    #[test]
    fn tarpit_requested_holds_request_then_terminates_with_500_finst_t() {
        let mut chan = Channel::new(4096, 0, false);
        chan.buf_mut().put_block(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n").unwrap();
        chan.analysers = REQUEST_PIPELINE;
        let mut msg = HttpMessage::new(false);
        let mut ctx = AnalyzeCtx::default();
        ctx.request_tarpit();

        // armed for 1000ms at t=0; not yet expired at t=0.
        let result = run_request(&mut msg, &mut chan, &mut ctx, 0, 1000);
        assert_eq!(ctx.tarpit_until, 1000);
        assert!(matches!(result, AnResult::Suspended));
        assert!(chan.analysers & AN_REQ_HTTP_TARPIT != 0, "tarpit bit must stay set while armed");

        // still pending just before the deadline.
        let result = run_request(&mut msg, &mut chan, &mut ctx, 999, 1000);
        assert!(matches!(result, AnResult::Suspended));

        // expired: synthesizes the 500/FINST_T termination, never reaching
        // HTTP_XFER_BODY or a backend connect.
        let result = run_request(&mut msg, &mut chan, &mut ctx, 1000, 1000);
        match result {
            AnResult::Terminate(e) => {
                assert_eq!(e.effective_status(), Some(500));
                assert_eq!(e.phase, ErrPhase::Tarpit);
            }
            other => panic!("expected Terminate, got {other:?}"),
        }
    }

    #[test]
    fn tarpit_not_requested_is_a_no_op() {
        let mut chan = Channel::new(4096, 0, false);
        chan.buf_mut().put_block(b"GET / HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n").unwrap();
        chan.analysers = REQUEST_PIPELINE;
        let mut msg = HttpMessage::new(false);
        let mut ctx = AnalyzeCtx::default();
        let result = run_request(&mut msg, &mut chan, &mut ctx, 0, 30_000);
        assert!(matches!(result, AnResult::Progressed));
        assert_eq!(ctx.tarpit_until, crate::clock::ETERNITY);
    }

    #[test]
    fn wait_for_request_body_is_a_no_op_unless_armed() {
        let mut chan = Channel::new(64, 0, false);
        let mut ctx = AnalyzeCtx::default();
        let result = wait_for_request_body(&mut ctx, &mut chan, 0, AN_REQ_HTTP_BODY);
        assert!(matches!(result, AnResult::Progressed));
        assert_eq!(chan.analysers, 0);
    }

    #[test]
    fn request_pipeline_bit_order_matches_spec() {
        assert!(AN_REQ_WAIT_HTTP < AN_REQ_HTTP_BODY);
        assert!(AN_REQ_HTTP_BODY < AN_REQ_HTTP_PROCESS_FE);
        assert!(AN_REQ_HTTP_PROCESS_FE < AN_REQ_HTTP_PROCESS_BE);
        assert!(AN_REQ_HTTP_PROCESS_BE < AN_REQ_HTTP_TARPIT);
        assert!(AN_REQ_HTTP_TARPIT < AN_REQ_HTTP_XFER_BODY);
    }
}
