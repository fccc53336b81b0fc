//! Per-direction HTTP/1 message state (spec.md §5.1).
//!
//! `MsgState` tracks how far the incremental parser has gotten through one
//! message (request or response); `BodyCoding` tracks how the remainder of
//! the body should be forwarded once headers are complete. The `Chunked`
//! variant's state machine is a direct generalization of `xitca-http`'s
//! `h1::proto::codec::ChunkedState` to a decode-only role (that module fuses
//! encode and decode; a proxy only ever needs to track decode progress on
//! the read side and can reuse the same cursor shape for re-encoding).

use super::header::HeaderList;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgState {
    /// before the first byte of the start line has arrived.
    Before,
    /// parsing the request-line / status-line.
    StartLine,
    /// parsing header field lines.
    Hdr,
    /// the blank line terminating the header block has been seen.
    Eoh,
    /// forwarding a length- or EOF-delimited body transparently.
    Body,
    /// forwarding a chunked body; see [`ChunkedState`] for the sub-FSM.
    Chunked,
    /// trailer headers following the terminating chunk.
    Trailers,
    /// a `100-continue` interim response has been sent/received; still
    /// waiting for the real status line.
    Sent100,
    /// message fully parsed and (for bodies being forwarded) fully drained.
    Done,
    /// this side initiated connection close; draining until empty.
    Closing,
    Closed,
    /// switched protocols / CONNECT established: bytes pass through
    /// unparsed from here on.
    Tunnel,
    /// a close is pending once in-flight forwarding ends.
    Ending,
    Error,
}

impl MsgState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, MsgState::Done | MsgState::Closed | MsgState::Error)
    }
}

/// Mirrors `ChunkedState` in `xitca-http`'s `h1::proto::codec`, minus the
/// encode-side variants this proxy never produces itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkedState {
    Size,
    SizeLws,
    Extension,
    SizeLf,
    Body,
    BodyCr,
    BodyLf,
    Trailer,
    TrailerLf,
    EndCr,
    EndLf,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyCoding {
    /// no body: `HEAD`, `204`, `304`, or a response to `CONNECT`.
    None,
    /// exactly `n` bytes remain, decremented as they are forwarded.
    Length(u64),
    /// `Transfer-Encoding: chunked`; `state` tracks progress through the
    /// current chunk, `remaining` the bytes left in the chunk body once
    /// a size has been parsed.
    Chunked { state: ChunkedState, remaining: u64 },
    /// no `Content-Length` and no chunked coding: body runs until the
    /// connection closes (only legal on a response).
    Eof,
    /// `CONNECT` answered 2xx, or a `101 Switching Protocols`: both
    /// directions forward raw bytes with no further HTTP framing.
    Tunnel,
}

pub struct HttpMessage {
    pub state: MsgState,
    pub is_response: bool,
    pub method: Option<(u32, u32)>,
    pub uri: Option<(u32, u32)>,
    pub status_code: u16,
    pub version_minor: u8,
    pub headers: HeaderList,
    pub body: BodyCoding,
    /// logical offset into the channel's buffer where the next parse step
    /// resumes; lets `parser::step` be called repeatedly as more bytes
    /// arrive without re-scanning what was already consumed.
    pub cursor: u32,
}

impl HttpMessage {
    pub fn new(is_response: bool) -> Self {
        Self {
            state: MsgState::Before,
            is_response,
            method: None,
            uri: None,
            status_code: 0,
            version_minor: 1,
            headers: HeaderList::new(),
            body: BodyCoding::None,
            cursor: 0,
        }
    }

    pub fn reset_for_next_message(&mut self) {
        self.state = MsgState::Before;
        self.method = None;
        self.uri = None;
        self.status_code = 0;
        self.headers.clear();
        self.body = BodyCoding::None;
        self.cursor = 0;
    }

    /// request methods with no expected request body per RFC semantics,
    /// used to default `Content-Length`-less requests to `BodyCoding::None`
    /// rather than `Eof` (which is nonsensical for a request).
    pub fn implies_no_body(method: &[u8]) -> bool {
        matches!(method, b"GET" | b"HEAD" | b"DELETE" | b"TRACE" | b"CONNECT")
    }
}
