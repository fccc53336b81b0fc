//! Peer synchronization protocol (spec.md §4.9).
//!
//! A binary, length-prefixed protocol for propagating shared stick-table
//! updates between sibling instances. Two phases: a line-oriented text
//! handshake (`HAProxyS <maj>.<min>` + peer names, answered by a status
//! line), then a binary streaming phase of `class(1) | type(1) |
//! varint_len | payload` frames. Framed incrementally the same way
//! `rproxy-core::http::parser` frames HTTP: `step`-style functions that
//! make as much progress as the buffered bytes allow and return `NeedMore`
//! rather than blocking, since this is driven by the same cooperative
//! scheduler as every other applet.

use std::collections::HashMap;
use std::fmt;

use tracing::{debug, trace, warn};

use crate::channel::Channel;
use crate::clock::{self, Tick};

use super::{Applet, AppletResult};

pub const PROTO_MAJOR: u8 = 2;
pub const PROTO_MINOR: u8 = 1;
pub const PROTO_MINOR_DOWNGRADE: u8 = 0;

/// Trash-sized cap on a single frame's payload (spec.md §5 "Trash").
pub const MAX_PAYLOAD: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerProtoError {
    VarintOverflow,
    PayloadTooLarge,
    TruncatedFrame,
    BadHandshakeLine,
    UnknownClass(u8),
    UnknownType(u8, u8),
    BadKey,
    Reserved,
}

impl fmt::Display for PeerProtoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VarintOverflow => write!(f, "varint exceeds 64 bits"),
            Self::PayloadTooLarge => write!(f, "frame payload exceeds trash size ({MAX_PAYLOAD} bytes)"),
            Self::TruncatedFrame => write!(f, "frame payload shorter than declared length"),
            Self::BadHandshakeLine => write!(f, "malformed handshake line"),
            Self::UnknownClass(c) => write!(f, "unknown message class {c}"),
            Self::UnknownType(c, t) => write!(f, "unknown message type {t} for class {c}"),
            Self::BadKey => write!(f, "malformed table key"),
            Self::Reserved => write!(f, "class=255 (RESERVED) rejected"),
        }
    }
}

impl std::error::Error for PeerProtoError {}

// ---------------------------------------------------------------------
// varint: 240-threshold, 7-bit little-endian continuation (spec.md §4.9).
// ---------------------------------------------------------------------

/// Encode `v` per the 240-threshold varint scheme, appending to `out`.
/// Matches `decode_varint`'s inverse exactly: `decode(encode(v)) == v` for
/// every `v` and the encoding never exceeds 10 bytes (spec.md §8).
pub fn encode_varint(v: u64, out: &mut Vec<u8>) {
    if v < 240 {
        out.push(v as u8);
        return;
    }
    out.push((v as u8) | 0xF0);
    let mut rem = (v - 240) >> 4;
    while rem >= 128 {
        out.push((rem as u8) | 0x80);
        rem = (rem - 128) >> 7;
    }
    out.push(rem as u8);
}

/// Decode a varint from the front of `buf`. Returns `Ok(None)` if `buf`
/// does not yet hold a complete encoding (caller should wait for more
/// bytes), `Err` on overflow (more than 9 continuation bytes, which can
/// never happen for a value that fits `u64`).
pub fn decode_varint(buf: &[u8]) -> Result<Option<(u64, usize)>, PeerProtoError> {
    let Some(&first) = buf.first() else { return Ok(None) };
    if first < 240 {
        return Ok(Some((first as u64, 1)));
    }
    let mut value = first as u64;
    let mut shift: u32 = 4;
    let mut idx = 1usize;
    loop {
        if idx > 9 {
            return Err(PeerProtoError::VarintOverflow);
        }
        let Some(&b) = buf.get(idx) else { return Ok(None) };
        idx += 1;
        value = value.wrapping_add(((b & 0x7F) as u64) << shift);
        shift += 7;
        if b < 128 {
            return Ok(Some((value, idx)));
        }
    }
}

// ---------------------------------------------------------------------
// Frame classes/types
// ---------------------------------------------------------------------

pub const CLASS_CONTROL: u8 = 0;
pub const CLASS_ERROR: u8 = 1;
pub const CLASS_STICKTABLE: u8 = 10;
pub const CLASS_RESERVED: u8 = 255;

pub const CTRL_RESYNCREQ: u8 = 0;
pub const CTRL_RESYNCFINISHED: u8 = 1;
pub const CTRL_RESYNCPARTIAL: u8 = 2;
pub const CTRL_RESYNCCONFIRM: u8 = 3;

pub const ST_UPDATE: u8 = 0x80;
pub const ST_INCUPDATE: u8 = 0x81;
pub const ST_DEFINE: u8 = 0x82;
pub const ST_SWITCH: u8 = 0x83;
pub const ST_ACK: u8 = 0x84;
pub const ST_UPDATE_TIMED: u8 = 0x85;
pub const ST_INCUPDATE_TIMED: u8 = 0x86;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub class: u8,
    pub ty: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(class: u8, ty: u8, payload: Vec<u8>) -> Self {
        Self { class, ty, payload }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.class);
        out.push(self.ty);
        encode_varint(self.payload.len() as u64, out);
        out.extend_from_slice(&self.payload);
    }
}

/// Incrementally parse one frame from the front of `buf`. `Ok(None)` means
/// "not enough bytes yet"; the caller must not consume anything in that
/// case. On success, returns the frame and the number of bytes it spans so
/// the caller can drop exactly that many from the input.
pub fn try_parse_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>, PeerProtoError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let class = buf[0];
    let ty = buf[1];
    let Some((len, len_bytes)) = decode_varint(&buf[2..])? else {
        return Ok(None);
    };
    if len as usize > MAX_PAYLOAD {
        return Err(PeerProtoError::PayloadTooLarge);
    }
    let header_len = 2 + len_bytes;
    let total = header_len + len as usize;
    if buf.len() < total {
        return Ok(None);
    }
    let payload = buf[header_len..total].to_vec();
    Ok(Some((Frame::new(class, ty, payload), total)))
}

// ---------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    Success = 200,
    TryAgain = 300,
    Proto = 501,
    Version = 502,
    Host = 503,
    Peer = 504,
}

impl HandshakeStatus {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            200 => Some(Self::Success),
            300 => Some(Self::TryAgain),
            501 => Some(Self::Proto),
            502 => Some(Self::Version),
            503 => Some(Self::Host),
            504 => Some(Self::Peer),
            _ => None,
        }
    }

    pub const fn code(self) -> u32 {
        self as u32
    }
}

/// `HAProxyS <maj>.<min>\n<remote-peer-name>\n<local-peer-name> <pid> <relative_pid>\n`
pub fn encode_greeting(maj: u8, min: u8, remote_name: &str, local_name: &str, pid: u32, relative_pid: u32) -> Vec<u8> {
    format!("HAProxyS {maj}.{min}\n{remote_name}\n{local_name} {pid} {relative_pid}\n").into_bytes()
}

pub struct ParsedGreeting {
    pub major: u8,
    pub minor: u8,
    pub remote_name: String,
    pub local_name: String,
    pub pid: u32,
    pub relative_pid: u32,
}

pub fn parse_greeting(lines: &[&str]) -> Result<ParsedGreeting, PeerProtoError> {
    let [l0, l1, l2] = lines else { return Err(PeerProtoError::BadHandshakeLine) };
    let rest = l0.strip_prefix("HAProxyS ").ok_or(PeerProtoError::BadHandshakeLine)?;
    let (maj_s, min_s) = rest.split_once('.').ok_or(PeerProtoError::BadHandshakeLine)?;
    let major: u8 = maj_s.trim().parse().map_err(|_| PeerProtoError::BadHandshakeLine)?;
    let minor: u8 = min_s.trim().parse().map_err(|_| PeerProtoError::BadHandshakeLine)?;
    let remote_name = l1.trim().to_string();
    let mut parts = l2.trim().split_whitespace();
    let local_name = parts.next().ok_or(PeerProtoError::BadHandshakeLine)?.to_string();
    let pid: u32 = parts.next().and_then(|s| s.parse().ok()).ok_or(PeerProtoError::BadHandshakeLine)?;
    let relative_pid: u32 = parts.next().and_then(|s| s.parse().ok()).ok_or(PeerProtoError::BadHandshakeLine)?;
    Ok(ParsedGreeting { major, minor, remote_name, local_name, pid, relative_pid })
}

pub fn encode_status_line(status: HandshakeStatus) -> Vec<u8> {
    format!("{}\n", status.code()).into_bytes()
}

/// Major version mismatch is fatal (`501`/`504` territory); a minor we
/// cannot speak triggers a downgrade request (`502`) rather than tearing
/// the link down outright, per spec.md §4.9 "Version negotiation".
pub fn negotiate_version(peer_major: u8, peer_minor: u8) -> Result<u8, HandshakeStatus> {
    if peer_major != PROTO_MAJOR {
        return Err(HandshakeStatus::Version);
    }
    if peer_minor > PROTO_MINOR {
        return Err(HandshakeStatus::Version);
    }
    Ok(peer_minor)
}

// ---------------------------------------------------------------------
// Shared-table data model
// ---------------------------------------------------------------------

/// Stick-table column types a `DEFINE` payload may announce, per spec.md
/// §4.9's `UPDATE`/`INCUPDATE` payload rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Sint,
    Uint,
    Ull,
    /// frequency counter: `(period_ms, ticks_since_curr, curr_ctr, prev_ctr)`.
    Frqp { period_ms: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnValue {
    Sint(i64),
    Uint(u64),
    Ull(u64),
    Frqp { ticks_since_curr: u64, curr_ctr: u64, prev_ctr: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableKey {
    Str(Vec<u8>),
    Int(u32),
}

#[derive(Debug, Clone)]
pub struct TableEntry {
    pub update_id: u32,
    pub expire_at: Tick,
    pub data: Vec<ColumnValue>,
}

/// A replicated keyed store: spec.md §3 "Shared table". One instance per
/// stick-table section, shared by every peer link that speaks about it.
#[derive(Debug, Clone)]
pub struct SharedTable {
    pub name: String,
    pub columns: Vec<ColumnType>,
    pub expire_ms: u64,
    /// this process's id for the table when *we* teach it (sent in our
    /// `DEFINE`).
    pub local_id: u32,
    /// the id the remote side assigned in *its* `DEFINE`; `None` until a
    /// `DEFINE` for this table has been received from that peer.
    pub remote_id: Option<u32>,
    pub remote_data: u32,
    pub last_pushed: u32,
    pub last_acked: u32,
    pub last_get: u32,
    pub teaching_origin: u32,
    /// highest contiguous update id applied from the remote teacher
    /// (the "contiguity gate", spec.md §8).
    remote_update: u32,
    entries: HashMap<Vec<u8>, TableEntry>,
}

impl SharedTable {
    pub fn new(name: impl Into<String>, local_id: u32, columns: Vec<ColumnType>, expire_ms: u64) -> Self {
        Self {
            name: name.into(),
            columns,
            expire_ms,
            local_id,
            remote_id: None,
            remote_data: 0,
            last_pushed: 0,
            last_acked: 0,
            last_get: 0,
            teaching_origin: 0,
            remote_update: 0,
            entries: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn remote_update(&self) -> u32 {
        self.remote_update
    }

    /// §8 invariant: `last_acked <= last_get <= last_pushed` in the push
    /// direction.
    pub fn push_invariant_holds(&self) -> bool {
        self.last_acked <= self.last_get && self.last_get <= self.last_pushed
    }

    /// Apply an incoming update. `explicit_id` is `Some` for `UPDATE`
    /// (non-contiguous or first), `None` for `INCUPDATE` (implicitly
    /// `remote_update + 1`). Returns whether the entry was applied or
    /// dropped as a gap (spec.md §8 "contiguity gate", §8 scenario 6).
    pub fn apply_update(&mut self, explicit_id: Option<u32>, key: Vec<u8>, data: Vec<ColumnValue>, expire_at: Tick) -> bool {
        let id = explicit_id.unwrap_or_else(|| self.remote_update.wrapping_add(1));
        if id != self.remote_update.wrapping_add(1) {
            debug!(table = %self.name, id, expected = self.remote_update + 1, "dropping non-contiguous update");
            return false;
        }
        self.entries.insert(key, TableEntry { update_id: id, expire_at, data });
        self.remote_update = id;
        true
    }

    pub fn get(&self, key: &[u8]) -> Option<&TableEntry> {
        self.entries.get(key)
    }

    /// Local write (e.g. a session bumping its own stick-table counter),
    /// queued to be taught to peers; bumps `last_pushed` so the teaching
    /// side of this table knows it has fresh data.
    pub fn local_update(&mut self, key: Vec<u8>, data: Vec<ColumnValue>, now: Tick) -> u32 {
        self.last_pushed += 1;
        let id = self.last_pushed;
        let expire_at = clock::add_ms(now, self.expire_ms);
        self.entries.insert(key, TableEntry { update_id: id, expire_at, data });
        id
    }
}

// ---------------------------------------------------------------------
// Peer / group state
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerFlags(pub(crate) u16);

impl PeerFlags {
    pub const TEACH_PROCESS: u16 = 1 << 0;
    pub const TEACH_FINISHED: u16 = 1 << 1;
    pub const TEACH_COMPLETE: u16 = 1 << 2;
    pub const LEARN_ASSIGN: u16 = 1 << 3;
    pub const LEARN_NOTUP2DATE: u16 = 1 << 4;
    pub const DWNGRD: u16 = 1 << 5;

    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn insert(&mut self, bits: u16) {
        self.0 |= bits;
    }

    pub fn remove(&mut self, bits: u16) {
        self.0 &= !bits;
    }

    pub const fn contains(&self, bits: u16) -> bool {
        (self.0 & bits) == bits
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    New,
    Connecting,
    Connected,
    Teaching,
    Learning,
    Errored,
}

pub struct Peer {
    pub name: String,
    pub status: PeerStatus,
    pub flags: PeerFlags,
    pub reconnect_deadline: Tick,
    pub confirm: u32,
    pub minor_in_use: u8,
    pub tables: Vec<SharedTable>,
}

impl Peer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: PeerStatus::New,
            flags: PeerFlags::empty(),
            reconnect_deadline: clock::ETERNITY,
            confirm: 0,
            minor_in_use: PROTO_MINOR,
            tables: Vec::new(),
        }
    }

    pub fn table_by_name_mut(&mut self, name: &str) -> Option<&mut SharedTable> {
        self.tables.iter_mut().find(|t| t.name == name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupFlags(u16);

impl GroupFlags {
    pub const RESYNC_LOCAL: u16 = 1 << 0;
    pub const RESYNC_REMOTE: u16 = 1 << 1;
    pub const RESYNC_ASSIGN: u16 = 1 << 2;
    pub const RESYNC_PROCESS: u16 = 1 << 3;
    pub const DONOTSTOP: u16 = 1 << 4;

    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn insert(&mut self, bits: u16) {
        self.0 |= bits;
    }

    pub fn remove(&mut self, bits: u16) {
        self.0 &= !bits;
    }

    pub const fn contains(&self, bits: u16) -> bool {
        (self.0 & bits) == bits
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncOrigin {
    FromLocal,
    FromRemote,
}

/// A peers section: spec.md §3 "Peers group" + §4.9 "Resync election".
/// Owns every [`Peer`] link this process maintains for one `peers` config
/// block and arbitrates which one (if any) is currently learning.
pub struct PeersGroup {
    pub flags: GroupFlags,
    pub resync_deadline: Tick,
    pub origin: ResyncOrigin,
    peers: Vec<Peer>,
    learner: Option<usize>,
}

impl PeersGroup {
    pub fn new(origin: ResyncOrigin) -> Self {
        Self { flags: GroupFlags::empty(), resync_deadline: clock::ETERNITY, origin, peers: Vec::new(), learner: None }
    }

    pub fn add_peer(&mut self, peer: Peer) -> usize {
        self.peers.push(peer);
        self.peers.len() - 1
    }

    pub fn peer(&self, idx: usize) -> &Peer {
        &self.peers[idx]
    }

    pub fn peer_mut(&mut self, idx: usize) -> &mut Peer {
        &mut self.peers[idx]
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// §8 invariant: at most one peer may hold `LEARN_ASSIGN` at a time.
    pub fn learner_count(&self) -> usize {
        self.peers.iter().filter(|p| p.flags.contains(PeerFlags::LEARN_ASSIGN)).count()
    }

    /// Called when `idx`'s session just reached handshake success (200).
    /// Implements the election in spec.md §4.9: `FromLocal` assigns the
    /// local peer session that just connected; `FromRemote` assigns the
    /// first remote success seen while no one else is assigned yet.
    pub fn on_connect_success(&mut self, idx: usize, is_local_session: bool) {
        if self.learner.is_some() {
            return;
        }
        let should_assign = match self.origin {
            ResyncOrigin::FromLocal => is_local_session,
            ResyncOrigin::FromRemote => !is_local_session,
        };
        if !should_assign {
            return;
        }
        self.learner = Some(idx);
        self.flags.insert(GroupFlags::RESYNC_ASSIGN);
        let peer = &mut self.peers[idx];
        peer.flags.insert(PeerFlags::LEARN_ASSIGN);
        peer.status = PeerStatus::Learning;
        trace!(peer = %peer.name, "assigned as resync learner");
    }

    /// Teacher signalled `CTRL_RESYNCFINISHED`: the learner replies
    /// `CTRL_RESYNCCONFIRM` and the group is fully synced.
    pub fn on_resync_finished(&mut self, idx: usize) {
        if self.learner != Some(idx) {
            return;
        }
        let peer = &mut self.peers[idx];
        peer.flags.remove(PeerFlags::LEARN_ASSIGN);
        peer.flags.remove(PeerFlags::LEARN_NOTUP2DATE);
        peer.status = PeerStatus::Connected;
        self.learner = None;
        self.flags.remove(GroupFlags::RESYNC_ASSIGN);
        self.flags.insert(GroupFlags::RESYNC_LOCAL | GroupFlags::RESYNC_REMOTE);
    }

    /// Teacher signalled `CTRL_RESYNCPARTIAL`: mark the learner
    /// `LEARN_NOTUP2DATE` and schedule a retry 5s out (spec.md §4.9).
    pub fn on_resync_partial(&mut self, idx: usize, now: Tick) {
        if self.learner != Some(idx) {
            return;
        }
        let peer = &mut self.peers[idx];
        peer.flags.remove(PeerFlags::LEARN_ASSIGN);
        peer.flags.insert(PeerFlags::LEARN_NOTUP2DATE);
        peer.status = PeerStatus::Connected;
        self.learner = None;
        self.flags.remove(GroupFlags::RESYNC_ASSIGN);
        self.resync_deadline = clock::add_ms(now, 5_000);
    }

    /// The learner session died before finishing: clear the assignment so
    /// another peer can be elected (spec.md §3 invariant on `LEARN_ASSIGN`).
    pub fn on_peer_disconnect(&mut self, idx: usize) {
        if self.learner == Some(idx) {
            self.learner = None;
            self.flags.remove(GroupFlags::RESYNC_ASSIGN);
        }
        let peer = &mut self.peers[idx];
        peer.flags.remove(PeerFlags::LEARN_ASSIGN);
        peer.status = PeerStatus::New;
    }

    pub fn learner_idx(&self) -> Option<usize> {
        self.learner
    }

    /// Soft-stop: the group gains `DONOTSTOP` while the local teacher
    /// finishes teaching everyone, per spec.md §4.9.
    pub fn begin_soft_stop(&mut self) {
        self.flags.insert(GroupFlags::DONOTSTOP);
    }
}

/// Randomized 50-2050ms reconnect delay used during soft-stop to avoid a
/// lock-step reconnection storm across every peer at once (spec.md §4.9).
pub fn soft_stop_reconnect_delay() -> u64 {
    50 + (rand::random::<u64>() % 2001)
}

// ---------------------------------------------------------------------
// Applet: drives one peer link's handshake then streaming phase.
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    SendGreeting,
    AwaitGreetingOrStatus,
    AwaitStatus,
    Streaming,
    Closed,
}

/// Which side of the handshake this applet instance plays. The peers
/// protocol is symmetric on the wire but asymmetric in who speaks first:
/// an initiator sends the greeting and waits for a status line; an
/// acceptor waits for the greeting and replies with a status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Acceptor,
}

/// Session applet implementing spec.md §4.9 over a [`Channel`] pair
/// (`input` carries bytes from the remote peer, `output` carries bytes to
/// it), mirroring how [`super::stats::StatsApplet`] is pumped against its
/// own channel pair rather than a socket directly.
pub struct PeerApplet {
    role: Role,
    phase: Phase,
    local_name: String,
    remote_name_expected: String,
    pid: u32,
    relative_pid: u32,
    negotiated_minor: Option<u8>,
    pub error: Option<PeerProtoError>,
}

impl PeerApplet {
    pub fn new(role: Role, local_name: impl Into<String>, remote_name_expected: impl Into<String>, pid: u32, relative_pid: u32) -> Self {
        Self {
            role,
            phase: Phase::SendGreeting,
            local_name: local_name.into(),
            remote_name_expected: remote_name_expected.into(),
            pid,
            relative_pid,
            negotiated_minor: None,
            error: None,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.phase == Phase::Streaming
    }

    pub fn negotiated_minor(&self) -> Option<u8> {
        self.negotiated_minor
    }

    fn take_line(input: &mut Channel) -> Option<Vec<u8>> {
        match input.buf().get_line_nc(input.buf().output_len()) {
            crate::buffer::LineNc::Line(parts, len) => {
                let mut owned = Vec::with_capacity(len);
                owned.extend_from_slice(parts[0]);
                owned.extend_from_slice(parts[1]);
                input.buf_mut().drop_input(len);
                Some(owned)
            }
            crate::buffer::LineNc::NoLine | crate::buffer::LineNc::NoLineFull => None,
        }
    }

    fn write(output: &mut Channel, bytes: &[u8]) -> bool {
        if output.channel_full(0) {
            return false;
        }
        output.buf_mut().put_block(bytes).is_ok()
    }

    /// Drive the handshake. Returns `Progress`/`Suspend` like any other
    /// applet step; on success the applet is left in `Phase::Streaming`.
    fn pump_handshake(&mut self, input: &mut Channel, output: &mut Channel) -> AppletResult {
        match self.phase {
            Phase::SendGreeting => {
                if self.role == Role::Initiator {
                    let greeting = encode_greeting(PROTO_MAJOR, PROTO_MINOR, &self.remote_name_expected, &self.local_name, self.pid, self.relative_pid);
                    if !Self::write(output, &greeting) {
                        return AppletResult::Suspend;
                    }
                    self.phase = Phase::AwaitStatus;
                } else {
                    self.phase = Phase::AwaitGreetingOrStatus;
                }
                AppletResult::Progress
            }
            Phase::AwaitGreetingOrStatus => {
                let mut lines = Vec::with_capacity(3);
                for _ in 0..3 {
                    match Self::take_line(input) {
                        Some(l) => lines.push(l),
                        None => return AppletResult::Suspend,
                    }
                }
                let strs: Vec<&str> = lines.iter().map(|l| std::str::from_utf8(l).unwrap_or("")).collect();
                match parse_greeting(&strs) {
                    Ok(greeting) => {
                        let status = match negotiate_version(greeting.major, greeting.minor) {
                            Ok(minor) => {
                                self.negotiated_minor = Some(minor);
                                HandshakeStatus::Success
                            }
                            Err(s) => s,
                        };
                        if !Self::write(output, &encode_status_line(status)) {
                            return AppletResult::Suspend;
                        }
                        if status == HandshakeStatus::Success {
                            self.phase = Phase::Streaming;
                        } else {
                            self.error = Some(PeerProtoError::BadHandshakeLine);
                            self.phase = Phase::Closed;
                        }
                    }
                    Err(e) => {
                        let _ = Self::write(output, &encode_status_line(HandshakeStatus::Proto));
                        self.error = Some(e);
                        self.phase = Phase::Closed;
                    }
                }
                AppletResult::Progress
            }
            Phase::AwaitStatus => {
                let Some(line) = Self::take_line(input) else {
                    return AppletResult::Suspend;
                };
                let s = std::str::from_utf8(&line).unwrap_or("").trim();
                let code: u32 = s.parse().unwrap_or(0);
                match HandshakeStatus::from_code(code) {
                    Some(HandshakeStatus::Success) => {
                        self.negotiated_minor = Some(PROTO_MINOR);
                        self.phase = Phase::Streaming;
                    }
                    Some(other) => {
                        warn!(status = ?other, peer = %self.remote_name_expected, "peer handshake rejected");
                        self.phase = Phase::Closed;
                    }
                    None => {
                        self.phase = Phase::Closed;
                    }
                }
                AppletResult::Progress
            }
            Phase::Streaming | Phase::Closed => AppletResult::Progress,
        }
    }

    /// One streaming-phase step: parse whatever complete frames are
    /// buffered and hand each to `on_frame`. `RESERVED` (class 255) is
    /// rejected outright per spec.md §9's authoritative "reject" stance.
    pub fn pump_stream(&mut self, input: &mut Channel, output: &mut Channel, mut on_frame: impl FnMut(&Frame, &mut Channel)) -> AppletResult {
        debug_assert_eq!(self.phase, Phase::Streaming);
        let mut progressed = false;
        loop {
            let avail = input.buf().input_len();
            let (parts, len) = input.buf().get_block_nc(input.buf().output_len(), avail);
            let mut bytes = Vec::with_capacity(len);
            bytes.extend_from_slice(parts[0]);
            bytes.extend_from_slice(parts[1]);
            match try_parse_frame(&bytes) {
                Ok(Some((frame, consumed))) => {
                    input.buf_mut().drop_input(consumed);
                    progressed = true;
                    if frame.class == CLASS_RESERVED {
                        self.error = Some(PeerProtoError::Reserved);
                        let err = Frame::new(CLASS_ERROR, 0, Vec::new());
                        let mut out = Vec::new();
                        err.encode(&mut out);
                        let _ = Self::write(output, &out);
                        self.phase = Phase::Closed;
                        return AppletResult::Done;
                    }
                    on_frame(&frame, output);
                }
                Ok(None) => break,
                Err(e) => {
                    self.error = Some(e);
                    let err = Frame::new(CLASS_ERROR, 0, Vec::new());
                    let mut out = Vec::new();
                    err.encode(&mut out);
                    let _ = Self::write(output, &out);
                    self.phase = Phase::Closed;
                    return AppletResult::Done;
                }
            }
        }
        if progressed {
            AppletResult::Progress
        } else {
            AppletResult::Suspend
        }
    }
}

impl Applet for PeerApplet {
    fn process(&mut self, input: &mut Channel, output: &mut Channel, _now: Tick) -> AppletResult {
        if self.phase != Phase::Streaming {
            return self.pump_handshake(input, output);
        }
        self.pump_stream(input, output, |_frame, _out| {})
    }
}

// ---------------------------------------------------------------------
// DEFINE / SWITCH / UPDATE / ACK payload encode-decode
// ---------------------------------------------------------------------

pub fn encode_define(local_id: u32, name: &str, key_size: u32, data_bitmask: u32, expire_ms: u32, freq_columns: &[(u8, u32)]) -> Vec<u8> {
    let mut out = Vec::new();
    encode_varint(local_id as u64, &mut out);
    encode_varint(name.len() as u64, &mut out);
    out.extend_from_slice(name.as_bytes());
    encode_varint(0 /* type: keyed table */, &mut out);
    encode_varint(key_size as u64, &mut out);
    encode_varint(data_bitmask as u64, &mut out);
    encode_varint(expire_ms as u64, &mut out);
    for &(ty, period) in freq_columns {
        encode_varint(ty as u64, &mut out);
        encode_varint(period as u64, &mut out);
    }
    out
}

pub struct DefineMsg {
    pub local_id: u32,
    pub name: String,
    pub key_size: u32,
    pub data_bitmask: u32,
    pub expire_ms: u32,
}

pub fn decode_define(payload: &[u8]) -> Result<DefineMsg, PeerProtoError> {
    let mut off = 0usize;
    let (local_id, n) = read_varint(payload, &mut off)?;
    let _ = n;
    let (name_len, _) = read_varint(payload, &mut off)?;
    let name_len = name_len as usize;
    let name_bytes = payload.get(off..off + name_len).ok_or(PeerProtoError::TruncatedFrame)?;
    off += name_len;
    let name = String::from_utf8_lossy(name_bytes).into_owned();
    let (_table_type, _) = read_varint(payload, &mut off)?;
    let (key_size, _) = read_varint(payload, &mut off)?;
    let (data_bitmask, _) = read_varint(payload, &mut off)?;
    let (expire_ms, _) = read_varint(payload, &mut off)?;
    Ok(DefineMsg { local_id: local_id as u32, name, key_size: key_size as u32, data_bitmask: data_bitmask as u32, expire_ms: expire_ms as u32 })
}

fn read_varint(buf: &[u8], off: &mut usize) -> Result<(u64, usize), PeerProtoError> {
    let (v, n) = decode_varint(&buf[*off..])?.ok_or(PeerProtoError::TruncatedFrame)?;
    *off += n;
    Ok((v, n))
}

pub fn encode_switch(remote_id: u32) -> Vec<u8> {
    let mut out = Vec::new();
    encode_varint(remote_id as u64, &mut out);
    out
}

pub fn decode_switch(payload: &[u8]) -> Result<u32, PeerProtoError> {
    let mut off = 0;
    let (id, _) = read_varint(payload, &mut off)?;
    Ok(id as u32)
}

pub fn encode_ack(remote_id: u32, update_id: u32) -> Vec<u8> {
    let mut out = Vec::new();
    encode_varint(remote_id as u64, &mut out);
    encode_varint(update_id as u64, &mut out);
    out
}

pub fn decode_ack(payload: &[u8]) -> Result<(u32, u32), PeerProtoError> {
    let mut off = 0;
    let (rid, _) = read_varint(payload, &mut off)?;
    let (uid, _) = read_varint(payload, &mut off)?;
    Ok((rid as u32, uid as u32))
}

/// Encode a string-keyed update. `explicit_id` distinguishes `UPDATE`
/// (`Some`, used for the first update or after a gap) from `INCUPDATE`
/// (`None`, implicit `last+1`); `remaining_expire_ms` is `Some` only for
/// the `_TIMED` variants.
pub fn update_frame_type(explicit_id: bool, timed: bool) -> u8 {
    match (explicit_id, timed) {
        (true, false) => ST_UPDATE,
        (false, false) => ST_INCUPDATE,
        (true, true) => ST_UPDATE_TIMED,
        (false, true) => ST_INCUPDATE_TIMED,
    }
}

pub fn encode_update(explicit_id: Option<u32>, remaining_expire_ms: Option<u32>, key: &TableKey, data: &[ColumnValue]) -> Vec<u8> {
    let mut out = Vec::new();
    if let Some(id) = explicit_id {
        out.extend_from_slice(&id.to_be_bytes());
    }
    if let Some(ms) = remaining_expire_ms {
        out.extend_from_slice(&ms.to_be_bytes());
    }
    match key {
        TableKey::Str(s) => {
            encode_varint(s.len() as u64, &mut out);
            out.extend_from_slice(s);
        }
        TableKey::Int(i) => out.extend_from_slice(&i.to_be_bytes()),
    }
    for v in data {
        match v {
            ColumnValue::Sint(i) => encode_varint(zigzag_encode(*i), &mut out),
            ColumnValue::Uint(u) | ColumnValue::Ull(u) => encode_varint(*u, &mut out),
            ColumnValue::Frqp { ticks_since_curr, curr_ctr, prev_ctr } => {
                encode_varint(*ticks_since_curr, &mut out);
                encode_varint(*curr_ctr, &mut out);
                encode_varint(*prev_ctr, &mut out);
            }
        }
    }
    out
}

fn zigzag_encode(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

fn zigzag_decode(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

pub struct DecodedUpdate {
    pub explicit_id: Option<u32>,
    pub remaining_expire_ms: Option<u32>,
    pub key: TableKey,
    pub data: Vec<ColumnValue>,
}

/// Decode an update payload against a known column schema (from the
/// table's `DEFINE`), a string key of `key_len` bytes (or `0` for an
/// integer key), for the given frame `ty`.
pub fn decode_update(ty: u8, payload: &[u8], columns: &[ColumnType], int_key: bool) -> Result<DecodedUpdate, PeerProtoError> {
    let has_explicit_id = matches!(ty, ST_UPDATE | ST_UPDATE_TIMED);
    let timed = matches!(ty, ST_UPDATE_TIMED | ST_INCUPDATE_TIMED);
    let mut off = 0usize;
    let explicit_id = if has_explicit_id {
        let b = payload.get(0..4).ok_or(PeerProtoError::TruncatedFrame)?;
        off += 4;
        Some(u32::from_be_bytes(b.try_into().unwrap()))
    } else {
        None
    };
    let remaining_expire_ms = if timed {
        let b = payload.get(off..off + 4).ok_or(PeerProtoError::TruncatedFrame)?;
        off += 4;
        Some(u32::from_be_bytes(b.try_into().unwrap()))
    } else {
        None
    };
    let key = if int_key {
        let b = payload.get(off..off + 4).ok_or(PeerProtoError::TruncatedFrame)?;
        off += 4;
        TableKey::Int(u32::from_be_bytes(b.try_into().unwrap()))
    } else {
        let (len, _) = read_varint(payload, &mut off)?;
        let len = len as usize;
        let s = payload.get(off..off + len).ok_or(PeerProtoError::BadKey)?;
        off += len;
        TableKey::Str(s.to_vec())
    };
    let mut data = Vec::with_capacity(columns.len());
    for col in columns {
        match col {
            ColumnType::Sint => {
                let (v, _) = read_varint(payload, &mut off)?;
                data.push(ColumnValue::Sint(zigzag_decode(v)));
            }
            ColumnType::Uint => {
                let (v, _) = read_varint(payload, &mut off)?;
                data.push(ColumnValue::Uint(v));
            }
            ColumnType::Ull => {
                let (v, _) = read_varint(payload, &mut off)?;
                data.push(ColumnValue::Ull(v));
            }
            ColumnType::Frqp { .. } => {
                let (ticks, _) = read_varint(payload, &mut off)?;
                let (curr, _) = read_varint(payload, &mut off)?;
                let (prev, _) = read_varint(payload, &mut off)?;
                data.push(ColumnValue::Frqp { ticks_since_curr: ticks, curr_ctr: curr, prev_ctr: prev });
            }
        }
    }
    Ok(DecodedUpdate { explicit_id, remaining_expire_ms, key, data })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn varint_round_trips_boundary_values() {
        for &v in &[0u64, 1, 239, 240, 241, 300, 4095, 65535, 1 << 20, u32::MAX as u64, u64::MAX] {
            let mut out = Vec::new();
            encode_varint(v, &mut out);
            assert!(out.len() <= 10, "encoded length must be <= 10 bytes for {v}");
            let (decoded, consumed) = decode_varint(&out).unwrap().unwrap();
            assert_eq!(decoded, v, "round trip failed for {v}");
            assert_eq!(consumed, out.len());
        }
    }

    #[test]
    fn varint_reports_need_more_on_truncated_continuation() {
        let mut out = Vec::new();
        encode_varint(100_000, &mut out);
        let truncated = &out[..out.len() - 1];
        assert_eq!(decode_varint(truncated).unwrap(), None);
    }

    #[test]
    fn frame_round_trips_through_encode_and_parse() {
        let frame = Frame::new(CLASS_STICKTABLE, ST_SWITCH, encode_switch(7));
        let mut bytes = Vec::new();
        frame.encode(&mut bytes);
        let (parsed, consumed) = try_parse_frame(&bytes).unwrap().unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(parsed, frame);
        assert_eq!(decode_switch(&parsed.payload).unwrap(), 7);
    }

    #[test]
    fn try_parse_frame_waits_for_full_payload() {
        let frame = Frame::new(CLASS_CONTROL, CTRL_RESYNCREQ, vec![1, 2, 3, 4, 5]);
        let mut bytes = Vec::new();
        frame.encode(&mut bytes);
        assert_eq!(try_parse_frame(&bytes[..bytes.len() - 1]).unwrap(), None);
    }

    #[test]
    fn oversized_payload_length_is_rejected() {
        let mut bytes = Vec::new();
        bytes.push(CLASS_STICKTABLE);
        bytes.push(ST_UPDATE);
        encode_varint((MAX_PAYLOAD + 1) as u64, &mut bytes);
        assert_eq!(try_parse_frame(&bytes), Err(PeerProtoError::PayloadTooLarge));
    }

    #[test]
    fn reserved_class_is_rejected_not_treated_as_probe() {
        let frame = Frame::new(CLASS_RESERVED, 0, Vec::new());
        let mut bytes = Vec::new();
        frame.encode(&mut bytes);
        let mut input = Channel::new(128, 0, false);
        let mut output = Channel::new(128, 0, true);
        input.buf_mut().put_block(&bytes).unwrap();
        let mut applet = PeerApplet::new(Role::Acceptor, "local", "remote", 1, 1);
        applet.phase = Phase::Streaming;
        let r = applet.pump_stream(&mut input, &mut output, |_, _| {});
        assert_eq!(r, AppletResult::Done);
        assert_eq!(applet.error, Some(PeerProtoError::Reserved));
    }

    #[test]
    fn define_round_trips() {
        let payload = encode_define(3, "sh_table", 4, 0b11, 30_000, &[]);
        let msg = decode_define(&payload).unwrap();
        assert_eq!(msg.local_id, 3);
        assert_eq!(msg.name, "sh_table");
        assert_eq!(msg.key_size, 4);
        assert_eq!(msg.data_bitmask, 0b11);
        assert_eq!(msg.expire_ms, 30_000);
    }

    #[test]
    fn update_round_trips_with_string_key_and_mixed_columns() {
        let columns = vec![ColumnType::Uint, ColumnType::Sint];
        let data = vec![ColumnValue::Uint(42), ColumnValue::Sint(-7)];
        let key = TableKey::Str(b"10.0.0.1".to_vec());
        let payload = encode_update(Some(1), None, &key, &data);
        let decoded = decode_update(ST_UPDATE, &payload, &columns, false).unwrap();
        assert_eq!(decoded.explicit_id, Some(1));
        assert_eq!(decoded.key, TableKey::Str(b"10.0.0.1".to_vec()));
        assert_eq!(decoded.data, data);
    }

    #[test]
    fn timed_update_carries_remaining_expire() {
        let key = TableKey::Int(7);
        let payload = encode_update(Some(1), Some(5_000), &key, &[]);
        let decoded = decode_update(ST_UPDATE_TIMED, &payload, &[], true).unwrap();
        assert_eq!(decoded.remaining_expire_ms, Some(5_000));
        assert_eq!(decoded.key, TableKey::Int(7));
    }

    #[test]
    fn gap_handling_drops_non_contiguous_update_and_keeps_remote_update_monotonic() {
        let mut t = SharedTable::new("t", 0, vec![], 0);
        assert!(t.apply_update(Some(1), b"a".to_vec(), vec![], clock::ETERNITY));
        assert!(t.apply_update(None, b"b".to_vec(), vec![], clock::ETERNITY)); // INCUPDATE -> id 2
        assert_eq!(t.remote_update(), 2);
        // id 4 is a gap (3 missing): must be dropped, remote_update stays at 2.
        assert!(!t.apply_update(Some(4), b"c".to_vec(), vec![], clock::ETERNITY));
        assert_eq!(t.remote_update(), 2);
        assert!(t.get(b"c".as_slice()).is_none());
        assert!(t.get(b"a".as_slice()).is_some());
    }

    #[test]
    fn resync_election_assigns_exactly_one_learner() {
        let mut group = PeersGroup::new(ResyncOrigin::FromRemote);
        let a = group.add_peer(Peer::new("a"));
        let b = group.add_peer(Peer::new("b"));
        group.on_connect_success(a, false);
        group.on_connect_success(b, false);
        assert_eq!(group.learner_count(), 1);
        assert_eq!(group.learner_idx(), Some(a));
    }

    #[test]
    fn resync_finished_sets_group_flags_and_clears_assignment() {
        let mut group = PeersGroup::new(ResyncOrigin::FromRemote);
        let a = group.add_peer(Peer::new("a"));
        group.on_connect_success(a, false);
        group.on_resync_finished(a);
        assert!(group.flags.contains(GroupFlags::RESYNC_LOCAL | GroupFlags::RESYNC_REMOTE));
        assert_eq!(group.learner_idx(), None);
        assert!(!group.peer(a).flags.contains(PeerFlags::LEARN_ASSIGN));
    }

    #[test]
    fn resync_partial_schedules_retry_and_marks_not_up_to_date() {
        let mut group = PeersGroup::new(ResyncOrigin::FromRemote);
        let a = group.add_peer(Peer::new("a"));
        group.on_connect_success(a, false);
        group.on_resync_partial(a, 1_000);
        assert!(group.peer(a).flags.contains(PeerFlags::LEARN_NOTUP2DATE));
        assert_eq!(group.resync_deadline, 6_000);
    }

    #[test]
    fn peer_disconnect_clears_assignment_so_another_peer_can_learn() {
        let mut group = PeersGroup::new(ResyncOrigin::FromRemote);
        let a = group.add_peer(Peer::new("a"));
        let b = group.add_peer(Peer::new("b"));
        group.on_connect_success(a, false);
        group.on_peer_disconnect(a);
        assert_eq!(group.learner_idx(), None);
        group.on_connect_success(b, false);
        assert_eq!(group.learner_idx(), Some(b));
    }

    #[test]
    fn version_negotiation_requests_downgrade_for_unsupported_minor() {
        assert_eq!(negotiate_version(PROTO_MAJOR, PROTO_MINOR), Ok(PROTO_MINOR));
        assert_eq!(negotiate_version(PROTO_MAJOR, PROTO_MINOR + 1), Err(HandshakeStatus::Version));
        assert_eq!(negotiate_version(PROTO_MAJOR + 1, 0), Err(HandshakeStatus::Version));
    }

    #[test]
    fn greeting_round_trips() {
        let bytes = encode_greeting(2, 1, "remote", "local", 123, 1);
        let text = String::from_utf8(bytes).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        let parsed = parse_greeting(&lines).unwrap();
        assert_eq!(parsed.major, 2);
        assert_eq!(parsed.minor, 1);
        assert_eq!(parsed.remote_name, "remote");
        assert_eq!(parsed.local_name, "local");
        assert_eq!(parsed.pid, 123);
        assert_eq!(parsed.relative_pid, 1);
    }

    #[test]
    fn handshake_end_to_end_between_initiator_and_acceptor() {
        let mut link = Channel::new(1024, 0, false); // initiator -> acceptor
        let mut back = Channel::new(1024, 0, true); // acceptor -> initiator

        let mut initiator = PeerApplet::new(Role::Initiator, "local-a", "local-b", 1, 1);
        let mut acceptor = PeerApplet::new(Role::Acceptor, "local-b", "local-a", 2, 1);

        // initiator writes greeting into `link`.
        assert_eq!(initiator.pump_handshake(&mut back, &mut link), AppletResult::Progress);
        assert!(link.buf().input_len() > 0);

        // acceptor reads greeting from `link`, writes status into `back`.
        assert_eq!(acceptor.pump_handshake(&mut link, &mut back), AppletResult::Progress);
        assert_eq!(acceptor.phase, Phase::Streaming);
        assert!(back.buf().input_len() > 0);

        // initiator reads status from `back`.
        assert_eq!(initiator.pump_handshake(&mut back, &mut link), AppletResult::Progress);
        assert_eq!(initiator.phase, Phase::Streaming);
        assert_eq!(initiator.negotiated_minor(), Some(PROTO_MINOR));
    }

    #[test]
    fn soft_stop_reconnect_delay_is_within_spec_bounds() {
        for _ in 0..100 {
            let d = soft_stop_reconnect_delay();
            assert!((50..=2050).contains(&d));
        }
    }
}
