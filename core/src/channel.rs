//! One direction of a session's byte pipeline.
//!
//! A [`Channel`] owns a [`Buffer`] and carries every piece of state an
//! analyser needs to reason about forwarding and backpressure: how many
//! bytes remain to be passed through transparently, which analysers still
//! have work to do, and the timers/flags that classify why a direction
//! stalled.

use crate::buffer::Buffer;
use crate::clock::{self, Tick};

/// Bitmask flags carried by a [`Channel`]. Follows the `xitca-http`
/// `ContextState` pattern of a newtype over an integer with associated
/// consts instead of an external bitflags-derive, since this module wants
/// hand-written `const fn` accessors for the hot path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelFlags(u32);

impl ChannelFlags {
    pub const READ_ERROR: u32 = 1 << 0;
    pub const READ_TIMEOUT: u32 = 1 << 1;
    /// peer closed its write side (we read EOF).
    pub const READ_NULL: u32 = 1 << 2;
    pub const READ_PARTIAL: u32 = 1 << 3;
    pub const WRITE_ERROR: u32 = 1 << 4;
    pub const WRITE_TIMEOUT: u32 = 1 << 5;
    pub const SHUTR: u32 = 1 << 6;
    pub const SHUTR_NOW: u32 = 1 << 7;
    pub const SHUTW: u32 = 1 << 8;
    pub const SHUTW_NOW: u32 = 1 << 9;
    pub const READ_DONTWAIT: u32 = 1 << 10;
    pub const WAKE_WRITE: u32 = 1 << 11;
    pub const EXPECT_MORE: u32 = 1 << 12;
    pub const NEVER_WAIT: u32 = 1 << 13;
    pub const ISRESP: u32 = 1 << 14;
    pub const DONT_CONNECT: u32 = 1 << 15;
    pub const DONT_CLOSE: u32 = 1 << 16;
    pub const AUTO_CLOSE: u32 = 1 << 17;
    pub const AUTO_READ: u32 = 1 << 18;
    pub const AUTO_CONNECT: u32 = 1 << 19;

    pub const fn empty() -> Self {
        Self(0)
    }

    #[inline]
    pub fn insert(&mut self, bits: u32) {
        self.0 |= bits;
    }

    #[inline]
    pub fn remove(&mut self, bits: u32) {
        self.0 &= !bits;
    }

    #[inline]
    pub const fn contains(&self, bits: u32) -> bool {
        (self.0 & bits) == bits
    }

    #[inline]
    pub const fn any(&self, bits: u32) -> bool {
        (self.0 & bits) != 0
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }
}

/// A direction of a session's byte pipeline: request (client→server) or
/// response (server→client). See spec.md §3 "Channel".
pub struct Channel {
    buf: Buffer,
    pub flags: ChannelFlags,
    /// bytes still to forward transparently once the analyser chain stops
    /// touching them (body forwarding, tunnels).
    to_forward: u64,
    /// bitmask of analysers with work still pending on this channel, in
    /// increasing-bit processing order.
    pub analysers: u32,
    pub analyse_exp: Tick,
    pub rex: Tick,
    pub wex: Tick,
    pub rto: u64,
    pub wto: u64,
}

impl Channel {
    pub fn new(capacity: usize, reserve: usize, is_response: bool) -> Self {
        let mut flags = ChannelFlags::empty();
        if is_response {
            flags.insert(ChannelFlags::ISRESP);
        }
        Self {
            buf: Buffer::new(capacity, reserve),
            flags,
            to_forward: 0,
            analysers: 0,
            analyse_exp: clock::ETERNITY,
            rex: clock::ETERNITY,
            wex: clock::ETERNITY,
            rto: clock::ETERNITY,
            wto: clock::ETERNITY,
        }
    }

    #[inline]
    pub fn buf(&self) -> &Buffer {
        &self.buf
    }

    #[inline]
    pub fn buf_mut(&mut self) -> &mut Buffer {
        &mut self.buf
    }

    #[inline]
    pub fn is_response(&self) -> bool {
        self.flags.contains(ChannelFlags::ISRESP)
    }

    /// Move up to `n` bytes of unparsed input into the forwarding window:
    /// bumps `to_forward` so the transfer analyser knows how much more it
    /// may push to output without further parsing.
    pub fn forward(&mut self, n: u64) {
        self.to_forward = self.to_forward.saturating_add(n);
    }

    #[inline]
    pub fn to_forward(&self) -> u64 {
        self.to_forward
    }

    /// Consume up to `self.to_forward` bytes of buffered input by promoting
    /// them to output. Returns the number of bytes actually advanced.
    pub fn forward_available(&mut self) -> u64 {
        let want = self.to_forward.min(self.buf.input_len() as u64) as usize;
        if want > 0 {
            self.buf.advance(want);
            self.to_forward -= want as u64;
        }
        want as u64
    }

    /// `true` when free space (minus `reserve`) is exhausted: producers must
    /// stop filling this channel's buffer.
    #[inline]
    pub fn channel_full(&self, reserve: usize) -> bool {
        self.buf.free() <= reserve
    }

    #[inline]
    pub fn dont_connect(&self) -> bool {
        self.flags.contains(ChannelFlags::DONT_CONNECT)
    }

    #[inline]
    pub fn set_dont_connect(&mut self, v: bool) {
        if v {
            self.flags.insert(ChannelFlags::DONT_CONNECT);
        } else {
            self.flags.remove(ChannelFlags::DONT_CONNECT);
        }
    }

    #[inline]
    pub fn dont_close(&self) -> bool {
        self.flags.contains(ChannelFlags::DONT_CLOSE)
    }

    #[inline]
    pub fn auto_close(&self) -> bool {
        self.flags.contains(ChannelFlags::AUTO_CLOSE)
    }

    #[inline]
    pub fn auto_read(&self) -> bool {
        self.flags.contains(ChannelFlags::AUTO_READ)
    }

    #[inline]
    pub fn auto_connect(&self) -> bool {
        self.flags.contains(ChannelFlags::AUTO_CONNECT)
    }

    /// `true` while the channel is in a phase where an analyser may still
    /// grow data in place (headers not yet fully forwarded): governs whether
    /// `Buffer::replace` is permitted.
    #[inline]
    pub fn is_rewritable(&self) -> bool {
        !self.flags.any(ChannelFlags::SHUTW | ChannelFlags::SHUTW_NOW) && self.to_forward == 0
    }

    /// issue a read-side shutdown: no further reads will be attempted.
    pub fn shutr(&mut self) {
        self.flags.insert(ChannelFlags::SHUTR);
    }

    /// issue a write-side shutdown: no further writes will be attempted.
    pub fn shutw(&mut self) {
        self.flags.insert(ChannelFlags::SHUTW);
    }

    /// §8 invariant: `SHUTR ∧ input_empty ∧ to_forward == 0` implies the
    /// analyser chain cannot make further progress on this channel.
    pub fn analysers_can_progress(&self) -> bool {
        if self.flags.contains(ChannelFlags::SHUTR) && self.buf.input_len() == 0 && self.to_forward == 0 {
            return false;
        }
        true
    }

    pub fn set_analyse_exp(&mut self, deadline: Tick) {
        self.analyse_exp = deadline;
    }

    /// `true` if the read or the analyse deadline has passed; sets the
    /// corresponding timeout flag as a side effect so the analyser that
    /// re-enters can see why it was woken.
    pub fn expire(&mut self, now: Tick) -> bool {
        let mut expired = false;
        if clock::is_expired(self.analyse_exp, now) {
            expired = true;
        }
        if clock::is_expired(self.rex, now) {
            self.flags.insert(ChannelFlags::READ_TIMEOUT);
            expired = true;
        }
        if clock::is_expired(self.wex, now) {
            self.flags.insert(ChannelFlags::WRITE_TIMEOUT);
            expired = true;
        }
        expired
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn forward_consumes_input_into_output() {
        let mut ch = Channel::new(64, 8, false);
        ch.buf_mut().put_block(b"hello world").unwrap();
        ch.forward(5);
        let n = ch.forward_available();
        assert_eq!(n, 5);
        assert_eq!(ch.buf().output_len(), 5);
        assert_eq!(ch.buf().input_len(), 6);
        assert_eq!(ch.to_forward(), 0);
    }

    #[test]
    fn shutr_with_empty_input_blocks_progress() {
        let mut ch = Channel::new(32, 4, false);
        ch.shutr();
        assert!(!ch.analysers_can_progress());
        ch.buf_mut().put_block(b"x").unwrap();
        // SHUTR is latched once set; input no longer empty so progress resumes.
        assert!(ch.analysers_can_progress());
    }

    #[test]
    fn channel_full_respects_reserve() {
        let mut ch = Channel::new(16, 4, false);
        ch.buf_mut().put_block(&[0u8; 12]).unwrap();
        assert!(ch.channel_full(4));
    }

    #[test]
    fn expire_sets_timeout_flags() {
        let mut ch = Channel::new(16, 0, false);
        ch.rex = 100;
        ch.wex = clock::ETERNITY;
        assert!(ch.expire(100));
        assert!(ch.flags.contains(ChannelFlags::READ_TIMEOUT));
        assert!(!ch.flags.contains(ChannelFlags::WRITE_TIMEOUT));
    }
}
