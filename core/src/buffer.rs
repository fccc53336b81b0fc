//! Fixed-capacity ring buffer with split output/input halves and a rewrite
//! reserve.
//!
//! Mirrors HAProxy's `struct buffer` model described in the session engine
//! spec: a single backing region of size `S` holds `o` *output* bytes
//! (already-parsed content queued to leave this side) immediately followed,
//! in ring order, by `i` *input* bytes (received but not yet committed). A
//! pointer `p` marks where the input half begins; the output half occupies
//! the `o` bytes immediately behind it. The remaining `S - o - i` bytes are
//! free space, some of which (`R`, the *rewrite reserve*) producers must
//! leave alone while an analyser might still need to grow a header in place.

use core::fmt;

/// Byte offset into the logical (unwrapped) content sequence: `0` is the
/// first output byte, `self.output_len()` is the first input byte.
pub type Offset = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutBlockErr {
    /// Not enough free space right now; caller should wait for `skip`/forward
    /// progress on the consumer side.
    Full,
    /// The block can never fit even in an empty buffer of this capacity.
    TooLarge,
}

impl fmt::Display for PutBlockErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => f.write_str("buffer full"),
            Self::TooLarge => f.write_str("block too large for buffer capacity"),
        }
    }
}

impl std::error::Error for PutBlockErr {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteErr {
    /// Growing the region would overrun the buffer even after a realign.
    NoRoom,
}

impl fmt::Display for RewriteErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("insufficient room to rewrite region")
    }
}

impl std::error::Error for RewriteErr {}

/// Outcome of [`Buffer::get_line_nc`].
pub enum LineNc<'a> {
    /// A line terminated by `\n` was found. The two slices concatenate to
    /// the full line, including the trailing `\n`.
    Line([&'a [u8]; 2], usize),
    /// No `\n` yet, but the buffer isn't full: more bytes may arrive.
    NoLine,
    /// No `\n` and the buffer is completely full: this is a framing error
    /// (the line is longer than the buffer can ever hold).
    NoLineFull,
}

pub struct Buffer {
    data: Box<[u8]>,
    /// output (committed) byte count.
    o: usize,
    /// input (uncommitted) byte count.
    i: usize,
    /// physical offset where the input half starts.
    p: usize,
    /// rewrite reserve: producers honour this via `is_full_for_rewrite`.
    reserve: usize,
}

impl Buffer {
    pub fn new(capacity: usize, reserve: usize) -> Self {
        assert!(reserve <= capacity, "rewrite reserve must not exceed buffer capacity");
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            o: 0,
            i: 0,
            p: 0,
            reserve,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn output_len(&self) -> usize {
        self.o
    }

    #[inline]
    pub fn input_len(&self) -> usize {
        self.i
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.o + self.i
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn free(&self) -> usize {
        self.capacity() - self.len()
    }

    #[inline]
    pub fn reserve(&self) -> usize {
        self.reserve
    }

    /// `true` when the free space has shrunk to the rewrite reserve or below:
    /// an analyser in a rewrite-capable phase must not write more.
    #[inline]
    pub fn is_full_for_rewrite(&self) -> bool {
        self.free() <= self.reserve
    }

    /// physical offset where the output half starts.
    #[inline]
    fn output_start(&self) -> usize {
        (self.p + self.capacity() - self.o) % self.capacity()
    }

    #[inline]
    fn phys(&self, logical_offset: usize) -> usize {
        (self.output_start() + logical_offset) % self.capacity()
    }

    /// Append `data` to the input half. Returns the number of bytes actually
    /// written, which may be less than `data.len()` if free space ran out;
    /// `Err(PutBlockErr::Full)` only when *zero* bytes could be written
    /// despite there being room overall (i.e. truly full) and
    /// `Err(PutBlockErr::TooLarge)` when `data` can never fit even in an
    /// empty buffer of this capacity.
    pub fn put_block(&mut self, data: &[u8]) -> Result<usize, PutBlockErr> {
        if data.len() > self.capacity() {
            return Err(PutBlockErr::TooLarge);
        }
        let free = self.free();
        if free == 0 {
            return Err(PutBlockErr::Full);
        }
        let n = data.len().min(free);
        let start = (self.p + self.i) % self.capacity();
        self.write_ring(start, &data[..n]);
        self.i += n;
        Ok(n)
    }

    fn write_ring(&mut self, start: usize, data: &[u8]) {
        let cap = self.capacity();
        let first = (cap - start).min(data.len());
        self.data[start..start + first].copy_from_slice(&data[..first]);
        if first < data.len() {
            self.data[..data.len() - first].copy_from_slice(&data[first..]);
        }
    }

    /// Read up to `max_len` bytes starting at logical `offset` (0 = first
    /// output byte). Returns up to two slices (the second is empty unless
    /// the requested span wraps the physical end of the backing array); the
    /// slices are invalidated by any subsequent mutating call.
    pub fn get_block_nc(&self, offset: usize, max_len: usize) -> ([&[u8]; 2], usize) {
        let avail = self.len().saturating_sub(offset);
        let want = max_len.min(avail);
        if want == 0 {
            return ([&[], &[]], 0);
        }
        let cap = self.capacity();
        let start = self.phys(offset);
        let first = (cap - start).min(want);
        let second = want - first;
        ([&self.data[start..start + first], &self.data[..second]], want)
    }

    /// Scan from logical `offset` for the first `\n`. See [`LineNc`].
    pub fn get_line_nc(&self, offset: usize) -> LineNc<'_> {
        let (slices, len) = self.get_block_nc(offset, self.len().saturating_sub(offset));
        let mut scanned = 0;
        for s in slices {
            if let Some(pos) = s.iter().position(|&b| b == b'\n') {
                let line_len = scanned + pos + 1;
                let (out, _) = self.get_block_nc(offset, line_len);
                return LineNc::Line(out, line_len);
            }
            scanned += s.len();
        }
        let _ = len;
        if self.free() == 0 {
            LineNc::NoLineFull
        } else {
            LineNc::NoLine
        }
    }

    /// Promote `n` bytes of input to output (the HTTP parser has consumed
    /// them and they're now ready to forward/parse further).
    pub fn advance(&mut self, n: usize) {
        let n = n.min(self.i);
        self.i -= n;
        self.o += n;
    }

    /// Drop `n` bytes of already-sent output.
    pub fn skip(&mut self, n: usize) {
        let n = n.min(self.o);
        self.o -= n;
    }

    /// Discard `n` bytes from the front of the input half without promoting
    /// them to output: used for protocol framing bytes (chunk-size lines,
    /// chunk trailers) that must be consumed but never forwarded verbatim.
    pub fn drop_input(&mut self, n: usize) {
        let n = n.min(self.i);
        self.p = (self.p + n) % self.capacity();
        self.i -= n;
    }

    /// Rewrite the logical region `[start, end)` with `new_bytes`, shifting
    /// all trailing content by the length delta and adjusting `o`/`i`
    /// accordingly. Realigns first if the new length would not fit
    /// contiguously from the physical start; hard errors if it would not fit
    /// even then.
    pub fn replace(&mut self, start: usize, end: usize, new_bytes: &[u8]) -> Result<(), RewriteErr> {
        assert!(start <= end && end <= self.len(), "replace range out of bounds");
        let old_len = end - start;
        let delta = new_bytes.len() as isize - old_len as isize;
        if delta > 0 && delta as usize > self.free() {
            return Err(RewriteErr::NoRoom);
        }
        self.realign();
        // after realign, logical offset 0 == physical offset 0.
        let total = self.len();
        let mut tail = self.data[end..total].to_vec();
        self.data[start..start + new_bytes.len()].copy_from_slice(new_bytes);
        let new_tail_start = start + new_bytes.len();
        self.data[new_tail_start..new_tail_start + tail.len()].copy_from_slice(&tail);
        tail.clear();
        if start < self.o {
            // region touches the output half too; grow/shrink it along with input.
            let o_delta = delta.min((self.o - start) as isize);
            self.o = (self.o as isize + o_delta) as usize;
            self.i = (self.i as isize + (delta - o_delta)) as usize;
        } else {
            self.i = (self.i as isize + delta) as usize;
        }
        Ok(())
    }

    /// Compact wrapped content so the output half starts at physical offset
    /// 0. Only valid when no external code holds slices from `get_block_nc`.
    pub fn realign(&mut self) {
        if self.output_start() == 0 {
            self.p = self.o;
            return;
        }
        let total = self.len();
        let mut tmp = Vec::with_capacity(total);
        let (slices, _) = self.get_block_nc(0, total);
        tmp.extend_from_slice(slices[0]);
        tmp.extend_from_slice(slices[1]);
        self.data[..total].copy_from_slice(&tmp);
        self.p = self.o;
    }

    pub fn clear(&mut self) {
        self.o = 0;
        self.i = 0;
        self.p = 0;
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("capacity", &self.capacity())
            .field("o", &self.o)
            .field("i", &self.i)
            .field("reserve", &self.reserve)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn flatten(slices: [&[u8]; 2]) -> Vec<u8> {
        let mut v = slices[0].to_vec();
        v.extend_from_slice(slices[1]);
        v
    }

    #[test]
    fn invariant_holds_after_put_and_advance() {
        let mut buf = Buffer::new(16, 4);
        buf.put_block(b"hello").unwrap();
        assert!(buf.output_len() + buf.input_len() <= buf.capacity());
        buf.advance(5);
        assert_eq!(buf.output_len(), 5);
        assert_eq!(buf.input_len(), 0);
        assert!(buf.output_len() + buf.input_len() <= buf.capacity());
    }

    #[test]
    fn put_block_round_trip() {
        let mut buf = Buffer::new(32, 0);
        buf.put_block(b"abc").unwrap();
        buf.put_block(b"def").unwrap();
        let (s, n) = buf.get_block_nc(0, 6);
        assert_eq!(n, 6);
        assert_eq!(flatten(s), b"abcdef");
    }

    #[test]
    fn put_block_too_large_is_distinct_from_full() {
        let mut buf = Buffer::new(4, 0);
        assert_eq!(buf.put_block(b"12345"), Err(PutBlockErr::TooLarge));
        buf.put_block(b"1234").unwrap();
        assert_eq!(buf.put_block(b"x"), Err(PutBlockErr::Full));
    }

    #[test]
    fn get_block_nc_wraps() {
        let mut buf = Buffer::new(8, 0);
        buf.put_block(b"123456").unwrap();
        buf.advance(6);
        buf.skip(4); // output_start moves to physical offset 4
        buf.put_block(b"78").unwrap(); // wraps around physical end
        let (s, n) = buf.get_block_nc(0, 4);
        assert_eq!(n, 4);
        assert_eq!(flatten(s), b"5678");
    }

    #[test]
    fn get_line_nc_reports_no_line_until_full() {
        let mut buf = Buffer::new(8, 0);
        buf.put_block(b"abc").unwrap();
        assert!(matches!(buf.get_line_nc(0), LineNc::NoLine));
        buf.put_block(b"de\n").unwrap();
        match buf.get_line_nc(0) {
            LineNc::Line(s, n) => {
                assert_eq!(n, 6);
                assert_eq!(flatten(s), b"abcde\n");
            }
            _ => panic!("expected a line"),
        }
    }

    #[test]
    fn get_line_nc_full_without_lf_is_hard_error() {
        let mut buf = Buffer::new(4, 0);
        buf.put_block(b"abcd").unwrap();
        assert!(matches!(buf.get_line_nc(0), LineNc::NoLineFull));
    }

    #[test]
    fn realign_compacts_wrapped_content() {
        let mut buf = Buffer::new(8, 0);
        buf.put_block(b"123456").unwrap();
        buf.advance(6);
        buf.skip(4);
        buf.put_block(b"78").unwrap();
        buf.realign();
        let (s, n) = buf.get_block_nc(0, 4);
        assert_eq!(n, 4);
        assert_eq!(flatten(s), b"5678");
    }

    #[test]
    fn replace_grows_region_and_shifts_tail() {
        let mut buf = Buffer::new(32, 8);
        buf.put_block(b"GET /a HTTP/1.1\r\n").unwrap();
        buf.advance(18);
        buf.replace(4, 6, b"/a/b").unwrap();
        let (s, n) = buf.get_block_nc(0, buf.len());
        assert_eq!(flatten(s)[..n].to_vec(), b"GET /a/b HTTP/1.1\r\n".to_vec());
    }

    #[test]
    fn drop_input_frees_space_without_touching_output() {
        let mut buf = Buffer::new(16, 0);
        buf.put_block(b"ab").unwrap();
        buf.advance(1); // "a" -> output
        buf.drop_input(1); // drop "b" from input
        assert_eq!(buf.output_len(), 1);
        assert_eq!(buf.input_len(), 0);
        assert_eq!(buf.free(), 15);
    }

    #[test]
    fn rewrite_reserve_signals_full() {
        let mut buf = Buffer::new(10, 4);
        buf.put_block(b"123456").unwrap();
        assert!(buf.is_full_for_rewrite());
    }
}
