use std::collections::VecDeque;
use std::io::{self, IoSlice, IoSliceMut};

use crate::config::BufferConfig;
use crate::sys::socket::Socket;

const MAX_SIZE: usize = 1 << 30;
const MAX_WRITE_IOVECS: usize = 128;
const READ_IOVECS: usize = 2;

fn round_up_pow2(min: usize, size: usize) -> usize {
    let mut cap = min;
    while cap < size {
        cap <<= 1;
    }
    cap
}

/// A single fixed-capacity chunk in a buffer's block chain.
///
/// `misalign` is how far the readable span has drifted from byte 0 (bytes
/// already drained); `off` is the count of valid readable bytes starting at
/// `misalign`. Writable space is whatever's left after `misalign + off`.
struct Block {
    bytes: Box<[u8]>,
    misalign: usize,
    off: usize,
}

impl Block {
    fn new(min_size: usize, want: usize) -> Block {
        let cap = round_up_pow2(min_size, want.max(1));
        Block {
            bytes: vec![0u8; cap].into_boxed_slice(),
            misalign: 0,
            off: 0,
        }
    }

    fn readable_size(&self) -> usize {
        self.off
    }

    fn writable_size(&self) -> usize {
        self.bytes.len() - self.misalign - self.off
    }

    fn is_full(&self) -> bool {
        self.writable_size() == 0
    }

    fn is_empty(&self) -> bool {
        self.off == 0
    }

    fn readable(&self) -> &[u8] {
        &self.bytes[self.misalign..self.misalign + self.off]
    }

    fn writable_mut(&mut self) -> &mut [u8] {
        let start = self.misalign + self.off;
        &mut self.bytes[start..]
    }

    fn write(&mut self, data: &[u8]) {
        let start = self.misalign + self.off;
        self.bytes[start..start + data.len()].copy_from_slice(data);
        self.off += data.len();
    }

    fn commit_written(&mut self, n: usize) {
        self.off += n;
    }

    fn drain(&mut self, size: usize) {
        self.misalign += size;
        self.off -= size;
    }

    /// Resets to fully writable, keeping the backing allocation — used to
    /// recycle a fully-drained block onto the tail of the chain instead of
    /// freeing it.
    fn clear(&mut self) {
        self.misalign = 0;
        self.off = 0;
    }

    /// Slides the readable span back to byte 0, freeing up contiguous
    /// writable space at the tail, if the block is worth compacting: it
    /// still wouldn't have enough room for `size` more bytes otherwise, it's
    /// less than half full, and the drift is small.
    fn realign(&mut self, size: usize, threshold: usize) -> bool {
        let len = self.bytes.len();
        if len - self.off > size && self.off < len / 2 && self.off <= threshold {
            self.bytes.copy_within(self.misalign..self.misalign + self.off, 0);
            self.misalign = 0;
            true
        } else {
            false
        }
    }
}

/// A segmented, chained-block buffer for scatter/gather socket I/O.
///
/// Bytes are appended to a growing chain of power-of-two-sized blocks and
/// drained from the front; this avoids the repeated memmove a single
/// growable `Vec<u8>` would need under a read/write/read/write workload.
pub struct Buffer {
    blocks: VecDeque<Block>,
    total_len: usize,
    config: BufferConfig,
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::with_config(BufferConfig::default())
    }

    pub fn with_config(config: BufferConfig) -> Buffer {
        Buffer {
            blocks: VecDeque::new(),
            total_len: 0,
            config,
        }
    }

    pub fn len(&self) -> usize {
        self.total_len
    }

    pub fn is_empty(&self) -> bool {
        self.total_len == 0
    }

    /// Appends `bytes` to the chain, growing it as needed.
    pub fn add(&mut self, bytes: &[u8]) -> bool {
        if self.total_len + bytes.len() > MAX_SIZE {
            return false;
        }
        if bytes.is_empty() {
            return true;
        }

        let min_size = self.config.min_block_size;
        let threshold = self.config.realign_threshold;

        if let Some(tail) = self.blocks.back_mut() {
            let remain = tail.writable_size();
            if remain >= bytes.len() || tail.realign(bytes.len(), threshold) {
                tail.write(bytes);
                self.total_len += bytes.len();
                return true;
            }

            if remain > 0 {
                tail.write(&bytes[..remain]);
            }
            let mut next = Block::new(min_size, bytes.len() - remain);
            next.write(&bytes[remain..]);
            self.blocks.push_back(next);
        } else {
            let mut block = Block::new(min_size, bytes.len());
            block.write(bytes);
            self.blocks.push_back(block);
        }

        self.total_len += bytes.len();
        true
    }

    /// Ensures there's writable space for at least `want` more bytes at the
    /// tail, pushing a new block if necessary.
    fn expand(&mut self, want: usize) {
        let min_size = self.config.min_block_size;
        match self.blocks.back() {
            Some(tail) if tail.writable_size() >= want => {}
            Some(tail) => {
                let remain = tail.writable_size();
                self.blocks.push_back(Block::new(min_size, want - remain));
            }
            None => {
                self.blocks.push_back(Block::new(min_size, want));
            }
        }
    }

    /// Scatter-reads from `socket` into the tail of the chain, capped by
    /// `FIONREAD`/`max_read_bytes`. Returns the byte count read, `0` on a
    /// clean EOF, or a negative value on a (non-blocking) failure.
    pub fn read_from(&mut self, socket: &Socket, max_read_bytes: usize) -> io::Result<i64> {
        let readable = socket.bytes_readable().unwrap_or(max_read_bytes);
        let want = if readable == 0 || readable > max_read_bytes {
            max_read_bytes
        } else {
            readable
        };

        self.expand(want);

        let mut vecs: Vec<IoSliceMut<'_>> = self
            .blocks
            .iter_mut()
            .rev()
            .take(READ_IOVECS)
            .filter(|b| !b.is_full())
            .map(|b| IoSliceMut::new(b.writable_mut()))
            .collect();
        vecs.reverse();

        if vecs.is_empty() {
            return Ok(0);
        }

        let n = match socket.read_vectored(&mut vecs) {
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(-1),
            Err(e) => return Err(e),
        };

        if n == 0 {
            return Ok(0);
        }

        let mut remaining = n;
        let tail_count = self.blocks.len().min(READ_IOVECS);
        let start = self.blocks.len() - tail_count;
        for block in self.blocks.iter_mut().skip(start) {
            if remaining == 0 {
                break;
            }
            let space = block.writable_size();
            let take = space.min(remaining);
            block.commit_written(take);
            remaining -= take;
        }

        self.total_len += n;
        Ok(n as i64)
    }

    /// Gather-writes up to `howmuch` bytes (or the whole buffer if
    /// negative) to `socket`, capped at `MAX_WRITE_IOVECS` blocks, draining
    /// whatever was actually sent.
    pub fn write_to(&mut self, socket: &Socket, howmuch: i64) -> io::Result<i64> {
        let howmuch = if howmuch < 0 || howmuch as usize > self.total_len {
            self.total_len
        } else {
            howmuch as usize
        };

        if howmuch == 0 {
            return Ok(0);
        }

        let mut remaining = howmuch;
        let mut vecs: Vec<IoSlice<'_>> = Vec::new();
        for block in self.blocks.iter() {
            if remaining == 0 || vecs.len() >= MAX_WRITE_IOVECS {
                break;
            }
            let readable = block.readable();
            if readable.len() >= remaining {
                vecs.push(IoSlice::new(&readable[..remaining]));
                remaining = 0;
            } else {
                vecs.push(IoSlice::new(readable));
                remaining -= readable.len();
            }
        }

        if vecs.is_empty() {
            return Ok(0);
        }

        let n = match socket.write_vectored(&vecs) {
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
            Err(e) => return Err(e),
        };

        if n > 0 {
            self.drain(n);
        }

        Ok(n as i64)
    }

    fn copy_out(&self, dst: &mut [u8]) -> usize {
        let length = dst.len().min(self.total_len);
        let mut written = 0;
        for block in self.blocks.iter() {
            if written == length {
                break;
            }
            let readable = block.readable();
            let take = readable.len().min(length - written);
            dst[written..written + take].copy_from_slice(&readable[..take]);
            written += take;
        }
        written
    }

    /// Copies out up to `dst.len()` bytes and drains them from the chain.
    pub fn remove(&mut self, dst: &mut [u8]) -> usize {
        let n = self.copy_out(dst);
        if n > 0 {
            self.drain(n);
        }
        n
    }

    /// Advances the read cursor by `size`. A block that's fully consumed is
    /// recycled onto the tail of the chain (cleared, not freed) rather than
    /// dropped, so a read/drain/read/drain workload doesn't keep
    /// reallocating — unless the chain is already beyond
    /// `max_reserve_blocks`, in which case consumed blocks are dropped
    /// instead of growing the reserve further.
    pub fn drain(&mut self, size: usize) {
        if size == 0 {
            return;
        }
        let size = size.min(self.total_len);
        self.total_len -= size;

        let clean = self.blocks.len() > self.config.max_reserve_blocks;
        let mut remaining = size;

        while remaining > 0 {
            let front_readable = match self.blocks.front() {
                Some(front) => front.readable_size(),
                None => break,
            };

            if remaining < front_readable {
                self.blocks.front_mut().unwrap().drain(remaining);
                break;
            }

            remaining -= front_readable;
            let mut front = self.blocks.pop_front().unwrap();
            if !clean {
                front.clear();
                self.blocks.push_back(front);
            }
        }
    }

    pub fn skip(&mut self, size: usize) {
        self.drain(size);
    }

    /// Splices `other`'s whole block chain onto the tail of this buffer in
    /// O(blocks), leaving `other` empty. Cheaper than `add` when the source
    /// is itself a `Buffer`, since no byte copy is needed.
    pub fn append(&mut self, other: &mut Buffer) {
        if other.total_len == 0 {
            return;
        }
        self.total_len += other.total_len;
        self.blocks.append(&mut other.blocks);
        other.total_len = 0;
    }

    /// Linear scan for `needle` across the readable span.
    pub fn find(&self, needle: &[u8]) -> Option<usize> {
        if needle.is_empty() || needle.len() > self.total_len {
            return None;
        }

        let mut haystack = Vec::with_capacity(self.total_len);
        for block in self.blocks.iter() {
            haystack.extend_from_slice(block.readable());
        }

        haystack
            .windows(needle.len())
            .position(|window| window == needle)
    }

    /// Number of blocks currently in the chain. Exposed so callers (and
    /// tests) can confirm a read/drain/read/drain workload isn't growing the
    /// chain without bound.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn get(&self, index: usize) -> Option<u8> {
        if index >= self.total_len {
            return None;
        }
        let mut skipped = 0;
        for block in self.blocks.iter() {
            let readable = block.readable();
            if index < skipped + readable.len() {
                return Some(readable[index - skipped]);
            }
            skipped += readable.len();
        }
        None
    }
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

impl std::ops::Index<usize> for Buffer {
    type Output = u8;

    fn index(&self, index: usize) -> &u8 {
        // can't return a reference into a possibly-scattered chain by
        // value, so this relies on `get` for the general case and only
        // offers direct indexing into a fully materialized byte.
        let mut skipped = 0;
        for block in self.blocks.iter() {
            let readable = block.readable();
            if index < skipped + readable.len() {
                return &readable[index - skipped];
            }
            skipped += readable.len();
        }
        panic!("buffer index {} out of bounds (len {})", index, self.total_len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_remove_roundtrip() {
        let mut buf = Buffer::new();
        assert!(buf.add(b"hello world"));
        assert_eq!(buf.len(), 11);

        let mut out = [0u8; 11];
        let n = buf.remove(&mut out);
        assert_eq!(n, 11);
        assert_eq!(&out, b"hello world");
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn add_spans_multiple_blocks_when_small_min_size() {
        let mut buf = Buffer::with_config(BufferConfig {
            min_block_size: 8,
            ..BufferConfig::default()
        });
        for _ in 0..50 {
            assert!(buf.add(b"0123456789"));
        }
        assert_eq!(buf.len(), 500);

        let mut out = vec![0u8; 500];
        assert_eq!(buf.remove(&mut out), 500);
        assert_eq!(&out[0..10], b"0123456789");
        assert_eq!(&out[490..500], b"0123456789");
    }

    #[test]
    fn drain_partial_keeps_remaining_bytes() {
        let mut buf = Buffer::new();
        buf.add(b"abcdef");
        buf.drain(2);
        assert_eq!(buf.len(), 4);
        let mut out = [0u8; 4];
        buf.remove(&mut out);
        assert_eq!(&out, b"cdef");
    }

    #[test]
    fn find_locates_needle_across_blocks() {
        let mut buf = Buffer::with_config(BufferConfig {
            min_block_size: 4,
            ..BufferConfig::default()
        });
        buf.add(b"abc");
        buf.add(b"def");
        buf.add(b"ghi");
        assert_eq!(buf.find(b"cde"), Some(2));
        assert_eq!(buf.find(b"xyz"), None);
    }

    #[test]
    fn index_and_get_agree() {
        let mut buf = Buffer::new();
        buf.add(b"xyz");
        assert_eq!(buf[1], b'y');
        assert_eq!(buf.get(1), Some(b'y'));
        assert_eq!(buf.get(10), None);
    }

    #[test]
    fn append_splices_chain_and_empties_source() {
        let mut a = Buffer::new();
        let mut b = Buffer::new();
        a.add(b"abc");
        b.add(b"def");
        a.append(&mut b);
        assert_eq!(a.len(), 6);
        assert!(b.is_empty());
        let mut out = [0u8; 6];
        a.remove(&mut out);
        assert_eq!(&out, b"abcdef");
    }

    #[test]
    fn drain_all_clears_chain() {
        let mut buf = Buffer::new();
        buf.add(b"abcdef");
        buf.drain(100);
        assert_eq!(buf.len(), 0);
        assert!(buf.is_empty());
    }
}
