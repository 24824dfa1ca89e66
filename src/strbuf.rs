//! Bounded-growth string accumulator (spec.md §4.1).
//!
//! Mirrors the original `utils/strbuf.c` growth policy: capacity grows in
//! `CHUNK`-sized steps (`UTL_STRING_BUFFER_ALLOCATION_LENGTH` in the
//! original, 5120 bytes) rather than doubling, so that many small appends
//! against a large buffer don't repeatedly over-allocate.

const CHUNK: usize = 5120;

/// Amortized-growth byte accumulator, NUL-terminated on read via `as_cstr_bytes`.
#[derive(Debug, Default, Clone)]
pub struct StringBuffer {
    buf: Vec<u8>,
}

impl StringBuffer {
    pub fn new() -> Self {
        StringBuffer { buf: Vec::new() }
    }

    pub fn with_string(s: &str) -> Self {
        let mut sb = StringBuffer::new();
        sb.append(s);
        sb
    }

    /// Appending an empty string is a no-op, matching the original's
    /// `bUtlStringsIsStringNULL` guard in `iUtlStringBufferAppend`.
    pub fn append(&mut self, s: &str) {
        if s.is_empty() {
            return;
        }

        let needed = self.buf.len() + s.len();
        if needed + 1 > self.buf.capacity() {
            let grow = CHUNK.max(needed + 1 - self.buf.capacity());
            self.buf.reserve(grow);
        }
        self.buf.extend_from_slice(s.as_bytes());
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Borrow the accumulated string. Invalid UTF-8 cannot occur since
    /// `append` only ever extends with valid `&str` bytes.
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.buf).expect("StringBuffer only ever receives valid UTF-8")
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Free the buffer, optionally handing ownership of the inner bytes to
    /// the caller (the original's `bFreeString` flag on `iUtlStringBufferFree`).
    pub fn free(self, take_ownership: bool) -> Option<Vec<u8>> {
        if take_ownership {
            Some(self.buf)
        } else {
            None
        }
    }
}

/// Wide-character counterpart of [`StringBuffer`], modeling the original's
/// parallel `iUtlWideStringBufferCreate` family of functions.
#[derive(Debug, Default, Clone)]
pub struct WideStringBuffer {
    buf: Vec<u32>,
}

impl WideStringBuffer {
    pub fn new() -> Self {
        WideStringBuffer { buf: Vec::new() }
    }

    pub fn with_string(s: &[u32]) -> Self {
        let mut sb = WideStringBuffer::new();
        sb.append(s);
        sb
    }

    pub fn append(&mut self, s: &[u32]) {
        if s.is_empty() {
            return;
        }

        let needed = self.buf.len() + s.len();
        if needed + 1 > self.buf.capacity() {
            let grow = CHUNK.max(needed + 1 - self.buf.capacity());
            self.buf.reserve(grow);
        }
        self.buf.extend_from_slice(s);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.buf
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn free(self, take_ownership: bool) -> Option<Vec<u32>> {
        if take_ownership {
            Some(self.buf)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_append_is_noop() {
        let mut sb = StringBuffer::new();
        sb.append("");
        assert_eq!(sb.len(), 0);
        assert!(sb.is_empty());
    }

    #[test]
    fn append_accumulates() {
        let mut sb = StringBuffer::with_string("hello");
        sb.append(" ");
        sb.append("world");
        assert_eq!(sb.as_str(), "hello world");
        assert_eq!(sb.len(), 11);
    }

    #[test]
    fn growth_is_chunked_not_per_append() {
        let mut sb = StringBuffer::new();
        sb.append("x");
        let cap_after_first = sb.capacity();
        assert!(cap_after_first >= CHUNK);
        sb.append("y");
        // second tiny append must not have reallocated
        assert_eq!(sb.capacity(), cap_after_first);
    }

    #[test]
    fn large_append_grows_beyond_chunk() {
        let mut sb = StringBuffer::new();
        let big = "a".repeat(CHUNK * 3);
        sb.append(&big);
        assert_eq!(sb.len(), big.len());
        assert!(sb.capacity() >= big.len());
    }

    #[test]
    fn wide_buffer_mirrors_byte_buffer_semantics() {
        let mut wb = WideStringBuffer::new();
        wb.append(&[]);
        assert!(wb.is_empty());
        wb.append(&[1, 2, 3]);
        wb.append(&[4, 5]);
        assert_eq!(wb.as_slice(), &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn free_can_transfer_ownership() {
        let sb = StringBuffer::with_string("abc");
        let taken = sb.free(true);
        assert_eq!(taken.unwrap(), b"abc");

        let sb2 = StringBuffer::with_string("abc");
        let not_taken = sb2.free(false);
        assert!(not_taken.is_none());
    }
}
