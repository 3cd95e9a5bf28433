// src/buffer.rs
use crate::error::{EmberError, EmberResult};

/// Fixed-capacity byte buffer.
///
/// Bytes are filled at the back (`spare_mut` + `commit`, or `append`) and
/// dropped from the front with `consume`, which shifts the remainder down so
/// that offsets into the unconsumed region always start at zero.
pub struct ByteBuffer {
    data: Box<[u8]>,
    len: usize,
}

impl ByteBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len == self.data.len()
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.len
    }

    /// Bytes written so far and not yet consumed.
    #[inline]
    pub fn unconsumed(&self) -> &[u8] {
        &self.data[..self.len]
    }

    #[inline]
    pub fn unconsumed_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }

    /// Free tail of the buffer, for reading straight from a socket.
    #[inline]
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.len..]
    }

    /// Marks `n` bytes of the spare region as filled.
    #[inline]
    pub fn commit(&mut self, n: usize) {
        self.len = (self.len + n).min(self.data.len());
    }

    /// Appends all of `bytes` or nothing.
    pub fn append(&mut self, bytes: &[u8]) -> EmberResult<()> {
        if bytes.len() > self.remaining() {
            return Err(EmberError::BufferFull);
        }
        self.data[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        Ok(())
    }

    /// Drops the first `n` bytes and moves the rest to the front.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.len);
        self.data.copy_within(n..self.len, 0);
        self.len -= n;
    }

    #[inline]
    pub fn clear(&mut self) {
        self.len = 0;
    }
}

impl std::fmt::Debug for ByteBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteBuffer")
            .field("len", &self.len)
            .field("capacity", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_is_all_or_nothing() {
        let mut buf = ByteBuffer::with_capacity(8);
        buf.append(b"hello").unwrap();
        assert!(matches!(buf.append(b"world"), Err(EmberError::BufferFull)));
        assert_eq!(buf.unconsumed(), b"hello");
        buf.append(b"!!!").unwrap();
        assert!(buf.is_full());
    }

    #[test]
    fn consume_rebases_the_tail() {
        let mut buf = ByteBuffer::with_capacity(16);
        buf.append(b"GET /a\r\nGET /b").unwrap();
        buf.consume(8);
        assert_eq!(buf.unconsumed(), b"GET /b");
        assert_eq!(buf.remaining(), 10);

        buf.consume(100);
        assert!(buf.is_empty());
    }

    #[test]
    fn spare_and_commit() {
        let mut buf = ByteBuffer::with_capacity(4);
        buf.spare_mut()[..2].copy_from_slice(b"ab");
        buf.commit(2);
        assert_eq!(buf.unconsumed(), b"ab");
        assert_eq!(buf.spare_mut().len(), 2);
        buf.commit(10);
        assert_eq!(buf.len(), 4);
    }
}
