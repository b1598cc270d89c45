//! A buffer for reading data from the network.
//!
//! The `ReadBuffer` is a first-in, first-out queue of bytes. It is filled by reading
//! from a non-blocking stream and drained by the frame and request parsers, which
//! see the unconsumed bytes through a cursor.

use std::io::{Cursor, Read, Result as IoResult};

use bytes::Buf;

/// A FIFO buffer for reading packets from the network.
#[derive(Debug)]
pub struct ReadBuffer<const CHUNK_SIZE: usize> {
    storage: Cursor<Vec<u8>>,
    chunk: Box<[u8; CHUNK_SIZE]>,
}

impl<const CHUNK_SIZE: usize> ReadBuffer<CHUNK_SIZE> {
    /// Create a new empty buffer.
    pub fn new() -> Self {
        Self::with_capacity(CHUNK_SIZE)
    }

    /// Create a new empty buffer with a given `capacity`.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::from_partially_read(Vec::with_capacity(capacity))
    }

    /// Create a buffer that starts with previously read data.
    pub fn from_partially_read(part: Vec<u8>) -> Self {
        Self { storage: Cursor::new(part), chunk: Box::new([0; CHUNK_SIZE]) }
    }

    /// Cursor over the buffered data. Its position marks the consumed prefix.
    pub fn as_cursor(&self) -> &Cursor<Vec<u8>> {
        &self.storage
    }

    /// Mutable cursor over the buffered data.
    ///
    /// Parsers advance the position past whatever they consumed and leave it
    /// untouched when the data is incomplete.
    pub fn as_cursor_mut(&mut self) -> &mut Cursor<Vec<u8>> {
        &mut self.storage
    }

    /// Number of buffered bytes not consumed yet.
    pub fn len(&self) -> usize {
        Buf::remaining(&self.storage)
    }

    /// Whether every buffered byte has been consumed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consume the buffer, returning the bytes that have not been consumed yet.
    pub fn into_vec(mut self) -> Vec<u8> {
        self.clean_up();
        self.storage.into_inner()
    }

    /// Read the next portion of data from the given stream.
    ///
    /// Returns the number of bytes read; `0` means the peer closed its side.
    pub fn read_from<S: Read>(&mut self, stream: &mut S) -> IoResult<usize> {
        self.clean_up();
        let size = stream.read(&mut *self.chunk)?;
        self.storage.get_mut().extend_from_slice(&self.chunk[..size]);
        Ok(size)
    }

    /// Drop the already consumed prefix.
    fn clean_up(&mut self) {
        let pos = self.storage.position() as usize;
        if pos > 0 {
            self.storage.get_mut().drain(0..pos);
            self.storage.set_position(0);
        }
    }
}

impl<const CHUNK_SIZE: usize> Buf for ReadBuffer<CHUNK_SIZE> {
    fn remaining(&self) -> usize {
        Buf::remaining(self.as_cursor())
    }

    fn chunk(&self) -> &[u8] {
        Buf::chunk(self.as_cursor())
    }

    fn advance(&mut self, cnt: usize) {
        Buf::advance(self.as_cursor_mut(), cnt);
    }
}

impl<const CHUNK_SIZE: usize> Default for ReadBuffer<CHUNK_SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_everything_available() {
        let mut input = Cursor::new(b"GET / HTTP/1.1\r\n".to_vec());
        let mut buffer = ReadBuffer::<4096>::new();
        assert_eq!(buffer.read_from(&mut input).unwrap(), 16);
        assert_eq!(buffer.chunk(), b"GET / HTTP/1.1\r\n");
        assert_eq!(buffer.read_from(&mut input).unwrap(), 0);
    }

    #[test]
    fn consumed_prefix_is_dropped_on_next_read() {
        let mut input = Cursor::new(vec![0x81, 0x02, b'h', b'i', 0x89, 0x00]);
        let mut buffer = ReadBuffer::<4>::new();

        assert_eq!(buffer.read_from(&mut input).unwrap(), 4);
        buffer.advance(4);
        assert!(buffer.is_empty());

        assert_eq!(buffer.read_from(&mut input).unwrap(), 2);
        assert_eq!(buffer.storage.get_ref(), &vec![0x89, 0x00]);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn partially_read_tail_is_kept() {
        let mut buffer = ReadBuffer::<8>::from_partially_read(vec![1, 2, 3]);
        buffer.advance(1);
        assert_eq!(buffer.into_vec(), vec![2, 3]);
    }
}
