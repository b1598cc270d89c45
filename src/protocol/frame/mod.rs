//! Utilities to work with raw WebSocket frames.

pub mod coding;

#[allow(clippy::module_inception)]
mod frame;
mod mask;

pub use self::{
    frame::{CloseFrame, Frame, FrameHeader, LengthFormat},
    mask::apply_mask,
};

use std::io::{self, Read, Write};

use log::*;

use crate::{
    error::{Error, FrameError, ProtocolError, Result},
    ReadBuffer,
};

/// A codec for WebSocket frames over a non-blocking stream.
///
/// Incoming bytes are buffered until a complete frame is available; outgoing
/// frames are encoded into a byte buffer that is written out as far as the
/// stream accepts.
#[derive(Debug)]
pub struct FrameCodec {
    /// Buffer to read data from the stream.
    in_buffer: ReadBuffer,
    /// Encoded frames not written to the stream yet.
    out_buffer: Vec<u8>,
}

impl FrameCodec {
    /// Create a new frame codec.
    pub fn new() -> Self {
        Self { in_buffer: ReadBuffer::new(), out_buffer: Vec::new() }
    }

    /// Create a new frame codec from partially read data.
    pub fn from_partially_read(part: Vec<u8>) -> Self {
        Self { in_buffer: ReadBuffer::from_partially_read(part), out_buffer: Vec::new() }
    }

    /// Number of received bytes not decoded yet.
    pub fn buffered_input(&self) -> usize {
        self.in_buffer.len()
    }

    /// Whether encoded bytes are still waiting to be written.
    pub fn has_pending_output(&self) -> bool {
        !self.out_buffer.is_empty()
    }

    /// Read a frame from the stream, if one is complete.
    ///
    /// Returns `Ok(None)` when the stream would block before a whole frame has
    /// arrived; the bytes read so far stay buffered for the next call.
    pub fn read_frame<Stream: Read>(
        &mut self,
        stream: &mut Stream,
        max_size: Option<usize>,
    ) -> Result<Option<Frame>> {
        loop {
            let pending = match Frame::parse_limited(self.in_buffer.as_cursor_mut(), max_size) {
                Ok(frame) => {
                    debug!("received frame {frame}");
                    return Ok(Some(frame));
                }
                Err(Error::Frame(err)) if err.is_incomplete() => err,
                Err(err) => return Err(err),
            };

            // No full frame in buffer.
            match self.in_buffer.read_from(stream) {
                Ok(0) => return Err(self.eof_error(pending)),
                Ok(size) => trace!("read {size} bytes"),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => (),
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Classify the end of the stream by what is left in the buffer.
    fn eof_error(&self, pending: FrameError) -> Error {
        if self.in_buffer.is_empty() {
            trace!("stream closed on a frame boundary");
            return Error::ConnectionClosed;
        }
        match pending {
            err @ FrameError::TruncatedPayload { .. } => err.into(),
            _ => ProtocolError::ResetWithoutClosingHandshake.into(),
        }
    }

    /// Encode a frame into the output buffer.
    ///
    /// Nothing is written to the stream until `write_out()` is called.
    pub fn buffer_frame(&mut self, frame: Frame) -> Result<()> {
        trace!("writing frame {frame}");
        frame.format_into_buf(&mut self.out_buffer)
    }

    /// Write the output buffer to the stream.
    ///
    /// Returns `true` once everything has been written and flushed, `false` if the
    /// stream would block first. A stream accepting zero bytes is an error.
    pub fn write_out<Stream: Write>(&mut self, stream: &mut Stream) -> Result<bool> {
        while !self.out_buffer.is_empty() {
            match stream.write(&self.out_buffer) {
                Ok(0) => {
                    // This is the same as "Connection reset by peer"
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "Connection reset while sending",
                    )
                    .into());
                }
                Ok(len) => {
                    self.out_buffer.drain(0..len);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => (),
                Err(err) => return Err(err.into()),
            }
        }

        match stream.flush() {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Drop whatever is left of the frame being written.
    pub fn discard_output(&mut self) {
        self.out_buffer.clear();
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{coding::OpCode, Frame, FrameCodec};
    use crate::error::{Error, FrameError, ProtocolError};

    use std::io::{self, Cursor, Read};

    /// Yields the wrapped data, then `WouldBlock` forever.
    struct Trickle(Cursor<Vec<u8>>);

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.read(&mut buf[..1])? {
                0 => Err(io::Error::new(io::ErrorKind::WouldBlock, "nothing else to read")),
                n => Ok(n),
            }
        }
    }

    #[test]
    fn read_frames() {
        let mut raw = Cursor::new(vec![
            0x82, 0x07, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x82, 0x03, 0x03, 0x02, 0x01,
        ]);
        let mut codec = FrameCodec::new();

        assert_eq!(
            codec.read_frame(&mut raw, None).unwrap().unwrap().into_payload(),
            vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07]
        );
        assert_eq!(
            codec.read_frame(&mut raw, None).unwrap().unwrap().into_payload(),
            vec![0x03, 0x02, 0x01]
        );
        assert!(matches!(codec.read_frame(&mut raw, None), Err(Error::ConnectionClosed)));
    }

    #[test]
    fn from_partially_read() {
        let mut raw = Cursor::new(vec![0x02, 0x03, 0x04, 0x05, 0x06, 0x07]);
        let mut codec = FrameCodec::from_partially_read(vec![0x82, 0x07, 0x01]);
        assert_eq!(
            codec.read_frame(&mut raw, None).unwrap().unwrap().into_payload(),
            vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07]
        );
    }

    #[test]
    fn byte_at_a_time() {
        let bytes = vec![0x81, 0x83, 1, 2, 3, 4, b'a' ^ 1, b'b' ^ 2, b'c' ^ 3];
        let mut raw = Trickle(Cursor::new(bytes));
        let mut codec = FrameCodec::new();

        // One byte per read call, then the stream would block.
        let frame = loop {
            if let Some(frame) = codec.read_frame(&mut raw, None).unwrap() {
                break frame;
            }
        };
        assert_eq!(frame.opcode(), OpCode::Text);
        assert_eq!(frame.payload(), b"abc");
        assert_eq!(codec.buffered_input(), 0);
    }

    #[test]
    fn would_block_is_not_an_error() {
        let mut raw = Trickle(Cursor::new(vec![0x81]));
        let mut codec = FrameCodec::new();
        assert!(codec.read_frame(&mut raw, None).unwrap().is_none());
        assert!(codec.read_frame(&mut raw, None).unwrap().is_none());
        assert_eq!(codec.buffered_input(), 1);
    }

    #[test]
    fn eof_inside_payload() {
        let mut raw = Cursor::new(vec![0x82, 0x05, 0x01, 0x02]);
        let mut codec = FrameCodec::new();
        assert!(matches!(
            codec.read_frame(&mut raw, None),
            Err(Error::Frame(FrameError::TruncatedPayload { expected: 5, available: 2 }))
        ));
    }

    #[test]
    fn eof_inside_header() {
        let mut raw = Cursor::new(vec![0x82]);
        let mut codec = FrameCodec::new();
        assert!(matches!(
            codec.read_frame(&mut raw, None),
            Err(Error::Protocol(ProtocolError::ResetWithoutClosingHandshake))
        ));
    }

    #[test]
    fn write_frames() {
        let mut codec = FrameCodec::new();
        let mut out = Vec::new();

        codec.buffer_frame(Frame::ping(vec![0x04, 0x05])).unwrap();
        codec.buffer_frame(Frame::pong(vec![0x01])).unwrap();
        assert!(codec.has_pending_output());
        assert!(codec.write_out(&mut out).unwrap());
        assert!(!codec.has_pending_output());

        assert_eq!(out, vec![0x89, 0x02, 0x04, 0x05, 0x8a, 0x01, 0x01]);
    }
}
