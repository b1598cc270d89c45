use std::{
    borrow::Cow,
    fmt,
    io::{Cursor, Read, Write},
    result::Result as StdResult,
    str::Utf8Error,
};

use log::*;

use super::{
    coding::{CloseCode, OpCode},
    mask::apply_mask,
};
use crate::error::{CapacityError, Error, FrameError, ProtocolError, Result};

/// A struct representing the close command.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CloseFrame {
    /// The reason as a code.
    pub code: CloseCode,
    /// The reason as text string.
    pub reason: Cow<'static, str>,
}

impl fmt::Display for CloseFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.reason, self.code)
    }
}

/// A struct representing a WebSocket frame header.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct FrameHeader {
    /// Indicates that the frame is the last one of a possibly fragmented message.
    pub is_final: bool,
    /// Reserved for protocol extensions.
    pub rsv1: bool,
    /// Reserved for protocol extensions.
    pub rsv2: bool,
    /// Reserved for protocol extensions.
    pub rsv3: bool,
    /// WebSocket protocol opcode.
    pub opcode: OpCode,
    /// A frame mask, if any.
    pub mask: Option<[u8; 4]>,
}

impl FrameHeader {
    /// Create a final, unmasked header with the given opcode.
    pub fn new(opcode: OpCode) -> Self {
        FrameHeader { is_final: true, rsv1: false, rsv2: false, rsv3: false, opcode, mask: None }
    }

    /// Parse a header from an input stream.
    ///
    /// Returns the header and the payload length. When the input ends before the
    /// header does, the cursor is rewound and `FrameError::TruncatedHeader` is
    /// returned; the caller should retry once more bytes have arrived.
    pub fn parse(cursor: &mut Cursor<impl AsRef<[u8]>>) -> StdResult<(Self, u64), FrameError> {
        let initial = cursor.position();
        match Self::parse_internal(cursor) {
            ret @ Ok(_) => ret,
            Err(err) => {
                cursor.set_position(initial);
                Err(err)
            }
        }
    }

    /// Get the size of the header formatted with given payload length.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self, length: u64) -> usize {
        2 + LengthFormat::for_length(length).extra_bytes()
    }

    /// Format a header for given payload size.
    ///
    /// The MASK bit is never set: a server must not mask the frames it sends.
    pub fn format(&self, length: u64, output: &mut impl Write) -> Result<()> {
        let code: u8 = self.opcode.into();

        let one = {
            code | if self.is_final { 0x80 } else { 0 }
                | if self.rsv1 { 0x40 } else { 0 }
                | if self.rsv2 { 0x20 } else { 0 }
                | if self.rsv3 { 0x10 } else { 0 }
        };

        let lenfmt = LengthFormat::for_length(length);
        let two = lenfmt.length_byte();

        output.write_all(&[one, two])?;
        match lenfmt {
            LengthFormat::U8(_) => (),
            LengthFormat::U16 => output.write_all(&(length as u16).to_be_bytes())?,
            LengthFormat::U64 => output.write_all(&length.to_be_bytes())?,
        }

        Ok(())
    }

    fn parse_internal(cursor: &mut impl Read) -> StdResult<(Self, u64), FrameError> {
        let (first, second) = {
            let mut head = [0u8; 2];
            read_exact_or_truncated(cursor, &mut head)?;
            trace!("Parsed headers {:?}", head);
            (head[0], head[1])
        };

        trace!("First: {:b}", first);
        trace!("Second: {:b}", second);

        let is_final = first & 0x80 != 0;

        let rsv1 = first & 0x40 != 0;
        let rsv2 = first & 0x20 != 0;
        let rsv3 = first & 0x10 != 0;

        // An unknown opcode fails the frame before anything past the first two bytes is read.
        let opcode = OpCode::try_from(first & 0x0F)?;
        trace!("Opcode: {:?}", opcode);

        let masked = second & 0x80 != 0;
        trace!("Masked: {:?}", masked);

        let length = {
            let length_byte = second & 0x7F;
            let length_length = LengthFormat::for_byte(length_byte).extra_bytes();
            if length_length > 0 {
                let mut buf = [0u8; 8];
                read_exact_or_truncated(cursor, &mut buf[8 - length_length..])?;
                u64::from_be_bytes(buf)
            } else {
                u64::from(length_byte)
            }
        };
        trace!("Payload length: {}", length);

        let mask = if masked {
            let mut mask_bytes = [0u8; 4];
            read_exact_or_truncated(cursor, &mut mask_bytes)?;
            Some(mask_bytes)
        } else {
            None
        };

        let hdr = FrameHeader { is_final, rsv1, rsv2, rsv3, opcode, mask };

        Ok((hdr, length))
    }
}

fn read_exact_or_truncated(input: &mut impl Read, buf: &mut [u8]) -> StdResult<(), FrameError> {
    // Reading from an in-memory cursor only fails when it runs out of data.
    input.read_exact(buf).map_err(|_| FrameError::TruncatedHeader)
}

/// A struct representing a WebSocket frame.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Frame {
    header: FrameHeader,
    payload: Vec<u8>,
}

impl Frame {
    /// Get the length of the frame.
    /// This is the length of the header + the length of the payload.
    #[inline]
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        let length = self.payload.len();
        self.header.len(length as u64) + length
    }

    /// Get a reference to the frame's header.
    #[inline]
    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    /// Get the opcode of the frame.
    #[inline]
    pub fn opcode(&self) -> OpCode {
        self.header.opcode
    }

    /// Test whether the frame is a final frame.
    #[inline]
    pub fn is_final(&self) -> bool {
        self.header.is_final
    }

    /// Test whether the frame arrived masked.
    ///
    /// The payload is always unmasked by the time the frame is handed out; the key
    /// stays in the header only so that the sender's role can be checked.
    #[inline]
    pub fn is_masked(&self) -> bool {
        self.header.mask.is_some()
    }

    /// Get a reference to the frame's payload.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consume the frame into its payload as binary.
    #[inline]
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Get frame payload as `&str`.
    #[inline]
    pub fn to_text(&self) -> StdResult<&str, Utf8Error> {
        std::str::from_utf8(&self.payload)
    }

    /// Consume the frame into a closing frame.
    #[inline]
    pub fn into_close(self) -> Result<Option<CloseFrame>> {
        match self.payload.len() {
            0 => Ok(None),
            1 => Err(Error::Protocol(ProtocolError::InvalidCloseSequence)),
            _ => {
                let code = u16::from_be_bytes([self.payload[0], self.payload[1]]).into();
                let reason = String::from_utf8(self.payload[2..].to_vec())?;
                Ok(Some(CloseFrame { code, reason: reason.into() }))
            }
        }
    }

    /// Create a new unfragmented data frame.
    #[inline]
    pub fn message(data: impl Into<Vec<u8>>, opcode: OpCode) -> Frame {
        debug_assert!(!opcode.is_control(), "Invalid opcode for data frame.");
        Frame { header: FrameHeader::new(opcode), payload: data.into() }
    }

    /// Create a new text frame.
    #[inline]
    pub fn text(text: impl Into<String>) -> Frame {
        Frame::message(text.into().into_bytes(), OpCode::Text)
    }

    /// Create a new binary frame.
    #[inline]
    pub fn binary(data: impl Into<Vec<u8>>) -> Frame {
        Frame::message(data, OpCode::Binary)
    }

    /// Create a new Ping control frame.
    #[inline]
    pub fn ping(data: impl Into<Vec<u8>>) -> Frame {
        Frame { header: FrameHeader::new(OpCode::Ping), payload: data.into() }
    }

    /// Create a new Pong control frame.
    #[inline]
    pub fn pong(data: impl Into<Vec<u8>>) -> Frame {
        Frame { header: FrameHeader::new(OpCode::Pong), payload: data.into() }
    }

    /// Create the Pong answering a received Ping; the payload is copied as is.
    #[inline]
    pub fn pong_for(ping: &Frame) -> Frame {
        Frame::pong(ping.payload.clone())
    }

    /// Create a new Close control frame.
    #[inline]
    pub fn close(msg: Option<CloseFrame>) -> Frame {
        let payload = if let Some(CloseFrame { code, reason }) = msg {
            let mut p = Vec::with_capacity(reason.len() + 2);
            p.extend(u16::from(code).to_be_bytes());
            p.extend_from_slice(reason.as_bytes());
            p
        } else {
            Vec::new()
        };

        Frame { header: FrameHeader::new(OpCode::Close), payload }
    }

    /// Create the acknowledgement of a received Close frame.
    ///
    /// Only the status code (the first two payload bytes) is echoed back, the reason
    /// is dropped. A close frame without a status code is answered with an empty one.
    #[inline]
    pub fn close_reply(close: &Frame) -> Frame {
        let payload = match close.payload.get(..2) {
            Some(code) => code.to_vec(),
            None => Vec::new(),
        };
        Frame { header: FrameHeader::new(OpCode::Close), payload }
    }

    /// Create a frame from given header and data.
    pub fn from_payload(header: FrameHeader, payload: Vec<u8>) -> Self {
        Frame { header, payload }
    }

    /// Parse a complete frame from an input stream.
    ///
    /// A masked payload is unmasked before the frame is returned. If the input holds
    /// only part of the frame the cursor is left where it was and the error says
    /// which part is missing.
    pub fn parse(cursor: &mut Cursor<impl AsRef<[u8]>>) -> StdResult<Frame, FrameError> {
        let initial = cursor.position();
        let (header, length) = FrameHeader::parse(cursor)?;
        Self::parse_payload(cursor, initial, header, length)
    }

    /// Parse a frame, refusing payloads longer than `max_size` before reading them.
    pub(crate) fn parse_limited(
        cursor: &mut Cursor<impl AsRef<[u8]>>,
        max_size: Option<usize>,
    ) -> Result<Frame> {
        let initial = cursor.position();
        let (header, length) = FrameHeader::parse(cursor)?;

        if let Some(max_size) = max_size {
            if length > max_size as u64 {
                cursor.set_position(initial);
                return Err(CapacityError::MessageTooLong { size: length, max_size }.into());
            }
        }

        Ok(Self::parse_payload(cursor, initial, header, length)?)
    }

    fn parse_payload(
        cursor: &mut Cursor<impl AsRef<[u8]>>,
        initial: u64,
        header: FrameHeader,
        length: u64,
    ) -> StdResult<Frame, FrameError> {
        let available = cursor.get_ref().as_ref().len() as u64 - cursor.position();
        if available < length {
            cursor.set_position(initial);
            return Err(FrameError::TruncatedPayload { expected: length, available });
        }

        // The destination is sized up front: reading into an empty buffer yields
        // nothing and would look like the end of the input.
        let mut payload = vec![0u8; length as usize];
        if cursor.read_exact(&mut payload).is_err() {
            cursor.set_position(initial);
            return Err(FrameError::TruncatedPayload { expected: length, available });
        }

        if let Some(mask) = header.mask {
            apply_mask(&mut payload, mask);
        }

        Ok(Frame { header, payload })
    }

    /// Write a frame out to a buffer.
    pub fn format(self, output: &mut impl Write) -> Result<()> {
        self.header.format(self.payload.len() as u64, output)?;
        output.write_all(&self.payload)?;
        Ok(())
    }

    /// Write a frame out to a `Vec<u8>`.
    pub fn format_into_buf(self, buf: &mut Vec<u8>) -> Result<()> {
        buf.reserve(self.len());
        self.format(buf)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use std::fmt::Write;

        write!(
            f,
            "
<FRAME>
final: {}
reserved: {} {} {}
opcode: {}
length: {}
payload length: {}
payload: 0x{}
            ",
            self.header.is_final,
            self.header.rsv1,
            self.header.rsv2,
            self.header.rsv3,
            self.header.opcode,
            self.len(),
            self.payload.len(),
            self.payload.iter().fold(String::new(), |mut output, byte| {
                _ = write!(output, "{byte:02x}");
                output
            })
        )
    }
}

/// Handling of the length format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthFormat {
    /// The length fits in the 7-bit field itself.
    U8(u8),
    /// Code 126: the length follows as a 16-bit big-endian integer.
    U16,
    /// Code 127: the length follows as a 64-bit big-endian integer.
    U64,
}

impl LengthFormat {
    /// Get the length format for a given data size.
    #[inline]
    pub fn for_length(length: u64) -> Self {
        if length < 126 {
            LengthFormat::U8(length as u8)
        } else if length < 65536 {
            LengthFormat::U16
        } else {
            LengthFormat::U64
        }
    }

    /// Get the size of the length encoding.
    #[inline]
    pub fn extra_bytes(&self) -> usize {
        match *self {
            LengthFormat::U8(_) => 0,
            LengthFormat::U16 => 2,
            LengthFormat::U64 => 8,
        }
    }

    /// Encode the given length.
    #[inline]
    pub fn length_byte(&self) -> u8 {
        match *self {
            LengthFormat::U8(b) => b,
            LengthFormat::U16 => 126,
            LengthFormat::U64 => 127,
        }
    }

    /// Get the length format for a given length byte.
    #[inline]
    pub fn for_byte(byte: u8) -> Self {
        match byte & 0x7F {
            126 => LengthFormat::U16,
            127 => LengthFormat::U64,
            b => LengthFormat::U8(b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse() {
        let mut raw: Cursor<Vec<u8>> =
            Cursor::new(vec![0x82, 0x07, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07]);
        let (header, length) = FrameHeader::parse(&mut raw).unwrap();
        assert_eq!(length, 7);
        assert_eq!(header.opcode, OpCode::Binary);
        assert!(header.is_final);
        assert!(header.mask.is_none());

        let mut raw = Cursor::new(raw.into_inner());
        let frame = Frame::parse(&mut raw).unwrap();
        assert_eq!(frame.into_payload(), vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07]);
    }

    #[test]
    fn parse_masked() {
        // Masked "Hello" from RFC 6455, section 5.7.
        let mut raw = Cursor::new(vec![
            0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58,
        ]);
        let frame = Frame::parse(&mut raw).unwrap();
        assert!(frame.is_masked());
        assert_eq!(frame.opcode(), OpCode::Text);
        assert_eq!(frame.to_text().unwrap(), "Hello");
        assert_eq!(raw.position(), 11);
    }

    #[test]
    fn parse_extended_lengths() {
        let mut raw = vec![0x82, 0x7E, 0x00, 0x7E];
        raw.extend(std::iter::repeat(0xAB).take(126));
        let frame = Frame::parse(&mut Cursor::new(raw)).unwrap();
        assert_eq!(frame.payload().len(), 126);

        let mut raw = vec![0x82, 0x7F, 0, 0, 0, 0, 0, 0x01, 0x00, 0x00];
        raw.extend(std::iter::repeat(0xCD).take(65536));
        let frame = Frame::parse(&mut Cursor::new(raw)).unwrap();
        assert_eq!(frame.payload().len(), 65536);
    }

    #[test]
    fn truncated_header_rewinds() {
        for raw in [vec![], vec![0x81], vec![0x82, 0x7E, 0x01], vec![0x81, 0x81, 0x01, 0x02]] {
            let mut cursor = Cursor::new(raw);
            assert_eq!(Frame::parse(&mut cursor), Err(FrameError::TruncatedHeader));
            assert_eq!(cursor.position(), 0);
        }
    }

    #[test]
    fn truncated_payload_rewinds() {
        let mut cursor = Cursor::new(vec![0x82, 0x05, 0x01, 0x02]);
        assert_eq!(
            Frame::parse(&mut cursor),
            Err(FrameError::TruncatedPayload { expected: 5, available: 2 })
        );
        assert_eq!(cursor.position(), 0);
    }

    #[test]
    fn invalid_opcode_stops_before_payload() {
        let mut cursor = Cursor::new(vec![0x83, 0x03, 0x01, 0x02, 0x03]);
        assert_eq!(Frame::parse(&mut cursor), Err(FrameError::InvalidOpcode(3)));
        // Nothing is consumed, the payload was never touched.
        assert_eq!(cursor.position(), 0);
    }

    #[test]
    fn high_bit_length_is_accepted_by_the_header_parser() {
        let mut cursor = Cursor::new(vec![0x82, 0x7F, 0x80, 0, 0, 0, 0, 0, 0, 0x01]);
        let (_, length) = FrameHeader::parse(&mut cursor).unwrap();
        assert_eq!(length, 0x8000_0000_0000_0001);
    }

    #[test]
    fn size_limit_checked_before_payload() {
        let mut cursor = Cursor::new(vec![0x82, 0x7E, 0x10, 0x00]);
        let err = Frame::parse_limited(&mut cursor, Some(1024)).unwrap_err();
        assert!(matches!(
            err,
            Error::Capacity(CapacityError::MessageTooLong { size: 4096, max_size: 1024 })
        ));
    }

    #[test]
    fn format() {
        let frame = Frame::ping(vec![0x01, 0x02]);
        let mut buf = Vec::with_capacity(frame.len());
        frame.format(&mut buf).unwrap();
        assert_eq!(buf, vec![0x89, 0x02, 0x01, 0x02]);
    }

    #[test]
    fn format_never_masks() {
        let header = FrameHeader { mask: Some([1, 2, 3, 4]), ..FrameHeader::new(OpCode::Text) };
        let frame = Frame::from_payload(header, b"hi".to_vec());
        let mut buf = Vec::new();
        frame.format_into_buf(&mut buf).unwrap();
        assert_eq!(buf, vec![0x81, 0x02, b'h', b'i']);
    }

    #[test]
    fn length_code_boundaries() {
        let encode = |len: usize| {
            let mut buf = Vec::new();
            Frame::binary(vec![0u8; len]).format_into_buf(&mut buf).unwrap();
            buf
        };

        let buf = encode(125);
        assert_eq!(buf[1], 125);
        assert_eq!(buf.len(), 2 + 125);

        let buf = encode(126);
        assert_eq!(buf[1], 126);
        assert_eq!(&buf[2..4], &126u16.to_be_bytes());
        assert_eq!(buf.len(), 4 + 126);

        let buf = encode(65536);
        assert_eq!(buf[1], 127);
        assert_eq!(&buf[2..10], &65536u64.to_be_bytes());
        assert_eq!(buf.len(), 10 + 65536);
    }

    #[test]
    fn round_trip() {
        for len in [0usize, 1, 125, 126, 65535, 65536] {
            for opcode in [OpCode::Text, OpCode::Binary] {
                let payload: Vec<u8> = (0..len).map(|i| b'a' + (i % 26) as u8).collect();
                let frame = Frame::message(payload.clone(), opcode);

                let mut buf = Vec::new();
                frame.format_into_buf(&mut buf).unwrap();
                let decoded = Frame::parse(&mut Cursor::new(buf)).unwrap();

                assert_eq!(decoded.opcode(), opcode);
                assert!(decoded.is_final());
                assert_eq!(decoded.payload(), &payload[..]);
            }
        }
    }

    #[test]
    fn close_reply_keeps_only_the_status_code() {
        let close = Frame::close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "bye, see you".into(),
        }));
        assert_eq!(&close.payload()[..2], &[0x03, 0xE8]);

        let reply = Frame::close_reply(&close);
        assert_eq!(reply.opcode(), OpCode::Close);
        assert_eq!(reply.payload(), &[0x03, 0xE8]);

        assert!(Frame::close_reply(&Frame::close(None)).payload().is_empty());
        let short = Frame::from_payload(FrameHeader::new(OpCode::Close), vec![0x03]);
        assert!(Frame::close_reply(&short).payload().is_empty());
    }

    #[test]
    fn into_close() {
        let close = Frame::close(Some(CloseFrame { code: CloseCode::Away, reason: "gone".into() }));
        let parsed = close.into_close().unwrap().unwrap();
        assert_eq!(parsed.code, CloseCode::Away);
        assert_eq!(parsed.reason, "gone");

        let bad = Frame::from_payload(FrameHeader::new(OpCode::Close), vec![0x03]);
        assert!(matches!(
            bad.into_close(),
            Err(Error::Protocol(ProtocolError::InvalidCloseSequence))
        ));
    }

    #[test]
    fn pong_copies_ping_payload() {
        let ping = Frame::ping(b"abc".to_vec());
        let pong = Frame::pong_for(&ping);
        assert_eq!(pong.opcode(), OpCode::Pong);
        assert_eq!(pong.payload(), b"abc");
    }

    #[test]
    fn display() {
        let f = Frame::text("hi there");
        let view = format!("{f}");
        assert!(view.contains("payload:"));
        assert!(view.contains("6869"));
    }
}
