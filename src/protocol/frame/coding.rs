//! Various codes defined in RFC 6455.

use std::{
    convert::TryFrom,
    fmt::{Display, Formatter, Result as FmtResult},
};

use crate::error::FrameError;

/// WebSocket message opcode as in RFC 6455.
///
/// Only the opcodes of complete, unfragmented messages are known. Continuation
/// (0x0) and the reserved ranges are rejected while decoding.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum OpCode {
    /// 0x1 denotes a text frame
    Text,
    /// 0x2 denotes a binary frame
    Binary,
    /// 0x8 denotes a connection close
    Close,
    /// 0x9 denotes a ping
    Ping,
    /// 0xa denotes a pong
    Pong,
}

impl OpCode {
    /// Test whether this is a control opcode (close, ping or pong).
    pub fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

impl Display for OpCode {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        match *self {
            OpCode::Text => write!(f, "TEXT"),
            OpCode::Binary => write!(f, "BINARY"),
            OpCode::Close => write!(f, "CLOSE"),
            OpCode::Ping => write!(f, "PING"),
            OpCode::Pong => write!(f, "PONG"),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(code: OpCode) -> Self {
        match code {
            OpCode::Text => 1,
            OpCode::Binary => 2,
            OpCode::Close => 8,
            OpCode::Ping => 9,
            OpCode::Pong => 10,
        }
    }
}

impl TryFrom<u8> for OpCode {
    type Error = FrameError;

    fn try_from(byte: u8) -> Result<OpCode, FrameError> {
        match byte {
            1 => Ok(OpCode::Text),
            2 => Ok(OpCode::Binary),
            8 => Ok(OpCode::Close),
            9 => Ok(OpCode::Ping),
            10 => Ok(OpCode::Pong),
            i => Err(FrameError::InvalidOpcode(i)),
        }
    }
}

/// Status code used to indicate why an endpoint is closing the WebSocket connection.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum CloseCode {
    /// Indicates a normal closure, meaning that the purpose for
    /// which the connection was established has been fulfilled.
    Normal,
    /// Indicates that an endpoint is "going away", such as a server
    /// going down or a browser having navigated away from a page.
    Away,
    /// Indicates that an endpoint is terminating the connection due
    /// to a protocol error.
    Protocol,
    /// Indicates that an endpoint is terminating the connection
    /// because it has received a type of data it cannot accept.
    Unsupported,
    /// Indicates that an endpoint is terminating the connection
    /// because it has received data within a message that was not
    /// consistent with the type of the message.
    Invalid,
    /// Indicates that an endpoint is terminating the connection
    /// because it has received a message that violates its policy.
    Policy,
    /// Indicates that an endpoint is terminating the connection
    /// because it has received a message that is too big for it to
    /// process.
    Size,
    /// Indicates that a server is terminating the connection because
    /// it encountered an unexpected condition.
    Error,
    /// Any other code.
    Other(u16),
}

impl Display for CloseCode {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        let code: u16 = (*self).into();
        write!(f, "{code}")
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Invalid => 1007,
            CloseCode::Policy => 1008,
            CloseCode::Size => 1009,
            CloseCode::Error => 1011,
            CloseCode::Other(code) => code,
        }
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> CloseCode {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::Away,
            1002 => CloseCode::Protocol,
            1003 => CloseCode::Unsupported,
            1007 => CloseCode::Invalid,
            1008 => CloseCode::Policy,
            1009 => CloseCode::Size,
            1011 => CloseCode::Error,
            _ => CloseCode::Other(code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_from_u8() {
        assert_eq!(OpCode::try_from(0x1), Ok(OpCode::Text));
        assert_eq!(OpCode::try_from(0xA), Ok(OpCode::Pong));
        assert_eq!(OpCode::try_from(0x0), Err(FrameError::InvalidOpcode(0)));
        assert_eq!(OpCode::try_from(0x3), Err(FrameError::InvalidOpcode(3)));
        assert_eq!(OpCode::try_from(0xB), Err(FrameError::InvalidOpcode(11)));
    }

    #[test]
    fn opcode_into_u8() {
        for byte in [1u8, 2, 8, 9, 10] {
            let code = OpCode::try_from(byte).unwrap();
            assert_eq!(u8::from(code), byte);
        }
        assert!(OpCode::Ping.is_control());
        assert!(!OpCode::Binary.is_control());
    }

    #[test]
    fn close_code_from_u16() {
        assert_eq!(CloseCode::from(1000), CloseCode::Normal);
        assert_eq!(CloseCode::from(4000), CloseCode::Other(4000));
        assert_eq!(u16::from(CloseCode::Size), 1009);
    }
}
