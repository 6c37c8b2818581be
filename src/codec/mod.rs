//! Message codecs.
//!
//! A codec turns application payloads into bytes on the wire and back.
//! Each session owns its own encoder and decoder instance, produced by the
//! factories installed on the server, so codecs may keep per-connection state.
//!
//! ## Provided Codecs
//! - `length`: big-endian length field followed by the payload

pub mod length;

pub use length::{LengthFieldBasedFrameDecoder, LengthFieldPrepender};

use crate::session::Session;
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use tokio::io::AsyncRead;

/// Frames outbound payloads.
///
/// Called on the session's write flow, once per payload taken off the
/// outbound queue. An error terminates the write flow and closes the session.
pub trait Encoder: Send {
    fn encode(&mut self, session: &Session, payload: &[u8]) -> Result<Bytes, CodecError>;
}

/// Reads one complete inbound payload.
///
/// Called in a loop on the session's read flow. Each call either returns a
/// whole payload or fails; an error terminates the read flow.
#[async_trait]
pub trait Decoder: Send {
    async fn decode(
        &mut self,
        session: &Session,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<Bytes, CodecError>;
}

/// Width of the length field in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LenFieldWidth {
    W1 = 1,
    W2 = 2,
    W4 = 4,
}

impl LenFieldWidth {
    /// Number of bytes the field occupies on the wire.
    pub fn bytes(self) -> usize {
        self as usize
    }

    /// Largest payload length the encoder accepts.
    ///
    /// This is the signed maximum of the width so the top bit stays clear
    /// for peers that read the field as a signed integer.
    pub fn max_payload_len(self) -> usize {
        match self {
            LenFieldWidth::W1 => i8::MAX as usize,
            LenFieldWidth::W2 => i16::MAX as usize,
            LenFieldWidth::W4 => i32::MAX as usize,
        }
    }
}

impl TryFrom<usize> for LenFieldWidth {
    type Error = CodecError;

    fn try_from(width: usize) -> Result<Self, Self::Error> {
        match width {
            1 => Ok(LenFieldWidth::W1),
            2 => Ok(LenFieldWidth::W2),
            4 => Ok(LenFieldWidth::W4),
            other => Err(CodecError::InvalidWidth(other)),
        }
    }
}

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid length field width {0}, expected 1, 2 or 4")]
    InvalidWidth(usize),

    #[error("payload length overflow, len: {len}, max: {max}")]
    LengthOverflow { len: usize, max: usize },

    /// The peer closed the connection before a whole frame arrived.
    #[error("unexpected end of stream")]
    UnexpectedEof,

    #[error("short read, expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    #[error("length field cannot be a negative number: {0:#010x}")]
    NegativeLength(u32),

    #[error("frame too long, len: {len}, max: {max}")]
    FrameTooLong { len: usize, max: usize },

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_width_from_usize() {
        assert_eq!(LenFieldWidth::try_from(1usize).unwrap(), LenFieldWidth::W1);
        assert_eq!(LenFieldWidth::try_from(2usize).unwrap(), LenFieldWidth::W2);
        assert_eq!(LenFieldWidth::try_from(4usize).unwrap(), LenFieldWidth::W4);

        for bad in [0usize, 3, 5, 8] {
            match LenFieldWidth::try_from(bad) {
                Err(CodecError::InvalidWidth(w)) => assert_eq!(w, bad),
                other => panic!("unexpected: {:?}", other),
            }
        }
    }

    #[test]
    fn test_max_payload_len() {
        assert_eq!(LenFieldWidth::W1.max_payload_len(), 127);
        assert_eq!(LenFieldWidth::W2.max_payload_len(), 32_767);
        assert_eq!(LenFieldWidth::W4.max_payload_len(), 2_147_483_647);
        assert_eq!(LenFieldWidth::W4.bytes(), 4);
    }
}
