//! Length-field framing.
//!
//! Every frame is a big-endian unsigned length field of 1, 2 or 4 bytes
//! followed by exactly that many payload bytes:
//!
//! ```text
//! +----------------+---------------------------+
//! | length (W)     | payload (length bytes)    |
//! +----------------+---------------------------+
//!
//! Example (W = 4):
//! 00 00 00 05 68 65 6c 6c 6f    -> "hello"
//! ```
//!
//! There is no magic, checksum or type tag. The encoder refuses payloads whose
//! length would set the top bit of the field; the decoder rejects 4-byte fields
//! with the top bit set and anything longer than its configured maximum before
//! allocating the payload buffer.

use super::{CodecError, Decoder, Encoder, LenFieldWidth};
use crate::session::Session;
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Write the length field for a payload of `len` bytes into `out`.
pub fn encode_len(width: LenFieldWidth, len: usize, out: &mut BytesMut) -> Result<(), CodecError> {
    let max = width.max_payload_len();
    if len > max {
        return Err(CodecError::LengthOverflow { len, max });
    }
    out.put_uint(len as u64, width.bytes());
    Ok(())
}

/// Interpret a length field of exactly `width` bytes.
pub fn decode_len(width: LenFieldWidth, mut field: &[u8]) -> Result<usize, CodecError> {
    if field.len() != width.bytes() {
        return Err(CodecError::ShortRead {
            expected: width.bytes(),
            actual: field.len(),
        });
    }
    let raw = field.get_uint(width.bytes());
    if width == LenFieldWidth::W4 && raw > i32::MAX as u64 {
        return Err(CodecError::NegativeLength(raw as u32));
    }
    Ok(raw as usize)
}

/// Fill `buf` completely or fail.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), CodecError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match reader.read_exact(buf).await {
        Ok(n) if n == buf.len() => Ok(()),
        Ok(n) => Err(CodecError::ShortRead {
            expected: buf.len(),
            actual: n,
        }),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(CodecError::UnexpectedEof),
        Err(e) => Err(CodecError::Io(e)),
    }
}

/// Prepends a length field to each outbound payload.
#[derive(Debug, Clone, Copy)]
pub struct LengthFieldPrepender {
    width: LenFieldWidth,
}

impl LengthFieldPrepender {
    /// Create a prepender, validating the field width.
    pub fn new(width: usize) -> Result<Self, CodecError> {
        Ok(Self::with_width(LenFieldWidth::try_from(width)?))
    }

    pub fn with_width(width: LenFieldWidth) -> Self {
        Self { width }
    }

    pub fn width(&self) -> LenFieldWidth {
        self.width
    }

    /// Build `[length field | payload]`.
    pub fn encode_frame(&self, payload: &[u8]) -> Result<Bytes, CodecError> {
        let mut frame = BytesMut::with_capacity(self.width.bytes() + payload.len());
        encode_len(self.width, payload.len(), &mut frame)?;
        frame.extend_from_slice(payload);
        Ok(frame.freeze())
    }
}

impl Encoder for LengthFieldPrepender {
    fn encode(&mut self, _session: &Session, payload: &[u8]) -> Result<Bytes, CodecError> {
        self.encode_frame(payload)
    }
}

/// Reads length-prefixed frames, one per call.
///
/// Stateless between frames: the field is read in full, checked, and then
/// the payload is read in full. Partial socket reads are absorbed by the
/// read-full loop.
#[derive(Debug, Clone, Copy)]
pub struct LengthFieldBasedFrameDecoder {
    width: LenFieldWidth,
    max_frame_len: usize,
}

impl LengthFieldBasedFrameDecoder {
    /// Create a decoder, validating the field width.
    pub fn new(width: usize, max_frame_len: usize) -> Result<Self, CodecError> {
        Ok(Self::with_width(LenFieldWidth::try_from(width)?, max_frame_len))
    }

    pub fn with_width(width: LenFieldWidth, max_frame_len: usize) -> Self {
        Self {
            width,
            max_frame_len,
        }
    }

    pub fn width(&self) -> LenFieldWidth {
        self.width
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Read one complete frame and return its payload.
    pub async fn read_frame<R>(&self, reader: &mut R) -> Result<Bytes, CodecError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut field = [0u8; 4];
        let field = &mut field[..self.width.bytes()];
        read_full(reader, field).await?;

        let len = decode_len(self.width, field)?;
        if len > self.max_frame_len {
            return Err(CodecError::FrameTooLong {
                len,
                max: self.max_frame_len,
            });
        }

        let mut payload = BytesMut::zeroed(len);
        read_full(reader, &mut payload).await?;
        Ok(payload.freeze())
    }
}

#[async_trait]
impl Decoder for LengthFieldBasedFrameDecoder {
    async fn decode(
        &mut self,
        _session: &Session,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<Bytes, CodecError> {
        self.read_frame(reader).await
    }
}
