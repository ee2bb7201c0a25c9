//! Frame envelope: `size[4] type[1] tag[2] args`.
//!
//! `size` counts the whole frame including itself. The session reads raw
//! frames through [`FrameCodec`] so that a message of an unknown type can
//! still be answered with its tag.

use crate::{
    error::Error,
    fcall::{HEADER_SIZE, Msg},
    res, serialize,
    utils::Result,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Decoder;

const SIZE_FIELD: usize = 4;

/// A frame whose envelope has been parsed but whose arguments have not.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawFrame {
    pub typ: u8,
    pub tag: u16,
    pub args: Bytes,
}

impl RawFrame {
    /// Decode the arguments according to the frame type.
    pub fn decode(&self) -> Result<Msg> {
        serialize::decode_body(self.typ, self.tag, &self.args)
    }
}

/// Splits a byte stream into [`RawFrame`]s, rejecting frames shorter than
/// the header or longer than `max_size`.
#[derive(Copy, Clone, Debug)]
pub struct FrameCodec {
    max_size: u32,
}

impl FrameCodec {
    pub fn new(max_size: u32) -> FrameCodec {
        FrameCodec { max_size }
    }

    fn check_size(&self, size: u32) -> Result<usize> {
        if (size as usize) < HEADER_SIZE || size > self.max_size {
            return res!(Error::BadFrame);
        }
        Ok(size as usize)
    }
}

impl Decoder for FrameCodec {
    type Item = RawFrame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RawFrame>> {
        if src.len() < SIZE_FIELD {
            return Ok(None);
        }

        let size = self.check_size(u32::from_le_bytes([src[0], src[1], src[2], src[3]]))?;
        if src.len() < size {
            src.reserve(size - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(size);
        frame.advance(SIZE_FIELD);
        let typ = frame.get_u8();
        let tag = frame.get_u16_le();

        Ok(Some(RawFrame {
            typ,
            tag,
            args: frame.freeze(),
        }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<RawFrame>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => res!(Error::TruncatedFrame),
        }
    }
}

/// Serialize a message into one complete frame.
pub fn encode_msg(msg: &Msg) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(4096);
    buf.put_u32_le(0);

    let mut writer = buf.writer();
    serialize::write_msg(&mut writer, msg)?;
    let mut buf = writer.into_inner();

    let size = u32::try_from(buf.len()).map_err(|_| Error::BadFrame)?;
    buf[..SIZE_FIELD].copy_from_slice(&size.to_le_bytes());
    Ok(buf.freeze())
}

/// Read exactly one frame of at most `max_size` bytes.
///
/// Returns `None` when the stream ends cleanly before a new frame and
/// `TruncatedFrame` when it ends inside one.
pub async fn read_frame<R>(r: &mut R, max_size: u32) -> Result<Option<Msg>>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; SIZE_FIELD];
    let mut filled = 0;
    while filled < SIZE_FIELD {
        let n = r.read(&mut head[filled..]).await?;
        if n == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                res!(Error::TruncatedFrame)
            };
        }
        filled += n;
    }

    let size = FrameCodec::new(max_size).check_size(u32::from_le_bytes(head))?;
    let mut rest = vec![0u8; size - SIZE_FIELD];
    r.read_exact(&mut rest).await.map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => Error::TruncatedFrame,
        _ => Error::Io(e),
    })?;

    let tag = u16::from_le_bytes([rest[1], rest[2]]);
    serialize::decode_body(rest[0], tag, &rest[HEADER_SIZE - SIZE_FIELD..]).map(Some)
}

/// Write one complete frame with a single write.
pub async fn write_frame<W>(w: &mut W, msg: &Msg) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_msg(msg)?;
    w.write_all(&frame).await?;
    w.flush().await?;
    Ok(())
}
