//! 9P2000 wire encoding: little-endian integers, u16-prefixed strings.
//!
//! Integers are little-endian and fixed width, strings carry a u16 length
//! prefix and raw [`Bytes`] blobs are written as-is, their length being
//! implied by the surrounding frame. Decoding never reads past the input:
//! running out of bytes is reported as [`Error::BadFrame`].

use crate::{error::Error, fcall::*, res, utils::Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use num_traits::FromPrimitive;
use std::io::{self, Read};
use std::mem;
use std::ops::{Shl, Shr};

macro_rules! decode {
    ($decoder:expr) => {
        Decodable::decode(&mut $decoder)?
    };

    ($typ:ident, $buf:expr) => {
        $typ::from_bits_retain(decode!($buf))
    };
}

/// Running out of input while decoding means the frame was malformed.
fn short_read(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::UnexpectedEof => Error::BadFrame,
        _ => Error::Io(e),
    }
}

/// Read exactly `size` bytes without trusting `size` for the allocation.
fn read_exact<R: Read + ?Sized>(r: &mut R, size: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    r.take(size as u64).read_to_end(&mut buf)?;
    if buf.len() != size {
        return res!(Error::BadFrame);
    }
    Ok(buf)
}

/// Result of a chained `<<`/`>>`, so the first failure short-circuits the rest
///
/// # Overloaded operators
/// <<, >>
pub struct SResult<T>(pub Result<T>);

impl<T> SResult<T> {
    pub fn into_result(self) -> Result<T> {
        self.0
    }
}

/// Writer side of the `<<` chaining, counting bytes written
#[derive(Clone, Debug)]
pub struct Encoder<W> {
    writer: W,
    bytes: usize,
}

impl<W: WriteBytesExt> Encoder<W> {
    pub fn new(writer: W) -> Encoder<W> {
        Encoder { writer, bytes: 0 }
    }

    /// Return total bytes written
    pub fn bytes_written(&self) -> usize {
        self.bytes
    }

    /// Encode data, equivalent to: encoder << data
    pub fn encode<T: Encodable + ?Sized>(&mut self, data: &T) -> Result<usize> {
        let bytes = data.encode(&mut self.writer)?;
        self.bytes += bytes;
        Ok(bytes)
    }

    /// Get inner writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<'a, T: Encodable + ?Sized, W: WriteBytesExt> Shl<&'a T> for Encoder<W> {
    type Output = SResult<Encoder<W>>;
    fn shl(mut self, rhs: &'a T) -> Self::Output {
        match self.encode(rhs) {
            Ok(_) => SResult(Ok(self)),
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Encodable + ?Sized, W: WriteBytesExt> Shl<&'a T> for SResult<Encoder<W>> {
    type Output = Self;
    fn shl(self, rhs: &'a T) -> Self::Output {
        match self.0 {
            Ok(mut encoder) => match encoder.encode(rhs) {
                Ok(_) => SResult(Ok(encoder)),
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// Reader adapter counting the bytes handed out
#[derive(Clone, Debug)]
struct Counted<R> {
    inner: R,
    count: usize,
}

impl<R: Read> Read for Counted<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n;
        Ok(n)
    }
}

/// Reader side of the `>>` chaining, counting bytes consumed
#[derive(Clone, Debug)]
pub struct Decoder<R> {
    reader: Counted<R>,
}

impl<R: ReadBytesExt> Decoder<R> {
    pub fn new(reader: R) -> Decoder<R> {
        Decoder {
            reader: Counted {
                inner: reader,
                count: 0,
            },
        }
    }

    pub fn decode<T: Decodable>(&mut self) -> Result<T> {
        Decodable::decode(&mut self.reader)
    }

    /// Return total bytes consumed
    pub fn bytes_read(&self) -> usize {
        self.reader.count
    }

    /// Get inner reader
    pub fn into_inner(self) -> R {
        self.reader.inner
    }
}

impl<'a, T: Decodable, R: ReadBytesExt> Shr<&'a mut T> for Decoder<R> {
    type Output = SResult<Decoder<R>>;
    fn shr(mut self, rhs: &'a mut T) -> Self::Output {
        match self.decode() {
            Ok(r) => {
                *rhs = r;
                SResult(Ok(self))
            }
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Decodable, R: ReadBytesExt> Shr<&'a mut T> for SResult<Decoder<R>> {
    type Output = Self;
    fn shr(self, rhs: &'a mut T) -> Self::Output {
        match self.0 {
            Ok(mut decoder) => match decoder.decode() {
                Ok(r) => {
                    *rhs = r;
                    SResult(Ok(decoder))
                }
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// A value with a 9P wire form
pub trait Encodable {
    /// Write `self` to `w`, returning the byte count
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize>;
}

impl Encodable for u8 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u8(*self)?;
        Ok(mem::size_of::<Self>())
    }
}

impl Encodable for u16 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u16::<LittleEndian>(*self)?;
        Ok(mem::size_of::<Self>())
    }
}

impl Encodable for u32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u32::<LittleEndian>(*self)?;
        Ok(mem::size_of::<Self>())
    }
}

impl Encodable for u64 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u64::<LittleEndian>(*self)?;
        Ok(mem::size_of::<Self>())
    }
}

impl Encodable for str {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let len = u16::try_from(self.len()).map_err(|_| Error::StringTooLong)?;
        let bytes = len.encode(w)?;
        w.write_all(self.as_bytes())?;
        Ok(bytes + self.len())
    }
}

impl Encodable for String {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        self.as_str().encode(w)
    }
}

/// Opaque blob, written raw with no length prefix
impl Encodable for Bytes {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_all(self)?;
        Ok(self.len())
    }
}

impl Encodable for QId {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        (Encoder::new(w) << &self.typ.bits() << &self.version << &self.path)
            .into_result()
            .map(|enc| enc.bytes_written())
    }
}

impl Encodable for Dir {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let size = u16::try_from(self.size()).map_err(|_| Error::StringTooLong)?;
        (Encoder::new(w)
            << &size
            << &self.typ
            << &self.dev
            << &self.qid
            << &self.mode
            << &self.atime
            << &self.mtime
            << &self.length
            << &self.name
            << &self.uid
            << &self.gid
            << &self.muid)
            .into_result()
            .map(|enc| enc.bytes_written())
    }
}

impl Encodable for Data {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let size = u32::try_from(self.0.len()).map_err(|_| Error::InvalidType)?;
        let bytes = size.encode(w)? + self.0.len();
        w.write_all(&self.0)?;
        Ok(bytes)
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let len = u16::try_from(self.len()).map_err(|_| Error::InvalidType)?;
        self.iter()
            .fold(Encoder::new(w) << &len, |acc, s| acc << s)
            .into_result()
            .map(|enc| enc.bytes_written())
    }
}

/// stat[n] as carried by `RStat` and `TWStat`: the Dir prefixed by its
/// total encoded length
fn encode_stat<W: WriteBytesExt>(w: &mut W, stat: &Dir) -> Result<usize> {
    let n = u16::try_from(stat.size() + mem::size_of::<u16>())
        .map_err(|_| Error::StringTooLong)?;
    Ok(n.encode(w)? + stat.encode(w)?)
}

fn decode_stat<R: ReadBytesExt>(r: &mut R) -> Result<Dir> {
    let n: u16 = Decodable::decode(r)?;
    let stat: Dir = Decodable::decode(r)?;
    if n as usize != stat.size() + mem::size_of::<u16>() {
        return res!(Error::BadFrame);
    }
    Ok(stat)
}

impl Encodable for Msg {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        use crate::FCall::*;

        let typ = MsgType::from(&self.body);
        let buf = Encoder::new(&mut *w) << &(typ as u8) << &self.tag;

        let buf = match self.body {
            TVersion {
                ref msize,
                ref version,
            } => buf << msize << version,
            RVersion {
                ref msize,
                ref version,
            } => buf << msize << version,
            TAuth {
                ref afid,
                ref uname,
                ref aname,
            } => buf << afid << uname << aname,
            RAuth { ref aqid } => buf << aqid,
            TAttach {
                ref fid,
                ref afid,
                ref uname,
                ref aname,
            } => buf << fid << afid << uname << aname,
            RAttach { ref qid } => buf << qid,
            RError { ref ename } => buf << ename,
            TFlush { ref oldtag } => buf << oldtag,
            RFlush => buf,
            TWalk {
                ref fid,
                ref newfid,
                ref wnames,
            } => buf << fid << newfid << wnames,
            RWalk { ref wqids } => buf << wqids,
            TOpen { ref fid, ref mode } => buf << fid << mode,
            ROpen {
                ref qid,
                ref iounit,
            } => buf << qid << iounit,
            TCreate {
                ref fid,
                ref name,
                ref perm,
                ref mode,
            } => buf << fid << name << perm << mode,
            RCreate {
                ref qid,
                ref iounit,
            } => buf << qid << iounit,
            TRead {
                ref fid,
                ref offset,
                ref count,
            } => buf << fid << offset << count,
            RRead { ref data } => buf << data,
            TWrite {
                ref fid,
                ref offset,
                ref data,
            } => buf << fid << offset << data,
            RWrite { ref count } => buf << count,
            TClunk { ref fid } => buf << fid,
            RClunk => buf,
            TRemove { ref fid } => buf << fid,
            RRemove => buf,
            TStat { ref fid } => buf << fid,
            RStat { ref stat } => {
                let head = buf.into_result()?.bytes_written();
                return Ok(head + encode_stat(w, stat)?);
            }
            TWStat { ref fid, ref stat } => {
                let enc = (buf << fid).into_result()?;
                let head = enc.bytes_written();
                return Ok(head + encode_stat(w, stat)?);
            }
            RWStat => buf,
        };

        buf.into_result().map(|enc| enc.bytes_written())
    }
}

/// A value readable from its 9P wire form
pub trait Decodable: Sized {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self>;
}

impl Decodable for u8 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u8().map_err(short_read)
    }
}

impl Decodable for u16 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u16::<LittleEndian>().map_err(short_read)
    }
}

impl Decodable for u32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u32::<LittleEndian>().map_err(short_read)
    }
}

impl Decodable for u64 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u64::<LittleEndian>().map_err(short_read)
    }
}

impl Decodable for String {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        String::from_utf8(read_exact(r, len as usize)?).map_err(|_| Error::InvalidType)
    }
}

/// Opaque blob: everything up to the end of the input
impl Decodable for Bytes {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let mut buf = Vec::new();
        r.read_to_end(&mut buf)?;
        Ok(Bytes::from(buf))
    }
}

impl Decodable for QId {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(QId {
            typ: decode!(QIdType, *r),
            version: Decodable::decode(r)?,
            path: Decodable::decode(r)?,
        })
    }
}

impl Decodable for Dir {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let size: u16 = Decodable::decode(r)?;
        let dir = Dir {
            typ: Decodable::decode(r)?,
            dev: Decodable::decode(r)?,
            qid: Decodable::decode(r)?,
            mode: Decodable::decode(r)?,
            atime: Decodable::decode(r)?,
            mtime: Decodable::decode(r)?,
            length: Decodable::decode(r)?,
            name: Decodable::decode(r)?,
            uid: Decodable::decode(r)?,
            gid: Decodable::decode(r)?,
            muid: Decodable::decode(r)?,
        };
        if size as usize != dir.size() {
            return res!(Error::BadFrame);
        }
        Ok(dir)
    }
}

impl Decodable for Data {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u32 = Decodable::decode(r)?;
        Ok(Data(read_exact(r, len as usize)?))
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        let mut buf = Vec::new();
        for _ in 0..len {
            buf.push(Decodable::decode(r)?);
        }
        Ok(buf)
    }
}

/// Decode the arguments of a message whose type and tag were already read
/// from the frame header.
///
/// Unknown codes, `TError` and codes with no request/response meaning yield
/// [`Error::UnknownMessage`] so the caller can still answer with the tag.
/// The arguments must be consumed exactly.
pub fn decode_body(typ: u8, tag: u16, args: &[u8]) -> Result<Msg> {
    use crate::MsgType::*;

    let mut buf = Counted {
        inner: args,
        count: 0,
    };

    let body = match MsgType::from_u8(typ) {
        Some(TVersion) => FCall::TVersion {
            msize: decode!(buf),
            version: decode!(buf),
        },
        Some(RVersion) => FCall::RVersion {
            msize: decode!(buf),
            version: decode!(buf),
        },
        Some(TAuth) => FCall::TAuth {
            afid: decode!(buf),
            uname: decode!(buf),
            aname: decode!(buf),
        },
        Some(RAuth) => FCall::RAuth { aqid: decode!(buf) },
        Some(TAttach) => FCall::TAttach {
            fid: decode!(buf),
            afid: decode!(buf),
            uname: decode!(buf),
            aname: decode!(buf),
        },
        Some(RAttach) => FCall::RAttach { qid: decode!(buf) },
        Some(RError) => FCall::RError {
            ename: decode!(buf),
        },
        Some(TFlush) => FCall::TFlush {
            oldtag: decode!(buf),
        },
        Some(RFlush) => FCall::RFlush,
        Some(TWalk) => FCall::TWalk {
            fid: decode!(buf),
            newfid: decode!(buf),
            wnames: decode!(buf),
        },
        Some(RWalk) => FCall::RWalk {
            wqids: decode!(buf),
        },
        Some(TOpen) => FCall::TOpen {
            fid: decode!(buf),
            mode: decode!(buf),
        },
        Some(ROpen) => FCall::ROpen {
            qid: decode!(buf),
            iounit: decode!(buf),
        },
        Some(TCreate) => FCall::TCreate {
            fid: decode!(buf),
            name: decode!(buf),
            perm: decode!(buf),
            mode: decode!(buf),
        },
        Some(RCreate) => FCall::RCreate {
            qid: decode!(buf),
            iounit: decode!(buf),
        },
        Some(TRead) => FCall::TRead {
            fid: decode!(buf),
            offset: decode!(buf),
            count: decode!(buf),
        },
        Some(RRead) => FCall::RRead { data: decode!(buf) },
        Some(TWrite) => FCall::TWrite {
            fid: decode!(buf),
            offset: decode!(buf),
            data: decode!(buf),
        },
        Some(RWrite) => FCall::RWrite {
            count: decode!(buf),
        },
        Some(TClunk) => FCall::TClunk { fid: decode!(buf) },
        Some(RClunk) => FCall::RClunk,
        Some(TRemove) => FCall::TRemove { fid: decode!(buf) },
        Some(RRemove) => FCall::RRemove,
        Some(TStat) => FCall::TStat { fid: decode!(buf) },
        Some(RStat) => FCall::RStat {
            stat: decode_stat(&mut buf)?,
        },
        Some(TWStat) => FCall::TWStat {
            fid: decode!(buf),
            stat: decode_stat(&mut buf)?,
        },
        Some(RWStat) => FCall::RWStat,
        Some(TError) | None => return res!(Error::UnknownMessage),
    };

    if buf.count != args.len() {
        return res!(Error::BadFrame);
    }

    Ok(Msg { tag, body })
}

impl Decodable for Msg {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let typ: u8 = Decodable::decode(r)?;
        let tag: u16 = Decodable::decode(r)?;
        let mut args = Vec::new();
        r.read_to_end(&mut args)?;
        decode_body(typ, tag, &args)
    }
}

/// Helper function to read a 9P message (without the size field) from a byte-oriented stream
pub fn read_msg<R: ReadBytesExt>(r: &mut R) -> Result<Msg> {
    Decodable::decode(r)
}

/// Helper function to write a 9P message (without the size field) into a byte-oriented stream
pub fn write_msg<W: WriteBytesExt>(w: &mut W, msg: &Msg) -> Result<usize> {
    msg.encode(w)
}
