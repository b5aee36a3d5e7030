//! Serialize/deserialize 9P messages into/from binary.
//!
//! Two layers live here. [`write_msg`]/[`read_msg`] move a sizeless
//! message body (type, tag, fields) through a byte stream and are meant
//! to sit under length-delimited framing. [`pack`]/[`unpack`] handle a
//! whole frame including the leading 4-byte size, for callers that frame
//! by hand. Both take a `dotu` flag: the ".u" dialect adds trailing
//! fields to Tauth, Tattach, Tcreate, Rerror and the stat record, and is
//! otherwise identical on the wire.

use crate::{fcall::*, io_err, res};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_traits::FromPrimitive;
use std::fmt;
use std::io::{Cursor, Read, Result};
use std::mem;
use std::ops::{Shl, Shr};

macro_rules! decode {
    ($decoder:expr) => {
        Decodable::decode(&mut $decoder)?
    };
}

fn read_exact<R: Read + ?Sized>(r: &mut R, size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0; size];
    r.read_exact(&mut buf[..]).and(Ok(buf))
}

/// A serializing specific result to overload operators on `Result`
///
/// # Overloaded operators
/// <<, >>, ?
pub struct SResult<T>(::std::io::Result<T>);

/// A wrapper class of WriteBytesExt to provide operator overloads
/// for serializing
///
/// Operator '<<' serializes the right hand side argument into
/// the left hand side encoder
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
    pub fn encode<T: Encodable>(&mut self, data: &T) -> Result<usize> {
        let bytes = data.encode(&mut self.writer)?;
        self.bytes += bytes;
        Ok(bytes)
    }

    /// Get inner writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for Encoder<W> {
    type Output = SResult<Encoder<W>>;
    fn shl(mut self, rhs: &'a T) -> Self::Output {
        match self.encode(rhs) {
            Ok(_) => SResult(Ok(self)),
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for SResult<Encoder<W>> {
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

/// A wrapper class of ReadBytesExt to provide operator overloads
/// for deserializing
#[derive(Clone, Debug)]
pub struct Decoder<R> {
    reader: R,
}

impl<R: ReadBytesExt> Decoder<R> {
    pub fn new(reader: R) -> Decoder<R> {
        Decoder { reader }
    }
    pub fn decode<T: Decodable>(&mut self) -> Result<T> {
        Decodable::decode(&mut self.reader)
    }
    /// Get inner reader
    pub fn into_inner(self) -> R {
        self.reader
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

/// Trait representing a type which can be serialized into binary
pub trait Encodable {
    /// Encode self to w and returns the number of bytes encoded
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize>;
}

impl Encodable for u8 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u8(*self).and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u16 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u16::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u32::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u64 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u64::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for String {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        if self.len() > u16::MAX as usize {
            return res!(io_err!(InvalidInput, "string too long for 16-bit length"));
        }
        let mut bytes = (self.len() as u16).encode(w)?;
        bytes += w.write_all(self.as_bytes()).and(Ok(self.len()))?;
        Ok(bytes)
    }
}

impl Encodable for QId {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w) << &self.typ.bits() << &self.version << &self.path {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Data {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let size = self.0.len();
        let bytes = (size as u32).encode(w)? + size;
        w.write_all(&self.0)?;
        Ok(bytes)
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        if self.len() > u16::MAX as usize {
            return res!(io_err!(InvalidInput, "list too long for 16-bit count"));
        }
        match self
            .iter()
            .fold(Encoder::new(w) << &(self.len() as u16), |acc, s| acc << s)
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

/// Trait representing a type which can be deserialized from binary
pub trait Decodable: Sized {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self>;
}

impl Decodable for u8 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u8()
    }
}

impl Decodable for u16 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u16::<LittleEndian>()
    }
}

impl Decodable for u32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u32::<LittleEndian>()
    }
}

impl Decodable for u64 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u64::<LittleEndian>()
    }
}

impl Decodable for String {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        String::from_utf8(read_exact(r, len as usize)?)
            .map_err(|_| io_err!(Other, "Invalid UTF-8 sequence"))
    }
}

impl Decodable for QId {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        // from_bits_retain: the wstat sentinel qid sets every bit.
        Ok(QId {
            typ: QIdType::from_bits_retain(decode!(*r)),
            version: Decodable::decode(r)?,
            path: Decodable::decode(r)?,
        })
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

/// Encode a stat record with its single leading size field, the form
/// directory reads concatenate. Both length headers anywhere a record
/// appears are derived from the serialized body size, never patched in
/// afterwards.
pub fn write_stat<W: WriteBytesExt>(w: &mut W, stat: &Stat, dotu: bool) -> Result<usize> {
    let sr = Encoder::new(w)
        << &stat.size(dotu)
        << &stat.typ
        << &stat.dev
        << &stat.qid
        << &stat.mode
        << &stat.atime
        << &stat.mtime
        << &stat.length
        << &stat.name
        << &stat.uid
        << &stat.gid
        << &stat.muid;

    let sr = if dotu {
        sr << &stat.ext << &stat.uidnum << &stat.gidnum << &stat.muidnum
    } else {
        sr
    };

    match sr {
        SResult(Ok(enc)) => Ok(enc.bytes_written()),
        SResult(Err(e)) => Err(e),
    }
}

/// Decode a stat record with its single leading size field.
///
/// The size is authoritative: exactly that many bytes are consumed, and
/// any tail beyond the fields we know is skipped. That keeps readers of
/// directory data working against servers that append fields we have
/// never heard of.
pub fn read_stat<R: ReadBytesExt>(r: &mut R, dotu: bool) -> Result<Stat> {
    let size: u16 = Decodable::decode(r)?;
    let record = read_exact(r, size as usize)?;
    let mut buf = Cursor::new(&record[..]);

    let mut stat = Stat {
        typ: decode!(buf),
        dev: decode!(buf),
        qid: decode!(buf),
        mode: decode!(buf),
        atime: decode!(buf),
        mtime: decode!(buf),
        length: decode!(buf),
        name: decode!(buf),
        uid: decode!(buf),
        gid: decode!(buf),
        muid: decode!(buf),
        ext: String::new(),
        uidnum: NONUNAME,
        gidnum: NONUNAME,
        muidnum: NONUNAME,
    };

    if dotu {
        stat.ext = decode!(buf);
        stat.uidnum = decode!(buf);
        stat.gidnum = decode!(buf);
        stat.muidnum = decode!(buf);
    }

    Ok(stat)
}

/// Encode a stat record into a fresh buffer, for building directory data.
pub fn pack_stat(stat: &Stat, dotu: bool) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    write_stat(&mut buf, stat, dotu)?;
    Ok(buf)
}

// The stat parameter of Rstat/Twstat carries a second length in front of
// the record: the full record size including the record's own size field.
fn write_stat_param<W: WriteBytesExt>(w: &mut W, stat: &Stat, dotu: bool) -> Result<usize> {
    let mut bytes = (stat.size(dotu) + 2).encode(w)?;
    bytes += write_stat(w, stat, dotu)?;
    Ok(bytes)
}

fn read_stat_param<R: ReadBytesExt>(r: &mut R, dotu: bool) -> Result<Stat> {
    let _outer: u16 = Decodable::decode(r)?;
    read_stat(r, dotu)
}

/// Write a 9P message body (type, tag, fields) without the leading
/// 4-byte size, for use under length-delimited framing.
pub fn write_msg<W: WriteBytesExt>(w: &mut W, msg: &Msg, dotu: bool) -> Result<usize> {
    use crate::FCall::*;

    let typ = MsgType::from(&msg.body);
    let mut bytes = match Encoder::new(&mut *w) << &(typ as u8) << &msg.tag {
        SResult(Ok(enc)) => enc.bytes_written(),
        SResult(Err(e)) => return Err(e),
    };

    let buf = Encoder::new(w);
    let buf = match msg.body {
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
            ref nuname,
        } => {
            let b = buf << afid << uname << aname;
            if dotu { b << nuname } else { b }
        }
        RAuth { ref aqid } => buf << aqid,
        TAttach {
            ref fid,
            ref afid,
            ref uname,
            ref aname,
            ref nuname,
        } => {
            let b = buf << fid << afid << uname << aname;
            if dotu { b << nuname } else { b }
        }
        RAttach { ref qid } => buf << qid,
        RError {
            ref ename,
            ref errno,
        } => {
            let b = buf << ename;
            if dotu { b << errno } else { b }
        }
        TFlush { ref oldtag } => buf << oldtag,
        RFlush => SResult(Ok(buf)),
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
            ref ext,
        } => {
            let b = buf << fid << name << perm << mode;
            if dotu { b << ext } else { b }
        }
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
        RClunk => SResult(Ok(buf)),
        TRemove { ref fid } => buf << fid,
        RRemove => SResult(Ok(buf)),
        TStat { ref fid } => buf << fid,
        RStat { ref stat } => {
            let mut enc = buf;
            enc.bytes += write_stat_param(&mut enc.writer, stat, dotu)?;
            SResult(Ok(enc))
        }
        TWStat { ref fid, ref stat } => match buf << fid {
            SResult(Ok(mut enc)) => {
                enc.bytes += write_stat_param(&mut enc.writer, stat, dotu)?;
                SResult(Ok(enc))
            }
            e => e,
        },
        RWStat => SResult(Ok(buf)),
    };

    match buf {
        SResult(Ok(b)) => {
            bytes += b.bytes_written();
            Ok(bytes)
        }
        SResult(Err(e)) => Err(e),
    }
}

/// Read a 9P message body (type, tag, fields) without the leading
/// 4-byte size. Rejects unknown message types.
pub fn read_msg<R: ReadBytesExt>(r: &mut R, dotu: bool) -> Result<Msg> {
    use crate::MsgType::*;

    let mut buf = r;

    let msg_type = MsgType::from_u8(decode!(buf));
    let tag = decode!(buf);
    let body = match msg_type {
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
            nuname: if dotu { decode!(buf) } else { NONUNAME },
        },
        Some(RAuth) => FCall::RAuth { aqid: decode!(buf) },
        Some(TAttach) => FCall::TAttach {
            fid: decode!(buf),
            afid: decode!(buf),
            uname: decode!(buf),
            aname: decode!(buf),
            nuname: if dotu { decode!(buf) } else { NONUNAME },
        },
        Some(RAttach) => FCall::RAttach { qid: decode!(buf) },
        Some(RError) => FCall::RError {
            ename: decode!(buf),
            errno: if dotu { decode!(buf) } else { 0 },
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
            ext: if dotu { decode!(buf) } else { String::new() },
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
            stat: read_stat_param(buf, dotu)?,
        },
        Some(TWStat) => FCall::TWStat {
            fid: decode!(buf),
            stat: read_stat_param(buf, dotu)?,
        },
        Some(RWStat) => FCall::RWStat,
        None => return res!(io_err!(Other, "Invalid message type")),
    };

    Ok(Msg { tag, body })
}

/// Why [`unpack`] could not produce a message.
#[derive(Debug, PartialEq, Eq)]
pub enum UnpackError {
    /// The buffer holds less than one whole frame; the value is the
    /// total byte count the frame needs (4 until the size prefix itself
    /// is complete). Read more and retry.
    NeedMore(usize),
    /// The frame can never decode; the connection is beyond saving.
    Malformed(String),
}

impl fmt::Display for UnpackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnpackError::NeedMore(want) => write!(f, "need {want} bytes for a whole message"),
            UnpackError::Malformed(m) => write!(f, "malformed message: {m}"),
        }
    }
}

/// Pack a whole frame: 4-byte LE size (including itself), type, tag,
/// fields. Fails when a field exceeds its on-wire range.
pub fn pack(msg: &Msg, dotu: bool) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; 4];
    write_msg(&mut buf, msg, dotu)?;
    let size = buf.len() as u32;
    buf[..4].copy_from_slice(&size.to_le_bytes());
    Ok(buf)
}

/// Unpack one whole frame from the head of `buf`.
///
/// Returns the message and the number of bytes consumed; the caller owns
/// advancing past them. A short buffer is `NeedMore`, never conflated
/// with a decode failure.
pub fn unpack(buf: &[u8], dotu: bool) -> ::std::result::Result<(Msg, usize), UnpackError> {
    if buf.len() < 4 {
        return Err(UnpackError::NeedMore(4));
    }

    let size = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if size < 7 {
        return Err(UnpackError::Malformed(format!(
            "impossible message size {size}"
        )));
    }
    if buf.len() < size {
        return Err(UnpackError::NeedMore(size));
    }

    let mut body = Cursor::new(&buf[4..size]);
    let msg = read_msg(&mut body, dotu).map_err(|e| UnpackError::Malformed(e.to_string()))?;
    if body.position() as usize != size - 4 {
        return Err(UnpackError::Malformed(
            "message fields do not fill the length prefix".to_owned(),
        ));
    }

    Ok((msg, size))
}

#[cfg(test)]
fn roundtrip(msg: &Msg, dotu: bool) {
    let buf = pack(msg, dotu).unwrap();
    assert_eq!(
        u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize,
        buf.len(),
        "length prefix mismatch for {msg:?}"
    );
    let (decoded, consumed) = unpack(&buf, dotu).unwrap();
    assert_eq!(consumed, buf.len());
    assert_eq!(*msg, decoded);
}

#[test]
fn tversion_bytes() {
    let msg = Msg {
        tag: NOTAG,
        body: FCall::TVersion {
            msize: 8192,
            version: P92000.to_owned(),
        },
    };
    let expected = [
        19, 0, 0, 0, 100, 255, 255, 0, 32, 0, 0, 6, 0, 57, 80, 50, 48, 48, 48,
    ];
    assert_eq!(pack(&msg, false).unwrap(), expected);
    assert_eq!(unpack(&expected, false).unwrap(), (msg, 19));
}

#[test]
fn tflush_bytes() {
    let msg = Msg {
        tag: 1,
        body: FCall::TFlush { oldtag: 2 },
    };
    assert_eq!(pack(&msg, false).unwrap(), [9, 0, 0, 0, 108, 1, 0, 2, 0]);
}

#[test]
fn tauth_bytes() {
    // Tauth tag 1 afid 45 uname 'rminnich' aname ''
    let msg = Msg {
        tag: 1,
        body: FCall::TAuth {
            afid: 45,
            uname: "rminnich".to_owned(),
            aname: String::new(),
            nuname: NONUNAME,
        },
    };
    let expected = [
        23, 0, 0, 0, 102, 1, 0, 45, 0, 0, 0, 8, 0, 114, 109, 105, 110, 110, 105, 99, 104, 0, 0,
    ];
    assert_eq!(pack(&msg, false).unwrap(), expected);
}

#[test]
fn tattach_bytes() {
    let msg = Msg {
        tag: 0,
        body: FCall::TAttach {
            fid: 0,
            afid: NOFID,
            uname: "rminnich".to_owned(),
            aname: "/".to_owned(),
            nuname: NONUNAME,
        },
    };
    let expected = [
        28, 0, 0, 0, 104, 0, 0, 0, 0, 0, 0, 255, 255, 255, 255, 8, 0, 114, 109, 105, 110, 110,
        105, 99, 104, 1, 0, 47,
    ];
    assert_eq!(pack(&msg, false).unwrap(), expected);
    assert_eq!(unpack(&expected, false).unwrap(), (msg, 28));
}

#[test]
fn twalk_bytes() {
    let msg = Msg {
        tag: 0,
        body: FCall::TWalk {
            fid: 0,
            newfid: 1,
            wnames: vec!["null".to_owned()],
        },
    };
    let expected = [
        23, 0, 0, 0, 110, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 1, 0, 4, 0, 110, 117, 108, 108,
    ];
    assert_eq!(pack(&msg, false).unwrap(), expected);
}

#[test]
fn topen_bytes() {
    let msg = Msg {
        tag: 0,
        body: FCall::TOpen { fid: 1, mode: 2 },
    };
    assert_eq!(
        pack(&msg, false).unwrap(),
        [12, 0, 0, 0, 112, 0, 0, 1, 0, 0, 0, 2]
    );
}

#[test]
fn tread_bytes() {
    let msg = Msg {
        tag: 0,
        body: FCall::TRead {
            fid: 1,
            offset: 0,
            count: 8192,
        },
    };
    assert_eq!(
        pack(&msg, false).unwrap(),
        [23, 0, 0, 0, 116, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 32, 0, 0]
    );
}

#[test]
fn twrite_bytes() {
    let msg = Msg {
        tag: 3,
        body: FCall::TWrite {
            fid: 139,
            offset: 0,
            data: Data(b"hi\n".to_vec()),
        },
    };
    // The length prefix covers the write payload.
    assert_eq!(
        pack(&msg, false).unwrap(),
        [26, 0, 0, 0, 118, 3, 0, 139, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 3, 0, 0, 0, 104, 105, 10]
    );
}

#[test]
fn tclunk_tremove_tstat_bytes() {
    let clunk = Msg {
        tag: 1,
        body: FCall::TClunk { fid: 49 },
    };
    let remove = Msg {
        tag: 1,
        body: FCall::TRemove { fid: 49 },
    };
    let stat = Msg {
        tag: 1,
        body: FCall::TStat { fid: 49 },
    };
    assert_eq!(
        pack(&clunk, false).unwrap(),
        [11, 0, 0, 0, 120, 1, 0, 49, 0, 0, 0]
    );
    assert_eq!(
        pack(&remove, false).unwrap(),
        [11, 0, 0, 0, 122, 1, 0, 49, 0, 0, 0]
    );
    assert_eq!(
        pack(&stat, false).unwrap(),
        [11, 0, 0, 0, 124, 1, 0, 49, 0, 0, 0]
    );
}

#[test]
fn tcreate_bytes() {
    let msg = Msg {
        tag: 3,
        body: FCall::TCreate {
            fid: 74,
            name: "y".to_owned(),
            perm: 0o666,
            mode: 0,
            ext: String::new(),
        },
    };
    assert_eq!(
        pack(&msg, false).unwrap(),
        [19, 0, 0, 0, 114, 3, 0, 74, 0, 0, 0, 1, 0, 121, 182, 1, 0, 0, 0]
    );
}

#[test]
fn twstat_sentinel_bytes() {
    // Every field at its "do not change" value, mtime set. The double
    // length prefix is 49 (record incl. its size field) then 47.
    let mut stat = Stat::unchanged();
    stat.mtime = 1445968327;
    let msg = Msg {
        tag: 3,
        body: FCall::TWStat { fid: 49, stat },
    };
    let expected = [
        62, 0, 0, 0, 126, 3, 0, 49, 0, 0, 0, 49, 0, 47, 0, 255, 255, 255, 255, 255, 255, 255,
        255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255,
        255, 255, 199, 185, 47, 86, 255, 255, 255, 255, 255, 255, 255, 255, 0, 0, 0, 0, 0, 0, 0,
        0,
    ];
    assert_eq!(pack(&msg, false).unwrap(), expected);

    let (decoded, consumed) = unpack(&expected, false).unwrap();
    assert_eq!(consumed, 62);
    match decoded.body {
        FCall::TWStat { fid, stat } => {
            assert_eq!(fid, 49);
            assert_eq!(stat.length, !0);
            assert_eq!(stat.qid.typ.bits(), 0xff);
            assert_eq!(stat.qid.path, !0);
            assert_eq!(stat.mtime, 1445968327);
            assert_eq!(stat.name, "");
        }
        other => panic!("wrong body: {other:?}"),
    }
}

#[test]
fn twstat_sentinel_bytes_dotu() {
    let mut stat = Stat::unchanged();
    stat.mtime = 1445968327;
    stat.ext = "hi".to_owned();
    let msg = Msg {
        tag: 3,
        body: FCall::TWStat { fid: 49, stat },
    };
    let expected = [
        78, 0, 0, 0, 126, 3, 0, 49, 0, 0, 0, 65, 0, 63, 0, 255, 255, 255, 255, 255, 255, 255,
        255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255,
        255, 255, 199, 185, 47, 86, 255, 255, 255, 255, 255, 255, 255, 255, 0, 0, 0, 0, 0, 0, 0,
        0, 2, 0, b'h', b'i', 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255,
    ];
    assert_eq!(pack(&msg, true).unwrap(), expected);
    roundtrip(&msg, true);
}

// Directory data captured from a real ".u" server: two records, "passwd"
// then "hosts", uid/gid/muid all "none", uidnum/gidnum 1000, muidnum ~0.
#[cfg(test)]
const DIR_DATA_DOTU: &[u8] = &[
    79, 0, 0, 0, 0, 0, 0, 0, 0, 228, 193, 233, 248, 44, 145, 3, 0, 0, 0, 0, 0, 164, 1, 0, 0, 0,
    0, 0, 0, 47, 117, 180, 83, 102, 3, 0, 0, 0, 0, 0, 0, 6, 0, 112, 97, 115, 115, 119, 100, 4, 0,
    110, 111, 110, 101, 4, 0, 110, 111, 110, 101, 4, 0, 110, 111, 110, 101, 0, 0, 232, 3, 0, 0,
    232, 3, 0, 0, 255, 255, 255, 255, 78, 0, 0, 0, 0, 0, 0, 0, 0, 123, 171, 233, 248, 42, 145, 3,
    0, 0, 0, 0, 0, 164, 1, 0, 0, 0, 0, 0, 0, 41, 117, 180, 83, 195, 0, 0, 0, 0, 0, 0, 0, 5, 0,
    104, 111, 115, 116, 115, 4, 0, 110, 111, 110, 101, 4, 0, 110, 111, 110, 101, 4, 0, 110, 111,
    110, 101, 0, 0, 232, 3, 0, 0, 232, 3, 0, 0, 255, 255, 255, 255,
];

#[test]
fn dir_data_decodes() {
    let mut cur = Cursor::new(DIR_DATA_DOTU);
    let first = read_stat(&mut cur, true).unwrap();
    let second = read_stat(&mut cur, true).unwrap();
    assert_eq!(cur.position() as usize, DIR_DATA_DOTU.len());

    assert_eq!(first.name, "passwd");
    assert_eq!(first.length, 870);
    assert_eq!(first.mode, 0o644);
    assert_eq!((first.uid.as_str(), first.gid.as_str()), ("none", "none"));
    assert_eq!((first.uidnum, first.gidnum, first.muidnum), (1000, 1000, !0));

    assert_eq!(second.name, "hosts");
    assert_eq!(second.length, 195);
}

#[test]
fn dir_data_reencodes_identically() {
    // Both embedded lengths must come out exactly as the capture has
    // them; this is the historically buggy spot of this codec family.
    let mut cur = Cursor::new(DIR_DATA_DOTU);
    let first = read_stat(&mut cur, true).unwrap();
    let second = read_stat(&mut cur, true).unwrap();

    let mut out = pack_stat(&first, true).unwrap();
    out.extend(pack_stat(&second, true).unwrap());
    assert_eq!(out, DIR_DATA_DOTU);
    assert_eq!(first.size(true), 79);
    assert_eq!(second.size(true), 78);
}

#[test]
fn needmore_is_not_malformed() {
    let msg = Msg {
        tag: 7,
        body: FCall::TRead {
            fid: 1,
            offset: 0,
            count: 128,
        },
    };
    let buf = pack(&msg, false).unwrap();

    assert_eq!(unpack(&buf[..2], false), Err(UnpackError::NeedMore(4)));
    assert_eq!(
        unpack(&buf[..10], false),
        Err(UnpackError::NeedMore(buf.len()))
    );

    // A complete frame with an unknown type byte can never decode.
    let mut bogus = buf.clone();
    bogus[4] = 200;
    assert!(matches!(
        unpack(&bogus, false),
        Err(UnpackError::Malformed(_))
    ));

    // Sizes below the smallest possible message are poison, not "wait".
    assert!(matches!(
        unpack(&[3, 0, 0, 0, 0, 0, 0], false),
        Err(UnpackError::Malformed(_))
    ));
}

#[test]
fn trailing_garbage_rejected() {
    let msg = Msg {
        tag: 0,
        body: FCall::TClunk { fid: 5 },
    };
    let mut buf = pack(&msg, false).unwrap();
    buf.extend_from_slice(&[0, 0, 0]);
    let size = buf.len() as u32;
    buf[..4].copy_from_slice(&size.to_le_bytes());
    assert!(matches!(
        unpack(&buf, false),
        Err(UnpackError::Malformed(_))
    ));
}

#[test]
fn string_too_long_fails_pack() {
    let msg = Msg {
        tag: 0,
        body: FCall::TWalk {
            fid: 0,
            newfid: 1,
            wnames: vec!["x".repeat(u16::MAX as usize + 1)],
        },
    };
    assert!(pack(&msg, false).is_err());
}

#[test]
fn roundtrip_all_kinds() {
    let qid = QId {
        typ: QIdType::DIR,
        version: 1,
        path: 42,
    };
    let stat = Stat {
        typ: 1,
        dev: 2,
        qid,
        mode: dm::DIR | 0o755,
        atime: 3,
        mtime: 4,
        length: 0,
        name: "etc".to_owned(),
        uid: "glenda".to_owned(),
        gid: "sys".to_owned(),
        muid: "glenda".to_owned(),
        ext: String::new(),
        uidnum: NONUNAME,
        gidnum: NONUNAME,
        muidnum: NONUNAME,
    };

    let bodies = vec![
        FCall::TVersion {
            msize: 8192,
            version: P92000U.to_owned(),
        },
        FCall::RVersion {
            msize: 8192,
            version: P92000U.to_owned(),
        },
        FCall::TAuth {
            afid: 1,
            uname: "glenda".to_owned(),
            aname: "/".to_owned(),
            nuname: NONUNAME,
        },
        FCall::RAuth { aqid: qid },
        FCall::TAttach {
            fid: 0,
            afid: NOFID,
            uname: "glenda".to_owned(),
            aname: "/".to_owned(),
            nuname: NONUNAME,
        },
        FCall::RAttach { qid },
        FCall::RError {
            ename: "file not found".to_owned(),
            errno: 0,
        },
        FCall::TFlush { oldtag: 9 },
        FCall::RFlush,
        FCall::TWalk {
            fid: 0,
            newfid: 1,
            wnames: vec!["usr".to_owned(), "glenda".to_owned()],
        },
        FCall::RWalk {
            wqids: vec![qid, qid],
        },
        FCall::TOpen {
            fid: 1,
            mode: om::RDWR,
        },
        FCall::ROpen { qid, iounit: 0 },
        FCall::TCreate {
            fid: 1,
            name: "tmp".to_owned(),
            perm: 0o644,
            mode: om::WRITE,
            ext: String::new(),
        },
        FCall::RCreate { qid, iounit: 0 },
        FCall::TRead {
            fid: 1,
            offset: 77,
            count: 512,
        },
        FCall::RRead {
            data: Data(vec![1, 2, 3, 4, 5]),
        },
        FCall::TWrite {
            fid: 1,
            offset: 77,
            data: Data(vec![9, 8, 7]),
        },
        FCall::RWrite { count: 3 },
        FCall::TClunk { fid: 1 },
        FCall::RClunk,
        FCall::TRemove { fid: 1 },
        FCall::RRemove,
        FCall::TStat { fid: 1 },
        FCall::RStat { stat: stat.clone() },
        FCall::TWStat {
            fid: 1,
            stat: stat.clone(),
        },
        FCall::RWStat,
    ];

    for body in bodies {
        let tag = if matches!(body, FCall::TVersion { .. } | FCall::RVersion { .. }) {
            NOTAG
        } else {
            0xbeef
        };
        roundtrip(&Msg { tag, body }, false);
    }
}

#[test]
fn roundtrip_all_kinds_dotu() {
    let qid = QId {
        typ: QIdType::FILE,
        version: 0,
        path: 7,
    };
    let stat = Stat {
        typ: 0,
        dev: 0,
        qid,
        mode: 0o644,
        atime: 1,
        mtime: 2,
        length: 13,
        name: "motd".to_owned(),
        uid: "none".to_owned(),
        gid: "none".to_owned(),
        muid: "none".to_owned(),
        ext: String::new(),
        uidnum: 1000,
        gidnum: 1000,
        muidnum: !0,
    };

    let bodies = vec![
        FCall::TAuth {
            afid: 3,
            uname: "glenda".to_owned(),
            aname: String::new(),
            nuname: 1000,
        },
        FCall::TAttach {
            fid: 0,
            afid: NOFID,
            uname: "glenda".to_owned(),
            aname: String::new(),
            nuname: 1000,
        },
        FCall::TCreate {
            fid: 1,
            name: "fifo".to_owned(),
            perm: 0o644,
            mode: om::READ,
            ext: "p".to_owned(),
        },
        FCall::RError {
            ename: "permission denied".to_owned(),
            errno: 1,
        },
        FCall::RStat { stat: stat.clone() },
        FCall::TWStat { fid: 1, stat },
    ];

    for body in bodies {
        roundtrip(&Msg { tag: 4, body }, true);
    }
}
