//! Client/manager wire protocol.
//!
//! Every message is a fixed 16-byte header followed by a fixed-size body whose
//! layout depends only on the message class and the operation subtype. There
//! is no variable-length encoding; all integers are little-endian.
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────┬──────────────┐
//! │ Class (4)    │ Length (4)   │ Service (4)  │ Subtype (4)  │
//! └──────────────┴──────────────┴──────────────┴──────────────┘
//! ```
//!
//! `Length` covers header and body. Replies echo the request's subtype and
//! start their body with a status word: `0` on success, otherwise the legacy
//! `errno` code, in which case the rest of the body is zero.
//!
//! | Subtype | Request body                    | Reply body (after status)   |
//! |---------|---------------------------------|-----------------------------|
//! | GET     | key, size, flags                | id                          |
//! | ATTACH  | id, flags                       | size, seq, instance         |
//! | DETACH  | id, seq                         | (none)                      |
//! | CONTROL | id, command, descriptor         | descriptor                  |

use std::fmt;

use thiserror::Error;

use crate::error::ShmError;
use crate::types::{AttachFlags, GetFlags, IpcPerm, Key, SegmentId, SegmentStat};

/// Size of the common header.
pub const HEADER_SIZE: usize = 16;

/// Tag identifying the shared-memory service on the manager socket.
pub const SERVICE_ID: u32 = 0x5348_4d47; // "SHMG"

/// Largest message either side ever sends.
pub const MAX_MESSAGE_SIZE: usize = HEADER_SIZE + 8 + STAT_SIZE;

const STAT_SIZE: usize = 76;
const STATUS_SIZE: usize = 4;

pub mod class {
    pub const REQUEST: u32 = 0x01;
    pub const REPLY: u32 = 0x02;
}

/// Operation subtypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Subtype {
    Get = 1,
    Attach = 2,
    Detach = 3,
    Control = 4,
}

impl Subtype {
    const fn request_body_len(self) -> usize {
        match self {
            Self::Get => 16,
            Self::Attach | Self::Detach => 8,
            Self::Control => 8 + STAT_SIZE,
        }
    }

    const fn reply_body_len(self) -> usize {
        STATUS_SIZE
            + match self {
                Self::Get => 4,
                Self::Attach => 16,
                Self::Detach => 0,
                Self::Control => STAT_SIZE,
            }
    }

    /// Total length of a message of this subtype and class.
    #[must_use]
    pub const fn message_len(self, class: u32) -> usize {
        HEADER_SIZE
            + if class == class::REPLY {
                self.reply_body_len()
            } else {
                self.request_body_len()
            }
    }
}

impl TryFrom<u32> for Subtype {
    type Error = ProtocolError;

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Self::Get),
            2 => Ok(Self::Attach),
            3 => Ok(Self::Detach),
            4 => Ok(Self::Control),
            other => Err(ProtocolError::UnknownSubtype(other)),
        }
    }
}

impl fmt::Display for Subtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Get => "get",
            Self::Attach => "attach",
            Self::Detach => "detach",
            Self::Control => "control",
        };
        f.write_str(name)
    }
}

/// Decoded common header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub class: u32,
    pub len: u32,
    pub service: u32,
    pub subtype: u32,
}

impl Header {
    /// Decodes the header at the start of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = FrameReader::new(bytes);
        Ok(Self {
            class: r.take_u32()?,
            len: r.take_u32()?,
            service: r.take_u32()?,
            subtype: r.take_u32()?,
        })
    }

    /// Declared total length, validated against the protocol bounds.
    pub fn total_len(&self) -> Result<usize, ProtocolError> {
        let len = self.len as usize;
        if !(HEADER_SIZE..=MAX_MESSAGE_SIZE).contains(&len) {
            return Err(ProtocolError::InvalidLength {
                declared: len,
                expected: None,
            });
        }
        Ok(len)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetRequest {
    pub key: Key,
    pub size: u64,
    pub flags: GetFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachRequest {
    pub id: SegmentId,
    pub flags: AttachFlags,
}

/// `seq` is the slot sequence the client saw when it attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetachRequest {
    pub id: SegmentId,
    pub seq: u32,
}

/// `command` is sent raw; the manager validates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRequest {
    pub id: SegmentId,
    pub command: i32,
    pub stat: SegmentStat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Get(GetRequest),
    Attach(AttachRequest),
    Detach(DetachRequest),
    Control(ControlRequest),
}

impl Request {
    #[must_use]
    pub const fn subtype(&self) -> Subtype {
        match self {
            Self::Get(_) => Subtype::Get,
            Self::Attach(_) => Subtype::Attach,
            Self::Detach(_) => Subtype::Detach,
            Self::Control(_) => Subtype::Control,
        }
    }
}

/// What the client needs to map a segment it was allowed to attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachReply {
    pub size: u64,
    pub seq: u32,
    /// Tag of the manager instance that created the backing object.
    pub instance: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Get(SegmentId),
    Attach(AttachReply),
    Detach,
    Control(SegmentStat),
}

impl Reply {
    #[must_use]
    pub const fn subtype(&self) -> Subtype {
        match self {
            Self::Get(_) => Subtype::Get,
            Self::Attach(_) => Subtype::Attach,
            Self::Detach => Subtype::Detach,
            Self::Control(_) => Subtype::Control,
        }
    }
}

/// Errors during protocol encode/decode.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },
    #[error("unknown subtype: {0}")]
    UnknownSubtype(u32),
    #[error("unexpected message class: {0:#x}")]
    UnexpectedClass(u32),
    #[error("service id {0:#x} is not handled here")]
    ServiceMismatch(u32),
    #[error("invalid message length {declared} (expected {expected:?})")]
    InvalidLength {
        declared: usize,
        expected: Option<usize>,
    },
    #[error("reply subtype {got} does not answer a {sent} request")]
    SubtypeMismatch { sent: Subtype, got: Subtype },
}

struct FrameWriter<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> FrameWriter<'a> {
    fn new(buf: &'a mut Vec<u8>) -> Self {
        buf.clear();
        Self { buf }
    }

    fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn write_header(&mut self, class: u32, subtype: Subtype) {
        self.put_u32(class);
        self.put_u32(subtype.message_len(class) as u32);
        self.put_u32(SERVICE_ID);
        self.put_u32(subtype as u32);
    }

    fn put_stat(&mut self, stat: &SegmentStat) {
        let perm = &stat.perm;
        self.put_i32(perm.key);
        self.put_u32(perm.uid);
        self.put_u32(perm.gid);
        self.put_u32(perm.cuid);
        self.put_u32(perm.cgid);
        self.put_u32(perm.mode);
        self.put_u32(perm.seq);
        self.put_u64(stat.size);
        self.put_i64(stat.atime);
        self.put_i64(stat.dtime);
        self.put_i64(stat.ctime);
        self.put_i32(stat.cpid);
        self.put_i32(stat.lpid);
        self.put_u64(stat.nattch);
    }

    fn zero_fill(&mut self, total: usize) {
        self.buf.resize(total, 0);
    }
}

struct FrameReader<'a> {
    buf: &'a [u8],
    cursor: usize,
}

impl<'a> FrameReader<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf, cursor: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.cursor
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        if self.remaining() < N {
            return Err(ProtocolError::BufferTooSmall {
                need: N,
                have: self.remaining(),
            });
        }
        let mut arr = [0u8; N];
        arr.copy_from_slice(&self.buf[self.cursor..self.cursor + N]);
        self.cursor += N;
        Ok(arr)
    }

    fn take_u32(&mut self) -> Result<u32, ProtocolError> {
        self.take().map(u32::from_le_bytes)
    }

    fn take_i32(&mut self) -> Result<i32, ProtocolError> {
        self.take().map(i32::from_le_bytes)
    }

    fn take_u64(&mut self) -> Result<u64, ProtocolError> {
        self.take().map(u64::from_le_bytes)
    }

    fn take_i64(&mut self) -> Result<i64, ProtocolError> {
        self.take().map(i64::from_le_bytes)
    }

    fn take_stat(&mut self) -> Result<SegmentStat, ProtocolError> {
        let perm = IpcPerm {
            key: self.take_i32()?,
            uid: self.take_u32()?,
            gid: self.take_u32()?,
            cuid: self.take_u32()?,
            cgid: self.take_u32()?,
            mode: self.take_u32()?,
            seq: self.take_u32()?,
        };
        Ok(SegmentStat {
            perm,
            size: self.take_u64()?,
            atime: self.take_i64()?,
            dtime: self.take_i64()?,
            ctime: self.take_i64()?,
            cpid: self.take_i32()?,
            lpid: self.take_i32()?,
            nattch: self.take_u64()?,
        })
    }
}

/// Checks class, service id and length of a complete message and returns its
/// subtype.
fn check_envelope(bytes: &[u8], want_class: u32) -> Result<Subtype, ProtocolError> {
    let header = Header::decode(bytes)?;
    if header.class != want_class {
        return Err(ProtocolError::UnexpectedClass(header.class));
    }
    if header.service != SERVICE_ID {
        return Err(ProtocolError::ServiceMismatch(header.service));
    }
    let subtype = Subtype::try_from(header.subtype)?;
    let expected = subtype.message_len(want_class);
    if header.len as usize != expected || bytes.len() != expected {
        return Err(ProtocolError::InvalidLength {
            declared: header.len as usize,
            expected: Some(expected),
        });
    }
    Ok(subtype)
}

/// Encodes a request. The buffer is cleared and reused.
pub fn encode_request(req: &Request, buf: &mut Vec<u8>) {
    let mut w = FrameWriter::new(buf);
    w.write_header(class::REQUEST, req.subtype());

    match req {
        Request::Get(r) => {
            w.put_i32(r.key.as_raw());
            w.put_u64(r.size);
            w.put_u32(r.flags.bits());
        }
        Request::Attach(r) => {
            w.put_u32(r.id.as_u32());
            w.put_u32(r.flags.bits());
        }
        Request::Detach(r) => {
            w.put_u32(r.id.as_u32());
            w.put_u32(r.seq);
        }
        Request::Control(r) => {
            w.put_u32(r.id.as_u32());
            w.put_i32(r.command);
            w.put_stat(&r.stat);
        }
    }
}

/// Decodes a complete request message.
pub fn decode_request(bytes: &[u8]) -> Result<Request, ProtocolError> {
    let subtype = check_envelope(bytes, class::REQUEST)?;
    let mut r = FrameReader::new(&bytes[HEADER_SIZE..]);

    let req = match subtype {
        Subtype::Get => Request::Get(GetRequest {
            key: Key::new(r.take_i32()?),
            size: r.take_u64()?,
            flags: GetFlags::from_bits_truncate(r.take_u32()?),
        }),
        Subtype::Attach => Request::Attach(AttachRequest {
            id: SegmentId::new(r.take_u32()?),
            flags: AttachFlags::from_bits_truncate(r.take_u32()?),
        }),
        Subtype::Detach => Request::Detach(DetachRequest {
            id: SegmentId::new(r.take_u32()?),
            seq: r.take_u32()?,
        }),
        Subtype::Control => Request::Control(ControlRequest {
            id: SegmentId::new(r.take_u32()?),
            command: r.take_i32()?,
            stat: r.take_stat()?,
        }),
    };
    Ok(req)
}

/// Encodes the outcome of a request of `subtype`. Errors become a status word
/// followed by a zeroed body of the same fixed size.
///
/// # Panics
///
/// Panics if a successful reply does not match `subtype`; handlers always
/// answer with the subtype they were called for.
pub fn encode_reply(subtype: Subtype, outcome: &Result<Reply, ShmError>, buf: &mut Vec<u8>) {
    let mut w = FrameWriter::new(buf);
    w.write_header(class::REPLY, subtype);

    match outcome {
        Ok(reply) => {
            assert_eq!(reply.subtype(), subtype, "reply answers another subtype");
            w.put_i32(0);
            match reply {
                Reply::Get(id) => w.put_u32(id.as_u32()),
                Reply::Attach(a) => {
                    w.put_u64(a.size);
                    w.put_u32(a.seq);
                    w.put_u32(a.instance);
                }
                Reply::Detach => {}
                Reply::Control(stat) => w.put_stat(stat),
            }
        }
        Err(err) => {
            w.put_i32(err.errno());
            w.zero_fill(subtype.message_len(class::REPLY));
        }
    }
}

/// Decodes a complete reply to a request of subtype `sent`.
pub fn decode_reply(bytes: &[u8], sent: Subtype) -> Result<Result<Reply, ShmError>, ProtocolError> {
    let got = check_envelope(bytes, class::REPLY)?;
    if got != sent {
        return Err(ProtocolError::SubtypeMismatch { sent, got });
    }
    let mut r = FrameReader::new(&bytes[HEADER_SIZE..]);

    let status = r.take_i32()?;
    if status != 0 {
        return Ok(Err(ShmError::from_errno(status)));
    }

    let reply = match got {
        Subtype::Get => Reply::Get(SegmentId::new(r.take_u32()?)),
        Subtype::Attach => Reply::Attach(AttachReply {
            size: r.take_u64()?,
            seq: r.take_u32()?,
            instance: r.take_u32()?,
        }),
        Subtype::Detach => Reply::Detach,
        Subtype::Control => Reply::Control(r.take_stat()?),
    };
    Ok(Ok(reply))
}

/// Encodes an error reply for a message whose subtype could not be trusted,
/// such as one carrying a foreign service id. Uses the shortest reply layout.
pub fn encode_not_handled(buf: &mut Vec<u8>, subtype: u32) {
    let subtype = Subtype::try_from(subtype).unwrap_or(Subtype::Detach);
    encode_reply(subtype, &Err(ShmError::NotHandled), buf);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_stat() -> SegmentStat {
        SegmentStat {
            perm: IpcPerm {
                key: 42,
                uid: 1000,
                gid: 100,
                cuid: 1000,
                cgid: 100,
                mode: 0o640,
                seq: 3,
            },
            size: 4096,
            atime: 1_700_000_000,
            dtime: 0,
            ctime: 1_699_999_999,
            cpid: 77,
            lpid: 78,
            nattch: 2,
        }
    }

    #[test]
    fn stat_layout_is_fixed() {
        let mut buf = Vec::new();
        FrameWriter::new(&mut buf).put_stat(&sample_stat());
        assert_eq!(buf.len(), STAT_SIZE);
    }

    #[test]
    fn every_request_has_its_declared_length() {
        let requests = [
            Request::Get(GetRequest {
                key: Key::new(42),
                size: 4096,
                flags: GetFlags::CREATE.with_mode(0o600),
            }),
            Request::Attach(AttachRequest {
                id: SegmentId::new(1),
                flags: AttachFlags::RDONLY,
            }),
            Request::Detach(DetachRequest {
                id: SegmentId::new(1),
                seq: 9,
            }),
            Request::Control(ControlRequest {
                id: SegmentId::new(5),
                command: 1,
                stat: sample_stat(),
            }),
        ];

        let mut buf = Vec::new();
        for req in requests {
            encode_request(&req, &mut buf);
            assert_eq!(buf.len(), req.subtype().message_len(class::REQUEST));
            assert_eq!(decode_request(&buf).unwrap(), req);
        }
    }

    #[test]
    fn control_reply_carries_descriptor() {
        let mut buf = Vec::new();
        encode_reply(Subtype::Control, &Ok(Reply::Control(sample_stat())), &mut buf);
        let decoded = decode_reply(&buf, Subtype::Control).unwrap();
        assert_eq!(decoded, Ok(Reply::Control(sample_stat())));
    }

    #[test]
    fn error_reply_keeps_fixed_size() {
        let mut ok = Vec::new();
        encode_reply(Subtype::Control, &Ok(Reply::Control(sample_stat())), &mut ok);
        let mut err = Vec::new();
        encode_reply(Subtype::Control, &Err(ShmError::PermissionDenied), &mut err);

        assert_eq!(ok.len(), err.len());
        assert_eq!(
            decode_reply(&err, Subtype::Control).unwrap(),
            Err(ShmError::PermissionDenied)
        );
    }

    #[test]
    fn reply_to_other_subtype_is_rejected() {
        let mut buf = Vec::new();
        encode_reply(Subtype::Get, &Ok(Reply::Get(SegmentId::new(0))), &mut buf);
        assert_eq!(
            decode_reply(&buf, Subtype::Attach),
            Err(ProtocolError::SubtypeMismatch {
                sent: Subtype::Attach,
                got: Subtype::Get,
            })
        );
    }

    #[test]
    fn foreign_service_is_detected() {
        let mut buf = Vec::new();
        encode_request(
            &Request::Detach(DetachRequest {
                id: SegmentId::new(0),
                seq: 0,
            }),
            &mut buf,
        );
        buf[8..12].copy_from_slice(&0xdead_beef_u32.to_le_bytes());
        assert_eq!(
            decode_request(&buf),
            Err(ProtocolError::ServiceMismatch(0xdead_beef))
        );
    }

    #[test]
    fn truncated_message_is_rejected() {
        let mut buf = Vec::new();
        encode_request(
            &Request::Attach(AttachRequest {
                id: SegmentId::new(0),
                flags: AttachFlags::empty(),
            }),
            &mut buf,
        );
        buf.truncate(buf.len() - 1);
        assert!(matches!(
            decode_request(&buf),
            Err(ProtocolError::InvalidLength { .. })
        ));
    }

    #[test]
    fn header_bounds() {
        let header = Header {
            class: class::REQUEST,
            len: 4,
            service: SERVICE_ID,
            subtype: 1,
        };
        assert!(header.total_len().is_err());
        assert_eq!(Header::decode(&[0u8; 3]).unwrap_err(), ProtocolError::BufferTooSmall {
            need: 4,
            have: 3
        });
    }

    #[test]
    fn not_handled_reply_decodes_as_error() {
        let mut buf = Vec::new();
        encode_not_handled(&mut buf, 99);
        assert_eq!(
            decode_reply(&buf, Subtype::Detach).unwrap(),
            Err(ShmError::NotHandled)
        );
    }
}
