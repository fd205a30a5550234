//! # Packet Headers
//!
//! Common and type-specific headers of connection-oriented PDUs.
//!
//! ## Wire Format
//! ```text
//! [rpc_vers(1)=5] [rpc_vers_minor(1)=0] [ptype(1)] [pfc_flags(1)]
//! [drep(4)] [frag_length(2)] [auth_length(2)] [call_id(4)]
//! [type-specific fields ...]
//! ```
//!
//! Multi-byte integers follow the integer representation announced in `drep`.
//! Headers built by this crate are always little-endian.

use bytes::{BufMut, BytesMut};
use uuid::Uuid;

use crate::core::syntax::{SyntaxId, SYNTAX_ID_LEN};
use crate::error::{constants, ProtocolError, ProtocolResult};

/// Supported protocol version.
pub const RPC_VERSION_MAJOR: u8 = 5;
pub const RPC_VERSION_MINOR: u8 = 0;

/// Size of the header shared by every packet type.
pub const COMMON_HEADER_LEN: usize = 16;

/// Size of the `sec_trailer` that precedes an auth token.
pub const SEC_TRAILER_LEN: usize = 8;

/// Stub data in a fragment carrying an auth trailer is padded to this boundary.
pub const AUTH_PAD_ALIGNMENT: usize = 16;

/// Fragment size every implementation must accept; used until a bind negotiates sizes.
pub const MUST_RECV_FRAG_SIZE: u16 = 1432;

/// Default negotiated frame size.
pub const DEFAULT_MAX_FRAG: u16 = 5840;

/// Packet types handled by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Request = 0,
    Response = 2,
    Fault = 3,
    Bind = 11,
    BindAck = 12,
    BindNack = 13,
    Auth3 = 16,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> ProtocolResult<Self> {
        Ok(match value {
            0 => PacketType::Request,
            2 => PacketType::Response,
            3 => PacketType::Fault,
            11 => PacketType::Bind,
            12 => PacketType::BindAck,
            13 => PacketType::BindNack,
            16 => PacketType::Auth3,
            other => return Err(ProtocolError::BadType(other)),
        })
    }
}

impl PacketType {
    /// Size of the fixed header for this type.
    pub fn header_len(self, flags: PacketFlags) -> usize {
        match self {
            PacketType::Request if flags.contains(PacketFlags::OBJECT_UUID) => 40,
            PacketType::Request | PacketType::Response => 24,
            PacketType::Fault => 32,
            PacketType::Bind | PacketType::BindAck => 24,
            PacketType::BindNack => 18,
            PacketType::Auth3 => 20,
        }
    }

    /// Whether the type carries an allocation hint.
    pub fn has_alloc_hint(self) -> bool {
        matches!(
            self,
            PacketType::Request | PacketType::Response | PacketType::Fault
        )
    }
}

/// `pfc_flags` bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct PacketFlags(pub u8);

impl PacketFlags {
    pub const FIRST_FRAG: PacketFlags = PacketFlags(0x01);
    pub const LAST_FRAG: PacketFlags = PacketFlags(0x02);
    pub const PENDING_CANCEL: PacketFlags = PacketFlags(0x04);
    pub const CONC_MPX: PacketFlags = PacketFlags(0x10);
    pub const DID_NOT_EXECUTE: PacketFlags = PacketFlags(0x20);
    pub const MAYBE: PacketFlags = PacketFlags(0x40);
    pub const OBJECT_UUID: PacketFlags = PacketFlags(0x80);

    pub const fn empty() -> Self {
        PacketFlags(0)
    }

    pub const fn contains(self, other: PacketFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: PacketFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: PacketFlags) {
        self.0 &= !other.0;
    }

    pub fn set(&mut self, other: PacketFlags, on: bool) {
        if on {
            self.insert(other)
        } else {
            self.remove(other)
        }
    }
}

impl std::ops::BitOr for PacketFlags {
    type Output = PacketFlags;

    fn bitor(self, rhs: PacketFlags) -> PacketFlags {
        PacketFlags(self.0 | rhs.0)
    }
}

/// The four `drep` bytes: integer/character representation and float format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataRepresentation(pub [u8; 4]);

impl DataRepresentation {
    /// Little-endian integers, ASCII characters, IEEE floats.
    pub const LITTLE_ENDIAN: DataRepresentation = DataRepresentation([0x10, 0, 0, 0]);
    /// Big-endian integers, ASCII characters, IEEE floats.
    pub const BIG_ENDIAN: DataRepresentation = DataRepresentation([0x00, 0, 0, 0]);

    pub fn is_little_endian(&self) -> bool {
        self.0[0] & 0xF0 == 0x10
    }
}

impl Default for DataRepresentation {
    fn default() -> Self {
        Self::LITTLE_ENDIAN
    }
}

/// Fields shared by every packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonHeader {
    pub rpc_vers: u8,
    pub rpc_vers_minor: u8,
    pub ptype: PacketType,
    pub flags: PacketFlags,
    pub drep: DataRepresentation,
    pub frag_len: u16,
    pub auth_len: u16,
    pub call_id: u32,
}

impl CommonHeader {
    /// Parse and validate the 16 leading bytes of a fragment.
    pub fn peek(src: &[u8]) -> ProtocolResult<Self> {
        if src.len() < COMMON_HEADER_LEN {
            return Err(ProtocolError::violation(constants::ERR_TRUNCATED_BODY));
        }
        let (major, minor) = (src[0], src[1]);
        if major != RPC_VERSION_MAJOR || minor != RPC_VERSION_MINOR {
            return Err(ProtocolError::BadVersion { major, minor });
        }
        let ptype = PacketType::try_from(src[2])?;
        let drep = DataRepresentation([src[4], src[5], src[6], src[7]]);
        let mut reader = WireReader::new(&src[8..COMMON_HEADER_LEN], drep.is_little_endian());
        Ok(Self {
            rpc_vers: major,
            rpc_vers_minor: minor,
            ptype,
            flags: PacketFlags(src[3]),
            drep,
            frag_len: reader.u16()?,
            auth_len: reader.u16()?,
            call_id: reader.u32()?,
        })
    }

    /// Size of the full fixed header of this fragment.
    pub fn header_len(&self) -> usize {
        self.ptype.header_len(self.flags)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestHeader {
    pub alloc_hint: u32,
    pub context_id: u16,
    pub opnum: u16,
    pub object: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResponseHeader {
    pub alloc_hint: u32,
    pub context_id: u16,
    pub cancel_count: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FaultHeader {
    pub alloc_hint: u32,
    pub context_id: u16,
    pub cancel_count: u8,
    pub status: u32,
}

/// Shared by bind and bind_ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BindHeader {
    pub max_tsize: u16,
    pub max_rsize: u16,
    pub assoc_gid: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BindNackHeader {
    pub reject_reason: u16,
}

/// Type-specific header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderFields {
    Request(RequestHeader),
    Response(ResponseHeader),
    Fault(FaultHeader),
    Bind(BindHeader),
    BindAck(BindHeader),
    BindNack(BindNackHeader),
    Auth3,
}

impl HeaderFields {
    pub fn packet_type(&self) -> PacketType {
        match self {
            HeaderFields::Request(_) => PacketType::Request,
            HeaderFields::Response(_) => PacketType::Response,
            HeaderFields::Fault(_) => PacketType::Fault,
            HeaderFields::Bind(_) => PacketType::Bind,
            HeaderFields::BindAck(_) => PacketType::BindAck,
            HeaderFields::BindNack(_) => PacketType::BindNack,
            HeaderFields::Auth3 => PacketType::Auth3,
        }
    }

    /// Allocation hint, for the types that carry one.
    pub fn alloc_hint(&self) -> Option<u32> {
        match self {
            HeaderFields::Request(h) => Some(h.alloc_hint),
            HeaderFields::Response(h) => Some(h.alloc_hint),
            HeaderFields::Fault(h) => Some(h.alloc_hint),
            _ => None,
        }
    }

    pub fn set_alloc_hint(&mut self, hint: u32) {
        match self {
            HeaderFields::Request(h) => h.alloc_hint = hint,
            HeaderFields::Response(h) => h.alloc_hint = hint,
            HeaderFields::Fault(h) => h.alloc_hint = hint,
            _ => {}
        }
    }
}

/// A complete packet or fragment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub common: CommonHeader,
    pub fields: HeaderFields,
}

/// Build a header for `fields`. `frag_len` and `auth_len` are filled in by the
/// sender once the fragment layout is known; `call_id` starts at zero.
pub fn build_header(fields: HeaderFields, drep: DataRepresentation) -> Header {
    let mut flags = PacketFlags::empty();
    if let HeaderFields::Request(RequestHeader {
        object: Some(_), ..
    }) = fields
    {
        flags.insert(PacketFlags::OBJECT_UUID);
    }
    Header {
        common: CommonHeader {
            rpc_vers: RPC_VERSION_MAJOR,
            rpc_vers_minor: RPC_VERSION_MINOR,
            ptype: fields.packet_type(),
            flags,
            drep,
            frag_len: 0,
            auth_len: 0,
            call_id: 0,
        },
        fields,
    }
}

impl Header {
    pub fn new(fields: HeaderFields) -> Self {
        build_header(fields, DataRepresentation::LITTLE_ENDIAN)
    }

    pub fn with_call_id(mut self, call_id: u32) -> Self {
        self.common.call_id = call_id;
        self
    }

    pub fn packet_type(&self) -> PacketType {
        self.common.ptype
    }

    pub fn call_id(&self) -> u32 {
        self.common.call_id
    }

    pub fn flags(&self) -> PacketFlags {
        self.common.flags
    }

    pub fn is_little_endian(&self) -> bool {
        self.common.drep.is_little_endian()
    }

    /// Encoded size of this header.
    pub fn encoded_len(&self) -> usize {
        self.common.ptype.header_len(self.common.flags)
    }

    /// Write the header in the representation announced by its `drep`.
    pub fn encode(&self, dst: &mut BytesMut) {
        let le = self.is_little_endian();
        let c = &self.common;
        dst.reserve(self.encoded_len());
        dst.put_u8(c.rpc_vers);
        dst.put_u8(c.rpc_vers_minor);
        dst.put_u8(c.ptype as u8);
        dst.put_u8(c.flags.0);
        dst.put_slice(&c.drep.0);
        put_u16(dst, c.frag_len, le);
        put_u16(dst, c.auth_len, le);
        put_u32(dst, c.call_id, le);

        match &self.fields {
            HeaderFields::Request(h) => {
                put_u32(dst, h.alloc_hint, le);
                put_u16(dst, h.context_id, le);
                put_u16(dst, h.opnum, le);
                if let Some(object) = h.object {
                    put_uuid(dst, &object, le);
                }
            }
            HeaderFields::Response(h) => {
                put_u32(dst, h.alloc_hint, le);
                put_u16(dst, h.context_id, le);
                dst.put_u8(h.cancel_count);
                dst.put_u8(0);
            }
            HeaderFields::Fault(h) => {
                put_u32(dst, h.alloc_hint, le);
                put_u16(dst, h.context_id, le);
                dst.put_u8(h.cancel_count);
                dst.put_u8(0);
                put_u32(dst, h.status, le);
                put_u32(dst, 0, le);
            }
            HeaderFields::Bind(h) | HeaderFields::BindAck(h) => {
                put_u16(dst, h.max_tsize, le);
                put_u16(dst, h.max_rsize, le);
                put_u32(dst, h.assoc_gid, le);
            }
            HeaderFields::BindNack(h) => put_u16(dst, h.reject_reason, le),
            HeaderFields::Auth3 => put_u32(dst, 0, le),
        }
    }

    /// Parse a fixed header from the start of `src`.
    pub fn decode(src: &[u8]) -> ProtocolResult<Self> {
        let common = CommonHeader::peek(src)?;
        let len = common.header_len();
        if src.len() < len {
            return Err(ProtocolError::violation(constants::ERR_TRUNCATED_BODY));
        }
        let le = common.drep.is_little_endian();
        let mut r = WireReader::new(&src[COMMON_HEADER_LEN..len], le);

        let fields = match common.ptype {
            PacketType::Request => {
                let alloc_hint = r.u32()?;
                let context_id = r.u16()?;
                let opnum = r.u16()?;
                let object = if common.flags.contains(PacketFlags::OBJECT_UUID) {
                    Some(r.uuid()?)
                } else {
                    None
                };
                HeaderFields::Request(RequestHeader {
                    alloc_hint,
                    context_id,
                    opnum,
                    object,
                })
            }
            PacketType::Response => {
                let alloc_hint = r.u32()?;
                let context_id = r.u16()?;
                let cancel_count = r.u8()?;
                HeaderFields::Response(ResponseHeader {
                    alloc_hint,
                    context_id,
                    cancel_count,
                })
            }
            PacketType::Fault => {
                let alloc_hint = r.u32()?;
                let context_id = r.u16()?;
                let cancel_count = r.u8()?;
                r.skip(1)?;
                let status = r.u32()?;
                HeaderFields::Fault(FaultHeader {
                    alloc_hint,
                    context_id,
                    cancel_count,
                    status,
                })
            }
            PacketType::Bind | PacketType::BindAck => {
                let h = BindHeader {
                    max_tsize: r.u16()?,
                    max_rsize: r.u16()?,
                    assoc_gid: r.u32()?,
                };
                if common.ptype == PacketType::Bind {
                    HeaderFields::Bind(h)
                } else {
                    HeaderFields::BindAck(h)
                }
            }
            PacketType::BindNack => HeaderFields::BindNack(BindNackHeader {
                reject_reason: r.u16()?,
            }),
            PacketType::Auth3 => HeaderFields::Auth3,
        };

        Ok(Self { common, fields })
    }
}

/// The 8-byte `sec_trailer` that introduces an auth token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SecTrailer {
    pub auth_type: u8,
    pub auth_level: u8,
    pub auth_pad_len: u8,
    pub auth_context_id: u32,
}

impl SecTrailer {
    pub fn encode(&self, dst: &mut BytesMut, little_endian: bool) {
        dst.put_u8(self.auth_type);
        dst.put_u8(self.auth_level);
        dst.put_u8(self.auth_pad_len);
        dst.put_u8(0);
        put_u32(dst, self.auth_context_id, little_endian);
    }

    pub fn decode(src: &[u8], little_endian: bool) -> ProtocolResult<Self> {
        let mut r = WireReader::new(src, little_endian);
        let auth_type = r.u8()?;
        let auth_level = r.u8()?;
        let auth_pad_len = r.u8()?;
        r.skip(1)?;
        let auth_context_id = r.u32()?;
        Ok(Self {
            auth_type,
            auth_level,
            auth_pad_len,
            auth_context_id,
        })
    }
}

/// Padding needed to bring `len` up to the auth alignment.
pub fn auth_padding(len: usize) -> usize {
    (AUTH_PAD_ALIGNMENT - len % AUTH_PAD_ALIGNMENT) % AUTH_PAD_ALIGNMENT
}

/// Bounds-checked reader honouring the sender's integer representation.
pub(crate) struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
    little_endian: bool,
}

impl<'a> WireReader<'a> {
    pub(crate) fn new(buf: &'a [u8], little_endian: bool) -> Self {
        Self {
            buf,
            pos: 0,
            little_endian,
        }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn take(&mut self, n: usize) -> ProtocolResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(ProtocolError::violation(constants::ERR_TRUNCATED_BODY));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub(crate) fn skip(&mut self, n: usize) -> ProtocolResult<()> {
        self.take(n).map(|_| ())
    }

    pub(crate) fn u8(&mut self) -> ProtocolResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> ProtocolResult<u16> {
        let b = self.take(2)?;
        let raw = [b[0], b[1]];
        Ok(if self.little_endian {
            u16::from_le_bytes(raw)
        } else {
            u16::from_be_bytes(raw)
        })
    }

    pub(crate) fn u32(&mut self) -> ProtocolResult<u32> {
        let b = self.take(4)?;
        let raw = [b[0], b[1], b[2], b[3]];
        Ok(if self.little_endian {
            u32::from_le_bytes(raw)
        } else {
            u32::from_be_bytes(raw)
        })
    }

    pub(crate) fn uuid(&mut self) -> ProtocolResult<Uuid> {
        let b = self.take(16)?;
        let mut raw = [0u8; 16];
        raw.copy_from_slice(b);
        Ok(if self.little_endian {
            Uuid::from_bytes_le(raw)
        } else {
            Uuid::from_bytes(raw)
        })
    }

    pub(crate) fn syntax_id(&mut self) -> ProtocolResult<SyntaxId> {
        let little_endian = self.little_endian;
        let mut raw = self.take(SYNTAX_ID_LEN)?;
        SyntaxId::decode(&mut raw, little_endian)
    }

    /// Skip forward so the position is a multiple of `align`.
    pub(crate) fn align(&mut self, align: usize) -> ProtocolResult<()> {
        let pad = (align - self.pos % align) % align;
        self.skip(pad)
    }
}

pub(crate) fn put_u16(dst: &mut BytesMut, v: u16, le: bool) {
    if le {
        dst.put_u16_le(v)
    } else {
        dst.put_u16(v)
    }
}

pub(crate) fn put_u32(dst: &mut BytesMut, v: u32, le: bool) {
    if le {
        dst.put_u32_le(v)
    } else {
        dst.put_u32(v)
    }
}

pub(crate) fn put_uuid(dst: &mut BytesMut, v: &Uuid, le: bool) {
    if le {
        dst.put_slice(&v.to_bytes_le())
    } else {
        dst.put_slice(v.as_bytes())
    }
}
