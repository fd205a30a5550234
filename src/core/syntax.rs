//! Interface and transfer syntax identifiers.

use bytes::{Buf, BufMut};
use std::fmt;
use uuid::Uuid;

use crate::error::{constants, ProtocolError, ProtocolResult};

/// Encoded size of a [`SyntaxId`] on the wire.
pub const SYNTAX_ID_LEN: usize = 20;

/// The NDR 2.0 transfer syntax, `8a885d04-1ceb-11c9-9fe8-08002b104860` v2.0.
pub const NDR_TRANSFER_SYNTAX: SyntaxId =
    SyntaxId::new(Uuid::from_u128(0x8a885d04_1ceb_11c9_9fe8_08002b104860), 2, 0);

/// An interface or transfer syntax: a uuid plus a major/minor version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyntaxId {
    pub uuid: Uuid,
    pub version_major: u16,
    pub version_minor: u16,
}

impl SyntaxId {
    pub const fn new(uuid: Uuid, version_major: u16, version_minor: u16) -> Self {
        Self {
            uuid,
            version_major,
            version_minor,
        }
    }

    /// Write in little-endian NDR layout.
    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        dst.put_slice(&self.uuid.to_bytes_le());
        dst.put_u16_le(self.version_major);
        dst.put_u16_le(self.version_minor);
    }

    /// Read from `src`, honouring the sender's integer representation.
    pub fn decode<B: Buf>(src: &mut B, little_endian: bool) -> ProtocolResult<Self> {
        if src.remaining() < SYNTAX_ID_LEN {
            return Err(ProtocolError::violation(constants::ERR_TRUNCATED_BODY));
        }
        let mut raw = [0u8; 16];
        src.copy_to_slice(&mut raw);
        let uuid = if little_endian {
            Uuid::from_bytes_le(raw)
        } else {
            Uuid::from_bytes(raw)
        };
        let (major, minor) = if little_endian {
            (src.get_u16_le(), src.get_u16_le())
        } else {
            (src.get_u16(), src.get_u16())
        };
        Ok(Self::new(uuid, major, minor))
    }
}

impl fmt::Display for SyntaxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} v{}.{}",
            self.uuid, self.version_major, self.version_minor
        )
    }
}
