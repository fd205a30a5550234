//! # Packets
//!
//! A reassembled packet and the bodies of the negotiation packet types.
//!
//! ## Bind body
//! ```text
//! [n_context(1)] [reserved(1)] [reserved(2)]
//! { [context_id(2)] [n_transfer(1)] [reserved(1)] [abstract(20)] [transfer(20) * n] } * n_context
//! ```
//!
//! ## Bind ack body
//! ```text
//! [sec_addr_len(2)] [sec_addr(n, NUL terminated)] [align 4]
//! [n_results(1)] [reserved(3)] { [result(2)] [reason(2)] [transfer(20)] } * n_results
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::core::codec::AuthTrailer;
use crate::core::header::{BindHeader, Header, HeaderFields, PacketType, WireReader};
use crate::core::syntax::{SyntaxId, SYNTAX_ID_LEN};
use crate::error::{constants, ProtocolError, ProtocolResult};

/// bind_ack result values.
pub mod ack_result {
    pub const ACCEPTANCE: u16 = 0;
    pub const USER_REJECTION: u16 = 1;
    pub const PROVIDER_REJECTION: u16 = 2;
}

/// bind_ack provider reasons.
pub mod provider_reason {
    pub const NOT_SPECIFIED: u16 = 0;
    pub const ABSTRACT_SYNTAX_NOT_SUPPORTED: u16 = 1;
    pub const PROPOSED_TRANSFER_SYNTAXES_NOT_SUPPORTED: u16 = 2;
    pub const LOCAL_LIMIT_EXCEEDED: u16 = 3;
}

/// bind_nack reject reasons.
pub mod reject_reason {
    pub const NOT_SPECIFIED: u16 = 0;
    pub const TEMPORARY_CONGESTION: u16 = 1;
    pub const LOCAL_LIMIT_EXCEEDED: u16 = 2;
    pub const CALLED_PADDR_UNKNOWN: u16 = 3;
    pub const PROTOCOL_VERSION_NOT_SUPPORTED: u16 = 4;
    pub const DEFAULT_CONTEXT_NOT_SUPPORTED: u16 = 5;
    pub const USER_DATA_NOT_READABLE: u16 = 6;
    pub const NO_PSAP_AVAILABLE: u16 = 7;
    pub const UNKNOWN_AUTHN_SERVICE: u16 = 8;
    pub const INVALID_CHECKSUM: u16 = 9;
}

/// A fully reassembled packet.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Header of the first fragment, with `frag_len` and `auth_len` of that fragment.
    pub header: Header,
    /// Concatenated stub data of every fragment, padding and trailers removed.
    pub payload: Bytes,
    /// Auth trailer of the last fragment of a bind, bind_ack or auth3.
    pub auth: Option<AuthTrailer>,
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        self.header.packet_type()
    }

    pub fn into_parts(self) -> (Header, Bytes) {
        (self.header, self.payload)
    }

    /// Negotiation token, when the trailer carries one.
    pub fn auth_token(&self) -> Option<&Bytes> {
        self.auth.as_ref().map(|a| &a.token).filter(|t| !t.is_empty())
    }
}

/// One presentation context proposed in a bind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextElement {
    pub context_id: u16,
    pub abstract_syntax: SyntaxId,
    pub transfer_syntaxes: Vec<SyntaxId>,
}

/// Body of a bind packet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BindBody {
    pub contexts: Vec<ContextElement>,
}

impl BindBody {
    pub fn single(context_id: u16, abstract_syntax: SyntaxId, transfer: SyntaxId) -> Self {
        Self {
            contexts: vec![ContextElement {
                context_id,
                abstract_syntax,
                transfer_syntaxes: vec![transfer],
            }],
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(
            4 + self
                .contexts
                .iter()
                .map(|c| 4 + SYNTAX_ID_LEN * (1 + c.transfer_syntaxes.len()))
                .sum::<usize>(),
        );
        dst.put_u8(self.contexts.len() as u8);
        dst.put_u8(0);
        dst.put_u16_le(0);
        for ctx in &self.contexts {
            dst.put_u16_le(ctx.context_id);
            dst.put_u8(ctx.transfer_syntaxes.len() as u8);
            dst.put_u8(0);
            ctx.abstract_syntax.encode(&mut dst);
            for transfer in &ctx.transfer_syntaxes {
                transfer.encode(&mut dst);
            }
        }
        dst.freeze()
    }

    pub fn decode(src: &[u8], little_endian: bool) -> ProtocolResult<Self> {
        let mut r = WireReader::new(src, little_endian);
        let count = r.u8()?;
        r.skip(3)?;
        let mut contexts = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let context_id = r.u16()?;
            let n_transfer = r.u8()?;
            r.skip(1)?;
            let abstract_syntax = r.syntax_id()?;
            let mut transfer_syntaxes = Vec::with_capacity(n_transfer as usize);
            for _ in 0..n_transfer {
                transfer_syntaxes.push(r.syntax_id()?);
            }
            contexts.push(ContextElement {
                context_id,
                abstract_syntax,
                transfer_syntaxes,
            });
        }
        Ok(Self { contexts })
    }
}

/// One result entry of a bind_ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextResult {
    pub result: u16,
    pub reason: u16,
    pub transfer_syntax: SyntaxId,
}

impl ContextResult {
    pub fn accepted(transfer_syntax: SyntaxId) -> Self {
        Self {
            result: ack_result::ACCEPTANCE,
            reason: provider_reason::NOT_SPECIFIED,
            transfer_syntax,
        }
    }

    pub fn rejected(reason: u16) -> Self {
        Self {
            result: ack_result::PROVIDER_REJECTION,
            reason,
            transfer_syntax: SyntaxId::new(uuid::Uuid::nil(), 0, 0),
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.result == ack_result::ACCEPTANCE
    }
}

/// Body of a bind_ack packet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BindAckBody {
    /// Secondary address: the server endpoint, without the trailing NUL.
    pub secondary_address: String,
    pub results: Vec<ContextResult>,
}

impl BindAckBody {
    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::new();
        let addr = self.secondary_address.as_bytes();
        if addr.is_empty() {
            dst.put_u16_le(0);
        } else {
            dst.put_u16_le((addr.len() + 1) as u16);
            dst.put_slice(addr);
            dst.put_u8(0);
        }
        // the ack header is 24 bytes, so body alignment equals packet alignment
        while dst.len() % 4 != 0 {
            dst.put_u8(0);
        }
        dst.put_u8(self.results.len() as u8);
        dst.put_u8(0);
        dst.put_u16_le(0);
        for result in &self.results {
            dst.put_u16_le(result.result);
            dst.put_u16_le(result.reason);
            result.transfer_syntax.encode(&mut dst);
        }
        dst.freeze()
    }

    pub fn decode(src: &[u8], little_endian: bool) -> ProtocolResult<Self> {
        let mut r = WireReader::new(src, little_endian);
        let addr_len = r.u16()? as usize;
        let raw = r.take(addr_len)?;
        let secondary_address = String::from_utf8_lossy(raw)
            .trim_end_matches('\0')
            .to_string();
        r.align(4)?;
        let count = r.u8()?;
        r.skip(3)?;
        let mut results = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let result = r.u16()?;
            let reason = r.u16()?;
            let transfer_syntax = r.syntax_id()?;
            results.push(ContextResult {
                result,
                reason,
                transfer_syntax,
            });
        }
        Ok(Self {
            secondary_address,
            results,
        })
    }
}

/// Body of a bind_nack: the protocol versions the server supports.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BindNackBody {
    pub versions: Vec<(u8, u8)>,
}

impl BindNackBody {
    pub fn supported() -> Self {
        Self {
            versions: vec![(
                crate::core::header::RPC_VERSION_MAJOR,
                crate::core::header::RPC_VERSION_MINOR,
            )],
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(1 + 2 * self.versions.len());
        dst.put_u8(self.versions.len() as u8);
        for (major, minor) in &self.versions {
            dst.put_u8(*major);
            dst.put_u8(*minor);
        }
        dst.freeze()
    }

    /// Lenient: peers often send a bare reject reason with no version list.
    pub fn decode(src: &[u8]) -> Self {
        let mut r = WireReader::new(src, true);
        let mut versions = Vec::new();
        if let Ok(count) = r.u8() {
            for _ in 0..count {
                match (r.u8(), r.u8()) {
                    (Ok(major), Ok(minor)) => versions.push((major, minor)),
                    _ => break,
                }
            }
        }
        Self { versions }
    }
}

/// Pull the bind_ack body out of a packet known to be a bind_ack.
pub fn expect_bind_ack(packet: &Packet) -> ProtocolResult<(BindHeader, BindAckBody)> {
    match packet.header.fields {
        HeaderFields::BindAck(h) => Ok((
            h,
            BindAckBody::decode(&packet.payload, packet.header.is_little_endian())?,
        )),
        _ => Err(ProtocolError::violation(constants::ERR_UNEXPECTED_PACKET)),
    }
}
