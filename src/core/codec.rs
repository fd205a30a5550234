//! Fragment codec for framing PDUs over a byte stream.

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::header::{CommonHeader, Header, SecTrailer, COMMON_HEADER_LEN, SEC_TRAILER_LEN};
use crate::error::{constants, ProtocolError, ProtocolResult};

/// An auth trailer: the `sec_trailer` verifier plus its token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthTrailer {
    pub verifier: SecTrailer,
    pub token: Bytes,
}

/// One fragment as it travels on the wire.
///
/// When `auth` is present, `body` includes the `auth_pad_len` padding bytes
/// announced by the verifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub header: Header,
    pub body: Bytes,
    pub auth: Option<AuthTrailer>,
}

impl Fragment {
    /// Stub data without auth padding.
    pub fn stub_data(&self) -> Bytes {
        match &self.auth {
            Some(trailer) => {
                let pad = trailer.verifier.auth_pad_len as usize;
                self.body.slice(..self.body.len() - pad)
            }
            None => self.body.clone(),
        }
    }

    /// Total encoded length.
    pub fn wire_len(&self) -> usize {
        self.header.encoded_len()
            + self.body.len()
            + self
                .auth
                .as_ref()
                .map_or(0, |a| SEC_TRAILER_LEN + a.token.len())
    }
}

/// Frames connection-oriented PDUs by their `frag_length` field.
#[derive(Debug, Clone, Copy, Default)]
pub struct FragmentCodec;

impl Decoder for FragmentCodec {
    type Item = Fragment;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> ProtocolResult<Option<Fragment>> {
        if src.len() < COMMON_HEADER_LEN {
            return Ok(None);
        }

        let common = CommonHeader::peek(&src[..COMMON_HEADER_LEN])?;
        let frag_len = common.frag_len as usize;
        let header_len = common.header_len();
        let auth_len = common.auth_len as usize;

        if frag_len < header_len {
            return Err(ProtocolError::violation(constants::ERR_FRAGMENT_TOO_SHORT));
        }
        if auth_len > 0 && frag_len < header_len + SEC_TRAILER_LEN + auth_len {
            return Err(ProtocolError::violation(constants::ERR_AUTH_LEN_OVERFLOW));
        }

        if src.len() < frag_len {
            src.reserve(frag_len - src.len());
            return Ok(None);
        }

        let bytes = src.split_to(frag_len).freeze();
        let header = Header::decode(&bytes[..header_len])?;
        let le = header.is_little_endian();

        let (body_end, auth) = if auth_len > 0 {
            let trailer_at = frag_len - auth_len - SEC_TRAILER_LEN;
            let verifier =
                SecTrailer::decode(&bytes[trailer_at..trailer_at + SEC_TRAILER_LEN], le)?;
            let token = bytes.slice(trailer_at + SEC_TRAILER_LEN..);
            (trailer_at, Some(AuthTrailer { verifier, token }))
        } else {
            (frag_len, None)
        };

        let body = bytes.slice(header_len..body_end);
        if let Some(trailer) = &auth {
            if trailer.verifier.auth_pad_len as usize > body.len() {
                return Err(ProtocolError::violation(constants::ERR_AUTH_PAD_OVERFLOW));
            }
        }

        Ok(Some(Fragment { header, body, auth }))
    }
}

impl Encoder<Fragment> for FragmentCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frag: Fragment, dst: &mut BytesMut) -> ProtocolResult<()> {
        let total = frag.wire_len();
        if total > u16::MAX as usize {
            return Err(ProtocolError::violation(constants::ERR_OVERSIZED_PACKET));
        }

        let mut header = frag.header;
        header.common.frag_len = total as u16;
        header.common.auth_len = match &frag.auth {
            Some(trailer) if trailer.token.is_empty() => {
                return Err(ProtocolError::violation(constants::ERR_MALFORMED_TOKEN));
            }
            Some(trailer) => trailer.token.len() as u16,
            None => 0,
        };

        dst.reserve(total);
        header.encode(dst);
        dst.put_slice(&frag.body);
        if let Some(trailer) = &frag.auth {
            trailer.verifier.encode(dst, header.is_little_endian());
            dst.put_slice(&trailer.token);
        }
        Ok(())
    }
}
