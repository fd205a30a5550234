//! # Fragmentation
//!
//! Splitting a packet's stub data into fragments that fit the negotiated frame
//! size, and reassembling received fragments into a [`Packet`].
//!
//! ## Layout
//! Each fragment is `header + stub chunk [+ padding + sec_trailer + token]`.
//! When a fragment carries an auth trailer, the chunk is a multiple of 16 bytes
//! except on the last fragment, which is padded up to the boundary.
//!
//! ## Reassembly
//! - The first fragment must carry FIRST; the last carries LAST.
//! - Continuation fragments must repeat the packet type and call id.
//! - A non-zero alloc hint bounds the reassembled size; fragments exceeding it
//!   abort the packet. A zero hint lets the buffer grow up to the configured
//!   maximum packet size.

use bytes::{Bytes, BytesMut};

use crate::core::codec::{AuthTrailer, Fragment};
use crate::core::header::{Header, PacketFlags, AUTH_PAD_ALIGNMENT, SEC_TRAILER_LEN};
use crate::core::packet::Packet;
use crate::error::{constants, ProtocolError, ProtocolResult};

/// Stub bytes that fit in one fragment.
///
/// `auth_token_len` is the size of the token each fragment must make room for,
/// if any. With a trailer the room is rounded down to the auth alignment.
pub fn fragment_room(header_len: usize, max_frame: usize, auth_token_len: Option<usize>) -> usize {
    match auth_token_len {
        Some(token_len) => {
            let room = max_frame.saturating_sub(header_len + SEC_TRAILER_LEN + token_len);
            room - room % AUTH_PAD_ALIGNMENT
        }
        None => max_frame.saturating_sub(header_len),
    }
}

/// Split `payload` into ordered fragments of at most `max_frame` bytes each.
///
/// FIRST is set on fragment 0 and LAST on the final fragment; alloc hints
/// carry the number of stub bytes remaining from each fragment onward. The
/// returned fragments carry no trailer yet: the sender attaches padding and a
/// token of at most `auth_token_len` bytes.
pub fn split(
    header: &Header,
    payload: &Bytes,
    max_frame: usize,
    auth_token_len: Option<usize>,
) -> ProtocolResult<Vec<Fragment>> {
    let header_len = header.encoded_len();
    let trailer_len = auth_token_len.map_or(0, |t| SEC_TRAILER_LEN + t);
    if header_len + trailer_len > max_frame {
        return Err(ProtocolError::violation(constants::ERR_FRAME_TOO_SMALL));
    }

    let room = fragment_room(header_len, max_frame, auth_token_len);
    if room == 0 && !payload.is_empty() {
        return Err(ProtocolError::violation(constants::ERR_FRAME_TOO_SMALL));
    }

    let total = payload.len();
    let mut fragments = Vec::with_capacity(if room == 0 { 1 } else { total.div_ceil(room).max(1) });
    let mut offset = 0;
    loop {
        let chunk = room.min(total - offset);
        let last = offset + chunk == total;

        let mut frag_header = *header;
        let flags = &mut frag_header.common.flags;
        flags.remove(PacketFlags::FIRST_FRAG | PacketFlags::LAST_FRAG);
        flags.set(PacketFlags::FIRST_FRAG, offset == 0);
        flags.set(PacketFlags::LAST_FRAG, last);
        frag_header.fields.set_alloc_hint((total - offset) as u32);

        fragments.push(Fragment {
            header: frag_header,
            body: payload.slice(offset..offset + chunk),
            auth: None,
        });

        offset += chunk;
        if last {
            break;
        }
    }
    Ok(fragments)
}

struct Pending {
    header: Header,
    buf: BytesMut,
    limit: Option<usize>,
}

/// Collects fragments of one packet at a time.
pub struct Reassembler {
    max_packet_size: usize,
    pending: Option<Pending>,
}

impl Reassembler {
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            max_packet_size,
            pending: None,
        }
    }

    /// Whether no packet is partially received.
    pub fn is_idle(&self) -> bool {
        self.pending.is_none()
    }

    /// Feed one fragment's stub data (padding already removed).
    ///
    /// Returns the packet when the LAST fragment arrives. Any error discards
    /// the partially received packet.
    pub fn push(
        &mut self,
        header: Header,
        stub: Bytes,
        auth: Option<AuthTrailer>,
    ) -> ProtocolResult<Option<Packet>> {
        let last = header.flags().contains(PacketFlags::LAST_FRAG);

        let Some(mut pending) = self.pending.take() else {
            if !header.flags().contains(PacketFlags::FIRST_FRAG) {
                return Err(ProtocolError::violation(constants::ERR_MISSING_FIRST_FRAG));
            }
            let limit = header
                .fields
                .alloc_hint()
                .filter(|hint| *hint > 0)
                .map(|hint| hint as usize);
            let expected = limit.unwrap_or(stub.len());
            if expected > self.max_packet_size {
                return Err(ProtocolError::violation(constants::ERR_OVERSIZED_PACKET));
            }
            if limit.is_some_and(|limit| stub.len() > limit) {
                return Err(ProtocolError::violation(constants::ERR_ALLOC_HINT_EXCEEDED));
            }
            if last {
                return Ok(Some(Packet {
                    header,
                    payload: stub,
                    auth,
                }));
            }
            let mut buf = BytesMut::with_capacity(expected);
            buf.extend_from_slice(&stub);
            self.pending = Some(Pending { header, buf, limit });
            return Ok(None);
        };

        if header.packet_type() != pending.header.packet_type()
            || header.call_id() != pending.header.call_id()
        {
            return Err(ProtocolError::violation(constants::ERR_FRAGMENT_MISMATCH));
        }
        if header.flags().contains(PacketFlags::FIRST_FRAG) {
            return Err(ProtocolError::violation(constants::ERR_UNEXPECTED_FIRST_FRAG));
        }
        let new_len = pending.buf.len() + stub.len();
        if pending.limit.is_some_and(|limit| new_len > limit) {
            return Err(ProtocolError::violation(constants::ERR_ALLOC_HINT_EXCEEDED));
        }
        if new_len > self.max_packet_size {
            return Err(ProtocolError::violation(constants::ERR_OVERSIZED_PACKET));
        }
        pending.buf.extend_from_slice(&stub);

        if last {
            Ok(Some(Packet {
                header: pending.header,
                payload: pending.buf.freeze(),
                auth,
            }))
        } else {
            self.pending = Some(pending);
            Ok(None)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::core::header::{HeaderFields, RequestHeader};

    fn request(opnum: u16) -> Header {
        Header::new(HeaderFields::Request(RequestHeader {
            opnum,
            ..Default::default()
        }))
        .with_call_id(9)
    }

    fn reassemble(frags: Vec<Fragment>) -> ProtocolResult<Packet> {
        let mut r = Reassembler::new(1 << 20);
        for frag in frags {
            if let Some(packet) = r.push(frag.header, frag.body, None)? {
                return Ok(packet);
            }
        }
        Err(ProtocolError::violation("incomplete"))
    }

    #[test]
    fn test_ten_bytes_in_four_byte_frames_make_three_fragments() {
        let payload = Bytes::from_static(b"0123456789");
        let frags = split(&request(1), &payload, 28, None).unwrap();
        assert_eq!(frags.len(), 3);
        assert_eq!(
            frags.iter().map(|f| f.body.len()).collect::<Vec<_>>(),
            vec![4, 4, 2]
        );
        assert!(frags[0].header.flags().contains(PacketFlags::FIRST_FRAG));
        assert!(!frags[0].header.flags().contains(PacketFlags::LAST_FRAG));
        assert!(frags[2].header.flags().contains(PacketFlags::LAST_FRAG));
        assert_eq!(frags[0].header.fields.alloc_hint(), Some(10));
        assert_eq!(frags[2].header.fields.alloc_hint(), Some(2));

        let packet = reassemble(frags).unwrap();
        assert_eq!(packet.payload, payload);
    }

    #[test]
    fn test_empty_payload_is_one_header_only_fragment() {
        let frags = split(&request(0), &Bytes::new(), 24, None).unwrap();
        assert_eq!(frags.len(), 1);
        let flags = frags[0].header.flags();
        assert!(flags.contains(PacketFlags::FIRST_FRAG | PacketFlags::LAST_FRAG));
        assert!(reassemble(frags).unwrap().payload.is_empty());
    }

    #[test]
    fn test_auth_room_is_aligned() {
        // 100 - 24 - 8 - 24 = 44, rounded down to 32
        assert_eq!(fragment_room(24, 100, Some(24)), 32);
        assert_eq!(fragment_room(24, 100, None), 76);
    }

    #[test]
    fn test_frame_without_room_is_rejected() {
        let payload = Bytes::from_static(b"x");
        assert!(split(&request(0), &payload, 24, None).is_err());
        assert!(split(&request(0), &payload, 60, Some(24)).is_err());
    }

    #[test]
    fn test_missing_first_flag_aborts() {
        let mut frags = split(&request(0), &Bytes::from_static(b"abcdef"), 28, None).unwrap();
        frags[0].header.common.flags.remove(PacketFlags::FIRST_FRAG);
        assert!(matches!(
            reassemble(frags),
            Err(ProtocolError::Protocol(_))
        ));
    }

    #[test]
    fn test_first_flag_on_continuation_aborts() {
        let mut frags = split(&request(0), &Bytes::from_static(b"abcdefgh"), 28, None).unwrap();
        frags[1].header.common.flags.insert(PacketFlags::FIRST_FRAG);
        let mut r = Reassembler::new(1 << 20);
        let first = frags.remove(0);
        assert!(r.push(first.header, first.body, None).unwrap().is_none());
        let second = frags.remove(0);
        assert!(matches!(
            r.push(second.header, second.body, None),
            Err(ProtocolError::Protocol(msg)) if msg == constants::ERR_UNEXPECTED_FIRST_FRAG
        ));
        assert!(r.is_idle());
    }

    #[test]
    fn test_exceeding_alloc_hint_aborts() {
        let mut frags = split(&request(0), &Bytes::from_static(b"abcdefgh"), 28, None).unwrap();
        frags[0].header.fields.set_alloc_hint(6);
        assert!(matches!(
            reassemble(frags),
            Err(ProtocolError::Protocol(_))
        ));
    }

    #[test]
    fn test_zero_alloc_hint_grows_buffer() {
        let mut frags = split(&request(0), &Bytes::from_static(b"abcdefghij"), 28, None).unwrap();
        for frag in &mut frags {
            frag.header.fields.set_alloc_hint(0);
        }
        assert_eq!(&reassemble(frags).unwrap().payload[..], b"abcdefghij");
    }

    #[test]
    fn test_foreign_call_id_aborts() {
        let mut frags = split(&request(0), &Bytes::from_static(b"abcdefgh"), 28, None).unwrap();
        frags[1].header.common.call_id = 10;
        assert!(reassemble(frags).is_err());
    }

    #[test]
    fn test_oversized_hint_is_refused_before_allocating() {
        let mut r = Reassembler::new(64);
        let mut header = request(0);
        header.common.flags = PacketFlags::FIRST_FRAG;
        header.fields.set_alloc_hint(65);
        assert!(r.push(header, Bytes::from_static(b"ab"), None).is_err());
        assert!(r.is_idle());
    }
}
