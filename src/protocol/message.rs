//! Marshalling boundary: the buffer handed to operation handlers.

use bytes::{Bytes, BytesMut};
use uuid::Uuid;

use crate::core::header::DataRepresentation;
use crate::core::syntax::SyntaxId;
use crate::protocol::binding::Binding;

/// Stub data of one call plus what a handler needs to unmarshal it.
#[derive(Debug)]
pub struct Message {
    pub buffer: BytesMut,
    pub interface: SyntaxId,
    pub transfer_syntax: SyntaxId,
    pub opnum: u16,
    pub data_representation: DataRepresentation,
    pub object: Option<Uuid>,
    /// Caller of a dispatched request; `None` on responses.
    pub binding: Option<Binding>,
}

impl Message {
    pub fn new(interface: SyntaxId, transfer_syntax: SyntaxId, opnum: u16) -> Self {
        Self {
            buffer: BytesMut::new(),
            interface,
            transfer_syntax,
            opnum,
            data_representation: DataRepresentation::default(),
            object: None,
            binding: None,
        }
    }

    /// Output message for this call carrying `buffer`.
    pub fn response(&self, buffer: impl AsRef<[u8]>) -> Message {
        Message {
            buffer: BytesMut::from(buffer.as_ref()),
            interface: self.interface,
            transfer_syntax: self.transfer_syntax,
            opnum: self.opnum,
            data_representation: DataRepresentation::default(),
            object: self.object,
            binding: None,
        }
    }

    /// Output message reusing this call's buffer as rewritten in place.
    pub fn take_response(&mut self) -> Message {
        Message {
            buffer: std::mem::take(&mut self.buffer),
            interface: self.interface,
            transfer_syntax: self.transfer_syntax,
            opnum: self.opnum,
            data_representation: DataRepresentation::default(),
            object: self.object,
            binding: None,
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_bytes(self) -> Bytes {
        self.buffer.freeze()
    }

    /// Whether the sender's integers are little-endian.
    pub fn is_little_endian(&self) -> bool {
        self.data_representation.is_little_endian()
    }
}
