//! # Core Protocol Components
//!
//! Wire format of connection-oriented PDUs: headers, packet bodies, the
//! fragment codec, and fragmentation/reassembly.
//!
//! ## Components
//! - **Header**: common and type-specific headers, `sec_trailer`
//! - **Packet**: reassembled packets and negotiation bodies
//! - **Codec**: Tokio codec framing fragments by `frag_length`
//! - **Fragment**: splitting to a frame size, reassembly by call id
//! - **Syntax**: interface and transfer syntax identifiers
//!
//! ## Security
//! - Lengths are validated before any allocation
//! - Alloc hints bound reassembly, and the buffer never exceeds the configured maximum

pub mod codec;
pub mod fragment;
pub mod header;
pub mod packet;
pub mod syntax;
