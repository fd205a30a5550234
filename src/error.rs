//! # Error Types
//!
//! Error handling for the RPC runtime.
//!
//! Two layers are defined here:
//! - [`ProtocolError`]: what the packet codec and connection layer produce while
//!   moving fragments between a channel and the reassembly buffer.
//! - [`RpcError`]: the single error type callers see from any failed runtime
//!   operation (binding, calling, registering, listening).
//!
//! Bind rejections carry their wire sub-reason as a [`BindRejection`], which
//! maps deterministically onto an [`RpcError`] variant.
//!
//! ## Example Usage
//! ```rust
//! use rpc_runtime::error::{BindRejection, RpcError};
//!
//! let err: RpcError = BindRejection::from_reject_reason(2).into();
//! assert!(matches!(err, RpcError::ServerTooBusy));
//! ```

use std::borrow::Cow;
use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Interface registry errors
    pub const ERR_INTERFACE_WRITE_LOCK: &str = "Failed to acquire write lock on interface registry";
    pub const ERR_INTERFACE_READ_LOCK: &str = "Failed to acquire read lock on interface registry";

    /// Wire format errors
    pub const ERR_FRAGMENT_TOO_SHORT: &str = "Fragment length shorter than its header";
    pub const ERR_AUTH_LEN_OVERFLOW: &str = "Auth trailer does not fit inside the fragment";
    pub const ERR_AUTH_PAD_OVERFLOW: &str = "Auth padding longer than the fragment body";
    pub const ERR_MISSING_FIRST_FRAG: &str = "First fragment of a packet lacks the FIRST flag";
    pub const ERR_FRAGMENT_MISMATCH: &str = "Continuation fragment does not belong to the packet";
    pub const ERR_UNEXPECTED_FIRST_FRAG: &str = "Continuation fragment carries the FIRST flag";
    pub const ERR_ALLOC_HINT_EXCEEDED: &str = "Fragments exceed the packet's allocation hint";
    pub const ERR_OVERSIZED_PACKET: &str = "Packet exceeds maximum size";
    pub const ERR_FRAME_TOO_SMALL: &str = "Frame size leaves no room for payload";
    pub const ERR_TRUNCATED_BODY: &str = "Packet body truncated";
    pub const ERR_UNEXPECTED_PACKET: &str = "Unexpected packet type";
    pub const ERR_CALL_ID_MISMATCH: &str = "Response call id does not match the request";

    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_CONNECTION_BROKEN: &str = "Connection is broken";

    /// Security errors
    pub const ERR_NO_SECURITY_CONTEXT: &str = "Auth trailer received without a security context";
    pub const ERR_CONTEXT_NOT_ESTABLISHED: &str = "Security context is not established";
    pub const ERR_INVALID_SECURITY_STATE: &str = "Security context is in the wrong state";
    pub const ERR_MISSING_VERIFIER: &str = "Protected connection received an unprotected packet";
    pub const ERR_SIGNATURE_INVALID: &str = "Packet signature verification failed";
    pub const ERR_UNSEAL_FAILED: &str = "Packet unseal failed";
    pub const ERR_REPLAY_DETECTED: &str = "Sequence number replayed";
    pub const ERR_MISSING_CHALLENGE: &str = "Bind accepted without the challenge the context needs";
    pub const ERR_MALFORMED_TOKEN: &str = "Malformed authentication token";
    pub const ERR_PEER_VERIFICATION_FAILED: &str = "Peer failed key confirmation";
    pub const ERR_STALE_TIMESTAMP: &str = "Negotiation token timestamp outside the accepted window";
    pub const ERR_SYSTEM_TIME: &str = "System time is before UNIX epoch";

    /// Binding errors
    pub const ERR_NOT_BOUND: &str = "Binding has no connection; call bind first";
    pub const ERR_SERVER_BINDING: &str = "Operation not valid on a server-side binding";

    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";
}

/// Errors raised by the packet codec and connection layer.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("Unsupported protocol version {major}.{minor}")]
    BadVersion { major: u8, minor: u8 },

    #[error("Unknown packet type: {0}")]
    BadType(u8),

    #[error("Protocol error: {0}")]
    Protocol(Cow<'static, str>),

    #[error("Security error: {0}")]
    Security(Cow<'static, str>),
}

impl ProtocolError {
    /// Protocol violation with a static message.
    pub const fn violation(message: &'static str) -> Self {
        Self::Protocol(Cow::Borrowed(message))
    }

    /// Security failure with a static message.
    pub const fn security(message: &'static str) -> Self {
        Self::Security(Cow::Borrowed(message))
    }

    /// Transport error for a peer that went away.
    pub fn closed() -> Self {
        Self::Transport(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            constants::ERR_CONNECTION_CLOSED,
        ))
    }

    /// Transport error for a send on a connection already marked broken.
    pub fn broken() -> Self {
        Self::Transport(io::Error::new(
            io::ErrorKind::BrokenPipe,
            constants::ERR_CONNECTION_BROKEN,
        ))
    }
}

/// The error callers see from any failed runtime operation.
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Transport error: {0}")]
    Transport(#[source] io::Error),

    #[error(transparent)]
    Protocol(ProtocolError),

    #[error("Interface is not supported by the server")]
    UnknownInterface,

    #[error("Server unavailable")]
    ServerUnavailable,

    #[error("Server too busy")]
    ServerTooBusy,

    #[error("Unknown authentication service")]
    UnknownAuthnService,

    #[error("Access denied")]
    AccessDenied,

    #[error("Remote call failed")]
    CallFailed,

    #[error("No association matches the requested group")]
    NoContext,

    #[error("Operation {opnum} out of range (interface has {count})")]
    OperationOutOfRange { opnum: u16, count: usize },

    #[error("Call faulted with status {0:#010x}")]
    Fault(u32),

    #[error("Unsupported protocol sequence: {0}")]
    UnsupportedProtseq(String),

    #[error("Invalid binding: {0}")]
    InvalidBinding(Cow<'static, str>),

    #[error("Server is already listening")]
    AlreadyListening,

    #[error("Server is not listening")]
    NotListening,

    #[error("Operation timed out")]
    Timeout,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<ProtocolError> for RpcError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Transport(io) => RpcError::Transport(io),
            ProtocolError::Security(_) => RpcError::AccessDenied,
            other => RpcError::Protocol(other),
        }
    }
}

impl From<io::Error> for RpcError {
    fn from(err: io::Error) -> Self {
        RpcError::Transport(err)
    }
}

/// Well-known status codes carried in fault packets.
pub mod status {
    /// `ERROR_ACCESS_DENIED`
    pub const ACCESS_DENIED: u32 = 0x0000_0005;
    /// `RPC_S_SERVER_UNAVAILABLE`
    pub const SERVER_UNAVAILABLE: u32 = 0x0000_06BA;
    /// `RPC_S_SERVER_TOO_BUSY`
    pub const SERVER_TOO_BUSY: u32 = 0x0000_06BB;
    /// `RPC_S_CALL_FAILED`
    pub const CALL_FAILED: u32 = 0x0000_06BE;
    /// `RPC_S_UNKNOWN_IF`
    pub const UNKNOWN_IF: u32 = 0x0000_06B5;
}

impl RpcError {
    /// Status code to put in a fault packet when a handler fails with this error.
    pub fn fault_status(&self) -> u32 {
        match self {
            RpcError::Fault(code) => *code,
            RpcError::AccessDenied => status::ACCESS_DENIED,
            RpcError::ServerTooBusy => status::SERVER_TOO_BUSY,
            RpcError::ServerUnavailable => status::SERVER_UNAVAILABLE,
            RpcError::UnknownInterface => status::UNKNOWN_IF,
            _ => status::CALL_FAILED,
        }
    }

    /// Error a client reports for a fault packet with the given status.
    pub fn from_fault_status(code: u32) -> Self {
        match code {
            status::CALL_FAILED => RpcError::CallFailed,
            status::ACCESS_DENIED => RpcError::AccessDenied,
            status::SERVER_TOO_BUSY => RpcError::ServerTooBusy,
            status::SERVER_UNAVAILABLE => RpcError::ServerUnavailable,
            status::UNKNOWN_IF => RpcError::UnknownInterface,
            other => RpcError::Fault(other),
        }
    }
}

/// Why a server refused a bind, decoded from a bind_ack result or a
/// bind_nack reject reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindRejection {
    /// bind_ack: the abstract syntax (interface) is not registered.
    AbstractSyntaxNotSupported,
    /// bind_ack: none of the proposed transfer syntaxes is acceptable.
    TransferSyntaxesNotSupported,
    /// bind_ack: provider or user rejection for another reason.
    Rejected { result: u16, reason: u16 },
    /// bind_nack with `REJECT_TEMPORARY_CONGESTION` or `REJECT_LOCAL_LIMIT_EXCEEDED`.
    Busy(u16),
    /// bind_nack with `REJECT_PROTOCOL_VERSION_NOT_SUPPORTED`.
    ProtocolVersionNotSupported,
    /// bind_nack with `REJECT_UNKNOWN_AUTHN_SERVICE`.
    UnknownAuthnService,
    /// bind_nack with `REJECT_INVALID_CHECKSUM`.
    InvalidChecksum,
    /// Any other bind_nack reason.
    Other(u16),
}

impl BindRejection {
    /// Decode a bind_nack reject reason.
    pub fn from_reject_reason(reason: u16) -> Self {
        use crate::core::packet::reject_reason::*;
        match reason {
            TEMPORARY_CONGESTION | LOCAL_LIMIT_EXCEEDED => BindRejection::Busy(reason),
            PROTOCOL_VERSION_NOT_SUPPORTED => BindRejection::ProtocolVersionNotSupported,
            UNKNOWN_AUTHN_SERVICE => BindRejection::UnknownAuthnService,
            INVALID_CHECKSUM => BindRejection::InvalidChecksum,
            other => BindRejection::Other(other),
        }
    }

    /// Decode a non-accepting bind_ack result entry.
    pub fn from_ack_result(result: u16, reason: u16) -> Self {
        use crate::core::packet::provider_reason::*;
        match reason {
            ABSTRACT_SYNTAX_NOT_SUPPORTED => BindRejection::AbstractSyntaxNotSupported,
            PROPOSED_TRANSFER_SYNTAXES_NOT_SUPPORTED => BindRejection::TransferSyntaxesNotSupported,
            _ => BindRejection::Rejected { result, reason },
        }
    }
}

impl From<BindRejection> for RpcError {
    fn from(rejection: BindRejection) -> Self {
        match rejection {
            BindRejection::AbstractSyntaxNotSupported => RpcError::UnknownInterface,
            BindRejection::TransferSyntaxesNotSupported => RpcError::ServerUnavailable,
            BindRejection::Rejected { .. } => RpcError::CallFailed,
            BindRejection::Busy(_) => RpcError::ServerTooBusy,
            BindRejection::ProtocolVersionNotSupported => RpcError::Protocol(
                ProtocolError::violation("Peer does not support protocol version 5.0"),
            ),
            BindRejection::UnknownAuthnService => RpcError::UnknownAuthnService,
            BindRejection::InvalidChecksum => RpcError::AccessDenied,
            BindRejection::Other(_) => RpcError::CallFailed,
        }
    }
}

/// Type alias for Results using RpcError
pub type Result<T> = std::result::Result<T, RpcError>;

/// Type alias for codec-level Results
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;
