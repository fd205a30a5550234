//! # Security
//!
//! Pluggable authentication for connections.
//!
//! A [`SecurityProvider`] names an authentication service (its DCE auth type)
//! and creates one [`SecurityPackage`] per connection and role. The
//! [`SecurityContext`] wraps a package and drives negotiation: tokens ride the
//! auth trailer of bind and bind_ack packets, and the client's final token is
//! sent in an `auth3`. Once established, the context signs or seals every
//! request, response and fault fragment, depending on the [`AuthLevel`].
//!
//! Packages are synchronous; all I/O is done by the connection.

pub mod context;
pub mod key_exchange;

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use zeroize::Zeroizing;

use crate::error::ProtocolResult;

pub use context::{SecurityContext, SecurityState};
pub use key_exchange::KeyExchangeProvider;

/// `RPC_C_AUTHN_NONE`
pub const AUTH_TYPE_NONE: u8 = 0;

/// Authentication level, DCE numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum AuthLevel {
    None = 1,
    Connect = 2,
    Call = 3,
    Pkt = 4,
    PktIntegrity = 5,
    PktPrivacy = 6,
}

impl AuthLevel {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(AuthLevel::None),
            2 => Some(AuthLevel::Connect),
            3 => Some(AuthLevel::Call),
            4 => Some(AuthLevel::Pkt),
            5 => Some(AuthLevel::PktIntegrity),
            6 => Some(AuthLevel::PktPrivacy),
            _ => None,
        }
    }

    /// Whether request, response and fault fragments carry a per-packet token.
    pub fn protects_packets(self) -> bool {
        self >= AuthLevel::PktIntegrity
    }
}

/// Which end of the negotiation a package plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Principal name plus optional secret material.
#[derive(Clone, Default)]
pub struct Credential {
    pub principal: String,
    pub secret: Option<Zeroizing<Vec<u8>>>,
}

impl Credential {
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            secret: None,
        }
    }

    pub fn with_secret(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.secret = Some(Zeroizing::new(secret.into()));
        self
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("principal", &self.principal)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Quality of service requested for a binding. Part of the pool match key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct QualityOfService {
    pub capabilities: u32,
    pub impersonation_level: u32,
    pub dynamic_identity: bool,
}

/// Authentication requested for a binding.
#[derive(Clone)]
pub struct AuthInfo {
    pub level: AuthLevel,
    pub provider: Arc<dyn SecurityProvider>,
    pub credential: Credential,
}

impl AuthInfo {
    pub fn new(level: AuthLevel, provider: Arc<dyn SecurityProvider>, credential: Credential) -> Self {
        Self {
            level,
            provider,
            credential,
        }
    }

    pub fn auth_type(&self) -> u8 {
        self.provider.auth_type()
    }

    /// Same service, level and principal.
    pub fn matches(&self, other: &AuthInfo) -> bool {
        self.auth_type() == other.auth_type()
            && self.level == other.level
            && self.credential.principal == other.credential.principal
    }
}

impl fmt::Debug for AuthInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthInfo")
            .field("level", &self.level)
            .field("provider", &self.provider.name())
            .field("credential", &self.credential)
            .finish()
    }
}

/// An authentication service.
pub trait SecurityProvider: Send + Sync {
    /// DCE auth type carried in the `sec_trailer`.
    fn auth_type(&self) -> u8;

    fn name(&self) -> &str;

    fn new_package(&self, role: Role) -> Box<dyn SecurityPackage>;
}

/// One side of an authenticated connection.
///
/// The client calls [`initialize`](Self::initialize) then
/// [`respond`](Self::respond); the server calls [`accept`](Self::accept) then
/// [`complete`](Self::complete). An empty challenge from `accept` means the
/// server needs no further leg; the client side of such a package reports
/// [`is_complete`](Self::is_complete) right after `initialize`.
pub trait SecurityPackage: Send {
    fn initialize(&mut self, credential: &Credential) -> ProtocolResult<Vec<u8>>;

    fn accept(&mut self, credential: &Credential, token: &[u8]) -> ProtocolResult<Vec<u8>>;

    fn respond(&mut self, challenge: &[u8]) -> ProtocolResult<Vec<u8>>;

    fn complete(&mut self, token: &[u8]) -> ProtocolResult<()>;

    /// Length of the token produced by `sign` and `seal`.
    fn signature_len(&self) -> usize;

    fn sign(&mut self, data: &[u8]) -> ProtocolResult<Vec<u8>>;

    fn verify(&mut self, data: &[u8], signature: &[u8]) -> ProtocolResult<()>;

    /// Encrypt `data` in place and return its token.
    fn seal(&mut self, data: &mut [u8]) -> ProtocolResult<Vec<u8>>;

    fn unseal(&mut self, data: &mut [u8], signature: &[u8]) -> ProtocolResult<()>;

    fn expiry(&self) -> Option<Instant> {
        None
    }

    /// Whether the client needs no challenge to finish.
    fn is_complete(&self) -> bool {
        false
    }
}
