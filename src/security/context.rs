//! Per-connection security context and its negotiation state machine.

use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, warn};

use super::{AuthInfo, AuthLevel, Credential, Role, SecurityPackage, SecurityProvider};
use crate::core::header::SecTrailer;
use crate::error::{constants, ProtocolError, ProtocolResult};

/// Negotiation progress. Only moves forward; `Failed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityState {
    Unauthenticated,
    Negotiating,
    Authorizing,
    Established,
    Failed,
}

/// Context attribute flags.
pub mod attributes {
    pub const MUTUAL_AUTH: u32 = 0x01;
    pub const INTEGRITY: u32 = 0x02;
    pub const CONFIDENTIALITY: u32 = 0x04;
}

/// Wraps a [`SecurityPackage`] for one connection.
pub struct SecurityContext {
    package: Box<dyn SecurityPackage>,
    role: Role,
    state: SecurityState,
    credential: Credential,
    auth_type: u8,
    level: AuthLevel,
    context_id: u32,
    attributes: u32,
    expiry: Option<Instant>,
}

impl SecurityContext {
    /// Client context for `auth`, not yet negotiated.
    pub fn client(auth: &AuthInfo, context_id: u32) -> Self {
        Self::new(
            auth.provider.as_ref(),
            Role::Client,
            auth.level,
            auth.credential.clone(),
            context_id,
        )
    }

    /// Server context answering a bind at `level`.
    pub fn server(
        provider: &dyn SecurityProvider,
        level: AuthLevel,
        credential: Credential,
        context_id: u32,
    ) -> Self {
        Self::new(provider, Role::Server, level, credential, context_id)
    }

    fn new(
        provider: &dyn SecurityProvider,
        role: Role,
        level: AuthLevel,
        credential: Credential,
        context_id: u32,
    ) -> Self {
        Self {
            package: provider.new_package(role),
            role,
            state: SecurityState::Unauthenticated,
            credential,
            auth_type: provider.auth_type(),
            level,
            context_id,
            attributes: 0,
            expiry: None,
        }
    }

    pub fn state(&self) -> SecurityState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == SecurityState::Established
    }

    pub fn auth_type(&self) -> u8 {
        self.auth_type
    }

    pub fn level(&self) -> AuthLevel {
        self.level
    }

    pub fn context_id(&self) -> u32 {
        self.context_id
    }

    pub fn principal(&self) -> &str {
        &self.credential.principal
    }

    pub fn attributes(&self) -> u32 {
        self.attributes
    }

    pub fn expiry(&self) -> Option<Instant> {
        self.expiry
    }

    /// Whether established fragments of call packets carry a token.
    pub fn protects_packets(&self) -> bool {
        self.is_established() && self.level.protects_packets()
    }

    /// Length of per-packet tokens.
    pub fn signature_len(&self) -> usize {
        self.package.signature_len()
    }

    /// Verifier describing this context in a `sec_trailer`.
    pub fn verifier(&self, auth_pad_len: u8) -> SecTrailer {
        SecTrailer {
            auth_type: self.auth_type,
            auth_level: self.level as u8,
            auth_pad_len,
            auth_context_id: self.context_id,
        }
    }

    fn expect(&self, role: Role, state: SecurityState) -> ProtocolResult<()> {
        if self.role == role && self.state == state {
            Ok(())
        } else {
            Err(ProtocolError::security(constants::ERR_INVALID_SECURITY_STATE))
        }
    }

    fn fail(&mut self, err: ProtocolError) -> ProtocolError {
        warn!(auth_type = self.auth_type, error = %err, "Security negotiation failed");
        self.state = SecurityState::Failed;
        err
    }

    fn establish(&mut self) {
        self.state = SecurityState::Established;
        self.attributes = attributes::MUTUAL_AUTH;
        if self.level >= AuthLevel::PktIntegrity {
            self.attributes |= attributes::INTEGRITY;
        }
        if self.level == AuthLevel::PktPrivacy {
            self.attributes |= attributes::CONFIDENTIALITY;
        }
        self.expiry = self.package.expiry();
        debug!(auth_type = self.auth_type, level = ?self.level, "Security context established");
    }

    /// Client: produce the token for the bind trailer.
    pub fn negotiate(&mut self) -> ProtocolResult<Bytes> {
        self.expect(Role::Client, SecurityState::Unauthenticated)?;
        match self.package.initialize(&self.credential) {
            Ok(token) => {
                self.state = SecurityState::Negotiating;
                Ok(Bytes::from(token))
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Client: answer the bind_ack challenge; the result goes out in an auth3.
    pub fn authorize(&mut self, challenge: &[u8]) -> ProtocolResult<Bytes> {
        self.expect(Role::Client, SecurityState::Negotiating)?;
        self.state = SecurityState::Authorizing;
        match self.package.respond(challenge) {
            Ok(token) => {
                self.establish();
                Ok(Bytes::from(token))
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Client: the bind_ack carried no challenge.
    ///
    /// Single-leg packages are established here; anything else fails.
    pub fn conclude(&mut self) -> ProtocolResult<()> {
        self.expect(Role::Client, SecurityState::Negotiating)?;
        if self.package.is_complete() {
            self.establish();
            Ok(())
        } else {
            Err(self.fail(ProtocolError::security(constants::ERR_MISSING_CHALLENGE)))
        }
    }

    /// Server: consume the bind token and produce the bind_ack challenge.
    ///
    /// Returns `None` when the package completed in a single leg.
    pub fn accept(&mut self, token: &[u8]) -> ProtocolResult<Option<Bytes>> {
        self.expect(Role::Server, SecurityState::Unauthenticated)?;
        match self.package.accept(&self.credential, token) {
            Ok(challenge) if challenge.is_empty() => {
                self.establish();
                Ok(None)
            }
            Ok(challenge) => {
                self.state = SecurityState::Authorizing;
                Ok(Some(Bytes::from(challenge)))
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Server: consume the auth3 token.
    pub fn complete(&mut self, token: &[u8]) -> ProtocolResult<()> {
        self.expect(Role::Server, SecurityState::Authorizing)?;
        match self.package.complete(token) {
            Ok(()) => {
                self.establish();
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn established(&self) -> ProtocolResult<()> {
        if self.is_established() {
            Ok(())
        } else {
            Err(ProtocolError::security(constants::ERR_CONTEXT_NOT_ESTABLISHED))
        }
    }

    pub fn sign(&mut self, data: &[u8]) -> ProtocolResult<Bytes> {
        self.established()?;
        self.package.sign(data).map(Bytes::from)
    }

    pub fn verify(&mut self, data: &[u8], signature: &[u8]) -> ProtocolResult<()> {
        self.established()?;
        self.package.verify(data, signature)
    }

    pub fn seal(&mut self, data: &mut [u8]) -> ProtocolResult<Bytes> {
        self.established()?;
        self.package.seal(data).map(Bytes::from)
    }

    pub fn unseal(&mut self, data: &mut [u8], signature: &[u8]) -> ProtocolResult<()> {
        self.established()?;
        self.package.unseal(data, signature)
    }
}

impl std::fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityContext")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("auth_type", &self.auth_type)
            .field("level", &self.level)
            .field("context_id", &self.context_id)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::security::KeyExchangeProvider;
    use std::sync::Arc;

    fn pair(level: AuthLevel) -> (SecurityContext, SecurityContext) {
        let provider = Arc::new(KeyExchangeProvider::new());
        let auth = AuthInfo::new(level, provider.clone(), Credential::new("alice"));
        let client = SecurityContext::client(&auth, 0);
        let server = SecurityContext::server(provider.as_ref(), level, Credential::new("svc"), 0);
        (client, server)
    }

    /// Accepts any token in one leg and never protects packets.
    struct OneShot;

    impl SecurityProvider for OneShot {
        fn auth_type(&self) -> u8 {
            0x44
        }

        fn name(&self) -> &str {
            "one-shot"
        }

        fn new_package(&self, _role: Role) -> Box<dyn SecurityPackage> {
            Box::new(OneShot)
        }
    }

    impl SecurityPackage for OneShot {
        fn initialize(&mut self, credential: &Credential) -> ProtocolResult<Vec<u8>> {
            Ok(credential.principal.as_bytes().to_vec())
        }

        fn accept(&mut self, _credential: &Credential, _token: &[u8]) -> ProtocolResult<Vec<u8>> {
            Ok(Vec::new())
        }

        fn respond(&mut self, _challenge: &[u8]) -> ProtocolResult<Vec<u8>> {
            Err(ProtocolError::security(constants::ERR_INVALID_SECURITY_STATE))
        }

        fn complete(&mut self, _token: &[u8]) -> ProtocolResult<()> {
            Err(ProtocolError::security(constants::ERR_INVALID_SECURITY_STATE))
        }

        fn signature_len(&self) -> usize {
            0
        }

        fn sign(&mut self, _data: &[u8]) -> ProtocolResult<Vec<u8>> {
            Ok(Vec::new())
        }

        fn verify(&mut self, _data: &[u8], _signature: &[u8]) -> ProtocolResult<()> {
            Ok(())
        }

        fn seal(&mut self, _data: &mut [u8]) -> ProtocolResult<Vec<u8>> {
            Ok(Vec::new())
        }

        fn unseal(&mut self, _data: &mut [u8], _signature: &[u8]) -> ProtocolResult<()> {
            Ok(())
        }

        fn is_complete(&self) -> bool {
            true
        }
    }

    fn establish(client: &mut SecurityContext, server: &mut SecurityContext) {
        let token = client.negotiate().unwrap();
        let challenge = server.accept(&token).unwrap().unwrap();
        let confirm = client.authorize(&challenge).unwrap();
        server.complete(&confirm).unwrap();
    }

    #[test]
    fn test_three_legs_reach_established_on_both_sides() {
        let (mut client, mut server) = pair(AuthLevel::PktPrivacy);
        assert_eq!(client.state(), SecurityState::Unauthenticated);
        let token = client.negotiate().unwrap();
        assert_eq!(client.state(), SecurityState::Negotiating);
        let challenge = server.accept(&token).unwrap().unwrap();
        assert_eq!(server.state(), SecurityState::Authorizing);
        let confirm = client.authorize(&challenge).unwrap();
        assert!(client.is_established());
        server.complete(&confirm).unwrap();
        assert!(server.is_established());
        assert_ne!(server.attributes() & attributes::CONFIDENTIALITY, 0);
    }

    #[test]
    fn test_single_leg_package_concludes_without_challenge() {
        let provider = Arc::new(OneShot);
        let auth = AuthInfo::new(AuthLevel::Connect, provider.clone(), Credential::new("alice"));
        let mut client = SecurityContext::client(&auth, 0);
        let mut server =
            SecurityContext::server(provider.as_ref(), AuthLevel::Connect, Credential::new("svc"), 0);

        let token = client.negotiate().unwrap();
        assert!(server.accept(&token).unwrap().is_none());
        assert!(server.is_established());

        client.conclude().unwrap();
        assert!(client.is_established());
        assert!(client.conclude().is_err());
    }

    #[test]
    fn test_missing_challenge_fails_a_multi_leg_context() {
        let (mut client, _) = pair(AuthLevel::Connect);
        client.negotiate().unwrap();
        assert!(matches!(client.conclude(), Err(ProtocolError::Security(_))));
        assert_eq!(client.state(), SecurityState::Failed);
    }

    #[test]
    fn test_no_renegotiation_once_established() {
        let (mut client, mut server) = pair(AuthLevel::Connect);
        establish(&mut client, &mut server);
        assert!(client.negotiate().is_err());
        assert!(client.is_established());
    }

    #[test]
    fn test_protection_requires_established_context() {
        let (mut client, _) = pair(AuthLevel::PktIntegrity);
        assert!(!client.protects_packets());
        assert!(matches!(client.sign(b"data"), Err(ProtocolError::Security(_))));
    }

    #[test]
    fn test_bad_challenge_fails_the_context() {
        let (mut client, _) = pair(AuthLevel::Connect);
        client.negotiate().unwrap();
        assert!(client.authorize(b"garbage").is_err());
        assert_eq!(client.state(), SecurityState::Failed);
    }

    #[test]
    fn test_signed_data_verifies_on_the_peer() {
        let (mut client, mut server) = pair(AuthLevel::PktIntegrity);
        establish(&mut client, &mut server);

        let sig = client.sign(b"stub data").unwrap();
        assert_eq!(sig.len(), client.signature_len());
        server.verify(b"stub data", &sig).unwrap();
        assert!(server.verify(b"stub datA", &client.sign(b"stub data").unwrap()).is_err());
    }

    #[test]
    fn test_sealed_data_unseals_on_the_peer() {
        let (mut client, mut server) = pair(AuthLevel::PktPrivacy);
        establish(&mut client, &mut server);

        let mut data = b"confidential stub".to_vec();
        let sig = server.seal(&mut data).unwrap();
        assert_ne!(&data[..], b"confidential stub");
        client.unseal(&mut data, &sig).unwrap();
        assert_eq!(&data[..], b"confidential stub");
    }
}
