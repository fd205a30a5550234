//! Built-in key-exchange security package.
//!
//! Three negotiation legs over X25519 with random nonces:
//!
//! 1. bind: client public key, client nonce, timestamp
//! 2. bind_ack: server public key, server nonce, hash proving the server
//!    derived the session key
//! 3. auth3: hash proving the client derived the same key
//!
//! The session key is SHA-256 over the shared secret, the optional pre-shared
//! secret of each side's credential, and both nonces. Peers holding different
//! pre-shared secrets fail the proof exchange. Per-packet tokens are a
//! ChaCha20-Poly1305 tag plus the sequence number it was computed under;
//! sequence numbers must strictly increase per direction.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce, Tag};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};
use x25519_dalek::{EphemeralSecret, PublicKey, SharedSecret};
use zeroize::Zeroizing;

use super::{Credential, Role, SecurityPackage, SecurityProvider};
use crate::error::{constants, ProtocolError, ProtocolResult};

/// Private-use DCE auth type for this package.
pub const AUTH_TYPE_KEY_EXCHANGE: u8 = 0x70;

const TOKEN_INIT: u8 = 0x01;
const TOKEN_CHALLENGE: u8 = 0x02;
const TOKEN_CONFIRM: u8 = 0x03;

const INIT_LEN: usize = 1 + 32 + 16 + 8;
const CHALLENGE_LEN: usize = 1 + 32 + 16 + 32;
const CONFIRM_LEN: usize = 1 + 32;

const SEQ_LEN: usize = 8;
const TAG_LEN: usize = 16;
/// Bytes of every sign/seal token.
pub const SIGNATURE_LEN: usize = SEQ_LEN + TAG_LEN;

const DIR_CLIENT: u8 = b'C';
const DIR_SERVER: u8 = b'S';

/// Accepted age of a client's init token.
const MAX_TOKEN_AGE: Duration = Duration::from_secs(30);
const FUTURE_TOLERANCE_MS: u64 = 2000;

/// Provider for [`AUTH_TYPE_KEY_EXCHANGE`].
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyExchangeProvider;

impl KeyExchangeProvider {
    pub fn new() -> Self {
        Self
    }
}

impl SecurityProvider for KeyExchangeProvider {
    fn auth_type(&self) -> u8 {
        AUTH_TYPE_KEY_EXCHANGE
    }

    fn name(&self) -> &str {
        "x25519-chacha20poly1305"
    }

    fn new_package(&self, role: Role) -> Box<dyn SecurityPackage> {
        Box::new(KeyExchangePackage::new(role))
    }
}

fn current_timestamp() -> ProtocolResult<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .map_err(|_| ProtocolError::security(constants::ERR_SYSTEM_TIME))
}

/// Whether `timestamp` (ms) is no older than `max_age` and at most two
/// seconds in the future.
pub fn verify_timestamp(timestamp: u64, max_age: Duration) -> bool {
    let Ok(current) = current_timestamp() else {
        return false;
    };
    if timestamp > current + FUTURE_TOLERANCE_MS {
        return false;
    }
    !(current > timestamp && current - timestamp > max_age.as_millis() as u64)
}

fn generate_nonce() -> [u8; 16] {
    let mut nonce = [0u8; 16];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

fn derive_key(
    shared: &SharedSecret,
    psk: Option<&[u8]>,
    client_nonce: &[u8],
    server_nonce: &[u8],
) -> Zeroizing<[u8; 32]> {
    let mut hasher = Sha256::new();
    hasher.update(shared.as_bytes());
    if let Some(psk) = psk {
        hasher.update(b"psk");
        hasher.update(psk);
    }
    hasher.update(b"client_nonce");
    hasher.update(client_nonce);
    hasher.update(b"server_nonce");
    hasher.update(server_nonce);
    Zeroizing::new(hasher.finalize().into())
}

fn proof(label: &[u8], key: &[u8; 32], nonce: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(label);
    hasher.update(key);
    hasher.update(nonce);
    hasher.finalize().into()
}

fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn array<const N: usize>(src: &[u8]) -> ProtocolResult<[u8; N]> {
    src.try_into()
        .map_err(|_| ProtocolError::security(constants::ERR_MALFORMED_TOKEN))
}

fn expect_token(token: &[u8], kind: u8, len: usize) -> ProtocolResult<&[u8]> {
    if token.len() != len || token[0] != kind {
        return Err(ProtocolError::security(constants::ERR_MALFORMED_TOKEN));
    }
    Ok(&token[1..])
}

/// Session state for one side of one connection.
pub struct KeyExchangePackage {
    role: Role,
    secret: Option<EphemeralSecret>,
    psk: Option<Zeroizing<Vec<u8>>>,
    client_nonce: Option<[u8; 16]>,
    server_nonce: Option<[u8; 16]>,
    pending_key: Option<Zeroizing<[u8; 32]>>,
    cipher: Option<ChaCha20Poly1305>,
    send_seq: u64,
    recv_floor: u64,
}

impl KeyExchangePackage {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            secret: None,
            psk: None,
            client_nonce: None,
            server_nonce: None,
            pending_key: None,
            cipher: None,
            send_seq: 0,
            recv_floor: 0,
        }
    }

    fn install(&mut self, key: &[u8; 32]) {
        self.cipher = Some(ChaCha20Poly1305::new(Key::from_slice(key)));
        self.secret = None;
        self.pending_key = None;
    }

    fn nonce(direction: u8, seq: u64) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[0] = direction;
        nonce[4..].copy_from_slice(&seq.to_le_bytes());
        nonce
    }

    fn directions(&self) -> (u8, u8) {
        match self.role {
            Role::Client => (DIR_CLIENT, DIR_SERVER),
            Role::Server => (DIR_SERVER, DIR_CLIENT),
        }
    }

    fn cipher(&self) -> ProtocolResult<&ChaCha20Poly1305> {
        self.cipher
            .as_ref()
            .ok_or(ProtocolError::security(constants::ERR_CONTEXT_NOT_ESTABLISHED))
    }

    fn next_send(&mut self) -> ([u8; 12], u64) {
        let seq = self.send_seq;
        self.send_seq += 1;
        (Self::nonce(self.directions().0, seq), seq)
    }

    fn check_recv(&self, signature: &[u8]) -> ProtocolResult<([u8; 12], u64, Tag)> {
        if signature.len() != SIGNATURE_LEN {
            return Err(ProtocolError::security(constants::ERR_MALFORMED_TOKEN));
        }
        let seq = u64::from_le_bytes(array(&signature[..SEQ_LEN])?);
        if seq < self.recv_floor {
            return Err(ProtocolError::security(constants::ERR_REPLAY_DETECTED));
        }
        let tag = *Tag::from_slice(&signature[SEQ_LEN..]);
        Ok((Self::nonce(self.directions().1, seq), seq, tag))
    }

    fn token(seq: u64, tag: &Tag) -> Vec<u8> {
        let mut token = Vec::with_capacity(SIGNATURE_LEN);
        token.extend_from_slice(&seq.to_le_bytes());
        token.extend_from_slice(tag);
        token
    }
}

impl SecurityPackage for KeyExchangePackage {
    #[instrument(skip_all)]
    fn initialize(&mut self, credential: &Credential) -> ProtocolResult<Vec<u8>> {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        let nonce = generate_nonce();

        self.secret = Some(secret);
        self.client_nonce = Some(nonce);
        self.psk = credential.secret.clone();

        let mut token = Vec::with_capacity(INIT_LEN);
        token.push(TOKEN_INIT);
        token.extend_from_slice(public.as_bytes());
        token.extend_from_slice(&nonce);
        token.extend_from_slice(&current_timestamp()?.to_le_bytes());
        debug!("Client initiating key exchange");
        Ok(token)
    }

    #[instrument(skip_all)]
    fn accept(&mut self, credential: &Credential, token: &[u8]) -> ProtocolResult<Vec<u8>> {
        let body = expect_token(token, TOKEN_INIT, INIT_LEN)?;
        let client_public = PublicKey::from(array::<32>(&body[..32])?);
        let client_nonce: [u8; 16] = array(&body[32..48])?;
        let timestamp = u64::from_le_bytes(array(&body[48..56])?);
        if !verify_timestamp(timestamp, MAX_TOKEN_AGE) {
            return Err(ProtocolError::security(constants::ERR_STALE_TIMESTAMP));
        }

        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        let server_nonce = generate_nonce();
        let shared = secret.diffie_hellman(&client_public);
        let key = derive_key(
            &shared,
            credential.secret.as_ref().map(|s| s.as_slice()),
            &client_nonce,
            &server_nonce,
        );

        let mut challenge = Vec::with_capacity(CHALLENGE_LEN);
        challenge.push(TOKEN_CHALLENGE);
        challenge.extend_from_slice(public.as_bytes());
        challenge.extend_from_slice(&server_nonce);
        challenge.extend_from_slice(&proof(b"server", &key, &client_nonce));

        self.client_nonce = Some(client_nonce);
        self.server_nonce = Some(server_nonce);
        self.pending_key = Some(key);
        debug!("Server answered key exchange");
        Ok(challenge)
    }

    #[instrument(skip_all)]
    fn respond(&mut self, challenge: &[u8]) -> ProtocolResult<Vec<u8>> {
        let body = expect_token(challenge, TOKEN_CHALLENGE, CHALLENGE_LEN)?;
        let server_public = PublicKey::from(array::<32>(&body[..32])?);
        let server_nonce: [u8; 16] = array(&body[32..48])?;
        let server_proof = &body[48..80];

        let secret = self
            .secret
            .take()
            .ok_or(ProtocolError::security(constants::ERR_INVALID_SECURITY_STATE))?;
        let client_nonce = self
            .client_nonce
            .ok_or(ProtocolError::security(constants::ERR_INVALID_SECURITY_STATE))?;

        let shared = secret.diffie_hellman(&server_public);
        let key = derive_key(
            &shared,
            self.psk.as_ref().map(|s| s.as_slice()),
            &client_nonce,
            &server_nonce,
        );
        if !ct_eq(&proof(b"server", &key, &client_nonce), server_proof) {
            return Err(ProtocolError::security(constants::ERR_PEER_VERIFICATION_FAILED));
        }

        let mut confirm = Vec::with_capacity(CONFIRM_LEN);
        confirm.push(TOKEN_CONFIRM);
        confirm.extend_from_slice(&proof(b"client", &key, &server_nonce));

        self.server_nonce = Some(server_nonce);
        self.install(&key);
        debug!("Client derived session key");
        Ok(confirm)
    }

    #[instrument(skip_all)]
    fn complete(&mut self, token: &[u8]) -> ProtocolResult<()> {
        let body = expect_token(token, TOKEN_CONFIRM, CONFIRM_LEN)?;
        let key = self
            .pending_key
            .take()
            .ok_or(ProtocolError::security(constants::ERR_INVALID_SECURITY_STATE))?;
        let server_nonce = self
            .server_nonce
            .ok_or(ProtocolError::security(constants::ERR_INVALID_SECURITY_STATE))?;
        if !ct_eq(&proof(b"client", &key, &server_nonce), body) {
            return Err(ProtocolError::security(constants::ERR_PEER_VERIFICATION_FAILED));
        }
        self.install(&key);
        debug!("Server finalized key exchange");
        Ok(())
    }

    fn signature_len(&self) -> usize {
        SIGNATURE_LEN
    }

    fn sign(&mut self, data: &[u8]) -> ProtocolResult<Vec<u8>> {
        let (nonce, seq) = self.next_send();
        let tag = self
            .cipher()?
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), data, &mut [])
            .map_err(|_| ProtocolError::security(constants::ERR_SIGNATURE_INVALID))?;
        Ok(Self::token(seq, &tag))
    }

    fn verify(&mut self, data: &[u8], signature: &[u8]) -> ProtocolResult<()> {
        let (nonce, seq, tag) = self.check_recv(signature)?;
        self.cipher()?
            .decrypt_in_place_detached(Nonce::from_slice(&nonce), data, &mut [], &tag)
            .map_err(|_| ProtocolError::security(constants::ERR_SIGNATURE_INVALID))?;
        self.recv_floor = seq + 1;
        Ok(())
    }

    fn seal(&mut self, data: &mut [u8]) -> ProtocolResult<Vec<u8>> {
        let (nonce, seq) = self.next_send();
        let tag = self
            .cipher()?
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), b"", data)
            .map_err(|_| ProtocolError::security(constants::ERR_UNSEAL_FAILED))?;
        Ok(Self::token(seq, &tag))
    }

    fn unseal(&mut self, data: &mut [u8], signature: &[u8]) -> ProtocolResult<()> {
        let (nonce, seq, tag) = self.check_recv(signature)?;
        self.cipher()?
            .decrypt_in_place_detached(Nonce::from_slice(&nonce), b"", data, &tag)
            .map_err(|_| ProtocolError::security(constants::ERR_UNSEAL_FAILED))?;
        self.recv_floor = seq + 1;
        Ok(())
    }
}
