//! # Connection
//!
//! One channel plus the state negotiated on it.
//!
//! A [`Connection`] owns the read side: fragments are decoded, unprotected,
//! and reassembled into packets by [`Connection::receive`]. The write side and
//! the negotiated state live behind a cloneable [`ConnectionHandle`], so the
//! server's workers can answer on a connection while its reader keeps reading.
//!
//! ## Sending
//! All fragments of one packet are written while holding the writer lock, so
//! fragments of concurrent packets never interleave. A failed write marks the
//! connection broken; broken connections never return to a pool.
//!
//! ## Protection
//! Once the security context is established at `PktIntegrity` or above, every
//! request, response and fault fragment carries a token: signed over its stub
//! data and padding, or sealed in place at `PktPrivacy`.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace, warn};

use crate::core::codec::{AuthTrailer, Fragment, FragmentCodec};
use crate::core::fragment::{split, Reassembler};
use crate::core::header::{auth_padding, Header, HeaderFields, PacketType, MUST_RECV_FRAG_SIZE};
use crate::core::packet::Packet;
use crate::core::syntax::SyntaxId;
use crate::error::{constants, ProtocolError, ProtocolResult};
use crate::security::{AuthInfo, AuthLevel, QualityOfService, SecurityContext};
use crate::transport::BoxedChannel;
use crate::utils::lock;
use crate::utils::metrics::Metrics;

type Writer = FramedWrite<WriteHalf<BoxedChannel>, FragmentCodec>;

/// State agreed by the bind handshake.
#[derive(Debug, Clone)]
pub struct NegotiatedState {
    pub active_interface: Option<SyntaxId>,
    pub transfer_syntax: Option<SyntaxId>,
    pub context_id: u16,
    /// Largest fragment this side transmits.
    pub max_frame_size: u16,
    /// Largest fragment this side offered to receive.
    pub max_receive_size: u16,
    pub assoc_group_id: u32,
    /// Authentication requested by the client that bound this connection.
    pub auth: Option<AuthInfo>,
    pub qos: QualityOfService,
}

impl Default for NegotiatedState {
    fn default() -> Self {
        Self {
            active_interface: None,
            transfer_syntax: None,
            context_id: 0,
            max_frame_size: MUST_RECV_FRAG_SIZE,
            max_receive_size: MUST_RECV_FRAG_SIZE,
            assoc_group_id: 0,
            auth: None,
            qos: QualityOfService::default(),
        }
    }
}

struct ConnectionInner {
    id: u64,
    is_server: bool,
    peer: String,
    writer: tokio::sync::Mutex<Writer>,
    state: Mutex<NegotiatedState>,
    security: Mutex<Option<SecurityContext>>,
    next_call_id: AtomicU32,
    broken: AtomicBool,
    max_packet_size: usize,
    metrics: Arc<Metrics>,
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.metrics.connection_closed();
        debug!(connection = self.id, peer = %self.peer, "Connection destroyed");
    }
}

/// Shared handle to a connection's write side and negotiated state.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<ConnectionInner>,
}

/// A connection with its read side.
pub struct Connection {
    reader: FramedRead<ReadHalf<BoxedChannel>, FragmentCodec>,
    reassembler: Reassembler,
    handle: ConnectionHandle,
}

impl Connection {
    /// Wrap a freshly opened or accepted channel.
    pub fn new(
        channel: BoxedChannel,
        is_server: bool,
        max_packet_size: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        let peer = channel.peer();
        let id = metrics.connection_established();
        let (read, write) = tokio::io::split(channel);
        debug!(connection = id, peer = %peer, is_server, "Connection created");

        Self {
            reader: FramedRead::new(read, FragmentCodec),
            reassembler: Reassembler::new(max_packet_size),
            handle: ConnectionHandle {
                inner: Arc::new(ConnectionInner {
                    id,
                    is_server,
                    peer,
                    writer: tokio::sync::Mutex::new(FramedWrite::new(write, FragmentCodec)),
                    state: Mutex::new(NegotiatedState::default()),
                    security: Mutex::new(None),
                    next_call_id: AtomicU32::new(1),
                    broken: AtomicBool::new(false),
                    max_packet_size,
                    metrics,
                }),
            },
        }
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Read fragments until one packet is complete.
    ///
    /// On a client, a bind_ack whose trailer carries a challenge is answered
    /// with an `auth3` before the packet is returned. Any inconsistency
    /// discards the partially received packet and breaks the connection.
    pub async fn receive(&mut self) -> ProtocolResult<Packet> {
        loop {
            let fragment = match self.reader.next().await {
                Some(Ok(fragment)) => fragment,
                Some(Err(e)) => {
                    self.handle.inner.metrics.protocol_error();
                    self.handle.mark_broken();
                    self.reassembler = Reassembler::new(self.handle.inner.max_packet_size);
                    return Err(e);
                }
                None => {
                    if !self.reassembler.is_idle() {
                        warn!(connection = self.handle.id(), "Channel closed mid-packet");
                    }
                    self.handle.mark_broken();
                    return Err(ProtocolError::closed());
                }
            };
            self.handle
                .inner
                .metrics
                .fragment_received(fragment.wire_len() as u64);
            trace!(
                connection = self.handle.id(),
                ptype = ?fragment.header.packet_type(),
                call_id = fragment.header.call_id(),
                len = fragment.wire_len(),
                "Fragment received"
            );

            let header = fragment.header;
            let (stub, auth) = match self.handle.unprotect(fragment) {
                Ok(parts) => parts,
                Err(e) => {
                    self.handle.inner.metrics.auth_failure();
                    self.handle.mark_broken();
                    self.reassembler = Reassembler::new(self.handle.inner.max_packet_size);
                    return Err(e);
                }
            };

            match self.reassembler.push(header, stub, auth) {
                Ok(Some(packet)) => {
                    self.handle.inner.metrics.packet_received();
                    if !self.handle.inner.is_server && packet.packet_type() == PacketType::BindAck {
                        if let Err(e) = self.answer_challenge(&packet).await {
                            self.handle.inner.metrics.auth_failure();
                            self.handle.mark_broken();
                            return Err(e);
                        }
                    }
                    return Ok(packet);
                }
                Ok(None) => continue,
                Err(e) => {
                    self.handle.inner.metrics.protocol_error();
                    self.handle.mark_broken();
                    warn!(connection = self.handle.id(), error = %e, "Reassembly failed");
                    return Err(e);
                }
            }
        }
    }

    async fn answer_challenge(&self, packet: &Packet) -> ProtocolResult<()> {
        let Some(challenge) = packet.auth_token() else {
            return Ok(());
        };
        let token = {
            let mut security = lock(&self.handle.inner.security);
            let ctx = security
                .as_mut()
                .ok_or(ProtocolError::security(constants::ERR_NO_SECURITY_CONTEXT))?;
            ctx.authorize(challenge)?
        };
        let header = Header::new(HeaderFields::Auth3).with_call_id(packet.header.call_id());
        self.handle.send(header, Bytes::new(), Some(token)).await
    }

    /// Shut down the write side and drop the connection.
    pub async fn close(self) {
        self.handle.close().await;
    }
}

impl std::ops::Deref for Connection {
    type Target = ConnectionHandle;

    fn deref(&self) -> &ConnectionHandle {
        &self.handle
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.handle.fmt(f)
    }
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn is_server(&self) -> bool {
        self.inner.is_server
    }

    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    pub fn is_broken(&self) -> bool {
        self.inner.broken.load(Ordering::Acquire)
    }

    pub fn mark_broken(&self) {
        self.inner.broken.store(true, Ordering::Release);
    }

    /// Allocate the next call id.
    pub fn next_call_id(&self) -> u32 {
        self.inner.next_call_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Snapshot of the negotiated state.
    pub fn negotiated(&self) -> NegotiatedState {
        lock(&self.inner.state).clone()
    }

    pub fn update_negotiated<F: FnOnce(&mut NegotiatedState)>(&self, f: F) {
        f(&mut lock(&self.inner.state));
    }

    pub fn set_security(&self, ctx: SecurityContext) {
        *lock(&self.inner.security) = Some(ctx);
    }

    /// Run `f` on the security context, if one exists.
    pub fn with_security<R>(&self, f: impl FnOnce(&mut SecurityContext) -> R) -> Option<R> {
        lock(&self.inner.security).as_mut().map(f)
    }

    /// Whether a pooled connection satisfies a binding's interface, auth and QoS.
    pub fn matches(
        &self,
        syntax: &SyntaxId,
        transfer: &SyntaxId,
        auth: Option<&AuthInfo>,
        qos: &QualityOfService,
    ) -> bool {
        if self.is_broken() {
            return false;
        }
        let state = lock(&self.inner.state);
        let auth_matches = match (state.auth.as_ref(), auth) {
            (None, None) => true,
            (Some(have), Some(want)) => have.matches(want),
            _ => false,
        };
        state.active_interface.as_ref() == Some(syntax)
            && state.transfer_syntax.as_ref() == Some(transfer)
            && auth_matches
            && state.qos == *qos
    }

    /// Fragment and write one packet.
    ///
    /// `auth_token` is a negotiation token for bind, bind_ack and auth3; it is
    /// attached to the last fragment. Call packets on a protected connection
    /// get a per-fragment token instead.
    pub async fn send(
        &self,
        header: Header,
        payload: Bytes,
        auth_token: Option<Bytes>,
    ) -> ProtocolResult<()> {
        if self.is_broken() {
            return Err(ProtocolError::broken());
        }
        let max_frame = lock(&self.inner.state).max_frame_size as usize;
        let is_call = matches!(
            header.packet_type(),
            PacketType::Request | PacketType::Response | PacketType::Fault
        );
        let protection = if is_call {
            self.with_security(|ctx| ctx.protects_packets().then(|| (ctx.level(), ctx.signature_len())))
                .flatten()
        } else {
            None
        };
        let reserve = match (&protection, &auth_token) {
            (Some((_, sig_len)), _) => Some(*sig_len),
            (None, Some(token)) => Some(token.len()),
            (None, None) => None,
        };

        let fragments = split(&header, &payload, max_frame, reserve)?;
        let count = fragments.len();

        let mut writer = self.inner.writer.lock().await;
        for (index, mut fragment) in fragments.into_iter().enumerate() {
            if let Some((level, _)) = protection {
                self.protect(&mut fragment, level)?;
            } else if index + 1 == count {
                if let Some(token) = &auth_token {
                    self.attach_token(&mut fragment, token.clone())?;
                }
            }

            let len = fragment.wire_len();
            if let Err(e) = writer.send(fragment).await {
                self.mark_broken();
                warn!(connection = self.id(), error = %e, "Send failed, connection broken");
                return Err(e);
            }
            self.inner.metrics.fragment_sent(len as u64);
        }
        self.inner.metrics.packet_sent();
        trace!(
            connection = self.id(),
            ptype = ?header.packet_type(),
            call_id = header.call_id(),
            bytes = payload.len(),
            fragments = count,
            "Packet sent"
        );
        Ok(())
    }

    fn padded_body(fragment: &Fragment) -> (BytesMut, u8) {
        let pad = auth_padding(fragment.body.len());
        let mut body = BytesMut::with_capacity(fragment.body.len() + pad);
        body.extend_from_slice(&fragment.body);
        body.resize(fragment.body.len() + pad, 0);
        (body, pad as u8)
    }

    fn protect(&self, fragment: &mut Fragment, level: AuthLevel) -> ProtocolResult<()> {
        let (mut body, pad) = Self::padded_body(fragment);
        let mut security = lock(&self.inner.security);
        let ctx = security
            .as_mut()
            .ok_or(ProtocolError::security(constants::ERR_NO_SECURITY_CONTEXT))?;
        let token = if level == AuthLevel::PktPrivacy {
            ctx.seal(&mut body)?
        } else {
            ctx.sign(&body)?
        };
        fragment.auth = Some(AuthTrailer {
            verifier: ctx.verifier(pad),
            token,
        });
        fragment.body = body.freeze();
        Ok(())
    }

    fn attach_token(&self, fragment: &mut Fragment, token: Bytes) -> ProtocolResult<()> {
        let (body, pad) = Self::padded_body(fragment);
        let verifier = self
            .with_security(|ctx| ctx.verifier(pad))
            .ok_or(ProtocolError::security(constants::ERR_NO_SECURITY_CONTEXT))?;
        fragment.auth = Some(AuthTrailer { verifier, token });
        fragment.body = body.freeze();
        Ok(())
    }

    /// Verify or unseal a received fragment; returns its stub data and any
    /// negotiation trailer.
    fn unprotect(&self, fragment: Fragment) -> ProtocolResult<(Bytes, Option<AuthTrailer>)> {
        let is_call = matches!(
            fragment.header.packet_type(),
            PacketType::Request | PacketType::Response | PacketType::Fault
        );
        if !is_call {
            let stub = fragment.stub_data();
            return Ok((stub, fragment.auth));
        }

        let mut security = lock(&self.inner.security);
        let protected = security.as_ref().is_some_and(|ctx| ctx.protects_packets());
        match (protected, fragment.auth) {
            (true, None) => Err(ProtocolError::security(constants::ERR_MISSING_VERIFIER)),
            (true, Some(trailer)) => {
                let ctx = security
                    .as_mut()
                    .ok_or(ProtocolError::security(constants::ERR_NO_SECURITY_CONTEXT))?;
                let mut body = BytesMut::from(&fragment.body[..]);
                if ctx.level() == AuthLevel::PktPrivacy {
                    ctx.unseal(&mut body, &trailer.token)?;
                } else {
                    ctx.verify(&body, &trailer.token)?;
                }
                body.truncate(body.len() - trailer.verifier.auth_pad_len as usize);
                Ok((body.freeze(), None))
            }
            (false, Some(trailer)) => {
                if security.is_none() {
                    return Err(ProtocolError::security(constants::ERR_NO_SECURITY_CONTEXT));
                }
                let pad = trailer.verifier.auth_pad_len as usize;
                Ok((fragment.body.slice(..fragment.body.len() - pad), None))
            }
            (false, None) => Ok((fragment.body, None)),
        }
    }

    /// Shut down the write side. Pending and future sends fail.
    pub async fn close(&self) {
        self.mark_broken();
        let mut writer = self.inner.writer.lock().await;
        if let Err(e) = writer.get_mut().shutdown().await {
            debug!(connection = self.id(), error = %e, "Shutdown after close failed");
        }
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("is_server", &self.inner.is_server)
            .field("peer", &self.inner.peer)
            .field("broken", &self.is_broken())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::core::header::{PacketFlags, RequestHeader, ResponseHeader};
    use crate::security::{Credential, KeyExchangeProvider};
    use crate::transport::BoxedChannel;

    fn pair(frame: u16) -> (Connection, Connection) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let metrics = Arc::new(Metrics::new());
        let client = Connection::new(Box::new(a) as BoxedChannel, false, 1 << 20, metrics.clone());
        let server = Connection::new(Box::new(b) as BoxedChannel, true, 1 << 20, metrics);
        for conn in [&client, &server] {
            conn.update_negotiated(|s| s.max_frame_size = frame);
        }
        (client, server)
    }

    fn request(opnum: u16) -> Header {
        Header::new(HeaderFields::Request(RequestHeader {
            alloc_hint: 0,
            context_id: 0,
            opnum,
            object: None,
        }))
    }

    #[tokio::test]
    async fn test_ten_bytes_over_frame_28_arrive_whole() {
        let (client, mut server) = pair(28);
        let payload = Bytes::from_static(b"0123456789");
        client.send(request(1).with_call_id(7), payload.clone(), None).await.unwrap();

        let packet = server.receive().await.unwrap();
        assert_eq!(packet.payload, payload);
        assert_eq!(packet.header.call_id(), 7);
        assert!(packet.header.flags().contains(PacketFlags::FIRST_FRAG));
    }

    #[tokio::test]
    async fn test_dropped_peer_reports_transport_error() {
        let (client, mut server) = pair(1024);
        drop(client);
        assert!(matches!(server.receive().await, Err(ProtocolError::Transport(_))));
    }

    #[tokio::test]
    async fn test_closed_connection_is_broken() {
        let (client, mut server) = pair(1024);
        let handle = client.handle().clone();
        client.close().await;
        assert!(handle.is_broken());
        assert!(server.receive().await.is_err());
    }

    #[tokio::test]
    async fn test_send_on_broken_connection_fails_fast() {
        let (client, _server) = pair(1024);
        client.mark_broken();
        let err = client
            .send(request(0).with_call_id(1), Bytes::from_static(b"late"), None)
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            ProtocolError::Transport(e) if e.kind() == std::io::ErrorKind::BrokenPipe
        ));
    }

    #[tokio::test]
    async fn test_call_ids_increase() {
        let (client, _server) = pair(1024);
        let first = client.next_call_id();
        assert_eq!(client.next_call_id(), first + 1);
    }

    async fn established(level: AuthLevel) -> (Connection, Connection) {
        let (client, server) = pair(128);
        let provider = Arc::new(KeyExchangeProvider::new());
        let auth = AuthInfo::new(level, provider.clone(), Credential::new("c"));
        let mut c = SecurityContext::client(&auth, 0);
        let mut s = SecurityContext::server(provider.as_ref(), level, Credential::new("s"), 0);
        let challenge = s.accept(&c.negotiate().unwrap()).unwrap().unwrap();
        s.complete(&c.authorize(&challenge).unwrap()).unwrap();
        client.set_security(c);
        server.set_security(s);
        (client, server)
    }

    #[tokio::test]
    async fn test_sealed_multi_fragment_response_round_trips() {
        let (client, mut server) = established(AuthLevel::PktPrivacy).await;
        let payload = Bytes::from(vec![0xAB; 100]);
        let header = Header::new(HeaderFields::Response(ResponseHeader {
            alloc_hint: 0,
            context_id: 0,
            cancel_count: 0,
        }));
        client.send(header.with_call_id(3), payload.clone(), None).await.unwrap();
        let packet = server.receive().await.unwrap();
        assert_eq!(packet.payload, payload);
    }

    #[tokio::test]
    async fn test_unprotected_request_on_protected_connection_is_rejected() {
        let (plain, mut guarded) = pair(1024);
        let (_, server) = established(AuthLevel::PktIntegrity).await;
        let ctx = lock(&server.handle.inner.security).take().unwrap();
        guarded.set_security(ctx);

        plain
            .send(request(0).with_call_id(1), Bytes::from_static(b"abcd"), None)
            .await
            .unwrap();
        let err = guarded.receive().await.err().unwrap();
        assert!(matches!(err, ProtocolError::Security(msg) if msg == constants::ERR_MISSING_VERIFIER));
    }

    #[tokio::test]
    async fn test_skipped_sequence_numbers_still_verify() {
        let (client, mut server) = established(AuthLevel::PktIntegrity).await;
        client.with_security(|ctx| ctx.sign(b"burn a sequence number").unwrap());
        client
            .send(request(2).with_call_id(9), Bytes::from_static(b"payload!"), None)
            .await
            .unwrap();
        // The server skips the burned sequence number and accepts the packet.
        assert!(server.receive().await.is_ok());
    }
}
