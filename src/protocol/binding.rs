//! # Bindings
//!
//! A [`Binding`] is the caller's handle to a target plus an optional object
//! uuid. It resolves lazily to a connection: [`Binding::bind`] checks one out
//! of the target's association, binding a new connection when the pool has no
//! match. Dropping or releasing the binding returns a pooled connection to the
//! association; a connection from [`Binding::bind_exclusive`] is closed.
//!
//! ## Bind handshake
//! The client sends `bind` with its fragment sizes, the association's group
//! id, and one presentation context. A `bind_ack` accepting the context fixes
//! the interface, the transmit size (`min(configured, ack.max_tsize)`), and
//! the group id. Rejections map onto [`RpcError`] through [`BindRejection`].

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::core::header::{BindHeader, Header, HeaderFields, RequestHeader};
use crate::core::packet::{expect_bind_ack, BindBody};
use crate::core::syntax::SyntaxId;
use crate::error::{constants, BindRejection, ProtocolError, Result, RpcError};
use crate::protocol::association::{Association, AssociationKey};
use crate::protocol::connection::{Connection, ConnectionHandle};
use crate::runtime::RpcRuntime;
use crate::security::{AuthInfo, AuthLevel, Credential, QualityOfService, SecurityContext, SecurityProvider};
use crate::utils::timeout::with_optional_timeout;

/// Open a new connection on `association` and run the bind handshake.
#[instrument(skip_all, fields(target = ?association.key(), interface = %syntax))]
pub async fn bind(
    association: &Association,
    syntax: &SyntaxId,
    transfer: &SyntaxId,
    auth: Option<&AuthInfo>,
    qos: &QualityOfService,
) -> Result<Connection> {
    let mut conn = association.open_connection().await?;
    let settings = association.settings();
    let metrics = association.metrics();

    let token = match auth {
        Some(auth) => {
            let mut ctx = SecurityContext::client(auth, 0);
            let token = ctx.negotiate()?;
            conn.set_security(ctx);
            Some(token)
        }
        None => None,
    };

    let call_id = conn.next_call_id();
    let header = Header::new(HeaderFields::Bind(BindHeader {
        max_tsize: settings.max_transmit_frag,
        max_rsize: settings.max_receive_frag,
        assoc_gid: association.group_id(),
    }))
    .with_call_id(call_id);
    let body = BindBody::single(0, *syntax, *transfer).encode();

    metrics.bind_sent();
    conn.send(header, body, token).await?;

    let packet = with_optional_timeout(
        async { conn.receive().await.map_err(RpcError::from) },
        settings.call_timeout,
    )
    .await?;

    match packet.header.fields {
        HeaderFields::BindAck(_) => {
            let (ack, body) = expect_bind_ack(&packet)?;
            let result = body
                .results
                .first()
                .ok_or(ProtocolError::violation(constants::ERR_TRUNCATED_BODY))?;
            if !result.is_accepted() {
                metrics.bind_rejected();
                let rejection = BindRejection::from_ack_result(result.result, result.reason);
                warn!(?rejection, "Bind rejected");
                return Err(rejection.into());
            }
            if auth.is_some() {
                let challenged = packet.auth_token().is_some();
                let established = conn.with_security(|ctx| {
                    if !challenged && !ctx.is_established() {
                        ctx.conclude()?;
                    }
                    Ok::<_, ProtocolError>(ctx.is_established())
                });
                if !matches!(established, Some(Ok(true))) {
                    metrics.auth_failure();
                    return Err(RpcError::AccessDenied);
                }
            }

            let transfer_syntax = result.transfer_syntax;
            conn.update_negotiated(|state| {
                state.active_interface = Some(*syntax);
                state.transfer_syntax = Some(transfer_syntax);
                state.context_id = 0;
                state.max_frame_size = settings.max_transmit_frag.min(ack.max_tsize);
                state.max_receive_size = settings.max_receive_frag;
                state.assoc_group_id = ack.assoc_gid;
                state.auth = auth.cloned();
                state.qos = *qos;
            });
            metrics.bind_accepted();
            debug!(
                connection = conn.id(),
                max_frame = settings.max_transmit_frag.min(ack.max_tsize),
                group_id = ack.assoc_gid,
                "Bind accepted"
            );
            Ok(conn)
        }
        HeaderFields::BindNack(nack) => {
            metrics.bind_rejected();
            let rejection = BindRejection::from_reject_reason(nack.reject_reason);
            warn!(?rejection, "Bind refused");
            Err(rejection.into())
        }
        _ => Err(ProtocolError::violation(constants::ERR_UNEXPECTED_PACKET).into()),
    }
}

struct CheckedOut {
    connection: Connection,
    pooled: bool,
}

/// Caller-visible handle to a target.
pub struct Binding {
    runtime: Arc<RpcRuntime>,
    key: AssociationKey,
    object_uuid: Option<Uuid>,
    is_server: bool,
    association: Option<Arc<Association>>,
    auth: Option<AuthInfo>,
    qos: QualityOfService,
    checked_out: Option<CheckedOut>,
}

impl Binding {
    /// Client binding to `protseq:network_address[endpoint]`.
    pub fn new(
        runtime: Arc<RpcRuntime>,
        protseq: &str,
        network_address: &str,
        endpoint: &str,
    ) -> Result<Self> {
        runtime.transports().get(protseq)?;
        Ok(Self {
            runtime,
            key: AssociationKey::new(protseq, network_address, endpoint, None),
            object_uuid: None,
            is_server: false,
            association: None,
            auth: None,
            qos: QualityOfService::default(),
            checked_out: None,
        })
    }

    /// Binding describing the caller of a dispatched request.
    pub fn server_side(
        runtime: Arc<RpcRuntime>,
        key: AssociationKey,
        object_uuid: Option<Uuid>,
    ) -> Self {
        Self {
            runtime,
            key,
            object_uuid,
            is_server: true,
            association: None,
            auth: None,
            qos: QualityOfService::default(),
            checked_out: None,
        }
    }

    pub fn with_options(mut self, options: impl Into<String>) -> Self {
        self.key.options = Some(options.into());
        self
    }

    pub fn with_object(mut self, object: Uuid) -> Self {
        self.object_uuid = Some(object);
        self
    }

    pub fn protseq(&self) -> &str {
        &self.key.protseq
    }

    pub fn network_address(&self) -> &str {
        &self.key.network_address
    }

    pub fn endpoint(&self) -> &str {
        &self.key.endpoint
    }

    pub fn options(&self) -> Option<&str> {
        self.key.options.as_deref()
    }

    pub fn object_uuid(&self) -> Option<Uuid> {
        self.object_uuid
    }

    pub fn set_object_uuid(&mut self, object: Option<Uuid>) {
        self.object_uuid = object;
    }

    pub fn is_server(&self) -> bool {
        self.is_server
    }

    pub fn is_bound(&self) -> bool {
        self.checked_out.is_some()
    }

    pub fn association(&self) -> Option<&Arc<Association>> {
        self.association.as_ref()
    }

    /// The checked-out connection, if bound.
    pub fn connection(&self) -> Option<&ConnectionHandle> {
        self.checked_out.as_ref().map(|c| c.connection.handle())
    }

    /// Authenticate future connections. Takes effect on the next bind.
    pub fn set_auth_info(
        &mut self,
        level: AuthLevel,
        provider: Arc<dyn SecurityProvider>,
        credential: Credential,
    ) {
        self.release();
        self.auth = Some(AuthInfo::new(level, provider, credential));
    }

    pub fn clear_auth_info(&mut self) {
        self.release();
        self.auth = None;
    }

    pub fn auth_info(&self) -> Option<&AuthInfo> {
        self.auth.as_ref()
    }

    pub fn set_qos(&mut self, qos: QualityOfService) {
        if qos != self.qos {
            self.release();
        }
        self.qos = qos;
    }

    fn ensure_client(&self) -> Result<()> {
        if self.is_server {
            Err(RpcError::InvalidBinding(Cow::Borrowed(constants::ERR_SERVER_BINDING)))
        } else {
            Ok(())
        }
    }

    fn association_handle(&mut self) -> Result<Arc<Association>> {
        if let Some(assoc) = &self.association {
            return Ok(assoc.clone());
        }
        let assoc = self
            .runtime
            .associations()
            .get_or_create_client(self.key.clone())?;
        self.association = Some(assoc.clone());
        Ok(assoc)
    }

    /// Check out a connection bound to `syntax`, reusing an idle one when
    /// its interface, auth and QoS match.
    pub async fn bind(&mut self, syntax: &SyntaxId, transfer: &SyntaxId) -> Result<()> {
        self.ensure_client()?;
        if let Some(current) = &self.checked_out {
            if current
                .connection
                .matches(syntax, transfer, self.auth.as_ref(), &self.qos)
            {
                return Ok(());
            }
        }
        self.release();

        let assoc = self.association_handle()?;
        let connection = assoc
            .acquire_connection(syntax, transfer, self.auth.as_ref(), &self.qos)
            .await?;
        self.checked_out = Some(CheckedOut {
            connection,
            pooled: true,
        });
        Ok(())
    }

    /// Bind a dedicated connection that is closed, not pooled, on release.
    pub async fn bind_exclusive(&mut self, syntax: &SyntaxId, transfer: &SyntaxId) -> Result<()> {
        self.ensure_client()?;
        self.release();

        let assoc = self.association_handle()?;
        let connection = bind(&assoc, syntax, transfer, self.auth.as_ref(), &self.qos).await?;
        assoc.pin_group_id(connection.negotiated().assoc_group_id);
        self.checked_out = Some(CheckedOut {
            connection,
            pooled: false,
        });
        Ok(())
    }

    /// Send one request and wait for its response.
    ///
    /// Returns the response stub data. A fault maps to its [`RpcError`]; any
    /// other failure breaks the connection, which is then discarded.
    #[instrument(skip(self, stub), fields(target = %self, len = stub.len()))]
    pub async fn call(&mut self, opnum: u16, stub: Bytes) -> Result<Bytes> {
        self.ensure_client()?;
        let checked_out = self
            .checked_out
            .as_mut()
            .ok_or(RpcError::InvalidBinding(Cow::Borrowed(constants::ERR_NOT_BOUND)))?;
        let connection = &mut checked_out.connection;
        let timeout = self.runtime.config().client.call_timeout;

        let result = with_optional_timeout(
            exchange(connection, opnum, self.object_uuid, stub),
            timeout,
        )
        .await;

        match result {
            Err(RpcError::Fault(_))
            | Err(RpcError::CallFailed)
            | Err(RpcError::AccessDenied)
            | Err(RpcError::ServerTooBusy)
            | Err(RpcError::ServerUnavailable)
            | Err(RpcError::UnknownInterface)
                if !connection.is_broken() =>
            {
                result
            }
            Err(e) => {
                connection.mark_broken();
                self.checked_out = None;
                Err(e)
            }
            ok => ok,
        }
    }

    /// Give up the checked-out connection: pooled ones go back to the
    /// association, exclusive ones are dropped.
    pub fn release(&mut self) {
        if let Some(CheckedOut { connection, pooled }) = self.checked_out.take() {
            match (&self.association, pooled) {
                (Some(assoc), true) => assoc.release_connection(connection),
                _ => drop(connection),
            }
        }
    }

    /// Release the connection; an exclusive one is shut down first.
    pub async fn close(mut self) {
        if let Some(checked_out) = self.checked_out.take() {
            if checked_out.pooled {
                if let Some(assoc) = &self.association {
                    assoc.release_connection(checked_out.connection);
                }
            } else {
                checked_out.connection.close().await;
            }
        }
    }
}

async fn exchange(
    connection: &mut Connection,
    opnum: u16,
    object: Option<Uuid>,
    stub: Bytes,
) -> Result<Bytes> {
    let context_id = connection.negotiated().context_id;
    let call_id = connection.next_call_id();
    let header = Header::new(HeaderFields::Request(RequestHeader {
        alloc_hint: 0,
        context_id,
        opnum,
        object,
    }))
    .with_call_id(call_id);
    connection.send(header, stub, None).await?;

    let packet = connection.receive().await?;
    if packet.header.call_id() != call_id {
        return Err(ProtocolError::violation(constants::ERR_CALL_ID_MISMATCH).into());
    }
    match packet.header.fields {
        HeaderFields::Response(_) => Ok(packet.payload),
        HeaderFields::Fault(fault) => {
            debug!(status = fault.status, "Call faulted");
            Err(RpcError::from_fault_status(fault.status))
        }
        _ => Err(ProtocolError::violation(constants::ERR_UNEXPECTED_PACKET).into()),
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        self.release();
    }
}

/// String binding: `[object@]protseq:address[endpoint[,options]]`.
impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(object) = self.object_uuid {
            write!(f, "{object}@")?;
        }
        write!(f, "{}:{}", self.key.protseq, self.key.network_address)?;
        if !self.key.endpoint.is_empty() || self.key.options.is_some() {
            write!(f, "[{}", self.key.endpoint)?;
            if let Some(options) = &self.key.options {
                write!(f, ",{options}")?;
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("target", &self.to_string())
            .field("is_server", &self.is_server)
            .field("bound", &self.is_bound())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::transport::memory::PROTSEQ;

    #[test]
    fn test_display_composes_string_binding() {
        let runtime = RpcRuntime::new(RuntimeConfig::default());
        let object = Uuid::from_u128(0x1234);
        let binding = Binding::new(runtime.clone(), PROTSEQ, "host", "svc")
            .unwrap()
            .with_options("opt=1")
            .with_object(object);
        assert_eq!(
            binding.to_string(),
            format!("{object}@ncacn_mem:host[svc,opt=1]")
        );

        let bare = Binding::new(runtime, PROTSEQ, "host", "").unwrap();
        assert_eq!(bare.to_string(), "ncacn_mem:host");
    }

    #[test]
    fn test_unknown_protseq_is_rejected_up_front() {
        let runtime = RpcRuntime::new(RuntimeConfig::default());
        assert!(matches!(
            Binding::new(runtime, "ncacn_http", "host", "80"),
            Err(RpcError::UnsupportedProtseq(_))
        ));
    }

    #[tokio::test]
    async fn test_call_before_bind_is_invalid() {
        let runtime = RpcRuntime::new(RuntimeConfig::default());
        let mut binding = Binding::new(runtime, PROTSEQ, "", "nowhere").unwrap();
        assert!(matches!(
            binding.call(0, Bytes::new()).await,
            Err(RpcError::InvalidBinding(_))
        ));
    }

    #[tokio::test]
    async fn test_server_side_bindings_cannot_bind() {
        let runtime = RpcRuntime::new(RuntimeConfig::default());
        let mut binding =
            Binding::server_side(runtime, AssociationKey::new(PROTSEQ, "", "svc", None), None);
        let syntax = crate::core::syntax::NDR_TRANSFER_SYNTAX;
        assert!(matches!(
            binding.bind(&syntax, &syntax).await,
            Err(RpcError::InvalidBinding(_))
        ));
    }
}
