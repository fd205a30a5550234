//! # Server Dispatch Engine
//!
//! An [`RpcServer`] owns a set of listening endpoints, the interface
//! registry, and the worker pool that runs operation handlers.
//!
//! ## Tasks
//! - one accept task per endpoint while the server is listening
//! - one reader task per accepted connection; bind and auth3 are answered
//!   inline, requests are queued to the pool
//! - elastic workers that look up the interface, run the handler and send the
//!   response or fault
//!
//! Stopping closes the listening channels and the pool. Connections already
//! accepted stay open; requests arriving on them are refused with a
//! `RPC_S_SERVER_UNAVAILABLE` fault until the server listens again.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::MAX_WORKERS;
use crate::core::codec::AuthTrailer;
use crate::core::header::{
    BindHeader, BindNackHeader, DataRepresentation, FaultHeader, Header, HeaderFields,
    RequestHeader, ResponseHeader,
};
use crate::core::packet::{reject_reason, BindAckBody, BindBody, BindNackBody, Packet};
use crate::core::syntax::SyntaxId;
use crate::error::{constants, status, ProtocolError, Result, RpcError};
use crate::protocol::association::{Association, AssociationKey};
use crate::protocol::binding::Binding;
use crate::protocol::connection::{Connection, ConnectionHandle};
use crate::protocol::message::Message;
use crate::runtime::RpcRuntime;
use crate::security::{AuthLevel, Credential, SecurityContext, SecurityProvider};
use crate::service::interface::{InterfaceFlags, InterfaceRegistry, RegisteredInterface};
use crate::service::worker_pool::{JobHandler, PoolStats, WorkerPool};
use crate::transport::{BoxedChannel, Listener, Transport};
use crate::utils::lock;

/// A request waiting for a worker.
struct CallJob {
    connection: ConnectionHandle,
    call_id: u32,
    request: RequestHeader,
    drep: DataRepresentation,
    payload: Bytes,
    caller: AssociationKey,
}

struct Endpoint {
    protseq: String,
    address: String,
    /// Resolved endpoint, reused when listening restarts.
    endpoint: String,
    transport: Arc<dyn Transport>,
    listener: Mutex<Option<Box<dyn Listener>>>,
    connections: Arc<Semaphore>,
}

impl Endpoint {
    fn binding_string(&self) -> String {
        format!("{}:{}[{}]", self.protseq, self.address, self.endpoint)
    }
}

/// Listening is requested by an explicit `listen` or by registered
/// AUTO_LISTEN interfaces, and stops once neither holds it.
#[derive(Default)]
struct ListenState {
    listening: bool,
    listen_requests: usize,
    auto_listen: usize,
    pool: Option<WorkerPool<CallJob>>,
    accept_tasks: Vec<JoinHandle<()>>,
}

/// Left behind by a halt: accept tasks to await, the closed pool to join,
/// and queued calls that never reached a worker.
struct Halted {
    accept_tasks: Vec<JoinHandle<()>>,
    pool: Option<WorkerPool<CallJob>>,
    refused: Vec<CallJob>,
}

type Registration = (Arc<dyn SecurityProvider>, Credential);

struct ServerInner {
    runtime: Arc<RpcRuntime>,
    interfaces: InterfaceRegistry,
    auth: Mutex<HashMap<u8, Registration>>,
    object_types: Mutex<HashMap<Uuid, Uuid>>,
    endpoints: Mutex<Vec<Arc<Endpoint>>>,
    state: Mutex<ListenState>,
    listening: watch::Sender<bool>,
}

/// RPC server: endpoints, interfaces and dispatch.
pub struct RpcServer {
    inner: Arc<ServerInner>,
}

impl RpcServer {
    pub fn new(runtime: Arc<RpcRuntime>) -> Self {
        let (listening, _) = watch::channel(false);
        Self {
            inner: Arc::new(ServerInner {
                runtime,
                interfaces: InterfaceRegistry::new(),
                auth: Mutex::new(HashMap::new()),
                object_types: Mutex::new(HashMap::new()),
                endpoints: Mutex::new(Vec::new()),
                state: Mutex::new(ListenState::default()),
                listening,
            }),
        }
    }

    pub fn runtime(&self) -> &Arc<RpcRuntime> {
        &self.inner.runtime
    }

    /// Open a listening endpoint and return the endpoint actually bound.
    ///
    /// An empty or `"0"` endpoint asks the transport for a dynamic one. At
    /// most `max_calls` connections on this endpoint are served at once.
    #[instrument(skip(self))]
    pub async fn register_protseq(
        &self,
        protseq: &str,
        endpoint: &str,
        max_calls: usize,
    ) -> Result<String> {
        let transport = self.inner.runtime.transports().get(protseq)?;
        let address = self.inner.runtime.config().server.bind_address.clone();
        let listener = transport.listen(&address, endpoint).await?;
        let resolved = listener.local_endpoint();

        let endpoint = Arc::new(Endpoint {
            protseq: transport.protseq().to_string(),
            address,
            endpoint: resolved.clone(),
            transport,
            listener: Mutex::new(Some(listener)),
            connections: Arc::new(Semaphore::new(max_calls.clamp(1, Semaphore::MAX_PERMITS))),
        });

        let mut state = lock(&self.inner.state);
        lock(&self.inner.endpoints).push(endpoint.clone());
        if state.listening {
            let task = self.inner.spawn_accept(endpoint);
            state.accept_tasks.push(task);
        }
        info!(endpoint = %resolved, "Endpoint registered");
        Ok(resolved)
    }

    /// Register or replace an interface. Running listeners see it at once.
    ///
    /// The first registration with [`InterfaceFlags::AUTO_LISTEN`] starts
    /// listening if the server is not already.
    pub fn register_interface(&self, interface: RegisteredInterface) -> Result<()> {
        let auto_listen = interface.flags.contains(InterfaceFlags::AUTO_LISTEN);
        let syntax = interface.syntax;
        let replaced = self.inner.interfaces.register(interface)?;
        let newly_auto = auto_listen
            && !replaced
                .as_ref()
                .is_some_and(|old| old.flags.contains(InterfaceFlags::AUTO_LISTEN));
        info!(interface = %syntax, auto_listen, "Interface registered");

        if newly_auto {
            let mut state = lock(&self.inner.state);
            state.auto_listen += 1;
            if !state.listening {
                let max_calls = self.inner.runtime.config().server.max_calls;
                self.inner.start(&mut state, 1, max_calls);
            }
        }
        Ok(())
    }

    /// Remove an interface. Requests already negotiated for it are dropped.
    pub fn unregister_interface(&self, syntax: &SyntaxId, manager_type: &Uuid) -> Result<()> {
        let removed = self
            .inner
            .interfaces
            .unregister(syntax, manager_type)?
            .ok_or(RpcError::UnknownInterface)?;
        info!(interface = %syntax, %manager_type, "Interface unregistered");

        if removed.flags.contains(InterfaceFlags::AUTO_LISTEN) {
            let halted = {
                let mut state = lock(&self.inner.state);
                state.auto_listen = state.auto_listen.saturating_sub(1);
                (state.auto_listen == 0 && state.listen_requests == 0 && state.listening)
                    .then(|| self.inner.halt(&mut state))
            };
            // Accept tasks finish on their own once signalled.
            if let Some(halted) = halted {
                self.inner.refuse_later(halted.refused);
            }
        }
        Ok(())
    }

    /// Dispatch requests for `object` to interfaces registered with `type_uuid`.
    pub fn set_object_type(&self, object: Uuid, type_uuid: Uuid) {
        let mut types = lock(&self.inner.object_types);
        if type_uuid.is_nil() {
            types.remove(&object);
        } else {
            types.insert(object, type_uuid);
        }
    }

    /// Accept binds using `provider` with `credential` as the server identity.
    pub fn register_auth_info(&self, provider: Arc<dyn SecurityProvider>, credential: Credential) {
        info!(
            auth_type = provider.auth_type(),
            provider = provider.name(),
            "Auth info registered"
        );
        lock(&self.inner.auth).insert(provider.auth_type(), (provider, credential));
    }

    /// Start accepting on every registered endpoint.
    ///
    /// `max_calls` caps the worker pool and `min_threads` is the number of
    /// idle workers it keeps. A server already started by an AUTO_LISTEN
    /// registration keeps its pool and stays up until this request is
    /// stopped too. Unless `non_blocking`, waits until the server stops
    /// listening.
    #[instrument(skip(self))]
    pub async fn listen(
        &self,
        min_threads: usize,
        max_calls: usize,
        non_blocking: bool,
    ) -> Result<()> {
        {
            let mut state = lock(&self.inner.state);
            if state.listen_requests > 0 {
                return Err(RpcError::AlreadyListening);
            }
            state.listen_requests += 1;
            if state.listening {
                debug!(auto_listen = state.auto_listen, "Listen joins a running server");
            } else {
                self.inner.start(&mut state, min_threads, max_calls);
            }
        }
        if !non_blocking {
            self.wait().await;
        }
        Ok(())
    }

    /// Stop accepting and close the pool. Queued calls that no worker picked
    /// up are refused with a fault; in-flight calls finish within the
    /// configured shutdown timeout.
    #[instrument(skip(self))]
    pub async fn stop_listening(&self) -> Result<()> {
        let Halted {
            accept_tasks,
            pool,
            refused,
        } = {
            let mut state = lock(&self.inner.state);
            if !state.listening {
                return Err(RpcError::NotListening);
            }
            self.inner.halt(&mut state)
        };
        refuse_calls(self.inner.runtime.clone(), refused).await;

        let grace = self.inner.runtime.config().server.shutdown_timeout;
        let drained = tokio::time::timeout(grace, async {
            for task in accept_tasks {
                if let Err(e) = task.await {
                    warn!(error = %e, "Accept task failed");
                }
            }
            if let Some(pool) = pool {
                pool.join().await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(?grace, "Calls still running after shutdown timeout");
        }
        info!("Server stopped listening");
        Ok(())
    }

    pub fn is_listening(&self) -> bool {
        lock(&self.inner.state).listening
    }

    /// Resolve once the server is not listening.
    pub async fn wait(&self) {
        let mut listening = self.inner.listening.subscribe();
        let _ = listening.wait_for(|listening| !*listening).await;
    }

    /// Registered endpoints as `protseq:address[endpoint]` strings.
    pub fn endpoints(&self) -> Vec<String> {
        lock(&self.inner.endpoints)
            .iter()
            .map(|endpoint| endpoint.binding_string())
            .collect()
    }

    /// Worker pool statistics while listening.
    pub fn pool_stats(&self) -> Option<PoolStats> {
        lock(&self.inner.state).pool.as_ref().map(WorkerPool::stats)
    }

    pub fn interface_count(&self) -> usize {
        self.inner.interfaces.len()
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        let halted = {
            let mut state = lock(&self.inner.state);
            state.listening.then(|| self.inner.halt(&mut state))
        };
        if let Some(halted) = halted {
            self.inner.refuse_later(halted.refused);
        }
    }
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("endpoints", &self.endpoints())
            .field("interfaces", &self.interface_count())
            .field("listening", &self.is_listening())
            .finish()
    }
}

/// Network address of a peer, without the port of a socket address.
fn peer_host(peer: &str) -> String {
    peer.parse::<SocketAddr>()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| peer.to_string())
}

impl ServerInner {
    fn start(self: &Arc<Self>, state: &mut ListenState, min_threads: usize, max_calls: usize) {
        let config = &self.runtime.config().server;
        let cap = max_calls.min(config.max_workers).min(MAX_WORKERS).max(1);

        let server = Arc::downgrade(self);
        let handler: JobHandler<CallJob> = Arc::new(move |job: CallJob| {
            let server = server.clone();
            async move {
                if let Some(server) = server.upgrade() {
                    server.dispatch(job).await;
                }
            }
            .boxed()
        });
        state.pool = Some(WorkerPool::new(
            cap,
            min_threads,
            config.worker_idle_timeout,
            self.runtime.metrics().clone(),
            handler,
        ));
        state.listening = true;
        self.listening.send_replace(true);

        let endpoints: Vec<_> = lock(&self.endpoints).clone();
        for endpoint in endpoints {
            state.accept_tasks.push(self.spawn_accept(endpoint));
        }
        info!(max_workers = cap, min_threads, "Server listening");
    }

    fn halt(&self, state: &mut ListenState) -> Halted {
        state.listening = false;
        state.listen_requests = 0;
        self.listening.send_replace(false);
        let pool = state.pool.take();
        let refused = pool.as_ref().map(WorkerPool::close).unwrap_or_default();
        Halted {
            accept_tasks: std::mem::take(&mut state.accept_tasks),
            pool,
            refused,
        }
    }

    /// Fault `calls` from a task, for callers that cannot await.
    fn refuse_later(&self, calls: Vec<CallJob>) {
        if calls.is_empty() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(refuse_calls(self.runtime.clone(), calls));
            }
            Err(_) => warn!(count = calls.len(), "Queued calls dropped outside a runtime"),
        }
    }

    fn spawn_accept(self: &Arc<Self>, endpoint: Arc<Endpoint>) -> JoinHandle<()> {
        tokio::spawn(accept_loop(
            self.clone(),
            endpoint,
            self.listening.subscribe(),
        ))
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_bind(
        &self,
        conn: &ConnectionHandle,
        key: &AssociationKey,
        endpoint: &Endpoint,
        header: Header,
        bind: BindHeader,
        payload: &Bytes,
        auth: Option<&AuthTrailer>,
    ) -> Result<Option<Arc<Association>>> {
        let call_id = header.call_id();
        let metrics = self.runtime.metrics();

        let association = match self
            .runtime
            .associations()
            .get_or_create_server(key.clone(), bind.assoc_gid)
        {
            Ok(association) => association,
            Err(e) => {
                warn!(group_id = bind.assoc_gid, error = %e, "Bind names an unknown association group");
                self.send_nack(conn, call_id, reject_reason::NOT_SPECIFIED).await?;
                return Ok(None);
            }
        };

        let challenge = match auth {
            Some(trailer) => match self.accept_security(conn, trailer) {
                Ok(challenge) => challenge,
                Err(reason) => {
                    self.send_nack(conn, call_id, reason).await?;
                    return Ok(None);
                }
            },
            None => None,
        };

        let body = BindBody::decode(payload, header.is_little_endian())?;
        let mut results = Vec::with_capacity(body.contexts.len());
        let mut accepted = None;
        for context in &body.contexts {
            let result = self.interfaces.negotiate(context)?;
            if result.is_accepted() && accepted.is_none() {
                accepted = Some((context.context_id, context.abstract_syntax, result.transfer_syntax));
            }
            results.push(result);
        }

        let config = &self.runtime.config().server;
        let max_tsize = config.max_receive_frag.min(bind.max_tsize);
        let max_frame = config.max_transmit_frag.min(bind.max_rsize);
        let group_id = association.group_id();
        let ack = Header::new(HeaderFields::BindAck(BindHeader {
            max_tsize,
            max_rsize: max_frame,
            assoc_gid: group_id,
        }))
        .with_call_id(call_id);
        let body = BindAckBody {
            secondary_address: endpoint.endpoint.clone(),
            results,
        }
        .encode();
        conn.send(ack, body, challenge).await?;

        // The ack itself goes out at the pre-negotiation frame size.
        conn.update_negotiated(|state| {
            if let Some((context_id, syntax, transfer)) = accepted {
                state.active_interface = Some(syntax);
                state.transfer_syntax = Some(transfer);
                state.context_id = context_id;
            }
            state.max_frame_size = max_frame;
            state.max_receive_size = max_tsize;
            state.assoc_group_id = group_id;
        });

        match accepted {
            Some((context_id, syntax, _)) => {
                metrics.bind_accepted();
                debug!(
                    connection = conn.id(),
                    interface = %syntax,
                    context_id,
                    group_id,
                    max_frame,
                    "Bind accepted"
                );
            }
            None => {
                metrics.bind_rejected();
                debug!(connection = conn.id(), "Bind rejected every presentation context");
            }
        }
        Ok(Some(association))
    }

    /// Start the server side of the negotiation carried by a bind. Errors
    /// are the bind_nack reason to send.
    fn accept_security(
        &self,
        conn: &ConnectionHandle,
        trailer: &AuthTrailer,
    ) -> std::result::Result<Option<Bytes>, u16> {
        let verifier = trailer.verifier;
        let registration = lock(&self.auth).get(&verifier.auth_type).cloned();
        let Some((provider, credential)) = registration else {
            warn!(auth_type = verifier.auth_type, "Bind requested an unknown authentication service");
            return Err(reject_reason::UNKNOWN_AUTHN_SERVICE);
        };
        let Some(level) = AuthLevel::from_u8(verifier.auth_level) else {
            warn!(auth_level = verifier.auth_level, "Bind requested an invalid authentication level");
            return Err(reject_reason::NOT_SPECIFIED);
        };

        let mut ctx =
            SecurityContext::server(provider.as_ref(), level, credential, verifier.auth_context_id);
        match ctx.accept(&trailer.token) {
            Ok(challenge) => {
                conn.set_security(ctx);
                Ok(challenge)
            }
            Err(e) => {
                self.runtime.metrics().auth_failure();
                warn!(connection = conn.id(), error = %e, "Bind authentication failed");
                Err(reject_reason::INVALID_CHECKSUM)
            }
        }
    }

    fn handle_auth3(&self, conn: &ConnectionHandle, auth: Option<&AuthTrailer>) -> Result<()> {
        let trailer = auth.ok_or(ProtocolError::security(constants::ERR_MISSING_VERIFIER))?;
        let completed = conn
            .with_security(|ctx| ctx.complete(&trailer.token))
            .ok_or(ProtocolError::security(constants::ERR_NO_SECURITY_CONTEXT))?;
        if let Err(e) = completed {
            self.runtime.metrics().auth_failure();
            return Err(e.into());
        }
        debug!(connection = conn.id(), "Security context established");
        Ok(())
    }

    async fn send_nack(&self, conn: &ConnectionHandle, call_id: u32, reason: u16) -> Result<()> {
        self.runtime.metrics().bind_rejected();
        let header = Header::new(HeaderFields::BindNack(BindNackHeader {
            reject_reason: reason,
        }))
        .with_call_id(call_id);
        conn.send(header, BindNackBody::supported().encode(), None).await?;
        debug!(connection = conn.id(), reason, "Bind refused");
        Ok(())
    }

    async fn queue_call(&self, job: CallJob) -> Result<()> {
        let pool = lock(&self.state).pool.clone();
        let refused = match pool {
            Some(pool) => pool.enqueue(job).err(),
            None => Some(job),
        };
        if let Some(job) = refused {
            debug!(call_id = job.call_id, "Server not listening, refusing call");
            refuse_call(&self.runtime, &job).await?;
        }
        Ok(())
    }

    async fn dispatch(self: Arc<Self>, job: CallJob) {
        let metrics = self.runtime.metrics();
        let negotiated = job.connection.negotiated();
        let (Some(syntax), Some(transfer)) = (negotiated.active_interface, negotiated.transfer_syntax)
        else {
            warn!(connection = job.connection.id(), "Request on a connection with no bound interface dropped");
            metrics.packet_dropped();
            return;
        };
        let opnum = job.request.opnum;
        let manager_type = job
            .request
            .object
            .and_then(|object| lock(&self.object_types).get(&object).copied())
            .unwrap_or_else(Uuid::nil);

        let interface = match self.interfaces.lookup(&syntax, &manager_type) {
            Ok(Some(interface)) => interface,
            Ok(None) => {
                warn!(interface = %syntax, %manager_type, opnum, "Request for unregistered interface dropped");
                metrics.packet_dropped();
                return;
            }
            Err(e) => {
                error!(error = %e, "Interface lookup failed");
                metrics.packet_dropped();
                return;
            }
        };

        let mut message = Message::new(syntax, transfer, opnum);
        message.buffer = BytesMut::from(&job.payload[..]);
        message.data_representation = job.drep;
        message.object = job.request.object;
        message.binding = Some(Binding::server_side(
            self.runtime.clone(),
            job.caller.clone(),
            job.request.object,
        ));

        metrics.call_dispatched();
        let outcome = interface.operation(opnum).and_then(|handler| {
            std::panic::catch_unwind(AssertUnwindSafe(|| handler(&mut message))).unwrap_or_else(|_| {
                error!(interface = %syntax, opnum, "Operation handler panicked");
                Err(RpcError::CallFailed)
            })
        });
        drop(message);

        let sent = match outcome {
            Ok(reply) => {
                let header = Header::new(HeaderFields::Response(ResponseHeader {
                    alloc_hint: 0,
                    context_id: job.request.context_id,
                    cancel_count: 0,
                }))
                .with_call_id(job.call_id);
                job.connection
                    .send(header, reply.into_bytes(), None)
                    .await
                    .map_err(RpcError::from)
            }
            Err(e) => {
                debug!(interface = %syntax, opnum, error = %e, "Call failed");
                send_fault(
                    &self.runtime,
                    &job.connection,
                    job.call_id,
                    job.request.context_id,
                    e.fault_status(),
                )
                .await
            }
        };
        if let Err(e) = sent {
            warn!(connection = job.connection.id(), call_id = job.call_id, error = %e, "Reply not sent");
        }
    }
}

async fn send_fault(
    runtime: &RpcRuntime,
    connection: &ConnectionHandle,
    call_id: u32,
    context_id: u16,
    status: u32,
) -> Result<()> {
    let header = Header::new(HeaderFields::Fault(FaultHeader {
        alloc_hint: 0,
        context_id,
        cancel_count: 0,
        status,
    }))
    .with_call_id(call_id);
    connection.send(header, Bytes::new(), None).await?;
    runtime.metrics().fault_sent();
    Ok(())
}

async fn refuse_call(runtime: &RpcRuntime, job: &CallJob) -> Result<()> {
    send_fault(
        runtime,
        &job.connection,
        job.call_id,
        job.request.context_id,
        status::SERVER_UNAVAILABLE,
    )
    .await
}

async fn refuse_calls(runtime: Arc<RpcRuntime>, calls: Vec<CallJob>) {
    for job in calls {
        if let Err(e) = refuse_call(&runtime, &job).await {
            warn!(connection = job.connection.id(), call_id = job.call_id, error = %e, "Refusal not sent");
        }
    }
}

async fn accept_loop(
    server: Arc<ServerInner>,
    endpoint: Arc<Endpoint>,
    mut listening: watch::Receiver<bool>,
) {
    let kept = lock(&endpoint.listener).take();
    let mut listener = match kept {
        Some(listener) => listener,
        None => match endpoint
            .transport
            .listen(&endpoint.address, &endpoint.endpoint)
            .await
        {
            Ok(listener) => listener,
            Err(e) => {
                error!(endpoint = %endpoint.binding_string(), error = %e, "Failed to reopen endpoint");
                return;
            }
        },
    };
    info!(endpoint = %endpoint.binding_string(), "Accepting connections");

    loop {
        let permit = tokio::select! {
            _ = listening.wait_for(|listening| !*listening) => break,
            permit = endpoint.connections.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let channel = tokio::select! {
            _ = listening.wait_for(|listening| !*listening) => break,
            accepted = listener.accept() => match accepted {
                Ok(channel) => channel,
                Err(e) => {
                    warn!(endpoint = %endpoint.binding_string(), error = %e, "Accept failed");
                    continue;
                }
            },
        };
        tokio::spawn(serve_connection(server.clone(), endpoint.clone(), channel, permit));
    }

    drop(listener);
    info!(endpoint = %endpoint.binding_string(), "Stopped accepting");
}

async fn serve_connection(
    server: Arc<ServerInner>,
    endpoint: Arc<Endpoint>,
    channel: BoxedChannel,
    _permit: OwnedSemaphorePermit,
) {
    let runtime = server.runtime.clone();
    let mut conn = Connection::new(
        channel,
        true,
        runtime.config().transport.max_packet_size,
        runtime.metrics().clone(),
    );
    let key = AssociationKey::new(
        &endpoint.protseq,
        &peer_host(conn.peer()),
        &endpoint.endpoint,
        None,
    );
    // Keeps the association group alive while this connection is open.
    let mut association: Option<Arc<Association>> = None;

    loop {
        let packet = match conn.receive().await {
            Ok(packet) => packet,
            Err(e) => {
                debug!(connection = conn.id(), error = %e, "Reader finished");
                break;
            }
        };
        let Packet {
            header,
            payload,
            auth,
        } = packet;

        let handled = match header.fields {
            HeaderFields::Bind(bind) => server
                .handle_bind(conn.handle(), &key, &endpoint, header, bind, &payload, auth.as_ref())
                .await
                .map(|bound| {
                    if bound.is_some() {
                        association = bound;
                    }
                }),
            HeaderFields::Auth3 => server.handle_auth3(conn.handle(), auth.as_ref()),
            HeaderFields::Request(request) => {
                server
                    .queue_call(CallJob {
                        connection: conn.handle().clone(),
                        call_id: header.call_id(),
                        request,
                        drep: header.common.drep,
                        payload,
                        caller: key.clone(),
                    })
                    .await
            }
            _ => Err(ProtocolError::violation(constants::ERR_UNEXPECTED_PACKET).into()),
        };
        if let Err(e) = handled {
            warn!(connection = conn.id(), ptype = ?header.packet_type(), error = %e, "Closing connection");
            break;
        }
    }

    conn.close().await;
    drop(association);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;

    #[test]
    fn test_peer_host_strips_socket_port() {
        assert_eq!(peer_host("127.0.0.1:49152"), "127.0.0.1");
        assert_eq!(peer_host("[::1]:135"), "::1");
        assert_eq!(peer_host("ncacn_mem"), "ncacn_mem");
    }

    #[test]
    fn test_connection_task_is_send() {
        fn spawnable<A, B, C, D, F>(_: fn(A, B, C, D) -> F)
        where
            F: std::future::Future<Output = ()> + Send + 'static,
        {
        }
        fn shared<T: Send + Sync>() {}

        spawnable(serve_connection);
        shared::<ConnectionHandle>();
        shared::<BoxedChannel>();
    }

    #[tokio::test]
    async fn test_listen_twice_is_rejected() {
        let server = RpcServer::new(RpcRuntime::new(RuntimeConfig::default()));
        server.register_protseq("ncacn_mem", "", 10).await.unwrap();
        server.listen(1, 10, true).await.unwrap();
        assert!(matches!(
            server.listen(1, 10, true).await,
            Err(RpcError::AlreadyListening)
        ));
        server.stop_listening().await.unwrap();
        assert!(matches!(
            server.stop_listening().await,
            Err(RpcError::NotListening)
        ));
    }

    #[tokio::test]
    async fn test_auto_listen_follows_registration() {
        use crate::core::syntax::NDR_TRANSFER_SYNTAX;

        let server = RpcServer::new(RpcRuntime::new(RuntimeConfig::default()));
        let syntax = SyntaxId::new(Uuid::from_u128(0xa11), 1, 0);
        server
            .register_interface(
                RegisteredInterface::new(syntax, NDR_TRANSFER_SYNTAX)
                    .with_flags(InterfaceFlags::AUTO_LISTEN),
            )
            .unwrap();
        assert!(server.is_listening());

        server.unregister_interface(&syntax, &Uuid::nil()).unwrap();
        assert!(!server.is_listening());
        assert!(matches!(
            server.unregister_interface(&syntax, &Uuid::nil()),
            Err(RpcError::UnknownInterface)
        ));
    }

    #[tokio::test]
    async fn test_dynamic_endpoints_are_resolved() {
        let server = RpcServer::new(RpcRuntime::new(RuntimeConfig::default()));
        let endpoint = server.register_protseq("ncacn_mem", "", 10).await.unwrap();
        assert!(!endpoint.is_empty());
        assert_eq!(server.endpoints(), vec![format!("ncacn_mem:0.0.0.0[{endpoint}]")]);
    }
}
