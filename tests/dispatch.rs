//! End-to-end dispatch tests over the in-process transport

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use rpc_runtime::config::RuntimeConfig;
use rpc_runtime::core::syntax::{SyntaxId, NDR_TRANSFER_SYNTAX};
use rpc_runtime::error::{ProtocolError, ProtocolResult, RpcError};
use rpc_runtime::protocol::binding::Binding;
use rpc_runtime::protocol::message::Message;
use rpc_runtime::runtime::RpcRuntime;
use rpc_runtime::security::{
    AuthLevel, Credential, KeyExchangeProvider, Role, SecurityPackage, SecurityProvider,
};
use rpc_runtime::service::{InterfaceFlags, RegisteredInterface, RpcServer};
use rpc_runtime::transport::memory::MemoryTransport;
use uuid::Uuid;

const ECHO: SyntaxId = SyntaxId::new(Uuid::from_u128(0x6bffd098_a112_3610_9833_46c3f87e345a), 1, 0);

fn echo_interface() -> RegisteredInterface {
    RegisteredInterface::new(ECHO, NDR_TRANSFER_SYNTAX)
        // 0: echo
        .with_operation(|msg: &mut Message| Ok(msg.response(msg.as_bytes())))
        // 1: panics
        .with_operation(|_msg: &mut Message| panic!("handler bug"))
        // 2: specific fault status
        .with_operation(|_msg: &mut Message| Err(RpcError::Fault(0x1c01_0003)))
        // 3: access denied
        .with_operation(|_msg: &mut Message| Err(RpcError::AccessDenied))
        // 4: describes the caller
        .with_operation(|msg: &mut Message| {
            let caller = msg.binding.as_ref().expect("dispatched calls carry a binding");
            assert!(caller.is_server());
            Ok(msg.response(caller.protseq()))
        })
        // 5: reverses the request in place
        .with_operation(|msg: &mut Message| {
            msg.buffer.reverse();
            Ok(msg.take_response())
        })
}

struct Harness {
    runtime: Arc<RpcRuntime>,
    memory: MemoryTransport,
    server: RpcServer,
    endpoint: String,
}

async fn harness(config: RuntimeConfig) -> Harness {
    let runtime = RpcRuntime::new(config);
    let memory = MemoryTransport::new();
    runtime.transports().register(Arc::new(memory.clone()));

    let server = RpcServer::new(runtime.clone());
    let endpoint = server.register_protseq("ncacn_mem", "", 16).await.unwrap();
    server.register_interface(echo_interface()).unwrap();
    server.listen(1, 16, true).await.unwrap();
    Harness {
        runtime,
        memory,
        server,
        endpoint,
    }
}

impl Harness {
    fn binding(&self) -> Binding {
        Binding::new(self.runtime.clone(), "ncacn_mem", "", &self.endpoint).unwrap()
    }

    async fn bound(&self) -> Binding {
        let mut binding = self.binding();
        binding.bind(&ECHO, &NDR_TRANSFER_SYNTAX).await.unwrap();
        binding
    }
}

#[tokio::test]
async fn test_ten_bytes_over_28_byte_frames_then_reuse() {
    let h = harness(RuntimeConfig::default_with_overrides(|c| {
        c.client.max_transmit_frag = 28;
        c.client.max_receive_frag = 28;
    }))
    .await;

    let mut binding = h.bound().await;
    let negotiated = binding.connection().unwrap().negotiated();
    assert_eq!(negotiated.max_frame_size, 28);

    let before = h.runtime.metrics().snapshot();
    let reply = binding.call(0, Bytes::from_static(b"0123456789")).await.unwrap();
    assert_eq!(&reply[..], b"0123456789");
    let after = h.runtime.metrics().snapshot();
    // three request fragments read by the server, three response fragments
    // read by the client
    assert_eq!(after.fragments_received - before.fragments_received, 6);

    binding.release();
    binding.bind(&ECHO, &NDR_TRANSFER_SYNTAX).await.unwrap();
    let reply = binding.call(0, Bytes::from_static(b"again")).await.unwrap();
    assert_eq!(&reply[..], b"again");

    let stats = h.runtime.metrics().snapshot();
    assert_eq!(stats.binds_sent, 1);
    assert_eq!(stats.pool_hits, 1);
    assert_eq!(h.memory.opened_channels(), 1);
}

#[tokio::test]
async fn test_out_of_range_opnum_faults_and_keeps_connection() {
    let h = harness(RuntimeConfig::default()).await;
    let mut binding = h.bound().await;

    let err = binding.call(42, Bytes::new()).await.unwrap_err();
    assert!(matches!(err, RpcError::CallFailed), "got {err:?}");
    assert!(binding.is_bound());

    let reply = binding.call(0, Bytes::from_static(b"still here")).await.unwrap();
    assert_eq!(&reply[..], b"still here");
    assert!(h.runtime.metrics().snapshot().faults_sent >= 1);
}

#[tokio::test]
async fn test_handler_panic_becomes_fault() {
    let h = harness(RuntimeConfig::default()).await;
    let mut binding = h.bound().await;

    let err = binding.call(1, Bytes::new()).await.unwrap_err();
    assert!(matches!(err, RpcError::CallFailed), "got {err:?}");

    let reply = binding.call(0, Bytes::from_static(b"ok")).await.unwrap();
    assert_eq!(&reply[..], b"ok");
}

#[tokio::test]
async fn test_handler_errors_map_to_fault_status() {
    let h = harness(RuntimeConfig::default()).await;
    let mut binding = h.bound().await;

    assert!(matches!(
        binding.call(2, Bytes::new()).await,
        Err(RpcError::Fault(0x1c01_0003))
    ));
    assert!(matches!(
        binding.call(3, Bytes::new()).await,
        Err(RpcError::AccessDenied)
    ));
}

#[tokio::test]
async fn test_handler_sees_server_side_binding() {
    let h = harness(RuntimeConfig::default()).await;
    let mut binding = h.bound().await;

    let reply = binding.call(4, Bytes::new()).await.unwrap();
    assert_eq!(&reply[..], b"ncacn_mem");
}

#[tokio::test]
async fn test_handler_rewrites_request_buffer_in_place() {
    let h = harness(RuntimeConfig::default()).await;
    let mut binding = h.bound().await;

    let reply = binding.call(5, Bytes::from_static(b"stressed")).await.unwrap();
    assert_eq!(&reply[..], b"desserts");
}

#[tokio::test]
async fn test_unregistered_interface_request_is_dropped() {
    let h = harness(RuntimeConfig::default_with_overrides(|c| {
        c.client.call_timeout = Some(Duration::from_millis(200));
    }))
    .await;
    let mut binding = h.bound().await;

    h.server.unregister_interface(&ECHO, &Uuid::nil()).unwrap();
    let err = binding.call(0, Bytes::from_static(b"lost")).await.unwrap_err();
    assert!(matches!(err, RpcError::Timeout), "got {err:?}");
    assert_eq!(h.runtime.metrics().snapshot().packets_dropped, 1);
    // A timed-out exchange leaves the connection unusable.
    assert!(!binding.is_bound());
}

#[tokio::test]
async fn test_object_type_selects_manager() {
    let h = harness(RuntimeConfig::default()).await;
    let typed = Uuid::from_u128(0x7e57);
    let object = Uuid::from_u128(0x0b1e);
    h.server
        .register_interface(
            RegisteredInterface::new(ECHO, NDR_TRANSFER_SYNTAX)
                .with_manager_type(typed)
                .with_operation(|msg: &mut Message| Ok(msg.response(b"typed"))),
        )
        .unwrap();
    h.server.set_object_type(object, typed);

    let mut plain = h.bound().await;
    assert_eq!(&plain.call(0, Bytes::from_static(b"nil")).await.unwrap()[..], b"nil");

    let mut with_object = h.binding().with_object(object);
    with_object.bind(&ECHO, &NDR_TRANSFER_SYNTAX).await.unwrap();
    assert_eq!(&with_object.call(0, Bytes::new()).await.unwrap()[..], b"typed");
}

#[tokio::test]
async fn test_bind_to_unknown_interface_is_rejected() {
    let h = harness(RuntimeConfig::default()).await;
    let mut binding = h.binding();
    let unknown = SyntaxId::new(Uuid::from_u128(0xdead), 1, 0);

    let err = binding.bind(&unknown, &NDR_TRANSFER_SYNTAX).await.unwrap_err();
    assert!(matches!(err, RpcError::UnknownInterface), "got {err:?}");

    let other_transfer = SyntaxId::new(Uuid::from_u128(0x71710533), 1, 0);
    let err = binding.bind(&ECHO, &other_transfer).await.unwrap_err();
    assert!(matches!(err, RpcError::ServerUnavailable), "got {err:?}");
}

async fn authenticated(h: &Harness, level: AuthLevel, secret: &[u8]) -> Result<Binding, RpcError> {
    let mut binding = h.binding();
    binding.set_auth_info(
        level,
        Arc::new(KeyExchangeProvider::new()),
        Credential::new("client").with_secret(secret.to_vec()),
    );
    binding.bind(&ECHO, &NDR_TRANSFER_SYNTAX).await?;
    Ok(binding)
}

#[tokio::test]
async fn test_integrity_and_privacy_round_trip() {
    let h = harness(RuntimeConfig::default()).await;
    h.server.register_auth_info(
        Arc::new(KeyExchangeProvider::new()),
        Credential::new("server").with_secret(b"shared".to_vec()),
    );

    let payload: Bytes = (0..12_000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>().into();
    for level in [AuthLevel::PktIntegrity, AuthLevel::PktPrivacy] {
        let mut binding = authenticated(&h, level, b"shared").await.unwrap();
        let established = binding
            .connection()
            .unwrap()
            .with_security(|ctx| ctx.is_established());
        assert_eq!(established, Some(true));

        let reply = binding.call(0, payload.clone()).await.unwrap();
        assert_eq!(reply, payload, "level {level:?}");
        let reply = binding.call(0, Bytes::from_static(b"second")).await.unwrap();
        assert_eq!(&reply[..], b"second");
    }
}

/// Finishes in the bind leg: the server answers without a challenge.
struct SingleLeg;

impl SecurityProvider for SingleLeg {
    fn auth_type(&self) -> u8 {
        0x44
    }

    fn name(&self) -> &str {
        "single-leg"
    }

    fn new_package(&self, _role: Role) -> Box<dyn SecurityPackage> {
        Box::new(SingleLeg)
    }
}

impl SecurityPackage for SingleLeg {
    fn initialize(&mut self, credential: &Credential) -> ProtocolResult<Vec<u8>> {
        Ok(credential.principal.as_bytes().to_vec())
    }

    fn accept(&mut self, _credential: &Credential, token: &[u8]) -> ProtocolResult<Vec<u8>> {
        if token == b"client" {
            Ok(Vec::new())
        } else {
            Err(ProtocolError::security("unknown principal"))
        }
    }

    fn respond(&mut self, _challenge: &[u8]) -> ProtocolResult<Vec<u8>> {
        Err(ProtocolError::security("no second leg"))
    }

    fn complete(&mut self, _token: &[u8]) -> ProtocolResult<()> {
        Err(ProtocolError::security("no third leg"))
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

#[tokio::test]
async fn test_single_leg_package_binds_without_auth3() {
    let h = harness(RuntimeConfig::default()).await;
    h.server
        .register_auth_info(Arc::new(SingleLeg), Credential::new("server"));

    let mut binding = h.binding();
    binding.set_auth_info(AuthLevel::Connect, Arc::new(SingleLeg), Credential::new("client"));
    binding.bind(&ECHO, &NDR_TRANSFER_SYNTAX).await.unwrap();
    let established = binding
        .connection()
        .unwrap()
        .with_security(|ctx| ctx.is_established());
    assert_eq!(established, Some(true));

    let reply = binding.call(0, Bytes::from_static(b"one leg")).await.unwrap();
    assert_eq!(&reply[..], b"one leg");
    assert_eq!(h.runtime.metrics().snapshot().auth_failures, 0);
}

#[tokio::test]
async fn test_mismatched_secret_is_denied() {
    let h = harness(RuntimeConfig::default()).await;
    h.server.register_auth_info(
        Arc::new(KeyExchangeProvider::new()),
        Credential::new("server").with_secret(b"right".to_vec()),
    );

    let err = authenticated(&h, AuthLevel::PktIntegrity, b"wrong")
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::AccessDenied), "got {err:?}");
    assert!(h.runtime.metrics().snapshot().auth_failures >= 1);
}

#[tokio::test]
async fn test_unknown_auth_service_is_refused() {
    let h = harness(RuntimeConfig::default()).await;
    let err = authenticated(&h, AuthLevel::PktIntegrity, b"any")
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::UnknownAuthnService), "got {err:?}");
}

#[tokio::test]
async fn test_stop_listening_refuses_new_work() {
    let h = harness(RuntimeConfig::default()).await;
    let mut existing = h.bound().await;

    h.server.stop_listening().await.unwrap();
    assert!(!h.server.is_listening());
    assert!(h.server.pool_stats().is_none());

    let err = existing.call(0, Bytes::from_static(b"late")).await.unwrap_err();
    assert!(matches!(err, RpcError::ServerUnavailable), "got {err:?}");

    let mut fresh = h.binding();
    let err = fresh.bind(&ECHO, &NDR_TRANSFER_SYNTAX).await.unwrap_err();
    assert!(matches!(err, RpcError::Transport(_)), "got {err:?}");

    // Listening again reopens the same endpoint.
    h.server.listen(1, 16, true).await.unwrap();
    let reply = existing.call(0, Bytes::from_static(b"back")).await.unwrap();
    assert_eq!(&reply[..], b"back");
    fresh.bind(&ECHO, &NDR_TRANSFER_SYNTAX).await.unwrap();
    assert_eq!(h.server.endpoints(), vec![format!("ncacn_mem:0.0.0.0[{}]", h.endpoint)]);
}

#[tokio::test]
async fn test_tcp_end_to_end() {
    let runtime = RpcRuntime::new(RuntimeConfig::default_with_overrides(|c| {
        c.server.bind_address = "127.0.0.1".to_string();
    }));
    let server = RpcServer::new(runtime.clone());
    let port = server.register_protseq("ncacn_ip_tcp", "0", 4).await.unwrap();
    assert_ne!(port, "0");
    server.register_interface(echo_interface()).unwrap();
    server.listen(1, 4, true).await.unwrap();

    let mut binding = Binding::new(runtime.clone(), "ncacn_ip_tcp", "127.0.0.1", &port).unwrap();
    binding.bind(&ECHO, &NDR_TRANSFER_SYNTAX).await.unwrap();
    let payload = Bytes::from(vec![7u8; 20_000]);
    assert_eq!(binding.call(0, payload.clone()).await.unwrap(), payload);

    server.stop_listening().await.unwrap();
}

#[tokio::test]
async fn test_explicit_listen_outlives_auto_listen_interface() {
    let runtime = RpcRuntime::new(RuntimeConfig::default());
    let server = RpcServer::new(runtime);
    server.register_protseq("ncacn_mem", "", 4).await.unwrap();
    let auto = SyntaxId::new(Uuid::from_u128(0xa070), 1, 0);
    server
        .register_interface(
            RegisteredInterface::new(auto, NDR_TRANSFER_SYNTAX).with_flags(InterfaceFlags::AUTO_LISTEN),
        )
        .unwrap();
    assert!(server.is_listening());

    // joins the running server instead of failing
    server.listen(1, 4, true).await.unwrap();
    assert!(matches!(
        server.listen(1, 4, true).await,
        Err(RpcError::AlreadyListening)
    ));

    server.unregister_interface(&auto, &Uuid::nil()).unwrap();
    assert!(server.is_listening(), "explicit listen still holds the server up");

    server.stop_listening().await.unwrap();
    assert!(!server.is_listening());
}

#[tokio::test]
async fn test_auto_listen_interface_does_not_stop_explicit_listen() {
    let runtime = RpcRuntime::new(RuntimeConfig::default());
    let server = RpcServer::new(runtime);
    server.register_protseq("ncacn_mem", "", 4).await.unwrap();
    server.listen(1, 4, true).await.unwrap();

    let auto = SyntaxId::new(Uuid::from_u128(0xa071), 1, 0);
    server
        .register_interface(
            RegisteredInterface::new(auto, NDR_TRANSFER_SYNTAX).with_flags(InterfaceFlags::AUTO_LISTEN),
        )
        .unwrap();
    server.unregister_interface(&auto, &Uuid::nil()).unwrap();
    assert!(server.is_listening());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_listening_faults_queued_calls() {
    let runtime = RpcRuntime::new(RuntimeConfig::default());
    let memory = MemoryTransport::new();
    runtime.transports().register(Arc::new(memory.clone()));

    let (release, gate) = mpsc::channel::<()>();
    let gate = Arc::new(Mutex::new(gate));
    let server = Arc::new(RpcServer::new(runtime.clone()));
    let endpoint = server.register_protseq("ncacn_mem", "", 4).await.unwrap();
    server
        .register_interface(RegisteredInterface::new(ECHO, NDR_TRANSFER_SYNTAX).with_operation(
            move |msg: &mut Message| {
                let _ = gate.lock().unwrap().recv_timeout(Duration::from_secs(5));
                Ok(msg.response(msg.as_bytes()))
            },
        ))
        .unwrap();
    // a single worker
    server.listen(1, 1, true).await.unwrap();

    let mut running = Binding::new(runtime.clone(), "ncacn_mem", "", &endpoint).unwrap();
    let mut queued = Binding::new(runtime.clone(), "ncacn_mem", "", &endpoint).unwrap();
    running.bind(&ECHO, &NDR_TRANSFER_SYNTAX).await.unwrap();
    queued.bind(&ECHO, &NDR_TRANSFER_SYNTAX).await.unwrap();

    let first = tokio::spawn(async move { running.call(0, Bytes::from_static(b"first")).await });
    wait_until(|| runtime.metrics().snapshot().calls_dispatched == 1).await;
    let second = tokio::spawn(async move { queued.call(0, Bytes::from_static(b"second")).await });
    wait_until(|| server.pool_stats().is_some_and(|stats| stats.queued == 1)).await;

    let stopper = server.clone();
    let stop = tokio::spawn(async move { stopper.stop_listening().await });

    let refused = tokio::time::timeout(Duration::from_secs(5), second)
        .await
        .expect("queued call answered")
        .unwrap();
    assert!(matches!(refused, Err(RpcError::ServerUnavailable)), "got {refused:?}");

    release.send(()).unwrap();
    assert_eq!(&first.await.unwrap().unwrap()[..], b"first");
    stop.await.unwrap().unwrap();
}

async fn wait_until(mut ready: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !ready() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached");
}
