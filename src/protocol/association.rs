//! # Associations
//!
//! An association names a target `(protseq, address, endpoint, options)` and
//! owns the idle client connections bound to it. Server associations group the
//! connections of one client association under a shared group id.
//!
//! Associations are reference counted through `Arc`. The registry holds only
//! weak entries: dropping the last `Arc` removes the entry and closes every
//! idle connection.
//!
//! ## Group ids
//! A client association starts with group id 0. The first connection returned
//! to the pool pins the id the server assigned in its bind_ack; it never
//! changes afterwards. Later binds send the pinned id so the server files the
//! new connection under the same server association.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, info, instrument};

use crate::config::{ClientConfig, TransportConfig};
use crate::core::syntax::SyntaxId;
use crate::error::{Result, RpcError};
use crate::protocol::binding;
use crate::protocol::connection::Connection;
use crate::security::{AuthInfo, QualityOfService};
use crate::transport::{Transport, TransportRegistry};
use crate::utils::lock;
use crate::utils::metrics::Metrics;
use crate::utils::timeout::with_timeout_error;

/// Registry key: the target's parsed string-binding fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssociationKey {
    pub protseq: String,
    pub network_address: String,
    pub endpoint: String,
    pub options: Option<String>,
}

impl AssociationKey {
    pub fn new(
        protseq: impl Into<String>,
        network_address: impl Into<String>,
        endpoint: impl Into<String>,
        options: Option<String>,
    ) -> Self {
        Self {
            protseq: protseq.into(),
            network_address: network_address.into(),
            endpoint: endpoint.into(),
            options,
        }
    }
}

/// Settings client connections are opened and bound with.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub max_transmit_frag: u16,
    pub max_receive_frag: u16,
    pub connect_timeout: std::time::Duration,
    pub call_timeout: Option<std::time::Duration>,
    pub max_packet_size: usize,
}

impl ConnectionSettings {
    pub fn new(client: &ClientConfig, transport: &TransportConfig) -> Self {
        Self {
            max_transmit_frag: client.max_transmit_frag,
            max_receive_frag: client.max_receive_frag,
            connect_timeout: client.connect_timeout,
            call_timeout: client.call_timeout,
            max_packet_size: transport.max_packet_size,
        }
    }
}

struct RegistryShared {
    clients: Mutex<HashMap<AssociationKey, Weak<Association>>>,
    servers: Mutex<HashMap<u32, Weak<Association>>>,
    next_group_id: AtomicU32,
}

/// Process-wide client and server association registries.
pub struct AssociationRegistry {
    shared: Arc<RegistryShared>,
    transports: Arc<TransportRegistry>,
    settings: ConnectionSettings,
    metrics: Arc<Metrics>,
}

impl AssociationRegistry {
    pub fn new(
        transports: Arc<TransportRegistry>,
        settings: ConnectionSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                clients: Mutex::new(HashMap::new()),
                servers: Mutex::new(HashMap::new()),
                next_group_id: AtomicU32::new(1),
            }),
            transports,
            settings,
            metrics,
        }
    }

    /// Find the client association for `key`, creating it with group id 0.
    pub fn get_or_create_client(&self, key: AssociationKey) -> Result<Arc<Association>> {
        let transport = self.transports.get(&key.protseq)?;
        let mut clients = lock(&self.shared.clients);
        if let Some(existing) = clients.get(&key).and_then(Weak::upgrade) {
            return Ok(existing);
        }

        let association = Arc::new(Association {
            key: key.clone(),
            group_id: AtomicU32::new(0),
            is_server: false,
            idle: Mutex::new(VecDeque::new()),
            transport: Some(transport),
            settings: self.settings.clone(),
            metrics: self.metrics.clone(),
            registry: Arc::downgrade(&self.shared),
        });
        debug!(key = ?key, "Client association created");
        clients.insert(key, Arc::downgrade(&association));
        Ok(association)
    }

    /// Find the server association a bind names.
    ///
    /// A non-zero `group_id` must match an existing association with the same
    /// key, or the bind fails with [`RpcError::NoContext`]. Zero creates a new
    /// association with a fresh group id.
    pub fn get_or_create_server(
        &self,
        key: AssociationKey,
        group_id: u32,
    ) -> Result<Arc<Association>> {
        if group_id != 0 {
            let found = lock(&self.shared.servers)
                .get(&group_id)
                .and_then(Weak::upgrade);
            return found
                .filter(|assoc| assoc.key == key)
                .ok_or(RpcError::NoContext);
        }

        let mut servers = lock(&self.shared.servers);
        let group_id = self.shared.next_group_id.fetch_add(1, Ordering::Relaxed);
        let association = Arc::new(Association {
            key,
            group_id: AtomicU32::new(group_id),
            is_server: true,
            idle: Mutex::new(VecDeque::new()),
            transport: None,
            settings: self.settings.clone(),
            metrics: self.metrics.clone(),
            registry: Arc::downgrade(&self.shared),
        });
        debug!(group_id, "Server association created");
        servers.insert(group_id, Arc::downgrade(&association));
        Ok(association)
    }

    /// Live client associations.
    pub fn client_count(&self) -> usize {
        lock(&self.shared.clients)
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    /// Live server associations.
    pub fn server_count(&self) -> usize {
        lock(&self.shared.servers)
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    /// Close the idle connections of every client association.
    pub fn drain_idle(&self) -> usize {
        let associations: Vec<_> = lock(&self.shared.clients)
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        let drained = associations.iter().map(|assoc| assoc.drain_idle()).sum();
        info!(drained, "Idle connections drained");
        drained
    }
}

impl fmt::Debug for AssociationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssociationRegistry")
            .field("clients", &self.client_count())
            .field("servers", &self.server_count())
            .finish()
    }
}

/// A target and its pool of idle connections.
pub struct Association {
    key: AssociationKey,
    group_id: AtomicU32,
    is_server: bool,
    idle: Mutex<VecDeque<Connection>>,
    transport: Option<Arc<dyn Transport>>,
    settings: ConnectionSettings,
    metrics: Arc<Metrics>,
    registry: Weak<RegistryShared>,
}

impl Association {
    pub fn key(&self) -> &AssociationKey {
        &self.key
    }

    pub fn group_id(&self) -> u32 {
        self.group_id.load(Ordering::Acquire)
    }

    pub fn is_server(&self) -> bool {
        self.is_server
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Holders of this association, the registry excluded.
    pub fn ref_count(self: &Arc<Self>) -> usize {
        Arc::strong_count(self)
    }

    /// Drop one reference. The last one destroys the association.
    pub fn release(self: Arc<Self>) {
        drop(self);
    }

    pub fn idle_count(&self) -> usize {
        lock(&self.idle).len()
    }

    /// Set the group id if it is still unassigned. Returns the id in effect.
    pub fn pin_group_id(&self, group_id: u32) -> u32 {
        match self
            .group_id
            .compare_exchange(0, group_id, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => group_id,
            Err(current) => current,
        }
    }

    /// Open a fresh, unbound client connection to the target.
    pub async fn open_connection(&self) -> Result<Connection> {
        let transport = self
            .transport
            .as_ref()
            .ok_or(RpcError::InvalidBinding(std::borrow::Cow::Borrowed(
                crate::error::constants::ERR_SERVER_BINDING,
            )))?;
        let key = &self.key;
        let channel = with_timeout_error(
            async {
                transport
                    .open(&key.network_address, &key.endpoint)
                    .await
                    .map_err(RpcError::from)
            },
            self.settings.connect_timeout,
        )
        .await?;
        Ok(Connection::new(
            channel,
            false,
            self.settings.max_packet_size,
            self.metrics.clone(),
        ))
    }

    /// Check out a connection for the interface, auth and QoS, binding a new
    /// one when no idle connection matches.
    #[instrument(skip(self, auth), fields(target = ?self.key))]
    pub async fn acquire_connection(
        &self,
        syntax: &SyntaxId,
        transfer: &SyntaxId,
        auth: Option<&AuthInfo>,
        qos: &QualityOfService,
    ) -> Result<Connection> {
        {
            let mut idle = lock(&self.idle);
            idle.retain(|conn| !conn.is_broken());
            if let Some(pos) = idle
                .iter()
                .position(|conn| conn.matches(syntax, transfer, auth, qos))
            {
                if let Some(conn) = idle.remove(pos) {
                    self.metrics.pool_hit();
                    debug!(connection = conn.id(), "Reusing pooled connection");
                    return Ok(conn);
                }
            }
        }

        self.metrics.pool_miss();
        binding::bind(self, syntax, transfer, auth, qos).await
    }

    /// Return a checked-out connection to the pool. Broken connections are
    /// dropped instead.
    pub fn release_connection(&self, conn: Connection) {
        if conn.is_broken() {
            debug!(connection = conn.id(), "Discarding broken connection");
            return;
        }
        let negotiated = conn.negotiated().assoc_group_id;
        if negotiated != 0 {
            self.pin_group_id(negotiated);
        }
        lock(&self.idle).push_back(conn);
    }

    /// Close all idle connections.
    pub fn drain_idle(&self) -> usize {
        let drained: Vec<_> = lock(&self.idle).drain(..).collect();
        drained.len()
    }
}

impl Drop for Association {
    fn drop(&mut self) {
        let this: *const Association = self;
        if let Some(shared) = self.registry.upgrade() {
            if self.is_server {
                let mut servers = lock(&shared.servers);
                let gid = self.group_id.load(Ordering::Acquire);
                if servers.get(&gid).is_some_and(|w| std::ptr::eq(w.as_ptr(), this)) {
                    servers.remove(&gid);
                }
            } else {
                let mut clients = lock(&shared.clients);
                if clients
                    .get(&self.key)
                    .is_some_and(|w| std::ptr::eq(w.as_ptr(), this))
                {
                    clients.remove(&self.key);
                }
            }
        }
        let idle = self
            .idle
            .get_mut()
            .map(|q| q.len())
            .unwrap_or_default();
        debug!(key = ?self.key, idle, "Association destroyed");
    }
}

impl fmt::Debug for Association {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Association")
            .field("key", &self.key)
            .field("group_id", &self.group_id())
            .field("is_server", &self.is_server)
            .field("idle", &self.idle_count())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::transport::memory::{MemoryTransport, PROTSEQ};

    fn registry() -> AssociationRegistry {
        let transports = Arc::new(TransportRegistry::new());
        transports.register(Arc::new(MemoryTransport::new()));
        AssociationRegistry::new(
            transports,
            ConnectionSettings::new(&ClientConfig::default(), &TransportConfig::default()),
            Arc::new(Metrics::new()),
        )
    }

    fn key(options: Option<&str>) -> AssociationKey {
        AssociationKey::new(PROTSEQ, "", "svc", options.map(String::from))
    }

    #[test]
    fn test_same_tuple_shares_one_association() {
        let registry = registry();
        let a = registry.get_or_create_client(key(None)).unwrap();
        let b = registry.get_or_create_client(key(None)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.ref_count(), 2);
        assert_eq!(a.group_id(), 0);

        let c = registry.get_or_create_client(key(Some("timeout=5"))).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_last_release_removes_from_registry() {
        let registry = registry();
        let a = registry.get_or_create_client(key(None)).unwrap();
        let b = a.clone();
        a.release();
        assert_eq!(registry.client_count(), 1);
        b.release();
        assert_eq!(registry.client_count(), 0);
    }

    #[test]
    fn test_unknown_protseq_fails_lookup() {
        let registry = registry();
        let err = registry
            .get_or_create_client(AssociationKey::new("ncacn_np", "", "pipe", None))
            .unwrap_err();
        assert!(matches!(err, RpcError::UnsupportedProtseq(_)));
    }

    #[test]
    fn test_server_group_ids_are_fresh_and_exact() {
        let registry = registry();
        let first = registry.get_or_create_server(key(None), 0).unwrap();
        let second = registry.get_or_create_server(key(None), 0).unwrap();
        assert!(second.group_id() > first.group_id());

        let found = registry
            .get_or_create_server(key(None), first.group_id())
            .unwrap();
        assert!(Arc::ptr_eq(&found, &first));

        assert!(matches!(
            registry.get_or_create_server(key(Some("x")), first.group_id()),
            Err(RpcError::NoContext)
        ));
        assert!(matches!(
            registry.get_or_create_server(key(None), 9999),
            Err(RpcError::NoContext)
        ));
    }

    #[test]
    fn test_group_id_pins_once() {
        let registry = registry();
        let assoc = registry.get_or_create_client(key(None)).unwrap();
        assert_eq!(assoc.pin_group_id(7), 7);
        assert_eq!(assoc.pin_group_id(9), 7);
        assert_eq!(assoc.group_id(), 7);
    }
}
