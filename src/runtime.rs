//! The runtime object owning all process-wide state.

use std::sync::Arc;

use tracing::info;

use crate::config::RuntimeConfig;
use crate::protocol::association::{AssociationRegistry, ConnectionSettings};
use crate::transport::memory::MemoryTransport;
use crate::transport::tcp::TcpTransport;
use crate::transport::TransportRegistry;
use crate::utils::metrics::Metrics;

/// Transports, association registries, metrics and configuration.
///
/// Created once with [`RpcRuntime::new`] and shared by bindings and servers.
/// [`RpcRuntime::shutdown`] closes every idle client connection.
#[derive(Debug)]
pub struct RpcRuntime {
    config: RuntimeConfig,
    transports: Arc<TransportRegistry>,
    associations: AssociationRegistry,
    metrics: Arc<Metrics>,
}

impl RpcRuntime {
    /// Initialize with the built-in transports registered.
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        let transports = Arc::new(TransportRegistry::new());
        transports.register(Arc::new(TcpTransport::new(config.transport.tcp_nodelay)));
        #[cfg(unix)]
        transports.register(Arc::new(crate::transport::local::LocalTransport));
        transports.register(Arc::new(MemoryTransport::new()));

        let metrics = Arc::new(Metrics::new());
        let associations = AssociationRegistry::new(
            transports.clone(),
            ConnectionSettings::new(&config.client, &config.transport),
            metrics.clone(),
        );
        info!(protseqs = ?transports.protseqs(), "RPC runtime initialized");

        Arc::new(Self {
            config,
            transports,
            associations,
            metrics,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn transports(&self) -> &Arc<TransportRegistry> {
        &self.transports
    }

    pub fn associations(&self) -> &AssociationRegistry {
        &self.associations
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Close all idle pooled connections.
    pub fn shutdown(&self) {
        let drained = self.associations.drain_idle();
        info!(drained, "RPC runtime shut down");
        self.metrics.log_metrics();
    }
}
