//! # Transport Layer
//!
//! Reliable byte-stream channels, one [`Transport`] per protocol sequence.
//!
//! A channel is any `AsyncRead + AsyncWrite` stream; its readiness is the
//! async wakeup of those traits. Closing a channel (dropping it or shutting
//! down its write half) unblocks the peer's pending reads with EOF.
//!
//! ## Built-in protocol sequences
//! - `ncacn_ip_tcp`: TCP, endpoint is the port
//! - `ncalrpc`: Unix domain sockets (Unix only)
//! - `ncacn_mem`: in-process loopback pairs

#[cfg(unix)]
pub mod local;
pub mod memory;
pub mod tcp;

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Result, RpcError};

/// A connected, bidirectional byte stream.
pub trait Channel: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static {
    /// Printable peer address, for diagnostics.
    fn peer(&self) -> String;
}

pub type BoxedChannel = Box<dyn Channel>;

/// A listening endpoint.
pub trait Listener: Send {
    /// Wait for the next inbound channel.
    fn accept(&mut self) -> BoxFuture<'_, io::Result<BoxedChannel>>;

    /// The endpoint actually bound (a dynamic port resolved, for example).
    fn local_endpoint(&self) -> String;
}

/// Opens and listens on channels for one protocol sequence.
pub trait Transport: Send + Sync {
    fn protseq(&self) -> &'static str;

    fn open<'a>(&'a self, addr: &'a str, endpoint: &'a str)
        -> BoxFuture<'a, io::Result<BoxedChannel>>;

    fn listen<'a>(
        &'a self,
        addr: &'a str,
        endpoint: &'a str,
    ) -> BoxFuture<'a, io::Result<Box<dyn Listener>>>;
}

/// Protocol sequence name to transport.
#[derive(Default)]
pub struct TransportRegistry {
    transports: RwLock<HashMap<&'static str, Arc<dyn Transport>>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `transport`, replacing any transport with the same protseq.
    pub fn register(&self, transport: Arc<dyn Transport>) {
        let mut transports = self
            .transports
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        transports.insert(transport.protseq(), transport);
    }

    pub fn get(&self, protseq: &str) -> Result<Arc<dyn Transport>> {
        let transports = self
            .transports
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        transports
            .get(protseq)
            .cloned()
            .ok_or_else(|| RpcError::UnsupportedProtseq(protseq.to_string()))
    }

    /// Registered protocol sequence names, sorted.
    pub fn protseqs(&self) -> Vec<&'static str> {
        let transports = self
            .transports
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut names: Vec<_> = transports.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("protseqs", &self.protseqs())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_protseq_is_unsupported() {
        let registry = TransportRegistry::new();
        registry.register(Arc::new(memory::MemoryTransport::new()));
        assert!(registry.get(memory::PROTSEQ).is_ok());
        assert!(matches!(
            registry.get("ncadg_ip_udp"),
            Err(RpcError::UnsupportedProtseq(name)) if name == "ncadg_ip_udp"
        ));
    }
}
