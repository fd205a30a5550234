//! `ncacn_mem`: in-process loopback channels.
//!
//! Each `open` creates a `tokio::io::duplex` pair and hands the server half to
//! the listener registered under the endpoint. Dropping the listener
//! unregisters it; later opens are refused.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tracing::debug;

use super::{BoxedChannel, Channel, Listener, Transport};
use crate::utils::lock;

pub const PROTSEQ: &str = "ncacn_mem";

const DUPLEX_CAPACITY: usize = 64 * 1024;
const ACCEPT_BACKLOG: usize = 64;

impl Channel for DuplexStream {
    fn peer(&self) -> String {
        String::from(PROTSEQ)
    }
}

#[derive(Default)]
struct Shared {
    listeners: Mutex<HashMap<String, mpsc::Sender<DuplexStream>>>,
    opened: AtomicUsize,
    next_endpoint: AtomicU64,
}

/// Loopback transport. Clones share the same endpoint namespace.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Channels opened by clients so far.
    pub fn opened_channels(&self) -> usize {
        self.shared.opened.load(Ordering::Relaxed)
    }
}

impl Transport for MemoryTransport {
    fn protseq(&self) -> &'static str {
        PROTSEQ
    }

    fn open<'a>(
        &'a self,
        _addr: &'a str,
        endpoint: &'a str,
    ) -> BoxFuture<'a, io::Result<BoxedChannel>> {
        Box::pin(async move {
            let sender = lock(&self.shared.listeners)
                .get(endpoint)
                .cloned()
                .ok_or_else(|| no_listener(endpoint))?;
            let (client, server) = tokio::io::duplex(DUPLEX_CAPACITY);
            sender.send(server).await.map_err(|_| no_listener(endpoint))?;
            self.shared.opened.fetch_add(1, Ordering::Relaxed);
            debug!(endpoint, "Memory channel opened");
            Ok(Box::new(client) as BoxedChannel)
        })
    }

    fn listen<'a>(
        &'a self,
        _addr: &'a str,
        endpoint: &'a str,
    ) -> BoxFuture<'a, io::Result<Box<dyn Listener>>> {
        Box::pin(async move {
            let endpoint = if endpoint.is_empty() || endpoint == "0" {
                let n = self.shared.next_endpoint.fetch_add(1, Ordering::Relaxed);
                format!("mem-{n}")
            } else {
                endpoint.to_string()
            };

            let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
            {
                let mut listeners = lock(&self.shared.listeners);
                if listeners.contains_key(&endpoint) {
                    return Err(io::Error::new(
                        io::ErrorKind::AddrInUse,
                        format!("Memory endpoint {endpoint} already in use"),
                    ));
                }
                listeners.insert(endpoint.clone(), tx);
            }
            Ok(Box::new(MemoryListener {
                shared: self.shared.clone(),
                endpoint,
                incoming: rx,
            }) as Box<dyn Listener>)
        })
    }
}

fn no_listener(endpoint: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::ConnectionRefused,
        format!("No listener on memory endpoint {endpoint}"),
    )
}

struct MemoryListener {
    shared: Arc<Shared>,
    endpoint: String,
    incoming: mpsc::Receiver<DuplexStream>,
}

impl Listener for MemoryListener {
    fn accept(&mut self) -> BoxFuture<'_, io::Result<BoxedChannel>> {
        Box::pin(async move {
            self.incoming
                .recv()
                .await
                .map(|stream| Box::new(stream) as BoxedChannel)
                .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionAborted, "Listener closed"))
        })
    }

    fn local_endpoint(&self) -> String {
        self.endpoint.clone()
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        lock(&self.shared.listeners).remove(&self.endpoint);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_open_reaches_listener_and_is_counted() {
        let transport = MemoryTransport::new();
        let mut listener = transport.listen("", "svc").await.unwrap();
        let mut client = transport.open("", "svc").await.unwrap();
        let mut server = listener.accept().await.unwrap();

        client.write_all(b"abc").await.unwrap();
        let mut buf = [0u8; 3];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");
        assert_eq!(transport.opened_channels(), 1);
    }

    #[tokio::test]
    async fn test_dropped_listener_refuses_opens() {
        let transport = MemoryTransport::new();
        let listener = transport.listen("", "gone").await.unwrap();
        drop(listener);
        let err = transport.open("", "gone").await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn test_duplicate_endpoint_is_in_use() {
        let transport = MemoryTransport::new();
        let _first = transport.listen("", "dup").await.unwrap();
        let err = transport.listen("", "dup").await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }

    #[tokio::test]
    async fn test_dynamic_endpoints_are_unique() {
        let transport = MemoryTransport::new();
        let a = transport.listen("", "").await.unwrap();
        let b = transport.listen("", "0").await.unwrap();
        assert_ne!(a.local_endpoint(), b.local_endpoint());
    }
}
