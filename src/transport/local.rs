//! `ncalrpc`: local channels over Unix domain sockets.
//!
//! The endpoint is either an absolute socket path or a name, which resolves to
//! a socket file in the system temp directory. A stale socket file left by a
//! previous process is removed before binding, and the listener removes its
//! file again when dropped.

use std::io;
use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info};

use super::{BoxedChannel, Channel, Listener, Transport};

pub const PROTSEQ: &str = "ncalrpc";

impl Channel for UnixStream {
    fn peer(&self) -> String {
        self.peer_addr()
            .ok()
            .and_then(|addr| addr.as_pathname().map(|p| p.display().to_string()))
            .unwrap_or_else(|| String::from("local"))
    }
}

/// Resolve an `ncalrpc` endpoint to a socket path.
pub fn socket_path(endpoint: &str) -> PathBuf {
    let path = Path::new(endpoint);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::temp_dir().join(format!("rpc-{endpoint}.sock"))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalTransport;

impl Transport for LocalTransport {
    fn protseq(&self) -> &'static str {
        PROTSEQ
    }

    fn open<'a>(
        &'a self,
        _addr: &'a str,
        endpoint: &'a str,
    ) -> BoxFuture<'a, io::Result<BoxedChannel>> {
        Box::pin(async move {
            let path = socket_path(endpoint);
            let stream = UnixStream::connect(&path).await?;
            debug!(path = %path.display(), "Local channel opened");
            Ok(Box::new(stream) as BoxedChannel)
        })
    }

    fn listen<'a>(
        &'a self,
        _addr: &'a str,
        endpoint: &'a str,
    ) -> BoxFuture<'a, io::Result<Box<dyn Listener>>> {
        Box::pin(async move {
            if endpoint.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "ncalrpc requires a named endpoint",
                ));
            }
            let path = socket_path(endpoint);
            if path.exists() {
                tokio::fs::remove_file(&path).await.ok();
            }
            let listener = UnixListener::bind(&path)?;
            info!(path = %path.display(), "Listening on unix socket");
            Ok(Box::new(LocalEndpoint {
                listener,
                path,
                endpoint: endpoint.to_string(),
            }) as Box<dyn Listener>)
        })
    }
}

struct LocalEndpoint {
    listener: UnixListener,
    path: PathBuf,
    endpoint: String,
}

impl Listener for LocalEndpoint {
    fn accept(&mut self) -> BoxFuture<'_, io::Result<BoxedChannel>> {
        Box::pin(async move {
            let (stream, _) = self.listener.accept().await?;
            Ok(Box::new(stream) as BoxedChannel)
        })
    }

    fn local_endpoint(&self) -> String {
        self.endpoint.clone()
    }
}

impl Drop for LocalEndpoint {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                error!(error = %e, path = %self.path.display(), "Failed to remove socket file");
            }
        } else {
            debug!(path = %self.path.display(), "Removed socket file");
        }
    }
}
