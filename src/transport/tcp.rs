//! `ncacn_ip_tcp`: channels over TCP. The endpoint is a port number.

use std::io;

use futures::future::BoxFuture;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use super::{BoxedChannel, Channel, Listener, Transport};

pub const PROTSEQ: &str = "ncacn_ip_tcp";

impl Channel for TcpStream {
    fn peer(&self) -> String {
        self.peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| String::from("unknown"))
    }
}

/// TCP transport.
#[derive(Debug, Clone, Copy)]
pub struct TcpTransport {
    nodelay: bool,
}

impl TcpTransport {
    pub fn new(nodelay: bool) -> Self {
        Self { nodelay }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(true)
    }
}

fn parse_port(endpoint: &str) -> io::Result<u16> {
    if endpoint.is_empty() {
        return Ok(0);
    }
    endpoint.parse::<u16>().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Invalid TCP endpoint: {endpoint}"),
        )
    })
}

fn socket_addr(addr: &str, port: u16) -> String {
    let host = if addr.is_empty() { "127.0.0.1" } else { addr };
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

impl Transport for TcpTransport {
    fn protseq(&self) -> &'static str {
        PROTSEQ
    }

    fn open<'a>(
        &'a self,
        addr: &'a str,
        endpoint: &'a str,
    ) -> BoxFuture<'a, io::Result<BoxedChannel>> {
        Box::pin(async move {
            let target = socket_addr(addr, parse_port(endpoint)?);
            let stream = TcpStream::connect(&target).await?;
            stream.set_nodelay(self.nodelay)?;
            debug!(target = %target, "TCP channel opened");
            Ok(Box::new(stream) as BoxedChannel)
        })
    }

    fn listen<'a>(
        &'a self,
        addr: &'a str,
        endpoint: &'a str,
    ) -> BoxFuture<'a, io::Result<Box<dyn Listener>>> {
        Box::pin(async move {
            let host = if addr.is_empty() { "0.0.0.0" } else { addr };
            let bind_to = socket_addr(host, parse_port(endpoint)?);
            let listener = TcpListener::bind(&bind_to).await?;
            info!(address = %listener.local_addr()?, "Listening on TCP");
            Ok(Box::new(TcpEndpoint {
                listener,
                nodelay: self.nodelay,
            }) as Box<dyn Listener>)
        })
    }
}

struct TcpEndpoint {
    listener: TcpListener,
    nodelay: bool,
}

impl Listener for TcpEndpoint {
    fn accept(&mut self) -> BoxFuture<'_, io::Result<BoxedChannel>> {
        Box::pin(async move {
            let (stream, peer) = self.listener.accept().await?;
            stream.set_nodelay(self.nodelay)?;
            debug!(peer = %peer, "TCP channel accepted");
            Ok(Box::new(stream) as BoxedChannel)
        })
    }

    fn local_endpoint(&self) -> String {
        self.listener
            .local_addr()
            .map(|addr| addr.port().to_string())
            .unwrap_or_default()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_ipv6_hosts_are_bracketed() {
        assert_eq!(socket_addr("::1", 135), "[::1]:135");
        assert_eq!(socket_addr("localhost", 135), "localhost:135");
    }

    #[test]
    fn test_non_numeric_endpoint_is_rejected() {
        assert!(parse_port("epmapper").is_err());
        assert_eq!(parse_port("").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dynamic_port_resolves_and_connects() {
        let transport = TcpTransport::default();
        let mut listener = transport.listen("127.0.0.1", "0").await.unwrap();
        let port = listener.local_endpoint();
        assert_ne!(port, "0");

        let mut client = transport.open("127.0.0.1", &port).await.unwrap();
        let mut server = listener.accept().await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
