//! TCP Transport implementation

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tracing::trace;

use crate::common::{Address, Result, Stream};
use crate::error::Error;

use super::{Listener, Transport};

/// TCP transport - raw TCP connections with Nagle disabled
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, addr: &Address) -> Result<Stream> {
        // Domains are resolved by the OS; every returned address is tried in turn
        let stream = match addr {
            Address::Socket(socket_addr) => TcpStream::connect(socket_addr).await?,
            Address::Domain(domain, port) => TcpStream::connect((domain.as_str(), *port)).await?,
        };
        stream.set_nodelay(true)?;
        trace!("TCP connected to {} via {:?}", addr, stream.peer_addr().ok());

        Ok(Box::new(stream))
    }

    async fn bind(&self, addr: &Address) -> Result<Box<dyn Listener>> {
        let socket_addr = addr
            .as_socket()
            .ok_or_else(|| Error::Config(format!("Cannot bind to domain address {}", addr)))?;

        let listener = TcpListener::bind(socket_addr).await?;
        Ok(Box::new(TcpAcceptor { listener }))
    }
}

/// Accept side of [`TcpTransport`]
struct TcpAcceptor {
    listener: TcpListener,
}

#[async_trait]
impl Listener for TcpAcceptor {
    async fn accept(&self) -> Result<(Stream, Address)> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((Box::new(stream), Address::Socket(peer)))
    }

    fn local_addr(&self) -> Result<Address> {
        Ok(Address::Socket(self.listener.local_addr()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_bind_and_connect() {
        let transport = TcpTransport::new();
        let listener = transport
            .bind(&Address::from(("127.0.0.1", 0)))
            .await
            .unwrap();
        let local = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut client = transport.connect(&local).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        assert_eq!(&server.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_connect_by_name() {
        let transport = TcpTransport::new();
        let listener = transport
            .bind(&Address::from(("127.0.0.1", 0)))
            .await
            .unwrap();
        let port = listener.local_addr().unwrap().port();

        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });
        transport
            .connect(&Address::domain("localhost", port))
            .await
            .unwrap();
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_domain_rejected() {
        let result = TcpTransport::new()
            .bind(&Address::domain("localhost", 0))
            .await;
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
