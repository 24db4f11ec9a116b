//! Tunnel upstreams: connections relayed through a remote proxy server

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use bytes::Bytes;
use shadowsocks::{
    config::{ServerConfig, ServerType},
    context::{Context as SsContext, SharedContext},
    crypto::CipherKind,
    relay::{socks5::Address as SsAddress, tcprelay::ProxyClientStream},
    ServerAddr,
};
use tracing::debug;

use crate::common::{Address, Result, Stream};
use crate::error::Error;

/// Opens a duplex connection to `target` through a remote server
#[async_trait]
pub trait TunnelConnector: Send + Sync {
    /// `raw_address` is the target in SOCKS5 encoding (`ATYP | ADDR | PORT`)
    /// for connectors that embed it verbatim in their handshake.
    async fn connect(&self, target: &Address, raw_address: &Bytes) -> Result<Stream>;

    /// Server endpoint, for logging
    fn endpoint(&self) -> String;
}

/// Shadowsocks AEAD client
pub struct ShadowsocksConnector {
    context: SharedContext,
    config: ServerConfig,
    endpoint: String,
}

impl ShadowsocksConnector {
    /// Build a connector for `server:port` with the named cipher
    pub fn new(server: &str, port: u16, method: &str, password: &str) -> Result<Self> {
        let cipher: CipherKind = method
            .trim()
            .to_lowercase()
            .parse()
            .map_err(|_| Error::Config(format!("Unsupported cipher method: {}", method)))?;

        let server_addr = match server.parse::<IpAddr>() {
            Ok(ip) => ServerAddr::SocketAddr(SocketAddr::new(ip, port)),
            Err(_) => ServerAddr::DomainName(server.to_string(), port),
        };

        let config = ServerConfig::new(server_addr, password.to_string(), cipher)
            .map_err(|e| Error::Config(format!("Invalid shadowsocks server {}: {}", server, e)))?;

        Ok(Self {
            context: SsContext::new_shared(ServerType::Local),
            config,
            endpoint: format!("{}:{}", server, port),
        })
    }
}

fn to_ss_address(target: &Address) -> SsAddress {
    match target {
        Address::Socket(addr) => SsAddress::SocketAddress(*addr),
        Address::Domain(domain, port) => SsAddress::DomainNameAddress(domain.clone(), *port),
    }
}

#[async_trait]
impl TunnelConnector for ShadowsocksConnector {
    async fn connect(&self, target: &Address, _raw_address: &Bytes) -> Result<Stream> {
        // The client stream writes the encoded target itself
        let stream =
            ProxyClientStream::connect(self.context.clone(), &self.config, to_ss_address(target))
                .await
                .map_err(|e| Error::Transport(format!("shadowsocks connect: {}", e)))?;
        debug!("Shadowsocks tunnel to {} via {}", target, self.endpoint);
        Ok(Box::new(stream))
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }
}
