//! Protocol Front-End
//!
//! A single local port speaks SOCKS5, SOCKS4/4a and HTTP proxy. The first byte
//! of a connection selects the protocol:
//!
//! ```text
//! 0x05 → SOCKS5    0x04 → SOCKS4    anything else → HTTP (byte is replayed)
//! ```
//!
//! The handshake only produces an [`InboundRequest`]. Success/failure replies are
//! written later through [`send_reply`], once the supervisor knows how the
//! upstream dial went.

mod http;
mod socks4;
mod socks5;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::common::{Address, PrefixedStream, Stream};
use crate::error::HandshakeError;

const SOCKS5_VERSION: u8 = 0x05;
const SOCKS4_VERSION: u8 = 0x04;

/// Wire protocol detected on an inbound connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    Socks5,
    Socks4,
    /// `CONNECT host:port HTTP/1.1`
    HttpConnect,
    /// Absolute-form request (`GET http://host/path HTTP/1.1`), replayed verbatim
    HttpForward,
}

impl InboundKind {
    pub fn name(&self) -> &'static str {
        match self {
            InboundKind::Socks5 => "socks5",
            InboundKind::Socks4 => "socks4",
            InboundKind::HttpConnect => "http-connect",
            InboundKind::HttpForward => "http",
        }
    }
}

impl std::fmt::Display for InboundKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Normalized result of a successful handshake
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub kind: InboundKind,
    /// Destination the client asked for
    pub target: Address,
    /// Target encoded as a SOCKS5 address (`ATYP | ADDR | PORT`), as tunnels expect it
    pub raw_address: Bytes,
    /// Bytes that must reach the upstream before relaying starts
    pub payload: Option<Bytes>,
}

impl InboundRequest {
    pub fn new(kind: InboundKind, target: Address) -> Self {
        let raw_address = Bytes::from(target.to_socks_bytes());
        Self {
            kind,
            target,
            raw_address,
            payload: None,
        }
    }

    pub fn with_raw_address(mut self, raw: impl Into<Bytes>) -> Self {
        self.raw_address = raw.into();
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        if !payload.is_empty() {
            self.payload = Some(payload);
        }
        self
    }

    /// Host used for rule matching
    pub fn host(&self) -> String {
        self.target.host()
    }
}

/// Outcome reported back to the client after dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Success,
    /// Routed to a rejecting upstream
    NotAllowed,
    /// The upstream dial failed
    HostUnreachable,
    /// No usable route
    GeneralFailure,
}

/// Detect the protocol and run its handshake.
pub async fn accept(mut stream: Stream) -> Result<(InboundRequest, Stream), HandshakeError> {
    let version = stream.read_u8().await?;
    trace!("Inbound first byte: {:#04x}", version);

    match version {
        SOCKS5_VERSION => {
            let request = socks5::handshake(&mut stream).await?;
            Ok((request, stream))
        }
        SOCKS4_VERSION => {
            let request = socks4::handshake(&mut stream).await?;
            Ok((request, stream))
        }
        first => {
            let stream: Stream = Box::new(PrefixedStream::new(vec![first], stream));
            http::handshake(stream).await
        }
    }
}

/// Write the protocol-specific reply for a dispatch outcome.
///
/// Absolute-form HTTP requests get no proxy-generated success line: the
/// upstream's own response is relayed instead.
pub async fn send_reply<W>(
    writer: &mut W,
    kind: InboundKind,
    status: ReplyStatus,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let reply: Vec<u8> = match kind {
        InboundKind::Socks5 => socks5::reply(status).to_vec(),
        InboundKind::Socks4 => socks4::reply(status).to_vec(),
        InboundKind::HttpConnect => http::reply(status).to_vec(),
        InboundKind::HttpForward => {
            if status == ReplyStatus::Success {
                return Ok(());
            }
            http::reply(status).to_vec()
        }
    };

    writer.write_all(&reply).await?;
    writer.flush().await
}
