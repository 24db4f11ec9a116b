//! SOCKS4 / SOCKS4a handshake, CONNECT only

use std::net::{Ipv4Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::common::Address;
use crate::error::HandshakeError;

use super::{InboundKind, InboundRequest, ReplyStatus};

const CMD_CONNECT: u8 = 0x01;
const CMD_BIND: u8 = 0x02;

const REPLY_VERSION: u8 = 0x00;
const REP_GRANTED: u8 = 0x5A;
const REP_REJECTED: u8 = 0x5B;

/// Upper bound for the null-terminated USERID and SOCKS4a domain fields
const MAX_FIELD_LEN: usize = 255;

/// Run the SOCKS4 handshake. The version byte has already been consumed.
pub(super) async fn handshake<S>(stream: &mut S) -> Result<InboundRequest, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // CMD | DSTPORT(2) | DSTIP(4)
    let mut header = [0u8; 7];
    stream.read_exact(&mut header).await?;

    let cmd = header[0];
    let port = u16::from_be_bytes([header[1], header[2]]);
    let ip = Ipv4Addr::new(header[3], header[4], header[5], header[6]);

    // USERID is read and ignored
    read_cstring(stream, "user id").await?;

    // SOCKS4a: 0.0.0.x (x != 0) means a domain name follows
    let octets = ip.octets();
    let target = if octets[..3] == [0, 0, 0] && octets[3] != 0 {
        let name = read_cstring(stream, "domain").await?;
        if name.is_empty() {
            return Err(HandshakeError::MalformedRequest("empty SOCKS4a domain".into()));
        }
        let domain = String::from_utf8(name)
            .map_err(|_| HandshakeError::MalformedRequest("domain is not UTF-8".into()))?;
        Address::domain(domain, port)
    } else {
        Address::Socket(SocketAddr::new(ip.into(), port))
    };

    match cmd {
        CMD_CONNECT => Ok(InboundRequest::new(InboundKind::Socks4, target)),
        CMD_BIND => {
            send_rejected(stream).await;
            Err(HandshakeError::ClientReject("BIND not supported".into()))
        }
        other => {
            send_rejected(stream).await;
            Err(HandshakeError::UnsupportedCommand(other))
        }
    }
}

/// Build the deferred reply for a dispatch outcome
pub(super) fn reply(status: ReplyStatus) -> [u8; 8] {
    let code = match status {
        ReplyStatus::Success => REP_GRANTED,
        _ => REP_REJECTED,
    };
    [REPLY_VERSION, code, 0, 0, 0, 0, 0, 0]
}

async fn send_rejected<S>(stream: &mut S)
where
    S: AsyncWrite + Unpin,
{
    let _ = stream.write_all(&reply(ReplyStatus::GeneralFailure)).await;
    let _ = stream.flush().await;
}

async fn read_cstring<S>(stream: &mut S, field: &str) -> Result<Vec<u8>, HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let mut out = Vec::new();
    loop {
        let byte = stream.read_u8().await?;
        if byte == 0 {
            return Ok(out);
        }
        if out.len() == MAX_FIELD_LEN {
            return Err(HandshakeError::MalformedRequest(format!("{} too long", field)));
        }
        out.push(byte);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(input: &[u8]) -> (Result<InboundRequest, HandshakeError>, Vec<u8>) {
        let (mut client, mut server) = tokio::io::duplex(4096);
        client.write_all(input).await.unwrap();
        client.shutdown().await.unwrap();

        let result = handshake(&mut server).await;
        drop(server);

        let mut written = Vec::new();
        client.read_to_end(&mut written).await.unwrap();
        (result, written)
    }

    #[tokio::test]
    async fn test_connect_ipv4() {
        let (result, written) = run(b"\x01\x00\x50\xc0\xa8\x01\x01alice\x00").await;
        let req = result.unwrap();
        assert_eq!(req.target, Address::Socket("192.168.1.1:80".parse().unwrap()));
        assert_eq!(&req.raw_address[..], &[0x01, 192, 168, 1, 1, 0, 80]);
        assert!(written.is_empty());
    }

    #[tokio::test]
    async fn test_connect_socks4a_domain() {
        let (result, _) = run(b"\x01\x01\xbb\x00\x00\x00\x01\x00example.org\x00").await;
        assert_eq!(result.unwrap().target, Address::domain("example.org", 443));
    }

    #[tokio::test]
    async fn test_bind_rejected() {
        let (result, written) = run(b"\x02\x00\x50\x7f\x00\x00\x01\x00").await;
        assert!(matches!(result, Err(HandshakeError::ClientReject(_))));
        assert_eq!(written, vec![0, REP_REJECTED, 0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_truncated_request() {
        let (result, _) = run(b"\x01\x00\x50\x7f\x00\x00\x01user").await;
        assert!(matches!(result, Err(HandshakeError::Io(_))));
    }

    #[test]
    fn test_reply_codes() {
        assert_eq!(reply(ReplyStatus::Success)[1], REP_GRANTED);
        assert_eq!(reply(ReplyStatus::HostUnreachable)[1], REP_REJECTED);
    }
}
