//! SOCKS5 handshake (RFC 1928), no-auth CONNECT only

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::common::{Address, ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6};
use crate::error::HandshakeError;

use super::{InboundKind, InboundRequest, ReplyStatus, SOCKS5_VERSION};

const AUTH_NONE: u8 = 0x00;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;
const CMD_BIND: u8 = 0x02;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

const REP_SUCCESS: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_NOT_ALLOWED: u8 = 0x02;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

/// NMETHODS + up to 255 methods
const GREETING_MAX: usize = 1 + 255;
/// VER CMD RSV ATYP + LEN + 255-byte domain + PORT
const REQUEST_MAX: usize = 4 + 1 + 255 + 2;

/// Run the SOCKS5 handshake. The version byte has already been consumed.
pub(super) async fn handshake<S>(stream: &mut S) -> Result<InboundRequest, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    negotiate_auth(stream).await?;
    read_request(stream).await
}

/// Build the deferred reply for a dispatch outcome
pub(super) fn reply(status: ReplyStatus) -> [u8; 10] {
    let code = match status {
        ReplyStatus::Success => REP_SUCCESS,
        ReplyStatus::NotAllowed => REP_NOT_ALLOWED,
        ReplyStatus::HostUnreachable => REP_HOST_UNREACHABLE,
        ReplyStatus::GeneralFailure => REP_GENERAL_FAILURE,
    };
    reply_with_code(code)
}

fn reply_with_code(code: u8) -> [u8; 10] {
    // Bound address is not meaningful for a local proxy
    [SOCKS5_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]
}

async fn negotiate_auth<S>(stream: &mut S) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; GREETING_MAX];
    let mut filled = 0;

    fill_at_least(stream, &mut buf, &mut filled, 1).await?;
    let frame_len = 1 + buf[0] as usize;
    fill_at_least(stream, &mut buf, &mut filled, frame_len).await?;
    if filled > frame_len {
        return Err(HandshakeError::ExtraData);
    }

    let methods = &buf[1..frame_len];
    if !methods.contains(&AUTH_NONE) {
        stream
            .write_all(&[SOCKS5_VERSION, AUTH_NO_ACCEPTABLE])
            .await?;
        return Err(HandshakeError::UnsupportedAuth);
    }

    stream.write_all(&[SOCKS5_VERSION, AUTH_NONE]).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_request<S>(stream: &mut S) -> Result<InboundRequest, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; REQUEST_MAX];
    let mut filled = 0;

    // VER CMD RSV ATYP and the first address byte (the domain length, if any)
    fill_at_least(stream, &mut buf, &mut filled, 5).await?;

    if buf[0] != SOCKS5_VERSION {
        return Err(HandshakeError::UnsupportedVersion(buf[0]));
    }

    let cmd = buf[1];
    let atyp = buf[3];
    let frame_len = match atyp {
        ATYP_IPV4 => 4 + 4 + 2,
        ATYP_IPV6 => 4 + 16 + 2,
        ATYP_DOMAIN => 4 + 1 + buf[4] as usize + 2,
        other => {
            send_error(stream, REP_ATYP_NOT_SUPPORTED).await;
            return Err(HandshakeError::MalformedRequest(format!(
                "unsupported address type: {}",
                other
            )));
        }
    };

    fill_at_least(stream, &mut buf, &mut filled, frame_len).await?;
    if filled > frame_len {
        return Err(HandshakeError::ExtraData);
    }

    match cmd {
        CMD_CONNECT => {}
        CMD_BIND | CMD_UDP_ASSOCIATE => {
            send_error(stream, REP_CMD_NOT_SUPPORTED).await;
            let name = if cmd == CMD_BIND { "BIND" } else { "UDP ASSOCIATE" };
            return Err(HandshakeError::ClientReject(format!("{} not supported", name)));
        }
        other => {
            send_error(stream, REP_CMD_NOT_SUPPORTED).await;
            return Err(HandshakeError::UnsupportedCommand(other));
        }
    }

    let port = u16::from_be_bytes([buf[frame_len - 2], buf[frame_len - 1]]);
    let target = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&buf[4..8]);
            Address::Socket(SocketAddr::new(Ipv4Addr::from(octets).into(), port))
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[4..20]);
            Address::Socket(SocketAddr::new(Ipv6Addr::from(octets).into(), port))
        }
        _ => {
            let name = &buf[5..frame_len - 2];
            if name.is_empty() {
                return Err(HandshakeError::MalformedRequest("empty domain name".into()));
            }
            let domain = std::str::from_utf8(name)
                .map_err(|_| HandshakeError::MalformedRequest("domain is not UTF-8".into()))?;
            Address::domain(domain, port)
        }
    };

    Ok(InboundRequest::new(InboundKind::Socks5, target).with_raw_address(buf[3..frame_len].to_vec()))
}

/// Best-effort error reply before the handshake fails
async fn send_error<S>(stream: &mut S, code: u8)
where
    S: AsyncWrite + Unpin,
{
    let _ = stream.write_all(&reply_with_code(code)).await;
    let _ = stream.flush().await;
}

/// Read into `buf` until at least `want` bytes are filled.
///
/// Reads may return more than `want`; callers treat the surplus as extra data.
async fn fill_at_least<S>(
    stream: &mut S,
    buf: &mut [u8],
    filled: &mut usize,
    want: usize,
) -> Result<(), HandshakeError>
where
    S: AsyncRead + Unpin,
{
    while *filled < want {
        let n = stream.read(&mut buf[*filled..]).await?;
        if n == 0 {
            return Err(HandshakeError::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        *filled += n;
    }
    Ok(())
}
