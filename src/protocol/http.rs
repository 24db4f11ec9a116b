//! HTTP proxy handshake: CONNECT tunnels and absolute-form requests

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tracing::trace;

use crate::common::{Address, Stream};
use crate::error::HandshakeError;

use super::{InboundKind, InboundRequest, ReplyStatus};

/// Upper bound for request line + headers
const MAX_HEAD_LEN: usize = 64 * 1024;

const DEFAULT_HTTP_PORT: u16 = 80;
const DEFAULT_CONNECT_PORT: u16 = 443;

const RESPONSE_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const RESPONSE_FORBIDDEN: &[u8] =
    b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const RESPONSE_BAD_GATEWAY: &[u8] =
    b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const RESPONSE_UNAVAILABLE: &[u8] =
    b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Parse an HTTP proxy request head.
///
/// `stream` still yields the first byte that was used for protocol detection.
pub(super) async fn handshake(stream: Stream) -> Result<(InboundRequest, Stream), HandshakeError> {
    let mut reader = BufReader::new(stream);
    let mut head = BytesMut::new();

    let request_line = read_line(&mut reader, &mut head).await?;
    let request_line = std::str::from_utf8(&request_line)
        .map_err(|_| HandshakeError::MalformedRequest("request line is not UTF-8".into()))?;

    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 3 || !parts[2].starts_with("HTTP/") {
        return Err(HandshakeError::MalformedRequest(format!(
            "invalid request line: {:?}",
            request_line.trim()
        )));
    }
    let method = parts[0].to_string();
    let uri = parts[1].to_string();

    // Headers are drained for CONNECT and kept verbatim for forwarding
    loop {
        let line = read_line(&mut reader, &mut head).await?;
        if line == b"\r\n"[..] || line == b"\n"[..] {
            break;
        }
        trace!("HTTP header: {}", String::from_utf8_lossy(&line).trim_end());
    }

    // Anything read past the head belongs to the client's byte stream
    let buffered = Bytes::copy_from_slice(reader.buffer());
    let stream = reader.into_inner();

    if method.eq_ignore_ascii_case("CONNECT") {
        let target = Address::parse_host_port(&uri, DEFAULT_CONNECT_PORT)
            .map_err(|e| HandshakeError::MalformedRequest(e.to_string()))?;
        let request = InboundRequest::new(InboundKind::HttpConnect, target).with_payload(buffered);
        return Ok((request, stream));
    }

    let target = absolute_form_target(&uri)?;
    head.extend_from_slice(&buffered);
    let request = InboundRequest::new(InboundKind::HttpForward, target).with_payload(head.freeze());
    Ok((request, stream))
}

/// Build the deferred reply for a dispatch outcome
pub(super) fn reply(status: ReplyStatus) -> &'static [u8] {
    match status {
        ReplyStatus::Success => RESPONSE_ESTABLISHED,
        ReplyStatus::NotAllowed => RESPONSE_FORBIDDEN,
        ReplyStatus::HostUnreachable => RESPONSE_BAD_GATEWAY,
        ReplyStatus::GeneralFailure => RESPONSE_UNAVAILABLE,
    }
}

/// Read one line (including its terminator) and append it to `head`.
///
/// The read never pulls more than the remaining head budget plus one byte.
async fn read_line(
    reader: &mut BufReader<Stream>,
    head: &mut BytesMut,
) -> Result<Vec<u8>, HandshakeError> {
    let budget = MAX_HEAD_LEN.saturating_sub(head.len());
    let mut line = Vec::new();
    let n = (&mut *reader)
        .take(budget as u64 + 1)
        .read_until(b'\n', &mut line)
        .await?;
    if line.len() > budget {
        return Err(HandshakeError::MalformedRequest("request head too large".into()));
    }
    if n == 0 || !line.ends_with(b"\n") {
        return Err(HandshakeError::MalformedRequest(
            "unexpected end of request head".into(),
        ));
    }

    head.extend_from_slice(&line);
    Ok(line)
}

/// Extract the target of `http://[user@]host[:port]/path`
fn absolute_form_target(uri: &str) -> Result<Address, HandshakeError> {
    let rest = uri
        .get(..7)
        .filter(|scheme| scheme.eq_ignore_ascii_case("http://"))
        .map(|_| &uri[7..])
        .ok_or_else(|| {
            HandshakeError::MalformedRequest(format!("not an absolute-form URI: {}", uri))
        })?;

    let authority = rest
        .split(|c: char| c == '/' || c == '?' || c == '#')
        .next()
        .unwrap_or(rest);
    let authority = authority.rsplit('@').next().unwrap_or(authority);

    Address::parse_host_port(authority, DEFAULT_HTTP_PORT)
        .map_err(|e| HandshakeError::MalformedRequest(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn run(input: &'static [u8]) -> Result<(InboundRequest, Stream), HandshakeError> {
        let (mut client, server) = tokio::io::duplex(1 << 20);
        client.write_all(input).await.unwrap();
        client.shutdown().await.unwrap();
        handshake(Box::new(server)).await
    }

    #[tokio::test]
    async fn test_connect_drains_headers() {
        let (req, _) = run(b"CONNECT example.com:8443 HTTP/1.1\r\n\
                             Host: example.com:8443\r\n\
                             Proxy-Connection: keep-alive\r\n\
                             \r\n")
        .await
        .unwrap();
        assert_eq!(req.kind, InboundKind::HttpConnect);
        assert_eq!(req.target, Address::domain("example.com", 8443));
        assert!(req.payload.is_none());
    }

    #[tokio::test]
    async fn test_connect_keeps_early_bytes() {
        let (req, mut stream) = run(b"CONNECT 10.0.0.1:443 HTTP/1.1\r\n\r\n\x16\x03\x01")
            .await
            .unwrap();
        assert_eq!(req.target, Address::Socket("10.0.0.1:443".parse().unwrap()));
        assert_eq!(req.payload.as_deref(), Some(&b"\x16\x03\x01"[..]));

        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_absolute_form_is_replayed_verbatim() {
        let raw: &'static [u8] = b"GET http://user@example.com:8080/index.html?q=1 HTTP/1.1\r\n\
                                   Host: example.com:8080\r\n\
                                   Content-Length: 4\r\n\
                                   \r\n\
                                   body";
        let (req, _) = run(raw).await.unwrap();
        assert_eq!(req.kind, InboundKind::HttpForward);
        assert_eq!(req.target, Address::domain("example.com", 8080));
        assert_eq!(req.payload.as_deref(), Some(raw));
    }

    #[tokio::test]
    async fn test_absolute_form_default_port() {
        let (req, _) = run(b"POST http://example.com/api HTTP/1.0\r\n\r\n").await.unwrap();
        assert_eq!(req.target, Address::domain("example.com", 80));
    }

    #[tokio::test]
    async fn test_origin_form_rejected() {
        let err = run(b"GET /index.html HTTP/1.1\r\n\r\n").await.err().expect("handshake should fail");
        assert!(matches!(err, HandshakeError::MalformedRequest(_)));
    }

    #[tokio::test]
    async fn test_truncated_head() {
        let err = run(b"GET http://example.com/ HTTP/1.1\r\nHost: exa").await.err().expect("handshake should fail");
        assert!(matches!(err, HandshakeError::MalformedRequest(_)));
    }

    #[tokio::test]
    async fn test_oversized_head() {
        let mut input = b"GET http://example.com/ HTTP/1.1\r\n".to_vec();
        for _ in 0..2000 {
            input.extend_from_slice(b"X-Padding: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\r\n");
        }
        input.extend_from_slice(b"\r\n");
        let input: &'static [u8] = Box::leak(input.into_boxed_slice());

        let err = run(input).await.err().expect("handshake should fail");
        assert!(matches!(err, HandshakeError::MalformedRequest(_)));
    }

    #[tokio::test]
    async fn test_endless_request_line_fails_without_eof() {
        let (mut client, server) = tokio::io::duplex(1 << 20);
        let mut input = b"GET http://x/".to_vec();
        input.resize(MAX_HEAD_LEN * 2, b'a');
        client.write_all(&input).await.unwrap();

        // Client stays connected; the cap alone must end the handshake
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            handshake(Box::new(server)),
        )
        .await
        .expect("handshake should stop at the head cap");
        let err = result.err().expect("handshake should fail");
        assert!(matches!(err, HandshakeError::MalformedRequest(ref m) if m.contains("too large")));
        drop(client);
    }
}
