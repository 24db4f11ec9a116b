//! Connection Supervisor
//!
//! One task per accepted connection:
//!
//! ```text
//! Accepted → Handshaking → Dispatched → Dialing → Relaying → Closed
//! ```
//!
//! The handshake only yields the request. The protocol reply is written after
//! the dial, since its status reflects the dial outcome. Failover only decides
//! which upstream is chosen; a failed dial is never retried elsewhere.

use std::sync::Arc;
use std::time::Instant;

use tokio::io::AsyncWriteExt;
use tracing::{debug, info, trace, warn};

use crate::common::{relay, Address, RelayStats, Result, Stream};
use crate::error::Error;
use crate::protocol::{self, InboundRequest, ReplyStatus};
use crate::router::{Decision, RuleEngine};
use crate::upstream::{ProxyRegistry, Upstream};

use super::stats::{format_bytes, SupervisorStats};

/// Lifecycle of one supervised connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    Handshaking,
    Dispatched,
    Dialing,
    Relaying,
    Closed,
}

/// Drives connections from handshake to relay
pub struct Supervisor {
    engine: Arc<RuleEngine>,
    registry: Arc<ProxyRegistry>,
    stats: Arc<SupervisorStats>,
}

impl Supervisor {
    pub fn new(engine: Arc<RuleEngine>, registry: Arc<ProxyRegistry>) -> Self {
        Self {
            engine,
            registry,
            stats: SupervisorStats::new(),
        }
    }

    pub fn engine(&self) -> &Arc<RuleEngine> {
        &self.engine
    }

    pub fn registry(&self) -> &Arc<ProxyRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> &Arc<SupervisorStats> {
        &self.stats
    }

    /// Supervise one connection until both relay directions are closed.
    ///
    /// Failures are logged here; the error is returned for callers that care.
    pub async fn handle(&self, stream: Stream, peer: Address) -> Result<RelayStats> {
        let _active = self.stats.connection_accepted();
        let start = Instant::now();
        let mut state = ConnectionState::Accepted;

        transition(&mut state, ConnectionState::Handshaking, &peer);
        let (request, mut client) = match protocol::accept(stream).await {
            Ok(accepted) => accepted,
            Err(e) => {
                self.stats.handshake_failed();
                debug!("Handshake from {} failed: {}", peer, e);
                return Err(e.into());
            }
        };

        transition(&mut state, ConnectionState::Dispatched, &peer);
        let decision = self.engine.decide(&request.host()).await;
        let upstream = match self.registry.resolve(&decision.action) {
            Ok(upstream) => upstream,
            Err(e) => {
                self.stats.route_missing();
                warn!("{} FAIL {}: {}", decision, request.target, e);
                reply(&mut client, &request, ReplyStatus::GeneralFailure).await;
                return Err(e);
            }
        };

        transition(&mut state, ConnectionState::Dialing, &peer);
        let mut remote = match self.dial(&upstream, &decision, &request).await {
            Ok(remote) => remote,
            Err(e) => {
                let status = match e {
                    Error::Rejected(_) => ReplyStatus::NotAllowed,
                    _ => ReplyStatus::HostUnreachable,
                };
                reply(&mut client, &request, status).await;
                return Err(e);
            }
        };

        protocol::send_reply(&mut client, request.kind, ReplyStatus::Success).await?;
        if let Some(payload) = &request.payload {
            remote.write_all(payload).await?;
            remote.flush().await?;
        }

        transition(&mut state, ConnectionState::Relaying, &peer);
        let relayed = relay(client, remote).await;
        self.stats.relay_finished(relayed);

        transition(&mut state, ConnectionState::Closed, &peer);
        info!(
            "[{}] Closed: {} -> {} via [{}] (↑{} ↓{} {:?})",
            request.kind,
            peer,
            request.target,
            upstream.name(),
            format_bytes(relayed.uploaded),
            format_bytes(relayed.downloaded),
            start.elapsed()
        );
        Ok(relayed)
    }

    /// Dial and account the outcome on the upstream
    async fn dial(
        &self,
        upstream: &Upstream,
        decision: &Decision,
        request: &InboundRequest,
    ) -> Result<Stream> {
        match upstream.dial(request).await {
            Ok(remote) => {
                upstream.record_success();
                info!("{} OK {}", decision, request.target);
                Ok(remote)
            }
            Err(e @ Error::Rejected(_)) => {
                // Policy outcome, not an upstream fault
                self.stats.request_rejected();
                info!("{} REJECT {}", decision, request.target);
                Err(e)
            }
            Err(e) => {
                let failures = upstream.record_failure();
                self.stats.dial_failed();
                warn!(
                    "{} FAIL {}: {} ({} failures)",
                    decision, request.target, e, failures
                );
                Err(e)
            }
        }
    }
}

fn transition(state: &mut ConnectionState, next: ConnectionState, peer: &Address) {
    trace!("{}: {:?} -> {:?}", peer, state, next);
    *state = next;
}

/// Best-effort failure reply; the connection is closed right after
async fn reply(client: &mut Stream, request: &InboundRequest, status: ReplyStatus) {
    if let Err(e) = protocol::send_reply(client, request.kind, status).await {
        trace!("Failed to send {:?} reply: {}", status, e);
    }
    let _ = client.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::RuleSet;
    use crate::transport::TcpTransport;
    use tokio::io::{duplex, AsyncReadExt};
    use tokio::net::TcpListener;

    fn supervisor(lines: &[&str]) -> Supervisor {
        let mut rules = RuleSet::new();
        for line in lines {
            rules.add_line(line).unwrap();
        }
        let registry = ProxyRegistry::new(Arc::new(TcpTransport::new()));
        Supervisor::new(Arc::new(RuleEngine::new(rules)), Arc::new(registry))
    }

    fn peer() -> Address {
        Address::Socket("127.0.0.1:50000".parse().unwrap())
    }

    /// Echo server on loopback, returns its port
    async fn echo_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn test_socks4_relay_through_direct() {
        let port = echo_server().await;
        let supervisor = supervisor(&["FINAL,direct"]);

        let (mut client, server) = duplex(4096);
        let mut request = vec![4, 1];
        request.extend_from_slice(&port.to_be_bytes());
        request.extend_from_slice(&[127, 0, 0, 1, 0]);
        client.write_all(&request).await.unwrap();

        let handle = tokio::spawn(async move { supervisor.handle(Box::new(server), peer()).await });

        let mut reply = [0u8; 8];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x5A);

        client.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");

        drop(client);
        let relayed = handle.await.unwrap().unwrap();
        assert_eq!(relayed.uploaded, 5);
        assert_eq!(relayed.downloaded, 5);
    }

    #[tokio::test]
    async fn test_http_connect_replies_then_relays_early_bytes() {
        const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
        let port = echo_server().await;
        let supervisor = supervisor(&[]);

        let (mut client, server) = duplex(4096);
        // Early bytes arrive in the same segment as the head
        let request = format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\nearly", port);
        client.write_all(request.as_bytes()).await.unwrap();

        let handle = tokio::spawn(async move { supervisor.handle(Box::new(server), peer()).await });

        // Status line first, then the early bytes come back through the tunnel
        let mut response = vec![0u8; ESTABLISHED.len() + 5];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(&response[..ESTABLISHED.len()], ESTABLISHED);
        assert_eq!(&response[ESTABLISHED.len()..], b"early");

        client.write_all(b"later").await.unwrap();
        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"later");

        drop(client);
        let relayed = handle.await.unwrap().unwrap();
        assert_eq!(relayed.downloaded, 10);
    }

    #[tokio::test]
    async fn test_http_connect_dial_failure_bad_gateway() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let supervisor = supervisor(&[]);
        let (mut client, server) = duplex(4096);
        let head = format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", port);
        client.write_all(head.as_bytes()).await.unwrap();

        let result = supervisor.handle(Box::new(server), peer()).await;
        assert!(matches!(result, Err(Error::Dial { .. })));

        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 502 Bad Gateway"));
        assert!(!response.contains("200"));
    }

    #[tokio::test]
    async fn test_reject_replies_not_allowed() {
        let supervisor = Arc::new(supervisor(&["DOMAIN-KEYWORD,ads,REJECT"]));

        let (mut client, server) = duplex(4096);
        client
            .write_all(b"CONNECT ads.example.com:443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();

        let result = supervisor.handle(Box::new(server), peer()).await;
        assert!(matches!(result, Err(Error::Rejected(_))));

        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 403"));

        // Not counted against the upstream
        let reject = supervisor.registry().upstream("reject").unwrap();
        assert_eq!(reject.failure_count(), 0);
        assert_eq!(supervisor.stats().snapshot().rejected, 1);
    }

    #[tokio::test]
    async fn test_no_route_general_failure() {
        let supervisor = supervisor(&["FINAL,missing-group"]);

        let (mut client, server) = duplex(4096);
        client
            .write_all(b"\x04\x01\x00\x50\x0a\x00\x00\x01\x00")
            .await
            .unwrap();

        let result = supervisor.handle(Box::new(server), peer()).await;
        assert!(matches!(result, Err(Error::NoRoute(_))));

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, vec![0, 0x5B, 0, 0, 0, 0, 0, 0]);
        assert_eq!(supervisor.stats().snapshot().no_route, 1);
    }

    #[tokio::test]
    async fn test_dial_failure_records_and_replies() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let supervisor = supervisor(&[]);
        let (mut client, server) = duplex(4096);
        let mut request = vec![4, 1];
        request.extend_from_slice(&port.to_be_bytes());
        request.extend_from_slice(&[127, 0, 0, 1, 0]);
        client.write_all(&request).await.unwrap();

        let result = supervisor.handle(Box::new(server), peer()).await;
        assert!(matches!(result, Err(Error::Dial { .. })));

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x5B);

        let direct = supervisor.registry().upstream("direct").unwrap();
        assert_eq!(direct.failure_count(), 1);
        assert_eq!(supervisor.stats().snapshot().dial_failures, 1);
    }

    #[tokio::test]
    async fn test_handshake_failure_counts() {
        let supervisor = supervisor(&[]);
        let (mut client, server) = duplex(4096);
        client.write_all(b"\x04\x01").await.unwrap();
        drop(client);

        let result = supervisor.handle(Box::new(server), peer()).await;
        assert!(matches!(result, Err(Error::Handshake(_))));

        let snapshot = supervisor.stats().snapshot();
        assert_eq!(snapshot.handshake_failures, 1);
        assert_eq!(snapshot.active, 0);
    }
}
