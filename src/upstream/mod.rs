//! Upstreams and the Proxy Registry
//!
//! An [`Upstream`] is a named, dialable target: a direct TCP connection, a
//! policy reject, or a tunnel through a remote proxy server. Each upstream
//! keeps a failure counter that gates its eligibility inside a [`Group`].

mod group;
mod registry;
mod tunnel;

pub use group::{Group, GroupStrategy};
pub use registry::ProxyRegistry;
pub use tunnel::{ShadowsocksConnector, TunnelConnector};

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::common::{Result, Stream};
use crate::error::Error;
use crate::protocol::InboundRequest;
use crate::transport::Transport;

/// Failure count at which an upstream drops out of group selection
pub const FAILURE_THRESHOLD: u32 = 30;

/// Name of the built-in direct upstream
pub const DIRECT: &str = "direct";
/// Name of the built-in reject upstream
pub const REJECT: &str = "reject";

/// How an upstream reaches the target
#[derive(Clone)]
pub enum UpstreamKind {
    /// Plain TCP to the target
    Direct(Arc<dyn Transport>),
    /// Refuse every request
    Reject,
    /// Through a remote proxy server
    Tunnel(Arc<dyn TunnelConnector>),
}

impl UpstreamKind {
    pub fn name(&self) -> &'static str {
        match self {
            UpstreamKind::Direct(_) => "direct",
            UpstreamKind::Reject => "reject",
            UpstreamKind::Tunnel(_) => "tunnel",
        }
    }
}

impl std::fmt::Debug for UpstreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamKind::Tunnel(connector) => write!(f, "Tunnel({})", connector.endpoint()),
            other => f.write_str(other.name()),
        }
    }
}

/// A named upstream with its failure counter
#[derive(Debug)]
pub struct Upstream {
    name: String,
    kind: UpstreamKind,
    failures: AtomicU32,
}

impl Upstream {
    pub fn new(name: impl Into<String>, kind: UpstreamKind) -> Self {
        Self {
            name: name.into().to_lowercase(),
            kind,
            failures: AtomicU32::new(0),
        }
    }

    pub fn direct(name: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self::new(name, UpstreamKind::Direct(transport))
    }

    pub fn reject(name: impl Into<String>) -> Self {
        Self::new(name, UpstreamKind::Reject)
    }

    pub fn tunnel(name: impl Into<String>, connector: Arc<dyn TunnelConnector>) -> Self {
        Self::new(name, UpstreamKind::Tunnel(connector))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &UpstreamKind {
        &self.kind
    }

    /// Open a connection to the request's target
    pub async fn dial(&self, request: &InboundRequest) -> Result<Stream> {
        match &self.kind {
            UpstreamKind::Direct(transport) => {
                transport
                    .connect(&request.target)
                    .await
                    .map_err(|e| Error::Dial {
                        upstream: self.name.clone(),
                        reason: e.to_string(),
                    })
            }
            UpstreamKind::Reject => Err(Error::Rejected(self.name.clone())),
            UpstreamKind::Tunnel(connector) => connector
                .connect(&request.target, &request.raw_address)
                .await
                .map_err(|e| Error::Dial {
                    upstream: self.name.clone(),
                    reason: format!("via {}: {}", connector.endpoint(), e),
                }),
        }
    }

    pub fn record_failure(&self) -> u32 {
        let count = self.failures.fetch_add(1, Ordering::AcqRel).saturating_add(1);
        if count == FAILURE_THRESHOLD {
            debug!("Upstream [{}] reached {} failures", self.name, count);
        }
        count
    }

    pub fn record_success(&self) {
        self.failures.store(0, Ordering::Release);
    }

    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    /// Eligible for group selection
    pub fn is_eligible(&self) -> bool {
        self.failure_count() < FAILURE_THRESHOLD
    }
}
