//! Flora - A rule-based local proxy
//!
//! # Architecture
//!
//! ```text
//! Listener (SOCKS4 / SOCKS5 / HTTP)
//! → Protocol handshake (target address)
//! → Rule Engine (Bypass → GeoIP → Suffix → Prefix → Keyword → Final)
//! → Proxy Registry (upstream or health-gated group)
//! → Upstream dial (direct / reject / tunnel)
//! → Duplex relay
//! ```
//!
//! ## Core Principles
//!
//! - The rule engine and registry are immutable after startup
//! - Upstream health is a lock-free failure counter
//! - External effects (DNS, GeoIP, tunnels, OS proxy) sit behind traits
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Core types: Stream, Address, relay
//! ├── transport/       # Raw TCP connect and listen
//! ├── protocol/        # Inbound handshakes: SOCKS4, SOCKS5, HTTP
//! ├── router/          # Rule set and rule engine
//! ├── upstream/        # Upstreams, groups, registry, tunnels
//! ├── geoip/           # Country database and classifier
//! ├── cache.rs         # TTL resolution cache
//! └── app/             # Supervisor, Runtime, stats
//! ```

// Core types
pub mod common;
pub mod error;

// Connection path
pub mod transport;
pub mod protocol;
pub mod router;
pub mod upstream;
pub mod app;

// Supporting modules
pub mod cache;
pub mod config;
pub mod geoip;
pub mod resolver;
pub mod sysproxy;

// Re-exports for convenience
pub use common::{Address, Stream};
pub use error::{Error, Result};
pub use config::Config;

pub use app::{Runtime, Supervisor};
pub use router::RuleEngine;
pub use upstream::ProxyRegistry;
