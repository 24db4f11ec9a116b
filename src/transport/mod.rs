//! Transport Layer
//!
//! Responsibilities:
//! - Open raw TCP connections for the direct upstream
//! - Bind the local listening endpoint
//!
//! No encryption and no protocol parsing happen here.

mod tcp;

pub use tcp::TcpTransport;

use async_trait::async_trait;

use crate::common::{Address, Result, Stream};

/// Transport trait for establishing raw connections
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to a remote address
    async fn connect(&self, addr: &Address) -> Result<Stream>;

    /// Create a listener bound to an address
    async fn bind(&self, addr: &Address) -> Result<Box<dyn Listener>>;
}

/// Listener trait for accepting incoming connections
#[async_trait]
pub trait Listener: Send + Sync {
    /// Accept a new connection
    async fn accept(&self) -> Result<(Stream, Address)>;

    /// Get the local bound address
    fn local_addr(&self) -> Result<Address>;
}
