//! Common types and abstractions
//!
//! - Stream: unified async I/O abstraction
//! - Address: network address representation
//! - Pipe: the duplex relay used once an upstream is connected

mod address;
pub mod pipe;
mod stream;

pub use address::{Address, ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6};
pub use pipe::{relay, CloseGuard, RelayStats};
pub use stream::{AsyncReadWrite, PrefixedStream, Stream};

// Re-export error types from crate root
pub use crate::error::{Error, Result};
