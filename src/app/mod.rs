//! Application Layer
//!
//! This module contains:
//! - Supervisor: per-connection flow (handshake → rule engine → upstream → relay)
//! - Runtime: configuration-driven assembly, accept loop and shutdown
//! - Stats: process-wide connection counters

mod runtime;
mod stats;
mod supervisor;

pub use runtime::Runtime;
pub use stats::{format_bytes, ActiveConnection, StatsSnapshot, SupervisorStats};
pub use supervisor::{ConnectionState, Supervisor};
