//! Router Layer
//!
//! Responsibilities:
//! - Hold the immutable rule set built at load time
//! - Map a target host to an action (upstream or group name)
//!
//! The only I/O on this path is GeoIP host resolution, and only when GeoIP
//! rules exist.

mod engine;
mod rule;

pub use engine::{Decision, RuleEngine};
pub use rule::{BypassEntry, Rule, RuleCategory, RuleLine, RuleSet, DIRECT_ACTION};
