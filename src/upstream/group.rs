//! Health-gated upstream groups

use std::sync::Arc;

use rand::seq::SliceRandom;

use super::Upstream;

/// Member selection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupStrategy {
    /// First eligible member in configured order
    #[default]
    Ordered,
    /// Uniform pick among all eligible members
    Random,
}

impl GroupStrategy {
    /// Map a configured mode label; anything but `random` is ordered
    pub fn from_mode(mode: &str) -> Self {
        if mode.trim().eq_ignore_ascii_case("random") {
            GroupStrategy::Random
        } else {
            GroupStrategy::Ordered
        }
    }
}

/// Named, ordered collection of upstreams
#[derive(Debug)]
pub struct Group {
    name: String,
    strategy: GroupStrategy,
    members: Vec<Arc<Upstream>>,
}

impl Group {
    /// `mode` is the configured label, see [`GroupStrategy::from_mode`]
    pub fn new(name: impl Into<String>, mode: &str, members: Vec<Arc<Upstream>>) -> Self {
        Self {
            name: name.into().to_lowercase(),
            strategy: GroupStrategy::from_mode(mode),
            members,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn strategy(&self) -> GroupStrategy {
        self.strategy
    }

    pub fn members(&self) -> &[Arc<Upstream>] {
        &self.members
    }

    /// Pick a member whose failure count is below the threshold
    pub fn select(&self) -> Option<Arc<Upstream>> {
        match self.strategy {
            GroupStrategy::Ordered => self.members.iter().find(|m| m.is_eligible()).cloned(),
            GroupStrategy::Random => {
                let eligible: Vec<&Arc<Upstream>> =
                    self.members.iter().filter(|m| m.is_eligible()).collect();
                eligible.choose(&mut rand::thread_rng()).map(|m| Arc::clone(m))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::FAILURE_THRESHOLD;

    fn member(name: &str, failures: u32) -> Arc<Upstream> {
        let upstream = Upstream::reject(name);
        for _ in 0..failures {
            upstream.record_failure();
        }
        Arc::new(upstream)
    }

    #[test]
    fn test_ordered_picks_first_eligible() {
        let group = Group::new(
            "proxy",
            "select",
            vec![member("a", 40), member("b", 5), member("c", 0)],
        );
        assert_eq!(group.strategy(), GroupStrategy::Ordered);
        for _ in 0..20 {
            assert_eq!(group.select().unwrap().name(), "b");
        }
    }

    #[test]
    fn test_no_eligible_member() {
        let group = Group::new(
            "proxy",
            "select",
            vec![member("a", FAILURE_THRESHOLD), member("b", 99)],
        );
        assert!(group.select().is_none());
        assert!(Group::new("empty", "select", vec![]).select().is_none());
    }

    #[test]
    fn test_random_only_eligible() {
        let group = Group::new(
            "proxy",
            "Random",
            vec![member("a", 40), member("b", 5), member("c", 0)],
        );
        assert_eq!(group.strategy(), GroupStrategy::Random);

        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            seen.insert(group.select().unwrap().name().to_string());
        }
        assert!(!seen.contains("a"));
        assert!(seen.contains("b") && seen.contains("c"));
    }
}
