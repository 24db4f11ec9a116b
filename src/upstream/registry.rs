//! Proxy Registry: action string -> live upstream

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::error::{Error, Result};
use crate::transport::Transport;

use super::{Group, Upstream, DIRECT, REJECT};

/// Upstreams and groups by lowercased name. Immutable once the runtime starts.
#[derive(Debug)]
pub struct ProxyRegistry {
    upstreams: HashMap<String, Arc<Upstream>>,
    groups: HashMap<String, Group>,
}

impl ProxyRegistry {
    /// Registry holding only the built-in `direct` and `reject` upstreams
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let mut registry = Self {
            upstreams: HashMap::new(),
            groups: HashMap::new(),
        };
        registry.add_upstream(Upstream::direct(DIRECT, transport));
        registry.add_upstream(Upstream::reject(REJECT));
        registry
    }

    pub fn add_upstream(&mut self, upstream: Upstream) -> Arc<Upstream> {
        let upstream = Arc::new(upstream);
        if let Some(previous) = self
            .upstreams
            .insert(upstream.name().to_string(), Arc::clone(&upstream))
        {
            warn!("Upstream [{}] redefined", previous.name());
        }
        upstream
    }

    pub fn add_group(&mut self, group: Group) {
        if self.upstreams.contains_key(group.name()) {
            warn!("Group [{}] is shadowed by an upstream of the same name", group.name());
        }
        self.groups.insert(group.name().to_string(), group);
    }

    pub fn upstream(&self, name: &str) -> Option<Arc<Upstream>> {
        self.upstreams.get(&name.to_lowercase()).cloned()
    }

    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.get(&name.to_lowercase())
    }

    /// Resolve an action into an upstream.
    ///
    /// A direct upstream name hits unconditionally; a group goes through its
    /// health-gated strategy.
    pub fn resolve(&self, action: &str) -> Result<Arc<Upstream>> {
        let action = action.to_lowercase();

        if let Some(upstream) = self.upstreams.get(&action) {
            return Ok(Arc::clone(upstream));
        }

        self.groups
            .get(&action)
            .and_then(Group::select)
            .ok_or(Error::NoRoute(action))
    }

    pub fn upstream_count(&self) -> usize {
        self.upstreams.len()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Whether an action names something this registry knows
    pub fn knows(&self, action: &str) -> bool {
        let action = action.to_lowercase();
        self.upstreams.contains_key(&action) || self.groups.contains_key(&action)
    }
}
