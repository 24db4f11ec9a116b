//! Rule Engine: host -> action

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{info, trace};

use crate::geoip::GeoClassifier;

use super::rule::{RuleCategory, RuleSet, DIRECT_ACTION};

/// Outcome of rule evaluation for one host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub category: RuleCategory,
    /// Pattern that fired (entry text for bypass, country for GeoIP)
    pub pattern: String,
    pub action: String,
}

impl Decision {
    fn new(category: RuleCategory, pattern: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            category,
            pattern: pattern.into(),
            action: action.into(),
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{}] -> [{}]", self.category, self.pattern, self.action)
    }
}

/// Evaluates categories in the fixed order
/// Bypass → GeoIP → Suffix → Prefix → Keyword → Final → default `direct`,
/// stopping at the first match.
pub struct RuleEngine {
    rules: RuleSet,
    geo: Option<Arc<dyn GeoClassifier>>,
    hits: [AtomicU64; RuleCategory::COUNT],
}

impl RuleEngine {
    pub fn new(rules: RuleSet) -> Self {
        Self {
            rules,
            geo: None,
            hits: Default::default(),
        }
    }

    pub fn with_geo(mut self, geo: Arc<dyn GeoClassifier>) -> Self {
        self.geo = Some(geo);
        self
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Pick the action for `host`
    pub async fn decide(&self, host: &str) -> Decision {
        let decision = self.evaluate(host).await;
        self.hits[decision.category.index()].fetch_add(1, Ordering::Relaxed);
        trace!("Rule decision for {}: {}", host, decision);
        decision
    }

    async fn evaluate(&self, host: &str) -> Decision {
        let host_ip = host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .ok();

        if let Some(entry) = self.rules.bypass.iter().find(|e| e.matches(host, host_ip)) {
            return Decision::new(RuleCategory::Bypass, entry.as_str(), DIRECT_ACTION);
        }

        if let Some(decision) = self.match_geoip(host).await {
            return decision;
        }

        let domain = host.to_lowercase();
        let domain_categories = [
            (RuleCategory::DomainSuffix, &self.rules.suffix),
            (RuleCategory::DomainPrefix, &self.rules.prefix),
            (RuleCategory::DomainKeyword, &self.rules.keyword),
        ];
        for (category, rules) in domain_categories {
            let hit = rules.iter().find(|rule| match category {
                RuleCategory::DomainSuffix => domain.ends_with(&rule.pattern),
                RuleCategory::DomainPrefix => domain.starts_with(&rule.pattern),
                _ => domain.contains(&rule.pattern),
            });
            if let Some(rule) = hit {
                return Decision::new(category, rule.pattern.clone(), rule.action.clone());
            }
        }

        match &self.rules.final_rule {
            Some(action) => Decision::new(RuleCategory::Final, "final", action.clone()),
            None => Decision::new(RuleCategory::Default, "default", DIRECT_ACTION),
        }
    }

    async fn match_geoip(&self, host: &str) -> Option<Decision> {
        // Resolution is skipped entirely when no GeoIP rule could fire
        if !self.rules.has_geoip_rules() {
            return None;
        }
        let geo = self.geo.as_ref()?;
        let country = geo.classify(host).await?;

        self.rules
            .geoip
            .iter()
            .find(|rule| rule.pattern.eq_ignore_ascii_case(&country))
            .map(|rule| Decision::new(RuleCategory::GeoIp, country.to_lowercase(), rule.action.clone()))
    }

    /// Number of decisions made per category
    pub fn hit_count(&self, category: RuleCategory) -> u64 {
        self.hits[category.index()].load(Ordering::Relaxed)
    }

    pub fn log_stats(&self) {
        let summary: Vec<String> = RuleCategory::ALL
            .iter()
            .map(|category| format!("{}={}", category, self.hit_count(*category)))
            .collect();
        info!("Rule hits: {}", summary.join(" "));
    }
}
