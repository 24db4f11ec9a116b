//! Rule definitions and the immutable rule set

use std::net::IpAddr;

use ipnet::IpNet;
use regex::Regex;
use tracing::warn;

use crate::error::{Error, Result};

/// Action used when a bypass entry fires or nothing matches
pub const DIRECT_ACTION: &str = "direct";

/// Rule category, in evaluation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleCategory {
    Bypass,
    GeoIp,
    DomainSuffix,
    DomainPrefix,
    DomainKeyword,
    Final,
    /// No rule matched and no Final rule exists
    Default,
}

impl RuleCategory {
    pub const COUNT: usize = 7;

    pub const ALL: [RuleCategory; Self::COUNT] = [
        RuleCategory::Bypass,
        RuleCategory::GeoIp,
        RuleCategory::DomainSuffix,
        RuleCategory::DomainPrefix,
        RuleCategory::DomainKeyword,
        RuleCategory::Final,
        RuleCategory::Default,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            RuleCategory::Bypass => "bypass",
            RuleCategory::GeoIp => "geoip",
            RuleCategory::DomainSuffix => "domain-suffix",
            RuleCategory::DomainPrefix => "domain-prefix",
            RuleCategory::DomainKeyword => "domain-keyword",
            RuleCategory::Final => "final",
            RuleCategory::Default => "default",
        }
    }

    pub(crate) fn index(&self) -> usize {
        *self as usize
    }
}

impl std::fmt::Display for RuleCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A single `pattern -> action` rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub pattern: String,
    /// Upstream or group name, lowercased
    pub action: String,
}

impl Rule {
    pub fn new(pattern: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            action: action.into().to_lowercase(),
        }
    }
}

/// One parsed Surge-style rule line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleLine {
    Rule(RuleCategory, Rule),
    Final(String),
    /// Comment or a rule type that is accepted but never evaluated
    Ignored,
}

impl RuleLine {
    /// Parse `TYPE,pattern,action` or `FINAL,action`
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with("//") {
            return Ok(RuleLine::Ignored);
        }

        let items: Vec<&str> = line.split(',').map(str::trim).collect();
        let kind = items[0].to_lowercase();

        if kind == "final" {
            return match items.get(1) {
                Some(action) if !action.is_empty() => Ok(RuleLine::Final(action.to_lowercase())),
                _ => Err(Error::Config(format!("FINAL rule without action: {}", line))),
            };
        }

        let category = match kind.as_str() {
            "domain-suffix" => RuleCategory::DomainSuffix,
            "domain-prefix" => RuleCategory::DomainPrefix,
            "domain-keyword" => RuleCategory::DomainKeyword,
            "geoip" => RuleCategory::GeoIp,
            // User-agent inspection is not performed
            "user-agent" => return Ok(RuleLine::Ignored),
            _ => return Err(Error::Config(format!("Unknown rule type: {}", line))),
        };

        if items.len() < 3 || items[1].is_empty() || items[2].is_empty() {
            return Err(Error::Config(format!("Rule needs pattern and action: {}", line)));
        }

        // Domain matching is done on lowercased hosts
        let pattern = items[1].to_lowercase();
        Ok(RuleLine::Rule(category, Rule::new(pattern, items[2])))
    }
}

/// Entry of the bypass list, classified once at load
#[derive(Debug, Clone)]
pub enum BypassEntry {
    Ip(IpAddr),
    Network(IpNet),
    Pattern(Regex),
}

impl BypassEntry {
    /// Classify as IP literal, CIDR, or regex. Invalid regexes yield `None`.
    pub fn parse(entry: &str) -> Option<Self> {
        let entry = entry.trim();
        if entry.is_empty() {
            return None;
        }
        if let Ok(ip) = entry.parse::<IpAddr>() {
            return Some(BypassEntry::Ip(ip));
        }
        if let Ok(net) = entry.parse::<IpNet>() {
            return Some(BypassEntry::Network(net));
        }
        Regex::new(entry).ok().map(BypassEntry::Pattern)
    }

    /// IP entries only ever match numeric hosts
    pub fn matches(&self, host: &str, host_ip: Option<IpAddr>) -> bool {
        match (self, host_ip) {
            (BypassEntry::Ip(ip), Some(host_ip)) => *ip == host_ip,
            (BypassEntry::Network(net), Some(host_ip)) => net.contains(&host_ip),
            (BypassEntry::Pattern(re), _) => re.is_match(host),
            _ => false,
        }
    }

    pub fn as_str(&self) -> String {
        match self {
            BypassEntry::Ip(ip) => ip.to_string(),
            BypassEntry::Network(net) => net.to_string(),
            BypassEntry::Pattern(re) => re.as_str().to_string(),
        }
    }
}

/// Ordered rules per category. Built once, read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    pub bypass: Vec<BypassEntry>,
    pub geoip: Vec<Rule>,
    pub suffix: Vec<Rule>,
    pub prefix: Vec<Rule>,
    pub keyword: Vec<Rule>,
    pub final_rule: Option<String>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bypass entries, skipping the ones that can't be classified
    pub fn add_bypass<I, S>(&mut self, entries: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for entry in entries {
            let entry = entry.as_ref();
            match BypassEntry::parse(entry) {
                Some(parsed) => self.bypass.push(parsed),
                None => warn!("Skipping invalid bypass entry: {:?}", entry),
            }
        }
    }

    /// Parse and append one rule line
    pub fn add_line(&mut self, line: &str) -> Result<()> {
        match RuleLine::parse(line)? {
            RuleLine::Rule(category, rule) => self.push(category, rule),
            RuleLine::Final(action) => {
                if let Some(previous) = self.final_rule.replace(action) {
                    warn!("Multiple FINAL rules, replacing [{}]", previous);
                }
            }
            RuleLine::Ignored => {}
        }
        Ok(())
    }

    pub fn push(&mut self, category: RuleCategory, rule: Rule) {
        match category {
            RuleCategory::GeoIp => self.geoip.push(rule),
            RuleCategory::DomainSuffix => self.suffix.push(rule),
            RuleCategory::DomainPrefix => self.prefix.push(rule),
            RuleCategory::DomainKeyword => self.keyword.push(rule),
            RuleCategory::Final => self.final_rule = Some(rule.action),
            RuleCategory::Bypass | RuleCategory::Default => {
                warn!("Ignoring {} rule pushed as a regular rule", category)
            }
        }
    }

    pub fn has_geoip_rules(&self) -> bool {
        !self.geoip.is_empty()
    }

    /// Every action referenced by a rule
    pub fn actions(&self) -> impl Iterator<Item = &str> {
        self.geoip
            .iter()
            .chain(&self.suffix)
            .chain(&self.prefix)
            .chain(&self.keyword)
            .map(|rule| rule.action.as_str())
            .chain(self.final_rule.as_deref())
    }

    pub fn len(&self) -> usize {
        self.geoip.len()
            + self.suffix.len()
            + self.prefix.len()
            + self.keyword.len()
            + usize::from(self.final_rule.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rule_lines() {
        assert_eq!(
            RuleLine::parse("DOMAIN-SUFFIX, Google.com, Proxy").unwrap(),
            RuleLine::Rule(RuleCategory::DomainSuffix, Rule::new("google.com", "proxy"))
        );
        assert_eq!(
            RuleLine::parse("GEOIP,CN,DIRECT").unwrap(),
            RuleLine::Rule(RuleCategory::GeoIp, Rule::new("cn", "direct"))
        );
        assert_eq!(RuleLine::parse("FINAL,Proxy").unwrap(), RuleLine::Final("proxy".into()));
        assert_eq!(RuleLine::parse("// DOMAIN-SUFFIX,x,y").unwrap(), RuleLine::Ignored);
        assert_eq!(RuleLine::parse("USER-AGENT,curl*,Proxy").unwrap(), RuleLine::Ignored);
    }

    #[test]
    fn test_parse_invalid_lines() {
        assert!(RuleLine::parse("IP-CIDR,10.0.0.0/8,DIRECT").is_err());
        assert!(RuleLine::parse("DOMAIN-SUFFIX,google.com").is_err());
        assert!(RuleLine::parse("FINAL").is_err());
    }

    #[test]
    fn test_bypass_classification() {
        assert!(matches!(BypassEntry::parse("127.0.0.1"), Some(BypassEntry::Ip(_))));
        assert!(matches!(BypassEntry::parse("192.168.0.0/16"), Some(BypassEntry::Network(_))));
        assert!(matches!(BypassEntry::parse("localhost"), Some(BypassEntry::Pattern(_))));
        assert!(BypassEntry::parse("*.local").is_none());
    }

    #[test]
    fn test_bypass_matching() {
        let net = BypassEntry::parse("10.0.0.0/8").unwrap();
        assert!(net.matches("10.1.2.3", "10.1.2.3".parse().ok()));
        assert!(!net.matches("10.example.com", None));

        let ip = BypassEntry::parse("::1").unwrap();
        assert!(ip.matches("::1", "::1".parse().ok()));

        let re = BypassEntry::parse(r"\.lan$").unwrap();
        assert!(re.matches("printer.lan", None));
        assert!(!re.matches("lan.example.com", None));
    }

    #[test]
    fn test_second_final_replaces_first() {
        let mut rules = RuleSet::new();
        rules.add_line("FINAL,a").unwrap();
        rules.add_line("FINAL,b").unwrap();
        assert_eq!(rules.final_rule.as_deref(), Some("b"));
        assert_eq!(rules.len(), 1);
    }

    #[test]
    fn test_invalid_bypass_skipped() {
        let mut rules = RuleSet::new();
        rules.add_bypass(["127.0.0.1", "*.local", "192.168.0.0/16"]);
        assert_eq!(rules.bypass.len(), 2);
    }
}
