//! GeoIP module - IP to country classification
//!
//! Country data comes from a V2Ray `geoip.dat` file (decoded via geosite-rs).
//! [`GeoIpClassifier`] puts a resolver and the TTL cache in front of the
//! lookup so every connection task shares one set of answers.

use std::collections::HashMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use geosite_rs::{decode_geoip, Cidr};
use tracing::{debug, trace};

use crate::cache::TtlCache;
use crate::error::{Error, Result};
use crate::resolver::HostResolver;

/// Country value cached for addresses the database doesn't know
pub const UNKNOWN_COUNTRY: &str = "unknown";

/// Default TTL for cached country answers (10 hours)
pub const DEFAULT_GEOIP_TTL: Duration = Duration::from_secs(10 * 60 * 60);

/// Country-classification provider
pub trait CountryLookup: Send + Sync {
    /// ISO 3166-1 alpha-2 code (upper case), or `None` if unknown
    fn lookup(&self, ip: IpAddr) -> Option<String>;
}

/// Host classification used by the rule engine
#[async_trait]
pub trait GeoClassifier: Send + Sync {
    /// Country of the host's first classified address, if any
    async fn classify(&self, host: &str) -> Option<String>;
}

/// CIDR entry for IP matching
#[derive(Clone, Debug)]
struct CidrEntry {
    ip: IpAddr,
    prefix: u8,
}

impl CidrEntry {
    fn from_cidr(cidr: &Cidr) -> Option<Self> {
        let ip = match cidr.ip.len() {
            4 => {
                let mut bytes = [0u8; 4];
                bytes.copy_from_slice(&cidr.ip);
                IpAddr::V4(Ipv4Addr::from(bytes))
            }
            16 => {
                let mut bytes = [0u8; 16];
                bytes.copy_from_slice(&cidr.ip);
                IpAddr::V6(Ipv6Addr::from(bytes))
            }
            _ => return None,
        };
        Some(Self {
            ip,
            prefix: cidr.prefix as u8,
        })
    }

    fn contains(&self, addr: IpAddr) -> bool {
        match (self.ip, addr) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let prefix = self.prefix.min(32);
                let mask = if prefix == 0 { 0 } else { !0u32 << (32 - prefix) };
                (u32::from(net) & mask) == (u32::from(ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let prefix = self.prefix.min(128);
                let mask = if prefix == 0 { 0 } else { !0u128 << (128 - prefix) };
                (u128::from(net) & mask) == (u128::from(ip) & mask)
            }
            _ => false, // IPv4 vs IPv6 mismatch
        }
    }
}

/// Country database loaded from a V2Ray geoip.dat file
#[derive(Clone, Debug, Default)]
pub struct GeoIpDatabase {
    /// Country code -> CIDR entries
    countries: HashMap<String, Vec<CidrEntry>>,
}

impl GeoIpDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a V2Ray geoip.dat file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path)
            .map_err(|e| Error::Config(format!("Failed to read {:?}: {}", path, e)))?;
        let db = Self::from_bytes(&data)?;
        debug!("Loaded {} countries from {:?}", db.countries.len(), path);
        Ok(db)
    }

    /// Decode geoip.dat contents
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let list = decode_geoip(data)
            .map_err(|e| Error::Config(format!("Failed to parse geoip.dat: {}", e)))?;

        let mut db = Self::new();
        for entry in &list.entry {
            let country = entry.country_code.to_uppercase();
            let cidrs: Vec<CidrEntry> = entry.cidr.iter().filter_map(CidrEntry::from_cidr).collect();
            trace!("Loaded geoip:{} with {} CIDRs", country, cidrs.len());
            db.countries.entry(country).or_default().extend(cidrs);
        }
        Ok(db)
    }

    /// Add a network by hand, mostly for tests and overrides
    pub fn insert(&mut self, country: &str, network: IpAddr, prefix: u8) {
        self.countries
            .entry(country.to_uppercase())
            .or_default()
            .push(CidrEntry { ip: network, prefix });
    }

    pub fn is_loaded(&self) -> bool {
        !self.countries.is_empty()
    }

    pub fn country_count(&self) -> usize {
        self.countries.len()
    }
}

impl CountryLookup for GeoIpDatabase {
    fn lookup(&self, ip: IpAddr) -> Option<String> {
        // geoip.dat also carries pseudo-countries like "PRIVATE"; the most
        // specific network wins so overlapping entries stay deterministic
        self.countries
            .iter()
            .flat_map(|(country, cidrs)| cidrs.iter().map(move |cidr| (country, cidr)))
            .filter(|(_, cidr)| cidr.contains(ip))
            .max_by(|(ca, a), (cb, b)| a.prefix.cmp(&b.prefix).then_with(|| cb.cmp(ca)))
            .map(|(country, _)| country.clone())
    }
}

/// Resolver + cache + country lookup
pub struct GeoIpClassifier {
    resolver: Arc<dyn HostResolver>,
    lookup: Arc<dyn CountryLookup>,
    cache: Arc<TtlCache<IpAddr, String>>,
    ttl: Duration,
}

impl GeoIpClassifier {
    pub fn new(
        resolver: Arc<dyn HostResolver>,
        lookup: Arc<dyn CountryLookup>,
        cache: Arc<TtlCache<IpAddr, String>>,
        ttl: Duration,
    ) -> Self {
        Self {
            resolver,
            lookup,
            cache,
            ttl,
        }
    }

    /// Country for one address, through the cache
    fn country_of(&self, ip: IpAddr) -> String {
        if let Some(country) = self.cache.get(&ip) {
            return country;
        }
        let country = self
            .lookup
            .lookup(ip)
            .unwrap_or_else(|| UNKNOWN_COUNTRY.to_string());
        self.cache.set(ip, country.clone(), self.ttl);
        country
    }
}

#[async_trait]
impl GeoClassifier for GeoIpClassifier {
    async fn classify(&self, host: &str) -> Option<String> {
        let ips = match self.resolver.resolve(host).await {
            Ok(ips) => ips,
            Err(e) => {
                debug!("GeoIP: cannot resolve {}: {}", host, e);
                return None;
            }
        };

        ips.into_iter()
            .map(|ip| self.country_of(ip))
            .find(|country| country != UNKNOWN_COUNTRY)
    }
}
