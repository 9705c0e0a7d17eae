//! MX resolution for outbound delivery.
//!
//! [`MxResolver`] turns a recipient domain into the ordered list of hosts to
//! try, following RFC 5321 section 5.1:
//!
//! - MX answer: the exchanges sorted by ascending preference
//! - No MX records (NOANSWER): the domain itself as an implicit MX at
//!   priority 0
//! - NXDOMAIN: [`DnsError::DomainNotFound`], a permanent failure
//! - Null MX (RFC 7505): also permanent, the domain does not accept mail
//!
//! Answers are cached in a `DashMap` using the record TTL clamped to the
//! configured bounds. Failures are never cached.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::DashMap;
use hickory_resolver::{
    ResolveError, TokioResolver, config::ResolverOpts, name_server::TokioConnectionProvider,
};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// A failed DNS lookup: which domain, which record type, and why.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DnsError {
    /// NXDOMAIN, or a domain that publishes a null MX.
    #[error("{record_type} lookup for {domain} failed: domain does not exist ({reason})")]
    DomainNotFound {
        domain: String,
        record_type: &'static str,
        reason: String,
    },

    #[error("{record_type} lookup for {domain} timed out: {reason}")]
    Timeout {
        domain: String,
        record_type: &'static str,
        reason: String,
    },

    /// SERVFAIL, refused, network errors and anything else that may clear up.
    #[error("{record_type} lookup for {domain} failed: {reason}")]
    LookupFailed {
        domain: String,
        record_type: &'static str,
        reason: String,
    },
}

impl DnsError {
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::LookupFailed { .. })
    }

    #[must_use]
    pub fn domain(&self) -> &str {
        match self {
            Self::DomainNotFound { domain, .. }
            | Self::Timeout { domain, .. }
            | Self::LookupFailed { domain, .. } => domain,
        }
    }

    fn from_resolve(domain: &str, record_type: &'static str, err: &ResolveError) -> Self {
        if err.is_nx_domain() {
            Self::DomainNotFound {
                domain: domain.to_string(),
                record_type,
                reason: "NXDOMAIN".to_string(),
            }
        } else {
            Self::LookupFailed {
                domain: domain.to_string(),
                record_type,
                reason: err.to_string(),
            }
        }
    }
}

mod defaults {
    pub const fn timeout_secs() -> u64 {
        5
    }

    pub const fn min_cache_ttl_secs() -> u64 {
        60
    }

    pub const fn max_cache_ttl_secs() -> u64 {
        3600
    }

    pub const fn cache_size() -> usize {
        1000
    }

    pub const fn smtp_port() -> u16 {
        25
    }

    pub const fn enabled() -> bool {
        true
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DnsConfig {
    #[serde(default = "defaults::timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "defaults::enabled")]
    pub cache_enabled: bool,

    /// Lower bound applied to record TTLs when caching.
    #[serde(default = "defaults::min_cache_ttl_secs")]
    pub min_cache_ttl_secs: u64,

    /// Upper bound applied to record TTLs when caching.
    #[serde(default = "defaults::max_cache_ttl_secs")]
    pub max_cache_ttl_secs: u64,

    /// Once reached, expired entries are evicted before inserting; if none
    /// have expired the new answer is not cached.
    #[serde(default = "defaults::cache_size")]
    pub cache_size: usize,

    /// Port used for every mail exchanger.
    #[serde(default = "defaults::smtp_port")]
    pub smtp_port: u16,

    /// Shuffle exchanges that share a preference.
    #[serde(default = "defaults::enabled")]
    pub shuffle_equal_priority: bool,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: defaults::timeout_secs(),
            cache_enabled: defaults::enabled(),
            min_cache_ttl_secs: defaults::min_cache_ttl_secs(),
            max_cache_ttl_secs: defaults::max_cache_ttl_secs(),
            cache_size: defaults::cache_size(),
            smtp_port: defaults::smtp_port(),
            shuffle_equal_priority: defaults::enabled(),
        }
    }
}

/// One candidate mail exchanger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MxRecord {
    /// Lower is tried first.
    pub priority: u16,
    pub host: String,
    pub port: u16,
}

impl MxRecord {
    #[must_use]
    pub fn new(priority: u16, host: impl Into<String>, port: u16) -> Self {
        Self {
            priority,
            host: host.into(),
            port,
        }
    }

    /// `host:port`, bracketing IPv6 literals.
    #[must_use]
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// What the DNS said about a domain's MX records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MxAnswer {
    /// Exchange names are returned without a trailing dot. A null MX shows
    /// up as a record with an empty host.
    Records { records: Vec<MxRecord>, ttl: u32 },
    /// The domain exists but has no MX records.
    NoRecords,
}

/// The DNS seam for MX queries.
#[async_trait]
pub trait MxLookup: Send + Sync {
    async fn lookup_mx(&self, domain: &str) -> Result<MxAnswer, DnsError>;
}

/// System resolver backed lookups for MX and DKIM TXT records.
#[derive(Debug, Clone)]
pub struct HickoryLookup {
    resolver: TokioResolver,
    timeout: Duration,
    port: u16,
}

impl HickoryLookup {
    /// Build from the system resolver configuration.
    pub fn new(config: &DnsConfig) -> Result<Self, DnsError> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let mut opts = ResolverOpts::default();
        opts.timeout = timeout;

        let resolver = TokioResolver::builder(TokioConnectionProvider::default())
            .map_err(|e| DnsError::LookupFailed {
                domain: String::new(),
                record_type: "MX",
                reason: format!("unable to load system resolver configuration: {e}"),
            })?
            .with_options(opts)
            .build();

        Ok(Self {
            resolver,
            timeout,
            port: config.smtp_port,
        })
    }

    fn timeout_error(&self, domain: &str, record_type: &'static str) -> DnsError {
        DnsError::Timeout {
            domain: domain.to_string(),
            record_type,
            reason: format!("no answer within {:?}", self.timeout),
        }
    }
}

#[async_trait]
impl MxLookup for HickoryLookup {
    async fn lookup_mx(&self, domain: &str) -> Result<MxAnswer, DnsError> {
        // hickory retries internally; bound the whole exchange.
        let lookup = tokio::time::timeout(self.timeout * 2, self.resolver.mx_lookup(domain))
            .await
            .map_err(|_| self.timeout_error(domain, "MX"))?;

        let lookup = match lookup {
            Ok(lookup) => lookup,
            Err(err) if err.is_nx_domain() => {
                return Err(DnsError::from_resolve(domain, "MX", &err));
            }
            Err(err) if err.is_no_records_found() => return Ok(MxAnswer::NoRecords),
            Err(err) => return Err(DnsError::from_resolve(domain, "MX", &err)),
        };

        let ttl = lookup
            .as_lookup()
            .records()
            .iter()
            .map(hickory_resolver::proto::rr::Record::ttl)
            .min()
            .unwrap_or(300);

        let records: Vec<MxRecord> = lookup
            .iter()
            .map(|mx| {
                let host = mx.exchange().to_utf8();
                MxRecord::new(mx.preference(), host.trim_end_matches('.'), self.port)
            })
            .collect();

        if records.is_empty() {
            Ok(MxAnswer::NoRecords)
        } else {
            Ok(MxAnswer::Records { records, ttl })
        }
    }
}

#[async_trait]
impl courier_dkim::TxtResolver for HickoryLookup {
    async fn lookup_txt(&self, name: &str) -> courier_dkim::Result<Vec<String>> {
        let dns_error = |reason: String| courier_dkim::DkimError::Dns {
            name: name.to_string(),
            reason,
        };

        let lookup = tokio::time::timeout(self.timeout * 2, self.resolver.txt_lookup(name))
            .await
            .map_err(|_| dns_error(self.timeout_error(name, "TXT").to_string()))?;

        match lookup {
            Ok(lookup) => Ok(lookup
                .iter()
                .map(|txt| {
                    txt.txt_data()
                        .iter()
                        .map(|part| String::from_utf8_lossy(part))
                        .collect::<String>()
                })
                .collect()),
            Err(err) if err.is_no_records_found() && !err.is_nx_domain() => Ok(Vec::new()),
            Err(err) => Err(dns_error(DnsError::from_resolve(name, "TXT", &err).to_string())),
        }
    }
}

#[derive(Debug, Clone)]
struct CachedAnswer {
    records: Arc<Vec<MxRecord>>,
    expires_at: Instant,
}

/// Resolves and caches the mail exchangers of recipient domains.
#[derive(Clone)]
pub struct MxResolver {
    lookup: Arc<dyn MxLookup>,
    cache: Arc<DashMap<String, CachedAnswer>>,
    config: DnsConfig,
}

impl std::fmt::Debug for MxResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MxResolver")
            .field("cached", &self.cache.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MxResolver {
    #[must_use]
    pub fn new(lookup: Arc<dyn MxLookup>, config: DnsConfig) -> Self {
        Self {
            lookup,
            cache: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Resolver backed by the system DNS configuration.
    pub fn system(config: DnsConfig) -> Result<Self, DnsError> {
        let lookup = HickoryLookup::new(&config)?;
        Ok(Self::new(Arc::new(lookup), config))
    }

    /// Candidate exchangers for `domain`, most preferred first.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn resolve(&self, domain: &str) -> Result<Arc<Vec<MxRecord>>, DnsError> {
        let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();

        if self.config.cache_enabled
            && let Some(cached) = self.cache.get(&domain)
        {
            if cached.expires_at > Instant::now() {
                debug!(%domain, servers = cached.records.len(), "MX cache hit");
                return Ok(Arc::clone(&cached.records));
            }
            debug!(%domain, "MX cache entry expired");
        }

        let (records, ttl) = match self.lookup.lookup_mx(&domain).await {
            Ok(MxAnswer::Records { records, ttl }) => (self.order(&domain, records)?, ttl),
            Ok(MxAnswer::NoRecords) => {
                debug!(%domain, "No MX records, using the domain as an implicit MX");
                (
                    vec![MxRecord::new(0, domain.clone(), self.config.smtp_port)],
                    u32::try_from(self.config.min_cache_ttl_secs).unwrap_or(u32::MAX),
                )
            }
            Err(err) => {
                warn!(%domain, %err, "MX lookup failed");
                return Err(err);
            }
        };

        let records = Arc::new(records);
        self.remember(domain, &records, ttl);
        Ok(records)
    }

    fn order(&self, domain: &str, mut records: Vec<MxRecord>) -> Result<Vec<MxRecord>, DnsError> {
        if records.iter().any(|r| r.host.is_empty() || r.host == ".") {
            return Err(DnsError::DomainNotFound {
                domain: domain.to_string(),
                record_type: "MX",
                reason: "null MX, domain does not accept mail".to_string(),
            });
        }

        if self.config.shuffle_equal_priority {
            records.shuffle(&mut rand::rng());
        }
        // Stable, so shuffled ties stay shuffled.
        records.sort_by_key(|r| r.priority);

        debug!(
            %domain,
            servers = %records.iter().map(MxRecord::address).collect::<Vec<_>>().join(", "),
            "Resolved MX records"
        );
        Ok(records)
    }

    fn remember(&self, domain: String, records: &Arc<Vec<MxRecord>>, ttl: u32) {
        if !self.config.cache_enabled {
            return;
        }

        let now = Instant::now();
        if self.cache.len() >= self.config.cache_size {
            self.cache.retain(|_, entry| entry.expires_at > now);
            if self.cache.len() >= self.config.cache_size {
                return;
            }
        }

        let ttl = u64::from(ttl).clamp(
            self.config.min_cache_ttl_secs,
            self.config.max_cache_ttl_secs.max(self.config.min_cache_ttl_secs),
        );
        self.cache.insert(
            domain,
            CachedAnswer {
                records: Arc::clone(records),
                expires_at: now + Duration::from_secs(ttl),
            },
        );
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    #[must_use]
    pub fn cached_domains(&self) -> usize {
        self.cache.len()
    }
}
