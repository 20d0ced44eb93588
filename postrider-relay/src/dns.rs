//! MX resolution for mail delivery: MX lookups with A/AAAA fallback per
//! RFC 5321 section 5.1, preference ordering with equal-preference
//! shuffling, and a TTL-driven cache.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::{ResolveError, TokioResolver};
use postrider_common::Reply;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum DnsError {
    /// No MX, A, or AAAA records exist for the domain.
    #[error("no mail servers found for domain: {0}")]
    NoMailServers(String),

    /// The domain does not exist (NXDOMAIN).
    #[error("domain does not exist: {0}")]
    NotFound(String),

    /// The query failed for reasons worth retrying (SERVFAIL, network).
    #[error("DNS lookup failed: {0}")]
    Lookup(#[from] ResolveError),
}

impl DnsError {
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::NoMailServers(_) | Self::NotFound(_))
    }

    /// The SMTP reply this failure maps to: `550 5.1.2` for dead
    /// domains, `451 4.4.3` for lookup trouble.
    #[must_use]
    pub fn reply(&self) -> Reply {
        match self {
            Self::NoMailServers(domain) => {
                Reply::new(550, format!("5.1.2 No mail servers for {domain}"))
            }
            Self::NotFound(domain) => {
                Reply::new(550, format!("5.1.2 Domain not found: {domain}"))
            }
            Self::Lookup(_) => Reply::new(451, "4.4.3 DNS lookup failed"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DnsConfig {
    /// DNS query timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Upper bound on how long an MX answer is cached, whatever its TTL.
    #[serde(default = "default_max_cache_ttl_secs")]
    pub max_cache_ttl_secs: u64,
}

const fn default_timeout_secs() -> u64 {
    5
}

const fn default_max_cache_ttl_secs() -> u64 {
    3600
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_cache_ttl_secs: default_max_cache_ttl_secs(),
        }
    }
}

/// One candidate next-hop for a domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxHost {
    pub host: String,
    /// MX preference; 0 for the implicit MX of an A/AAAA fallback.
    pub preference: u16,
    pub port: u16,
}

impl MxHost {
    #[must_use]
    pub const fn new(host: String, preference: u16, port: u16) -> Self {
        Self {
            host,
            preference,
            port,
        }
    }
}

#[derive(Debug, Clone)]
struct Cached {
    hosts: Arc<Vec<MxHost>>,
    expires_at: Instant,
}

/// Resolves the next-hop set for recipient domains, caching per the
/// records' TTLs. A TTL of zero means "do not cache", not "cache
/// forever".
#[derive(Debug)]
pub struct MxResolver {
    resolver: TokioResolver,
    cache: DashMap<String, Cached>,
    config: DnsConfig,
}

impl MxResolver {
    /// Build a resolver from the system DNS configuration, falling back
    /// to a public resolver when none can be read.
    pub fn new(config: DnsConfig) -> Self {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(config.timeout_secs);

        let resolver = match TokioResolver::builder(TokioConnectionProvider::default()) {
            Ok(builder) => builder.with_options(opts).build(),
            Err(err) => {
                warn!(error = %err, "system DNS configuration unavailable, using public resolver");
                TokioResolver::builder_with_config(
                    ResolverConfig::cloudflare(),
                    TokioConnectionProvider::default(),
                )
                .with_options(ResolverOpts::default())
                .build()
            }
        };

        Self {
            resolver,
            cache: DashMap::new(),
            config,
        }
    }

    /// Resolve the ordered next-hop set for a domain:
    ///
    /// 1. an unexpired cache entry, if any;
    /// 2. MX records sorted by preference, shuffled within equal
    ///    preference groups;
    /// 3. the domain's A/AAAA records as an implicit preference-0 MX
    ///    when no MX exists.
    pub async fn resolve(&self, domain: &str) -> Result<Arc<Vec<MxHost>>, DnsError> {
        if let Some(cached) = self.cache.get(domain) {
            if cached.expires_at > Instant::now() {
                debug!(%domain, hosts = cached.hosts.len(), "MX cache hit");
                return Ok(Arc::clone(&cached.hosts));
            }
        }

        let (hosts, ttl) = self.resolve_uncached(domain).await?;
        let hosts = Arc::new(hosts);

        let cache_ttl = u64::from(ttl).min(self.config.max_cache_ttl_secs);
        if cache_ttl > 0 {
            self.cache.insert(
                domain.to_owned(),
                Cached {
                    hosts: Arc::clone(&hosts),
                    expires_at: Instant::now() + Duration::from_secs(cache_ttl),
                },
            );
        }
        debug!(%domain, hosts = hosts.len(), ttl = cache_ttl, "resolved mail servers");
        Ok(hosts)
    }

    /// Replace the cached answer for a domain with a fixed host. Used by
    /// relays offering `force_mx`-style overrides and by tests.
    pub fn prime(&self, domain: &str, hosts: Vec<MxHost>, ttl: Duration) {
        self.cache.insert(
            domain.to_owned(),
            Cached {
                hosts: Arc::new(hosts),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    async fn resolve_uncached(&self, domain: &str) -> Result<(Vec<MxHost>, u32), DnsError> {
        match self.resolver.mx_lookup(domain).await {
            Ok(lookup) => {
                let min_ttl = lookup
                    .as_lookup()
                    .records()
                    .iter()
                    .map(hickory_resolver::proto::rr::Record::ttl)
                    .min()
                    .unwrap_or(300);

                let mut hosts: Vec<MxHost> = lookup
                    .iter()
                    .map(|mx| {
                        MxHost::new(
                            mx.exchange().to_utf8().trim_end_matches('.').to_owned(),
                            mx.preference(),
                            25,
                        )
                    })
                    .collect();

                if hosts.is_empty() {
                    return self.fallback_to_address(domain).await;
                }

                hosts.sort_by_key(|h| h.preference);
                shuffle_equal_preference(&mut hosts);
                Ok((hosts, min_ttl))
            }
            Err(err) if err.is_nx_domain() => Err(DnsError::NotFound(domain.to_owned())),
            Err(err) if err.is_no_records_found() => self.fallback_to_address(domain).await,
            Err(err) => {
                warn!(%domain, error = %err, "MX lookup failed");
                Err(DnsError::Lookup(err))
            }
        }
    }

    /// RFC 5321 implicit MX: when no MX exists, the domain's own address
    /// records stand in with preference 0.
    async fn fallback_to_address(&self, domain: &str) -> Result<(Vec<MxHost>, u32), DnsError> {
        match self.resolver.lookup_ip(domain).await {
            Ok(lookup) => {
                let min_ttl = lookup
                    .as_lookup()
                    .records()
                    .iter()
                    .map(hickory_resolver::proto::rr::Record::ttl)
                    .min()
                    .unwrap_or(300);

                let hosts: Vec<MxHost> = lookup
                    .iter()
                    .map(|ip| MxHost::new(ip.to_string(), 0, 25))
                    .collect();

                if hosts.is_empty() {
                    Err(DnsError::NoMailServers(domain.to_owned()))
                } else {
                    Ok((hosts, min_ttl))
                }
            }
            Err(err) if err.is_nx_domain() => Err(DnsError::NotFound(domain.to_owned())),
            Err(err) if err.is_no_records_found() => {
                Err(DnsError::NoMailServers(domain.to_owned()))
            }
            Err(err) => {
                warn!(%domain, error = %err, "address lookup failed");
                Err(DnsError::Lookup(err))
            }
        }
    }
}

/// Shuffle hosts within each equal-preference group so load spreads
/// across them (RFC 5321 section 5.1).
fn shuffle_equal_preference(hosts: &mut [MxHost]) {
    use rand::seq::SliceRandom;

    let mut start = 0;
    while start < hosts.len() {
        let preference = hosts[start].preference;
        let mut end = start + 1;
        while end < hosts.len() && hosts[end].preference == preference {
            end += 1;
        }
        if end - start > 1 {
            hosts[start..end].shuffle(&mut rand::rng());
        }
        start = end;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{DnsConfig, DnsError, MxHost, MxResolver, shuffle_equal_preference};

    fn host(name: &str, preference: u16) -> MxHost {
        MxHost::new(name.to_owned(), preference, 25)
    }

    #[test]
    fn shuffle_preserves_preference_order() {
        let mut hosts = vec![
            host("a1", 10),
            host("a2", 10),
            host("b1", 20),
            host("b2", 20),
            host("c", 30),
        ];
        shuffle_equal_preference(&mut hosts);
        let prefs: Vec<u16> = hosts.iter().map(|h| h.preference).collect();
        assert_eq!(prefs, vec![10, 10, 20, 20, 30]);
    }

    #[test]
    fn shuffle_actually_permutes() {
        let original = vec![host("m1", 5), host("m2", 5), host("m3", 5), host("m4", 5)];
        let mut seen = std::collections::HashSet::new();
        for _ in 0..20 {
            let mut hosts = original.clone();
            shuffle_equal_preference(&mut hosts);
            seen.insert(hosts.iter().map(|h| h.host.clone()).collect::<Vec<_>>());
        }
        assert!(seen.len() >= 2, "expected at least two orderings");
    }

    #[test]
    fn error_replies() {
        let err = DnsError::NotFound("gone.example".into());
        assert!(err.is_permanent());
        assert_eq!(err.reply().code(), 550);

        let err = DnsError::NoMailServers("empty.example".into());
        assert!(err.is_permanent());
        assert_eq!(err.reply().code(), 550);
    }

    #[tokio::test]
    async fn primed_entries_are_served_from_cache() {
        let resolver = MxResolver::new(DnsConfig::default());
        resolver.prime(
            "example.test",
            vec![host("mx.example.test", 10)],
            Duration::from_secs(60),
        );
        let hosts = resolver.resolve("example.test").await.unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].host, "mx.example.test");
    }

    #[tokio::test]
    #[ignore = "requires network access"]
    async fn resolves_real_mx() {
        let resolver = MxResolver::new(DnsConfig::default());
        let hosts = resolver.resolve("gmail.com").await.unwrap();
        assert!(!hosts.is_empty());
        assert!(hosts.windows(2).all(|w| w[0].preference <= w[1].preference));
    }
}
