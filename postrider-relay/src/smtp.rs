//! SMTP relays: delivery to a fixed next hop, and MX-routed delivery
//! that splits envelopes by recipient domain.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use postrider_common::Envelope;
use postrider_smtp::{ClientConfig, SmtpClient};
use tracing::{debug, trace, warn};

use crate::dns::{DnsConfig, MxHost, MxResolver};
use crate::pool::{Checkout, DestinationPool};
use crate::{DeliveryResult, RecipientStatus, Relay, RelayError};

/// Tuning shared by both relay flavors.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Ceiling on simultaneous connections per destination.
    pub concurrent_connections: usize,
    /// How long an idle pooled session stays eligible for reuse.
    pub idle_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            concurrent_connections: 4,
            idle_timeout: Duration::from_secs(30),
        }
    }
}

/// Delivers every envelope to one fixed `(host, port)` destination,
/// recycling connections through a bounded pool.
pub struct StaticSmtpRelay {
    host: String,
    port: u16,
    client_config: ClientConfig,
    pool: DestinationPool,
}

impl std::fmt::Debug for StaticSmtpRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticSmtpRelay")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl StaticSmtpRelay {
    #[must_use]
    pub fn new(
        host: impl Into<String>,
        port: u16,
        client_config: ClientConfig,
        relay_config: &RelayConfig,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            client_config,
            pool: DestinationPool::new(
                relay_config.concurrent_connections,
                relay_config.idle_timeout,
            ),
        }
    }

    /// Drop idle sessions past their timeout; returns how many remain.
    pub fn sweep(&self) -> usize {
        self.pool.sweep()
    }

    async fn deliver_once(&self, envelope: &Envelope) -> Result<DeliveryResult, RelayError> {
        let checkout = self.pool.checkout().await;
        let (mut client, permit) = match checkout {
            Checkout::Reused(mut client, permit) => {
                // The far side may have timed us out while parked; probe
                // before trusting the session with an envelope.
                if client.probe().await {
                    (client, permit)
                } else {
                    trace!(host = %self.host, "parked session went stale, reconnecting");
                    let fresh =
                        SmtpClient::connect(&self.host, self.port, &self.client_config).await?;
                    (fresh, permit)
                }
            }
            Checkout::Fresh(permit) => {
                let client =
                    SmtpClient::connect(&self.host, self.port, &self.client_config).await?;
                (client, permit)
            }
        };

        match client.deliver(envelope).await {
            Ok(replies) => {
                let statuses = replies
                    .into_iter()
                    .map(RecipientStatus::from_reply)
                    .collect();
                self.pool.park(client, permit);
                Ok(DeliveryResult { statuses })
            }
            Err(err) => {
                // A failed session is not worth keeping around.
                debug!(host = %self.host, error = %err, "delivery attempt failed");
                Err(err.into())
            }
        }
    }
}

#[async_trait]
impl Relay for StaticSmtpRelay {
    async fn attempt(
        &self,
        envelope: &Envelope,
        _attempts: u32,
    ) -> Result<DeliveryResult, RelayError> {
        self.deliver_once(envelope).await
    }
}

struct Destination {
    relay: StaticSmtpRelay,
    last_used: Mutex<Instant>,
}

/// Routes envelopes by the MX records of their recipient domains.
///
/// Recipients are grouped by lowercased domain; each group resolves its
/// own next-hop set and is delivered through a pooled [`StaticSmtpRelay`]
/// for that destination. Retries walk the preference-ordered host list
/// by attempt count.
pub struct MxSmtpRelay {
    resolver: MxResolver,
    client_config: ClientConfig,
    relay_config: RelayConfig,
    destinations: DashMap<(String, u16), Arc<Destination>>,
    forced: DashMap<String, (String, u16)>,
}

impl std::fmt::Debug for MxSmtpRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MxSmtpRelay")
            .field("destinations", &self.destinations.len())
            .finish_non_exhaustive()
    }
}

impl MxSmtpRelay {
    #[must_use]
    pub fn new(
        client_config: ClientConfig,
        relay_config: RelayConfig,
        dns_config: DnsConfig,
    ) -> Self {
        Self {
            resolver: MxResolver::new(dns_config),
            client_config,
            relay_config,
            destinations: DashMap::new(),
            forced: DashMap::new(),
        }
    }

    /// Skip MX lookups for `domain` and always deliver to `host:port`.
    pub fn force_mx(&self, domain: &str, host: impl Into<String>, port: u16) {
        self.forced.insert(domain.to_lowercase(), (host.into(), port));
    }

    #[must_use]
    pub const fn resolver(&self) -> &MxResolver {
        &self.resolver
    }

    /// Pick the destination for a domain on the given attempt: the
    /// forced host when set, otherwise the attempt-th entry (mod length)
    /// of the preference-ordered MX set.
    async fn route(&self, domain: &str, attempts: u32) -> Result<(String, u16), RelayError> {
        if let Some(forced) = self.forced.get(domain) {
            return Ok(forced.value().clone());
        }
        let hosts = self.resolver.resolve(domain).await.map_err(|err| {
            let reply = err.reply();
            if err.is_permanent() {
                RelayError::Permanent(reply)
            } else {
                RelayError::Transient(reply)
            }
        })?;
        let index = attempts as usize % hosts.len().max(1);
        let MxHost { host, port, .. } = hosts[index].clone();
        Ok((host, port))
    }

    /// Drop idle connections and forget destinations with nothing
    /// parked and no recent use.
    fn sweep_destinations(&self) {
        let idle_timeout = self.relay_config.idle_timeout;
        self.destinations.retain(|_, destination| {
            let parked = destination.relay.sweep();
            let recent = destination
                .last_used
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .elapsed()
                <= idle_timeout;
            parked > 0 || recent
        });
    }

    async fn deliver_group(
        &self,
        envelope: &Envelope,
        attempts: u32,
    ) -> Result<DeliveryResult, RelayError> {
        let domain = envelope.recipients[0].domain();
        let (host, port) = self.route(&domain, attempts).await?;
        trace!(%domain, %host, port, attempts, "routing recipient group");

        let key = (host.clone(), port);
        // Clone the Arc out so no map shard lock is held across awaits.
        let destination = {
            let entry = self.destinations.entry(key).or_insert_with(|| {
                Arc::new(Destination {
                    relay: StaticSmtpRelay::new(
                        host,
                        port,
                        self.client_config.clone(),
                        &self.relay_config,
                    ),
                    last_used: Mutex::new(Instant::now()),
                })
            });
            Arc::clone(entry.value())
        };
        *destination
            .last_used
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Instant::now();

        destination.relay.deliver_once(envelope).await
    }
}

#[async_trait]
impl Relay for MxSmtpRelay {
    async fn attempt(
        &self,
        envelope: &Envelope,
        attempts: u32,
    ) -> Result<DeliveryResult, RelayError> {
        self.sweep_destinations();

        // Group recipient indexes by lowercased domain, preserving
        // first-appearance order.
        let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
        for (index, rcpt) in envelope.recipients.iter().enumerate() {
            let domain = rcpt.domain();
            match groups.iter_mut().find(|(d, _)| *d == domain) {
                Some((_, indexes)) => indexes.push(index),
                None => groups.push((domain, vec![index])),
            }
        }

        let mut statuses: Vec<Option<RecipientStatus>> =
            envelope.recipients.iter().map(|_| None).collect();

        for (domain, indexes) in groups {
            let group_envelope = envelope.narrowed(&indexes);
            let group_result = match self.deliver_group(&group_envelope, attempts).await {
                Ok(result) => result,
                Err(err) => {
                    warn!(%domain, error = %err, "recipient group failed as a whole");
                    err.per_recipient(indexes.len())
                }
            };
            for (position, index) in indexes.iter().enumerate() {
                statuses[*index] = group_result.statuses.get(position).cloned();
            }
        }

        let statuses = statuses
            .into_iter()
            .map(|status| {
                status.unwrap_or_else(|| {
                    RecipientStatus::Transient(postrider_common::Reply::new(
                        451,
                        "4.3.0 Delivery result missing for recipient",
                    ))
                })
            })
            .collect();
        Ok(DeliveryResult { statuses })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use postrider_smtp::ClientConfig;

    use super::{MxSmtpRelay, RelayConfig};
    use crate::dns::{DnsConfig, MxHost};

    fn relay() -> MxSmtpRelay {
        MxSmtpRelay::new(
            ClientConfig::new("relay.test.example"),
            RelayConfig {
                concurrent_connections: 2,
                idle_timeout: Duration::from_secs(5),
            },
            DnsConfig::default(),
        )
    }

    #[tokio::test]
    async fn forced_mx_bypasses_dns() {
        let relay = relay();
        relay.force_mx("Example.COM", "smarthost.test", 2525);
        let (host, port) = relay.route("example.com", 0).await.unwrap();
        assert_eq!(host, "smarthost.test");
        assert_eq!(port, 2525);
    }

    #[tokio::test]
    async fn attempts_cycle_through_mx_hosts() {
        let relay = relay();
        relay.resolver().prime(
            "multi.example",
            vec![
                MxHost::new("mx1.multi.example".into(), 10, 25),
                MxHost::new("mx2.multi.example".into(), 20, 25),
            ],
            Duration::from_secs(60),
        );
        let (first, _) = relay.route("multi.example", 0).await.unwrap();
        let (second, _) = relay.route("multi.example", 1).await.unwrap();
        let (third, _) = relay.route("multi.example", 2).await.unwrap();
        assert_eq!(first, "mx1.multi.example");
        assert_eq!(second, "mx2.multi.example");
        assert_eq!(third, "mx1.multi.example");
    }
}
