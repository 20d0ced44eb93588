//! Background reverse-DNS lookup for connecting clients. Started at
//! banner time, harvested when the envelope completes; a lookup that
//! has not finished by then is abandoned rather than awaited.

use std::net::IpAddr;

use hickory_resolver::TokioResolver;
use hickory_resolver::name_server::TokioConnectionProvider;
use tokio::task::JoinHandle;
use tracing::trace;

/// Build the shared resolver an edge uses for PTR lookups.
#[must_use]
pub fn build_resolver() -> Option<TokioResolver> {
    match TokioResolver::builder(TokioConnectionProvider::default()) {
        Ok(builder) => Some(builder.build()),
        Err(err) => {
            tracing::warn!(error = %err, "no system DNS configuration, reverse lookups disabled");
            None
        }
    }
}

/// One in-flight PTR lookup.
#[derive(Debug)]
pub struct PtrLookup {
    handle: Option<JoinHandle<Option<String>>>,
}

impl PtrLookup {
    /// Start resolving `ip` in the background.
    #[must_use]
    pub fn start(resolver: Option<TokioResolver>, ip: IpAddr) -> Self {
        let handle = resolver.map(|resolver| {
            tokio::spawn(async move {
                match resolver.reverse_lookup(ip).await {
                    Ok(lookup) => lookup
                        .iter()
                        .next()
                        .map(|name| name.to_utf8().trim_end_matches('.').to_owned()),
                    Err(err) => {
                        trace!(%ip, error = %err, "reverse lookup failed");
                        None
                    }
                }
            })
        });
        Self { handle }
    }

    /// A lookup that will never produce a name.
    #[must_use]
    pub const fn disabled() -> Self {
        Self { handle: None }
    }

    /// Take the result if the lookup finished; abandon it otherwise.
    pub async fn finish(mut self) -> Option<String> {
        let handle = self.handle.take()?;
        if handle.is_finished() {
            handle.await.ok().flatten()
        } else {
            handle.abort();
            None
        }
    }
}

impl Drop for PtrLookup {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
