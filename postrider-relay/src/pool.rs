//! Bounded per-destination pools of SMTP client sessions.
//!
//! A permit from the pool's semaphore accompanies every connection,
//! including idle ones, so `concurrent_connections` bounds the total
//! number of sockets a destination sees. Checkouts that cannot get a
//! permit wait in FIFO order.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use postrider_smtp::SmtpClient;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

struct IdleSession {
    client: SmtpClient,
    permit: OwnedSemaphorePermit,
    since: Instant,
}

/// Either a reusable idle session or a permit to open a fresh one.
pub enum Checkout {
    /// An idle session within its idle timeout. Probe before trusting.
    Reused(SmtpClient, OwnedSemaphorePermit),
    /// A permit with no session attached; the caller connects.
    Fresh(OwnedSemaphorePermit),
}

/// Connection pool for one `(host, port)` destination.
pub struct DestinationPool {
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<IdleSession>>,
    idle_timeout: Duration,
}

impl std::fmt::Debug for DestinationPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DestinationPool")
            .field("available", &self.semaphore.available_permits())
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

impl DestinationPool {
    #[must_use]
    pub fn new(concurrent_connections: usize, idle_timeout: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(concurrent_connections.max(1))),
            idle: Mutex::new(Vec::new()),
            idle_timeout,
        }
    }

    /// Get a session slot, waiting if the destination is saturated.
    /// Prefers the most recently parked idle session; stale ones are
    /// discarded along the way.
    pub async fn checkout(&self) -> Checkout {
        loop {
            let idle = {
                let mut idle = self.idle.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                idle.pop()
            };
            match idle {
                Some(session) if session.since.elapsed() <= self.idle_timeout => {
                    trace!("reusing idle session");
                    return Checkout::Reused(session.client, session.permit);
                }
                Some(_stale) => {
                    trace!("discarding idle session past its timeout");
                    // Dropping the session releases its permit.
                }
                None => break,
            }
        }

        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .expect("pool semaphore is never closed");
        Checkout::Fresh(permit)
    }

    /// Park a healthy session for reuse, keeping its permit so the
    /// connection still counts against the bound.
    pub fn park(&self, client: SmtpClient, permit: OwnedSemaphorePermit) {
        let mut idle = self.idle.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        idle.push(IdleSession {
            client,
            permit,
            since: Instant::now(),
        });
    }

    /// Drop idle sessions past the idle timeout. Returns how many
    /// sessions remain parked.
    pub fn sweep(&self) -> usize {
        let mut idle = self.idle.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let timeout = self.idle_timeout;
        idle.retain(|session| session.since.elapsed() <= timeout);
        idle.len()
    }

    /// How many more connections this destination may open right now.
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}
