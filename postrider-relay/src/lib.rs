//! Delivery-side building blocks: the relay contract, per-destination
//! connection pooling, static-host and MX-based SMTP relays, and bounce
//! generation.

#![deny(clippy::pedantic, clippy::all)]
#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

pub mod bounce;
pub mod dns;
pub mod pool;
pub mod smtp;

use async_trait::async_trait;
use postrider_common::{Envelope, Reply};
use postrider_smtp::ClientError;
use thiserror::Error;

pub use bounce::BounceGenerator;
pub use dns::{DnsConfig, DnsError, MxHost, MxResolver};
pub use pool::DestinationPool;
pub use smtp::{MxSmtpRelay, StaticSmtpRelay};

/// What happened to one recipient in a delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecipientStatus {
    Delivered(Reply),
    /// Worth retrying later (4xx, connect trouble, DNS weather).
    Transient(Reply),
    /// Final failure (5xx, NXDOMAIN); the queue bounces this recipient.
    Permanent(Reply),
}

impl RecipientStatus {
    /// Classify a reply by its code: 2xx delivered, 5xx permanent,
    /// everything else transient.
    #[must_use]
    pub fn from_reply(reply: Reply) -> Self {
        if reply.is_success() {
            Self::Delivered(reply)
        } else if reply.is_permanent() {
            Self::Permanent(reply)
        } else {
            Self::Transient(reply)
        }
    }

    #[must_use]
    pub const fn reply(&self) -> &Reply {
        match self {
            Self::Delivered(reply) | Self::Transient(reply) | Self::Permanent(reply) => reply,
        }
    }
}

/// Per-recipient outcome of a delivery attempt; `statuses` parallels the
/// envelope's recipient list by index, because recipients may repeat.
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub statuses: Vec<RecipientStatus>,
}

impl DeliveryResult {
    #[must_use]
    pub fn all_with(status: &RecipientStatus, count: usize) -> Self {
        Self {
            statuses: vec![status.clone(); count],
        }
    }
}

/// Failure that applies to the whole envelope rather than individual
/// recipients.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("transient relay failure: {0}")]
    Transient(Reply),

    #[error("permanent relay failure: {0}")]
    Permanent(Reply),
}

impl RelayError {
    #[must_use]
    pub const fn reply(&self) -> &Reply {
        match self {
            Self::Transient(reply) | Self::Permanent(reply) => reply,
        }
    }

    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    /// Spread a whole-envelope failure over every recipient.
    #[must_use]
    pub fn per_recipient(&self, count: usize) -> DeliveryResult {
        let status = match self {
            Self::Transient(reply) => RecipientStatus::Transient(reply.clone()),
            Self::Permanent(reply) => RecipientStatus::Permanent(reply.clone()),
        };
        DeliveryResult {
            statuses: vec![status; count],
        }
    }
}

/// Categorize client session failures. 5xx rejections are permanent;
/// network weather, timeouts, and 4xx rejections retry.
impl From<ClientError> for RelayError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Rejected(reply) | ClientError::AuthFailed(reply) => {
                if reply.is_permanent() {
                    Self::Permanent(reply)
                } else {
                    Self::Transient(reply)
                }
            }
            ClientError::ConnectTimeout => {
                Self::Transient(Reply::new(451, "4.4.1 Connection timed out"))
            }
            ClientError::CommandTimeout | ClientError::DataTimeout => {
                Self::Transient(Reply::new(451, "4.4.2 Timed out waiting for reply"))
            }
            ClientError::ConnectionLost | ClientError::Io(_) => {
                Self::Transient(Reply::connection_failed())
            }
            ClientError::Tls(msg) => {
                Self::Transient(Reply::new(451, format!("4.7.0 TLS failure: {msg}")))
            }
            ClientError::Protocol(msg) => {
                Self::Transient(Reply::new(451, format!("4.5.0 Protocol error: {msg}")))
            }
            ClientError::TlsUnavailable => Self::Permanent(Reply::new(
                530,
                "5.7.10 TLS required but not offered by destination",
            )),
            ClientError::NoAuthMechanism => Self::Permanent(Reply::new(
                534,
                "5.7.9 No supported authentication mechanism offered",
            )),
        }
    }
}

/// A delivery engine: given an envelope and the number of prior
/// attempts, try the next hop and report per-recipient outcomes.
///
/// Implementations return `Err` only for failures that apply to the
/// envelope as a whole; partial failures belong in the result.
#[async_trait]
pub trait Relay: Send + Sync + std::fmt::Debug {
    async fn attempt(
        &self,
        envelope: &Envelope,
        attempts: u32,
    ) -> Result<DeliveryResult, RelayError>;
}
