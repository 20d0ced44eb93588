//! Postrider is a programmable mail transfer agent library: composable
//! receivers, a durable retrying queue, and MX-routed delivery engines,
//! glued together by the envelope and reply types in
//! [`postrider_common`].
//!
//! The crates compose along the reception → queue → delivery pipeline:
//!
//! - [`edge`]: accept connections and produce envelopes;
//! - [`policy`]: transform envelopes before they are persisted;
//! - [`queue`]: persist, schedule, retry, and bounce;
//! - [`relay`]: resolve next hops and drive client sessions;
//! - [`smtp`]: the protocol plumbing both sides are built from.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use postrider::edge::{EdgeConfig, SmtpEdge};
//! use postrider::queue::{Queue, MemoryStorage, exponential_backoff};
//! use postrider::relay::{MxSmtpRelay, smtp::RelayConfig};
//! use postrider::relay::dns::DnsConfig;
//! use postrider::smtp::{ClientConfig, ServerConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let relay = Arc::new(MxSmtpRelay::new(
//!     ClientConfig::new("mx.example.com"),
//!     RelayConfig::default(),
//!     DnsConfig::default(),
//! ));
//! let queue = Arc::new(
//!     Queue::builder(Arc::new(MemoryStorage::new()))
//!         .relay(relay)
//!         .backoff(exponential_backoff(
//!             Duration::from_secs(300),
//!             Duration::from_secs(86_400),
//!             12,
//!         ))
//!         .start()
//!         .await?,
//! );
//!
//! let edge = SmtpEdge::bind(
//!     &["0.0.0.0:25".parse()?, "[::]:25".parse()?],
//!     queue,
//!     EdgeConfig::new(ServerConfig::new("mx.example.com")),
//! )
//! .await?;
//! let (_shutdown, rx) = tokio::sync::watch::channel(false);
//! edge.serve(rx).await;
//! # Ok(())
//! # }
//! ```

#![deny(clippy::pedantic, clippy::all)]
#![allow(clippy::must_use_candidate)]

pub use postrider_common as common;
pub use postrider_edge as edge;
pub use postrider_policy as policy;
pub use postrider_queue as queue;
pub use postrider_relay as relay;
pub use postrider_smtp as smtp;

pub use postrider_common::{Envelope, Mailbox, Reply};
pub use postrider_queue::{Queue, QueueError, QueueId};
pub use postrider_relay::{DeliveryResult, RecipientStatus, Relay, RelayError};
