//! Reception edges: bounded TCP servers that run SMTP sessions, build
//! envelopes, and hand them to the queue, with optional PROXY protocol
//! support and reverse-DNS trace metadata.

#![deny(clippy::pedantic, clippy::all)]
#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

pub mod proxy;
pub mod ptr;
pub mod smtp;

pub use proxy::{ProxyError, read_proxy_header};
pub use ptr::PtrLookup;
pub use smtp::{EdgeConfig, NullValidators, SmtpEdge, SmtpValidators, ValidatorFactory};
