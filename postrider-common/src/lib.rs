//! Shared building blocks for the postrider mail transfer library:
//! reply objects, envelope addresses, the envelope itself, and logging
//! setup.

#![deny(clippy::pedantic, clippy::all)]
#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

pub mod address;
pub mod envelope;
pub mod logging;
pub mod reply;

pub use address::{AddressError, Mailbox};
pub use envelope::{ClientInfo, Envelope, Header, Security};
pub use reply::Reply;
