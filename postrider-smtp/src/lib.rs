//! SMTP protocol plumbing: the wire codec, command and extension
//! parsing, SASL authentication, and the server and client session state
//! machines that receivers and relays are built from.

#![deny(clippy::pedantic, clippy::all)]
#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

pub mod auth;
pub mod client;
pub mod codec;
pub mod command;
pub mod error;
pub mod extensions;
pub mod server;

pub use auth::{Authenticator, Credentials, Mechanism};
pub use client::{ClientConfig, ClientError, ClientTimeouts, SmtpClient, TlsMode};
pub use codec::{Io, SmtpStream};
pub use command::{Command, MailParams};
pub use error::SmtpError;
pub use extensions::{Extension, Extensions};
pub use server::{AuthConfig, Server, ServerConfig, SmtpHandlers};
