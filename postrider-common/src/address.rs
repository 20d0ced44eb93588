//! Envelope mailbox addresses (RFC 5321 reverse-path / forward-path).

use core::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("empty address")]
    Empty,

    #[error("address has no domain: {0}")]
    NoDomain(String),

    #[error("invalid local part: {0}")]
    InvalidLocalPart(String),

    #[error("invalid domain: {0}")]
    InvalidDomain(String),
}

/// A syntactically valid `local@domain` mailbox.
///
/// The null reverse-path used by bounce messages is represented as
/// `Option<Mailbox>::None` by the envelope, never as an empty `Mailbox`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Mailbox(String);

impl Mailbox {
    /// Parse and validate a bare mailbox address (no surrounding angle
    /// brackets). The local part may be a quoted string; the domain must
    /// be a dotted name or a `[...]` address literal.
    pub fn parse(address: &str) -> Result<Self, AddressError> {
        if address.is_empty() {
            return Err(AddressError::Empty);
        }
        let at = split_at_sign(address)
            .ok_or_else(|| AddressError::NoDomain(address.to_owned()))?;
        let (local, domain) = (&address[..at], &address[at + 1..]);

        validate_local_part(local)
            .map_err(|()| AddressError::InvalidLocalPart(address.to_owned()))?;
        validate_domain(domain)
            .map_err(|()| AddressError::InvalidDomain(address.to_owned()))?;

        Ok(Self(address.to_owned()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn local_part(&self) -> &str {
        let at = split_at_sign(&self.0).unwrap_or(self.0.len());
        &self.0[..at]
    }

    /// The domain part, lower-cased for grouping and DNS lookups.
    #[must_use]
    pub fn domain(&self) -> String {
        let at = split_at_sign(&self.0).map_or(0, |i| i + 1);
        self.0[at..].to_lowercase()
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl Display for Mailbox {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Mailbox {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Mailbox {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl<'de> Deserialize<'de> for Mailbox {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Position of the `@` separating local part and domain, ignoring any `@`
/// inside a quoted local part.
fn split_at_sign(address: &str) -> Option<usize> {
    let mut quoted = false;
    let mut escaped = false;
    let mut last = None;
    for (i, b) in address.bytes().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if quoted => escaped = true,
            b'"' => quoted = !quoted,
            b'@' if !quoted => last = Some(i),
            _ => {}
        }
    }
    last
}

fn validate_local_part(local: &str) -> Result<(), ()> {
    if local.is_empty() || local.len() > 64 {
        return Err(());
    }
    if local.starts_with('"') && local.ends_with('"') && local.len() >= 2 {
        // Quoted-string: anything printable except bare quotes.
        return Ok(());
    }
    // Dot-string: atoms separated by single dots.
    if local.starts_with('.') || local.ends_with('.') || local.contains("..") {
        return Err(());
    }
    for c in local.chars() {
        if c.is_control() || c == ' ' || c == '<' || c == '>' || c == '@' {
            return Err(());
        }
    }
    Ok(())
}

fn validate_domain(domain: &str) -> Result<(), ()> {
    if domain.is_empty() || domain.len() > 255 {
        return Err(());
    }
    if domain.starts_with('[') && domain.ends_with(']') {
        // Address literal; content checked no further here.
        return if domain.len() > 2 { Ok(()) } else { Err(()) };
    }
    for label in domain.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(());
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(());
        }
        // SMTPUTF8 permits non-ASCII labels; reject only structural noise.
        for c in label.chars() {
            if c.is_control() || c.is_whitespace() || "<>()[]\\,;:@\"".contains(c) {
                return Err(());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{AddressError, Mailbox};

    #[test]
    fn accepts_plain_addresses() {
        let addr = Mailbox::parse("user@example.com").unwrap();
        assert_eq!(addr.local_part(), "user");
        assert_eq!(addr.domain(), "example.com");
    }

    #[test]
    fn domain_is_lowercased() {
        let addr = Mailbox::parse("User@EXAMPLE.Com").unwrap();
        assert_eq!(addr.domain(), "example.com");
        // The address itself is preserved verbatim.
        assert_eq!(addr.as_str(), "User@EXAMPLE.Com");
    }

    #[test]
    fn accepts_quoted_local_part() {
        let addr = Mailbox::parse("\"odd @ local\"@example.com").unwrap();
        assert_eq!(addr.domain(), "example.com");
    }

    #[test]
    fn accepts_address_literal() {
        assert!(Mailbox::parse("user@[192.0.2.1]").is_ok());
    }

    #[test]
    fn rejects_missing_domain() {
        assert_eq!(
            Mailbox::parse("nodomain"),
            Err(AddressError::NoDomain("nodomain".into()))
        );
        assert!(Mailbox::parse("user@").is_err());
        assert!(Mailbox::parse("@example.com").is_err());
    }

    #[test]
    fn rejects_empty() {
        assert_eq!(Mailbox::parse(""), Err(AddressError::Empty));
    }

    #[test]
    fn rejects_dot_noise_in_local_part() {
        assert!(Mailbox::parse(".user@example.com").is_err());
        assert!(Mailbox::parse("user.@example.com").is_err());
        assert!(Mailbox::parse("us..er@example.com").is_err());
    }

    #[test]
    fn rejects_bad_domain_labels() {
        assert!(Mailbox::parse("user@-example.com").is_err());
        assert!(Mailbox::parse("user@exa mple.com").is_err());
        assert!(Mailbox::parse("user@example..com").is_err());
    }

    #[test]
    fn serde_round_trip() {
        let addr = Mailbox::parse("user@example.com").unwrap();
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"user@example.com\"");
        let back: Mailbox = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }

    #[test]
    fn serde_rejects_invalid() {
        assert!(serde_json::from_str::<Mailbox>("\"not-an-address\"").is_err());
    }
}
