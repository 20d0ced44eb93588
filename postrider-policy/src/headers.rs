//! Policies that maintain the standard RFC 5322 headers.

use chrono::{Local, Utc};
use postrider_common::Envelope;
use uuid::Uuid;

use crate::{PolicyAction, PolicyReject, QueuePolicy};

/// Adds a `Date:` header in RFC 5322 format (local timezone) when the
/// message does not already carry one.
#[derive(Debug, Default)]
pub struct AddDateHeader;

impl AddDateHeader {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl QueuePolicy for AddDateHeader {
    fn apply(&self, envelope: &mut Envelope) -> Result<PolicyAction, PolicyReject> {
        if !envelope.has_header("Date") {
            let when = envelope
                .timestamp
                .unwrap_or_else(Utc::now)
                .with_timezone(&Local);
            envelope.append_header("Date", when.format("%a, %d %b %Y %H:%M:%S %z").to_string());
        }
        Ok(PolicyAction::Keep)
    }
}

/// Adds a `Message-Id:` header of the form
/// `<hex-uuid.timestamp@hostname>` when none exists.
#[derive(Debug)]
pub struct AddMessageIdHeader {
    hostname: String,
}

impl AddMessageIdHeader {
    #[must_use]
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
        }
    }
}

impl QueuePolicy for AddMessageIdHeader {
    fn apply(&self, envelope: &mut Envelope) -> Result<PolicyAction, PolicyReject> {
        if !envelope.has_header("Message-Id") {
            let stamp = envelope.timestamp.unwrap_or_else(Utc::now).timestamp();
            let id = format!(
                "<{}.{}@{}>",
                Uuid::new_v4().simple(),
                stamp,
                self.hostname
            );
            envelope.append_header("Message-Id", id);
        }
        Ok(PolicyAction::Keep)
    }
}

/// Prepends the `Received:` trace header recording this hop: the sending
/// host, the receiving host, the protocol, and the date. One is added
/// for every envelope, newest first.
#[derive(Debug)]
pub struct AddReceivedHeader {
    hostname: String,
}

impl AddReceivedHeader {
    #[must_use]
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
        }
    }
}

impl QueuePolicy for AddReceivedHeader {
    fn apply(&self, envelope: &mut Envelope) -> Result<PolicyAction, PolicyReject> {
        let ehlo = envelope.client.name.as_deref().unwrap_or("unknown");
        let host = envelope.client.host.as_deref().unwrap_or("unknown");
        let ip = envelope
            .client
            .ip
            .map_or_else(|| String::from("unknown"), |ip| ip.to_string());

        let mut parts = vec![
            format!("from {ehlo} ({host} [{ip}])"),
            format!(
                "by {} (postrider {})",
                self.hostname,
                env!("CARGO_PKG_VERSION")
            ),
            format!("with {}", envelope.client.protocol()),
        ];
        if let [only] = envelope.recipients.as_slice() {
            parts.push(format!("for <{only}>"));
        }

        let date = envelope
            .timestamp
            .unwrap_or_else(Utc::now)
            .format("%a, %d %b %Y %H:%M:%S +0000");
        envelope.prepend_header("Received", format!("{}; {date}", parts.join(" ")));
        Ok(PolicyAction::Keep)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use postrider_common::{Envelope, Mailbox, Security};

    use super::{AddDateHeader, AddMessageIdHeader, AddReceivedHeader};
    use crate::QueuePolicy;

    fn envelope() -> Envelope {
        let mut env = Envelope::default();
        env.timestamp = Some(Utc.with_ymd_and_hms(2014, 7, 8, 9, 10, 11).unwrap());
        env
    }

    #[test]
    fn date_added_only_when_missing() {
        let mut env = envelope();
        AddDateHeader::new().apply(&mut env).unwrap();
        assert!(env.has_header("Date"));

        let existing = env.header("Date").unwrap().to_owned();
        AddDateHeader::new().apply(&mut env).unwrap();
        assert_eq!(
            env.headers.iter().filter(|h| h.name == "Date").count(),
            1
        );
        assert_eq!(env.header("Date").unwrap(), existing);
    }

    #[test]
    fn message_id_shape() {
        let mut env = envelope();
        AddMessageIdHeader::new("mx.example.com")
            .apply(&mut env)
            .unwrap();
        let id = env.header("Message-Id").unwrap();
        assert!(id.starts_with('<'));
        assert!(id.ends_with("@mx.example.com>"));
        assert!(id.contains('.'));
    }

    #[test]
    fn message_id_not_replaced() {
        let mut env = envelope();
        env.append_header("Message-Id", "<existing@elsewhere>");
        AddMessageIdHeader::new("mx.example.com")
            .apply(&mut env)
            .unwrap();
        assert_eq!(env.header("Message-Id").unwrap(), "<existing@elsewhere>");
    }

    #[test]
    fn received_is_prepended_with_session_facts() {
        let mut env = envelope();
        env.append_header("Subject", "hi");
        env.client.ip = Some("192.0.2.7".parse().unwrap());
        env.client.host = Some("client.example".into());
        env.client.name = Some("ehlo.example".into());
        env.client.extended = true;
        env.client.security = Security::Tls;
        env.recipients = vec![Mailbox::parse("one@example.net").unwrap()];

        AddReceivedHeader::new("mx.example.com")
            .apply(&mut env)
            .unwrap();

        assert_eq!(env.headers[0].name, "Received");
        let value = env.headers[0].text();
        assert!(value.starts_with("from ehlo.example (client.example [192.0.2.7])"));
        assert!(value.contains("by mx.example.com (postrider "));
        assert!(value.contains("with ESMTPS"));
        assert!(value.contains("for <one@example.net>"));
        assert!(value.ends_with("Tue, 08 Jul 2014 09:10:11 +0000"));
    }

    #[test]
    fn received_omits_for_clause_with_multiple_recipients() {
        let mut env = envelope();
        env.recipients = vec![
            Mailbox::parse("one@example.net").unwrap(),
            Mailbox::parse("two@example.net").unwrap(),
        ];
        AddReceivedHeader::new("mx.example.com")
            .apply(&mut env)
            .unwrap();
        assert!(!env.headers[0].text().contains("for <"));
    }
}
