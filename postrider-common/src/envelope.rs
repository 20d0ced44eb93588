//! The envelope: sender, recipients, headers, opaque body, and the
//! metadata of the session that received it.

use core::fmt::{self, Display, Formatter};
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::address::Mailbox;

/// Transport security of the receiving session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Security {
    #[default]
    None,
    Tls,
}

/// Facts about the client session that produced an envelope, recorded for
/// trace headers and bounce bodies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Peer IP address.
    pub ip: Option<IpAddr>,
    /// Reverse-DNS name of the peer, when the PTR lookup succeeded.
    pub host: Option<String>,
    /// The EHLO or HELO string the peer presented.
    pub name: Option<String>,
    /// Authenticated identity, if any.
    pub auth: Option<String>,
    pub security: Security,
    /// Whether the peer used EHLO (extended SMTP).
    pub extended: bool,
}

impl ClientInfo {
    /// Protocol label for trace headers: `SMTP` or `ESMTP`, suffixed with
    /// `S` under TLS and `A` when authenticated.
    #[must_use]
    pub fn protocol(&self) -> String {
        let mut proto = String::from(if self.extended { "ESMTP" } else { "SMTP" });
        if self.security == Security::Tls {
            proto.push('S');
        }
        if self.auth.is_some() {
            proto.push('A');
        }
        proto
    }
}

/// One message header, order-significant and duplicable.
///
/// `value` holds the raw wire text after the colon, including any leading
/// whitespace and folded continuation lines, so that parsing and
/// flattening round-trip byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        let value = value.into();
        Self {
            name: name.into(),
            value: if value.starts_with(' ') || value.starts_with('\t') {
                value
            } else {
                format!(" {value}")
            },
        }
    }

    /// The header value with leading whitespace trimmed.
    #[must_use]
    pub fn text(&self) -> &str {
        self.value.trim_start_matches([' ', '\t'])
    }
}

/// A message in transit: envelope addresses, header block, opaque body,
/// and receiving-session metadata.
///
/// Once an edge has acknowledged the message the envelope is treated as
/// immutable; the queue narrows the recipient list through storage only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sending address; `None` is the null reverse-path used by bounces.
    pub sender: Option<Mailbox>,
    /// Recipients in RCPT order; duplicates are allowed.
    pub recipients: Vec<Mailbox>,
    /// Ordered header block; duplicates allowed, `Received:` chains rely
    /// on insertion order.
    pub headers: Vec<Header>,
    /// Opaque message body, everything after the header block.
    pub body: Vec<u8>,
    pub client: ClientInfo,
    /// Hostname of the server that received this envelope.
    pub receiver: Option<String>,
    /// When the receiving session completed DATA.
    pub timestamp: Option<DateTime<Utc>>,
}

impl Envelope {
    #[must_use]
    pub fn new(sender: Option<Mailbox>) -> Self {
        Self {
            sender,
            ..Self::default()
        }
    }

    /// Split flattened message bytes into the header block and body.
    ///
    /// Lines may be terminated by CRLF or bare LF. A line that is neither
    /// a `name: value` header nor a folded continuation ends the header
    /// block; everything from the first non-header line (or after the
    /// blank separator) onward is the body, verbatim.
    pub fn parse_message(&mut self, data: &[u8]) {
        self.headers.clear();
        let mut pos = 0;

        while pos < data.len() {
            let line_end = match memchr::memchr(b'\n', &data[pos..]) {
                Some(i) => pos + i + 1,
                None => data.len(),
            };
            let raw = &data[pos..line_end];
            let line = trim_line_ending(raw);

            if line.is_empty() {
                // Blank separator: the body starts after it.
                pos = line_end;
                break;
            }

            if line[0] == b' ' || line[0] == b'\t' {
                // Folded continuation of the previous header.
                if let Some(last) = self.headers.last_mut() {
                    last.value.push_str("\r\n");
                    last.value.push_str(&String::from_utf8_lossy(line));
                    pos = line_end;
                    continue;
                }
                break;
            }

            let Some(colon) = memchr::memchr(b':', line) else {
                // Not a header; body begins here.
                break;
            };
            self.headers.push(Header {
                name: String::from_utf8_lossy(&line[..colon]).into_owned(),
                value: String::from_utf8_lossy(&line[colon + 1..]).into_owned(),
            });
            pos = line_end;
        }

        self.body = data[pos..].to_vec();
    }

    /// Serialize headers and body back into one byte stream. The header
    /// block is CRLF-terminated; the body is appended verbatim.
    #[must_use]
    pub fn flatten(&self) -> Vec<u8> {
        let header_len: usize = self
            .headers
            .iter()
            .map(|h| h.name.len() + h.value.len() + 3)
            .sum();
        let mut out = Vec::with_capacity(header_len + 2 + self.body.len());
        for header in &self.headers {
            out.extend_from_slice(header.name.as_bytes());
            out.push(b':');
            out.extend_from_slice(header.value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }

    /// First header with the given name, case-insensitive, trimmed.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(Header::text)
    }

    #[must_use]
    pub fn has_header(&self, name: &str) -> bool {
        self.headers
            .iter()
            .any(|h| h.name.eq_ignore_ascii_case(name))
    }

    /// Insert a header at the top of the block, as trace headers require.
    pub fn prepend_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(0, Header::new(name, value));
    }

    /// Append a header to the bottom of the block.
    pub fn append_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push(Header::new(name, value));
    }

    /// Copy of this envelope carrying only the given recipients. Headers
    /// and body are cloned; session metadata is shared.
    #[must_use]
    pub fn copy_with_recipients(&self, recipients: Vec<Mailbox>) -> Self {
        Self {
            recipients,
            ..self.clone()
        }
    }

    /// Copy carrying only the recipients at the given indexes, preserving
    /// their original order.
    #[must_use]
    pub fn narrowed(&self, indexes: &[usize]) -> Self {
        let recipients = indexes
            .iter()
            .filter_map(|&i| self.recipients.get(i).cloned())
            .collect();
        self.copy_with_recipients(recipients)
    }
}

impl Display for Envelope {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let sender = self.sender.as_ref().map_or("", Mailbox::as_str);
        write!(f, "<{}> -> {} recipient(s)", sender, self.recipients.len())
    }
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use super::{Envelope, Header, Security};
    use crate::address::Mailbox;

    fn envelope_from(data: &[u8]) -> Envelope {
        let mut env = Envelope::default();
        env.parse_message(data);
        env
    }

    #[test]
    fn parses_headers_and_body() {
        let env = envelope_from(b"Subject: hi\r\nFrom: a@b.c\r\n\r\nbody bytes\r\n");
        assert_eq!(env.headers.len(), 2);
        assert_eq!(env.header("subject"), Some("hi"));
        assert_eq!(env.header("FROM"), Some("a@b.c"));
        assert_eq!(env.body, b"body bytes\r\n");
    }

    #[test]
    fn flatten_round_trips() {
        let original: &[u8] =
            b"Received: from a\r\nSubject: hi\r\nX-Empty:\r\n\r\nline one\r\n.\r\nline two\r\n";
        let env = envelope_from(original);
        assert_eq!(env.flatten(), original);
    }

    #[test]
    fn folded_headers_round_trip() {
        let original: &[u8] =
            b"Received: from a\r\n\tby b\r\n\twith ESMTP\r\nSubject: hi\r\n\r\nbody";
        let env = envelope_from(original);
        assert_eq!(env.headers.len(), 2);
        assert_eq!(env.flatten(), original);
    }

    #[test]
    fn tolerates_bare_lf_input() {
        let env = envelope_from(b"Subject: hi\n\nbody");
        assert_eq!(env.header("Subject"), Some("hi"));
        assert_eq!(env.body, b"body");
    }

    #[test]
    fn headerless_data_is_all_body() {
        let env = envelope_from(b"no colon here\r\njust body\r\n");
        assert!(env.headers.is_empty());
        assert_eq!(env.body, b"no colon here\r\njust body\r\n");
    }

    #[test]
    fn prepend_header_goes_first() {
        let mut env = envelope_from(b"Subject: hi\r\n\r\nbody");
        env.prepend_header("Received", "from somewhere; today");
        assert_eq!(env.headers[0].name, "Received");
        assert_eq!(env.headers[0].text(), "from somewhere; today");
        assert_eq!(env.header("Subject"), Some("hi"));
    }

    #[test]
    fn header_value_keeps_wire_form() {
        let header = Header::new("Subject", "hello");
        assert_eq!(header.value, " hello");
        assert_eq!(header.text(), "hello");
    }

    #[test]
    fn narrowed_preserves_order() {
        let mut env = Envelope::default();
        env.recipients = vec![
            Mailbox::parse("a@x.example").unwrap(),
            Mailbox::parse("b@x.example").unwrap(),
            Mailbox::parse("c@y.example").unwrap(),
        ];
        let narrowed = env.narrowed(&[0, 2]);
        assert_eq!(narrowed.recipients.len(), 2);
        assert_eq!(narrowed.recipients[0].as_str(), "a@x.example");
        assert_eq!(narrowed.recipients[1].as_str(), "c@y.example");
    }

    #[test]
    fn protocol_label() {
        let mut env = Envelope::default();
        env.client.extended = true;
        assert_eq!(env.client.protocol(), "ESMTP");
        env.client.security = Security::Tls;
        env.client.auth = Some("user".into());
        assert_eq!(env.client.protocol(), "ESMTPSA");
    }
}
