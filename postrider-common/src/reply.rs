//! SMTP replies: a three-digit code, an optional ENHANCEDSTATUSCODES
//! string, and free-form text (RFC 5321 section 4.2, RFC 2034).

use core::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

/// A complete SMTP reply. The text may span multiple lines, separated by
/// `\n`; the wire codec renders continuation lines with `-` and the final
/// line with a space between code and text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    code: u16,
    enhanced: Option<String>,
    text: String,
}

impl Reply {
    /// Create a reply from a code and text. If the text begins with an
    /// enhanced status string (`N.N.N` followed by a space), it is pulled
    /// out into the `enhanced` slot.
    #[must_use]
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        let mut reply = Self {
            code,
            enhanced: None,
            text: String::new(),
        };
        reply.set_text(text);
        reply
    }

    #[must_use]
    pub const fn code(&self) -> u16 {
        self.code
    }

    pub fn set_code(&mut self, code: u16) {
        self.code = code;
    }

    /// The reply text without the enhanced status prefix.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Replace the reply text, re-extracting any enhanced status prefix.
    pub fn set_text(&mut self, text: impl Into<String>) {
        let text = text.into();
        match split_enhanced(&text) {
            Some((esc, rest)) => {
                self.enhanced = Some(esc.to_owned());
                self.text = rest.to_owned();
            }
            None => {
                self.enhanced = None;
                self.text = text;
            }
        }
    }

    #[must_use]
    pub fn enhanced_status(&self) -> Option<&str> {
        self.enhanced.as_deref()
    }

    pub fn set_enhanced_status(&mut self, esc: Option<String>) {
        self.enhanced = esc;
    }

    /// Append a continuation line to the reply text.
    pub fn push_line(&mut self, line: impl AsRef<str>) {
        if !self.text.is_empty() {
            self.text.push('\n');
        }
        self.text.push_str(line.as_ref());
    }

    /// Append to the final line of the reply text.
    pub fn append_text(&mut self, suffix: &str) {
        self.text.push_str(suffix);
    }

    /// Iterate the reply's lines. The enhanced status, when present, is
    /// prefixed onto the first line only.
    pub fn lines(&self) -> impl Iterator<Item = String> + '_ {
        self.text.split('\n').enumerate().map(move |(i, line)| {
            if i == 0 {
                match &self.enhanced {
                    Some(esc) => format!("{esc} {line}"),
                    None => line.to_owned(),
                }
            } else {
                line.to_owned()
            }
        })
    }

    /// Overwrite this reply with another, preserving nothing.
    pub fn copy_from(&mut self, other: &Self) {
        self.code = other.code;
        self.enhanced.clone_from(&other.enhanced);
        self.text.clone_from(&other.text);
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    #[must_use]
    pub const fn is_intermediate(&self) -> bool {
        self.code >= 300 && self.code < 400
    }

    #[must_use]
    pub const fn is_transient(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        self.code >= 500 && self.code < 600
    }

    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.is_transient() || self.is_permanent()
    }

    /// Replies with code 221 or 421 imply the connection closes after they
    /// are emitted (RFC 5321 section 3.8).
    #[must_use]
    pub const fn closes_connection(&self) -> bool {
        self.code == 221 || self.code == 421
    }
}

impl Display for Reply {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.enhanced {
            Some(esc) => write!(f, "{} {} {}", self.code, esc, self.text),
            None => write!(f, "{} {}", self.code, self.text),
        }
    }
}

/// Pre-defined replies shared by the server and client sessions.
impl Reply {
    /// `500 5.5.2` for verbs the server does not recognize.
    #[must_use]
    pub fn unknown_command() -> Self {
        Self::new(500, "5.5.2 Syntax error, command unrecognized")
    }

    /// `504 5.5.4` for unsupported ESMTP parameters.
    #[must_use]
    pub fn unknown_parameter() -> Self {
        Self::new(504, "5.5.4 Command parameter not implemented")
    }

    /// `503 5.5.1` for commands out of sequence.
    #[must_use]
    pub fn bad_sequence() -> Self {
        Self::new(503, "5.5.1 Bad sequence of commands")
    }

    /// `501 5.5.4` for malformed arguments.
    #[must_use]
    pub fn bad_arguments() -> Self {
        Self::new(501, "5.5.4 Syntax error in parameters or arguments")
    }

    /// `421 4.3.0` for unhandled internal errors.
    #[must_use]
    pub fn unhandled_error() -> Self {
        Self::new(421, "4.3.0 Unhandled system error")
    }

    /// `421 4.7.0` when TLS negotiation fails.
    #[must_use]
    pub fn tls_failure() -> Self {
        Self::new(421, "4.7.0 TLS negotiation failed")
    }

    /// `451 4.3.0` when an outbound connection fails.
    #[must_use]
    pub fn connection_failed() -> Self {
        Self::new(451, "4.3.0 Connection failed")
    }

    /// `421 4.4.2` when a session times out.
    #[must_use]
    pub fn timed_out() -> Self {
        Self::new(421, "4.4.2 Connection timed out")
    }

    /// `535 5.7.8` for failed authentication attempts.
    #[must_use]
    pub fn invalid_credentials() -> Self {
        Self::new(535, "5.7.8 Authentication credentials invalid")
    }

    /// `538 5.7.11` for plaintext authentication over an unencrypted link.
    #[must_use]
    pub fn encryption_required() -> Self {
        Self::new(538, "5.7.11 Encryption required for requested mechanism")
    }
}

fn split_enhanced(text: &str) -> Option<(&str, &str)> {
    let (esc, rest) = text.split_once(' ')?;
    let mut parts = esc.splitn(3, '.');
    let class = parts.next()?;
    let subject = parts.next()?;
    let detail = parts.next()?;
    if !matches!(class, "2" | "4" | "5") {
        return None;
    }
    for part in [subject, detail] {
        if part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
    }
    Some((esc, rest))
}
