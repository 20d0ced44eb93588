//! SMTP command parsing: verbs, address paths, and ESMTP parameters.

use core::fmt::{self, Display, Formatter};
use std::borrow::Cow;

use ahash::AHashMap;
use phf::phf_map;
use postrider_common::Mailbox;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    /// Maps to `501 5.5.4`.
    #[error("syntax error in parameters or arguments")]
    Syntax,
}

/// A parsed client command. Unrecognized verbs survive parsing as
/// [`Command::Unknown`] so the session can answer `500` itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ehlo(String),
    Helo(String),
    Mail {
        /// `None` is the null reverse-path, `MAIL FROM:<>`.
        sender: Option<Mailbox>,
        params: MailParams,
    },
    Rcpt {
        recipient: Mailbox,
        params: MailParams,
    },
    Data,
    Rset,
    Noop,
    Quit,
    StartTls,
    Vrfy(String),
    Auth {
        mechanism: String,
        initial: Option<String>,
    },
    Unknown(String),
}

impl Command {
    /// Parse one command line (without its CRLF terminator). The verb is
    /// matched case-insensitively; argument syntax errors map to 501.
    pub fn parse(line: &[u8]) -> Result<Self, CommandError> {
        let line = String::from_utf8_lossy(line);
        let trimmed = line.trim_end();
        let (verb, arg) = match trimmed.split_once(' ') {
            Some((verb, arg)) => (verb, arg.trim_start()),
            None => (trimmed, ""),
        };
        let verb = verb.to_ascii_uppercase();

        match verb.as_str() {
            "EHLO" => Ok(Self::Ehlo(arg.to_owned())),
            "HELO" => Ok(Self::Helo(arg.to_owned())),
            "MAIL" => Self::parse_mail(arg),
            "RCPT" => Self::parse_rcpt(arg),
            "DATA" | "RSET" | "QUIT" | "STARTTLS" if !arg.is_empty() => {
                Err(CommandError::Syntax)
            }
            "DATA" => Ok(Self::Data),
            "RSET" => Ok(Self::Rset),
            "NOOP" => Ok(Self::Noop),
            "QUIT" => Ok(Self::Quit),
            "STARTTLS" => Ok(Self::StartTls),
            "VRFY" => Ok(Self::Vrfy(arg.to_owned())),
            "AUTH" => {
                let (mechanism, initial) = match arg.split_once(' ') {
                    Some((mech, rest)) => (mech, Some(rest.trim().to_owned())),
                    None => (arg, None),
                };
                if mechanism.is_empty() {
                    return Err(CommandError::Syntax);
                }
                Ok(Self::Auth {
                    mechanism: mechanism.to_ascii_uppercase(),
                    initial,
                })
            }
            _ => Ok(Self::Unknown(verb)),
        }
    }

    fn parse_mail(arg: &str) -> Result<Self, CommandError> {
        let (address, rest) = parse_path(arg, "FROM:")?;
        let sender = if address.is_empty() {
            None
        } else {
            Some(Mailbox::parse(&address).map_err(|_| CommandError::Syntax)?)
        };
        Ok(Self::Mail {
            sender,
            params: MailParams::parse(rest)?,
        })
    }

    fn parse_rcpt(arg: &str) -> Result<Self, CommandError> {
        let (address, rest) = parse_path(arg, "TO:")?;
        if address.is_empty() {
            return Err(CommandError::Syntax);
        }
        let recipient = Mailbox::parse(&address).map_err(|_| CommandError::Syntax)?;
        Ok(Self::Rcpt {
            recipient,
            params: MailParams::parse(rest)?,
        })
    }
}

/// Split `FROM:<path> params...` into the bracketed address and the
/// remaining parameter text.
fn parse_path<'a>(arg: &'a str, keyword: &str) -> Result<(String, &'a str), CommandError> {
    if arg.len() < keyword.len() || !arg[..keyword.len()].eq_ignore_ascii_case(keyword) {
        return Err(CommandError::Syntax);
    }
    let rest = arg[keyword.len()..].trim_start();
    let rest = rest.strip_prefix('<').ok_or(CommandError::Syntax)?;
    let close = find_outside_quotes(rest.as_bytes(), b'>').ok_or(CommandError::Syntax)?;
    let mut address = &rest[..close];
    // Drop an RFC 5321 source route prefix ("@a,@b:user@host").
    if address.starts_with('@') {
        if let Some(colon) = address.find(':') {
            address = &address[colon + 1..];
        }
    }
    Ok((address.to_owned(), rest[close + 1..].trim_start()))
}

/// Find `needle` outside any double-quoted region.
fn find_outside_quotes(haystack: &[u8], needle: u8) -> Option<usize> {
    let mut quoted = false;
    let mut escaped = false;
    for (i, &b) in haystack.iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if quoted => escaped = true,
            b'"' => quoted = !quoted,
            b if b == needle && !quoted => return Some(i),
            _ => {}
        }
    }
    None
}

/// Well-known ESMTP parameter keywords, interned for cheap lookups.
static KNOWN_PARAMS: phf::Map<&'static str, &'static str> = phf_map! {
    "SIZE" => "SIZE",
    "BODY" => "BODY",
    "AUTH" => "AUTH",
    "SMTPUTF8" => "SMTPUTF8",
    "RET" => "RET",
    "ENVID" => "ENVID",
};

fn normalize_key(key: &str) -> Cow<'static, str> {
    let upper = key.to_ascii_uppercase();
    KNOWN_PARAMS
        .get(upper.as_str())
        .map_or(Cow::Owned(upper), |&s| Cow::Borrowed(s))
}

/// ESMTP parameters on MAIL and RCPT commands (RFC 5321 section 4.1.2):
/// `KEY=VALUE` pairs and bare flags, keys case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailParams {
    params: AHashMap<Cow<'static, str>, Option<String>>,
}

impl MailParams {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the parameter text following the address path. Duplicate
    /// keys and non-numeric SIZE values are syntax errors.
    pub fn parse(text: &str) -> Result<Self, CommandError> {
        let mut params = Self::new();
        for token in text.split_whitespace() {
            let (key, value) = match token.split_once('=') {
                Some((key, value)) => (key, Some(value.to_owned())),
                None => (token, None),
            };
            let key = normalize_key(key);
            if key == "SIZE" {
                let valid = value
                    .as_deref()
                    .is_some_and(|v| v.parse::<usize>().is_ok());
                if !valid {
                    return Err(CommandError::Syntax);
                }
            }
            if params.params.insert(key, value).is_some() {
                return Err(CommandError::Syntax);
            }
        }
        Ok(params)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(normalize_key(key).as_ref())?.as_deref()
    }

    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.params.contains_key(normalize_key(key).as_ref())
    }

    /// The declared SIZE, when present.
    #[must_use]
    pub fn size(&self) -> Option<usize> {
        self.get("SIZE")?.parse().ok()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

impl Display for MailParams {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, value) in &self.params {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            match value {
                Some(value) => write!(f, "{key}={value}")?,
                None => f.write_str(key)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Command, CommandError, MailParams};

    #[test]
    fn parses_helo_and_ehlo() {
        assert_eq!(
            Command::parse(b"EHLO client.example").unwrap(),
            Command::Ehlo("client.example".into())
        );
        assert_eq!(
            Command::parse(b"helo legacy").unwrap(),
            Command::Helo("legacy".into())
        );
        // An empty EHLO argument parses; the session decides what to do.
        assert_eq!(Command::parse(b"EHLO").unwrap(), Command::Ehlo(String::new()));
    }

    #[test]
    fn parses_mail_from() {
        let Command::Mail { sender, params } =
            Command::parse(b"MAIL FROM:<user@example.com>").unwrap()
        else {
            panic!("expected MAIL");
        };
        assert_eq!(sender.unwrap().as_str(), "user@example.com");
        assert!(params.is_empty());
    }

    #[test]
    fn parses_null_sender() {
        let Command::Mail { sender, .. } = Command::parse(b"MAIL FROM:<>").unwrap() else {
            panic!("expected MAIL");
        };
        assert!(sender.is_none());
    }

    #[test]
    fn parses_mail_params() {
        let Command::Mail { params, .. } =
            Command::parse(b"MAIL FROM:<a@b.example> SIZE=1024 BODY=8BITMIME SMTPUTF8").unwrap()
        else {
            panic!("expected MAIL");
        };
        assert_eq!(params.size(), Some(1024));
        assert_eq!(params.get("body"), Some("8BITMIME"));
        assert!(params.has("SMTPUTF8"));
    }

    #[test]
    fn rejects_bad_size() {
        assert_eq!(
            Command::parse(b"MAIL FROM:<a@b.example> SIZE=huge"),
            Err(CommandError::Syntax)
        );
        assert_eq!(
            Command::parse(b"MAIL FROM:<a@b.example> SIZE"),
            Err(CommandError::Syntax)
        );
    }

    #[test]
    fn rejects_duplicate_params() {
        assert_eq!(
            Command::parse(b"MAIL FROM:<a@b.example> SIZE=1 size=2"),
            Err(CommandError::Syntax)
        );
    }

    #[test]
    fn parses_rcpt_with_quoted_local_part() {
        let Command::Rcpt { recipient, .. } =
            Command::parse(b"RCPT TO:<\"quoted > odd\"@example.com>").unwrap()
        else {
            panic!("expected RCPT");
        };
        assert_eq!(recipient.domain(), "example.com");
    }

    #[test]
    fn strips_source_route() {
        let Command::Rcpt { recipient, .. } =
            Command::parse(b"RCPT TO:<@relay.example:user@example.com>").unwrap()
        else {
            panic!("expected RCPT");
        };
        assert_eq!(recipient.as_str(), "user@example.com");
    }

    #[test]
    fn rejects_empty_rcpt() {
        assert_eq!(Command::parse(b"RCPT TO:<>"), Err(CommandError::Syntax));
    }

    #[test]
    fn bare_verbs_reject_arguments() {
        assert_eq!(Command::parse(b"DATA").unwrap(), Command::Data);
        assert_eq!(Command::parse(b"DATA now"), Err(CommandError::Syntax));
        assert_eq!(Command::parse(b"STARTTLS please"), Err(CommandError::Syntax));
        assert_eq!(Command::parse(b"QUIT"), Ok(Command::Quit));
    }

    #[test]
    fn parses_auth() {
        assert_eq!(
            Command::parse(b"AUTH PLAIN AGZvbwBiYXI=").unwrap(),
            Command::Auth {
                mechanism: "PLAIN".into(),
                initial: Some("AGZvbwBiYXI=".into()),
            }
        );
        assert_eq!(
            Command::parse(b"auth cram-md5").unwrap(),
            Command::Auth {
                mechanism: "CRAM-MD5".into(),
                initial: None,
            }
        );
    }

    #[test]
    fn unknown_verbs_survive_parsing() {
        assert_eq!(
            Command::parse(b"EXPN list").unwrap(),
            Command::Unknown("EXPN".into())
        );
    }
}
