//! ESMTP extension advertisement (server side) and discovery (client
//! side).

use core::fmt::{self, Display, Formatter};

use crate::auth::Mechanism;

/// One ESMTP keyword, as advertised in an EHLO response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extension {
    EightBitMime,
    Pipelining,
    EnhancedStatusCodes,
    SmtpUtf8,
    Size(Option<usize>),
    StartTls,
    Auth(Vec<Mechanism>),
    Unknown(String),
}

impl Extension {
    /// Parse one EHLO response line into an extension.
    #[must_use]
    pub fn parse(line: &str) -> Self {
        let mut parts = line.split_whitespace();
        let Some(keyword) = parts.next() else {
            return Self::Unknown(line.to_owned());
        };
        match keyword.to_ascii_uppercase().as_str() {
            "8BITMIME" => Self::EightBitMime,
            "PIPELINING" => Self::Pipelining,
            "ENHANCEDSTATUSCODES" => Self::EnhancedStatusCodes,
            "SMTPUTF8" => Self::SmtpUtf8,
            "STARTTLS" => Self::StartTls,
            "SIZE" => Self::Size(parts.next().and_then(|s| s.parse().ok())),
            "AUTH" => Self::Auth(parts.filter_map(Mechanism::parse).collect()),
            _ => Self::Unknown(line.to_owned()),
        }
    }
}

impl Display for Extension {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::EightBitMime => f.write_str("8BITMIME"),
            Self::Pipelining => f.write_str("PIPELINING"),
            Self::EnhancedStatusCodes => f.write_str("ENHANCEDSTATUSCODES"),
            Self::SmtpUtf8 => f.write_str("SMTPUTF8"),
            Self::StartTls => f.write_str("STARTTLS"),
            Self::Size(Some(limit)) => write!(f, "SIZE {limit}"),
            Self::Size(None) => f.write_str("SIZE"),
            Self::Auth(mechs) => {
                f.write_str("AUTH")?;
                for mech in mechs {
                    write!(f, " {}", mech.as_str())?;
                }
                Ok(())
            }
            Self::Unknown(raw) => f.write_str(raw),
        }
    }
}

/// The ordered set of extensions a peer advertises (or a server intends
/// to advertise).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extensions {
    items: Vec<Extension>,
}

impl Extensions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The baseline advertisement every session offers.
    #[must_use]
    pub fn baseline(max_size: Option<usize>) -> Self {
        let mut items = vec![
            Extension::EightBitMime,
            Extension::Pipelining,
            Extension::EnhancedStatusCodes,
            Extension::SmtpUtf8,
        ];
        if let Some(limit) = max_size {
            items.push(Extension::Size(Some(limit)));
        }
        Self { items }
    }

    /// Parse the lines of an EHLO reply, skipping the greeting line.
    #[must_use]
    pub fn from_ehlo_lines<'a>(lines: impl Iterator<Item = &'a str>) -> Self {
        Self {
            items: lines.skip(1).map(Extension::parse).collect(),
        }
    }

    pub fn add(&mut self, extension: Extension) {
        self.items.push(extension);
    }

    pub fn drop_starttls(&mut self) {
        self.items.retain(|e| *e != Extension::StartTls);
    }

    #[must_use]
    pub fn iter(&self) -> impl Iterator<Item = &Extension> {
        self.items.iter()
    }

    /// Render the advertisement lines that follow the EHLO greeting.
    #[must_use]
    pub fn advertisement(&self) -> Vec<String> {
        self.items.iter().map(ToString::to_string).collect()
    }

    #[must_use]
    pub fn pipelining(&self) -> bool {
        self.items.contains(&Extension::Pipelining)
    }

    #[must_use]
    pub fn starttls(&self) -> bool {
        self.items.contains(&Extension::StartTls)
    }

    #[must_use]
    pub fn eight_bit_mime(&self) -> bool {
        self.items.contains(&Extension::EightBitMime)
    }

    #[must_use]
    pub fn size_limit(&self) -> Option<usize> {
        self.items.iter().find_map(|e| match e {
            Extension::Size(limit) => *limit,
            _ => None,
        })
    }

    /// Mechanisms offered by an AUTH advertisement, if any.
    #[must_use]
    pub fn auth_mechanisms(&self) -> Option<&[Mechanism]> {
        self.items.iter().find_map(|e| match e {
            Extension::Auth(mechs) => Some(mechs.as_slice()),
            _ => None,
        })
    }
}
