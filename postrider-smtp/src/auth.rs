//! SASL authentication for SMTP sessions: PLAIN, LOGIN, and CRAM-MD5
//! (RFC 4954, RFC 4616, RFC 2195).

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// Maps to `501 5.5.4`.
    #[error("malformed authentication response")]
    Malformed,

    /// The client cancelled the exchange with `*`. Maps to `501`.
    #[error("authentication exchange cancelled")]
    Cancelled,

    /// Maps to `535 5.7.8`.
    #[error("invalid credentials")]
    InvalidCredentials,
}

/// Supported SASL mechanisms, ordered weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Mechanism {
    Login,
    Plain,
    CramMd5,
}

impl Mechanism {
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PLAIN" => Some(Self::Plain),
            "LOGIN" => Some(Self::Login),
            "CRAM-MD5" => Some(Self::CramMd5),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
            Self::CramMd5 => "CRAM-MD5",
        }
    }

    /// Whether the mechanism exposes the password on the wire, and so
    /// must be refused on unencrypted links unless explicitly allowed.
    #[must_use]
    pub const fn is_plaintext(self) -> bool {
        matches!(self, Self::Plain | Self::Login)
    }
}

/// Credentials recovered from a completed SASL exchange, pending
/// verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub authcid: String,
    pub authzid: Option<String>,
    pub proof: Proof,
}

/// The client's proof of identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Proof {
    Password(String),
    CramMd5 {
        challenge: String,
        digest_hex: String,
    },
}

/// Looks up the stored secret for an authentication identity. Both the
/// plaintext mechanisms and CRAM-MD5 verification need the cleartext
/// secret.
pub trait Authenticator: Send + Sync + std::fmt::Debug {
    fn lookup_secret(&self, authcid: &str) -> Option<String>;
}

/// Verify completed credentials against an [`Authenticator`].
#[must_use]
pub fn verify(credentials: &Credentials, authenticator: &dyn Authenticator) -> bool {
    let Some(secret) = authenticator.lookup_secret(&credentials.authcid) else {
        return false;
    };
    match &credentials.proof {
        Proof::Password(password) => constant_time_eq(password.as_bytes(), secret.as_bytes()),
        Proof::CramMd5 {
            challenge,
            digest_hex,
        } => {
            let expected = hmac_md5_hex(secret.as_bytes(), challenge.as_bytes());
            constant_time_eq(digest_hex.as_bytes(), expected.as_bytes())
        }
    }
}

/// Decode the PLAIN initial response: `authzid NUL authcid NUL passwd`.
pub fn decode_plain(b64: &str) -> Result<Credentials, AuthError> {
    let raw = BASE64.decode(b64.trim()).map_err(|_| AuthError::Malformed)?;
    let raw = String::from_utf8(raw).map_err(|_| AuthError::Malformed)?;
    let mut parts = raw.splitn(3, '\0');
    let authzid = parts.next().ok_or(AuthError::Malformed)?;
    let authcid = parts.next().ok_or(AuthError::Malformed)?;
    let password = parts.next().ok_or(AuthError::Malformed)?;
    if authcid.is_empty() {
        return Err(AuthError::Malformed);
    }
    Ok(Credentials {
        authcid: authcid.to_owned(),
        authzid: (!authzid.is_empty()).then(|| authzid.to_owned()),
        proof: Proof::Password(password.to_owned()),
    })
}

/// Encode the PLAIN initial response for a client.
#[must_use]
pub fn encode_plain(authcid: &str, password: &str) -> String {
    BASE64.encode(format!("\0{authcid}\0{password}"))
}

/// Decode one base64 line of a LOGIN exchange.
pub fn decode_line(b64: &str) -> Result<String, AuthError> {
    let raw = BASE64.decode(b64.trim()).map_err(|_| AuthError::Malformed)?;
    String::from_utf8(raw).map_err(|_| AuthError::Malformed)
}

#[must_use]
pub fn encode_line(text: &str) -> String {
    BASE64.encode(text)
}

/// Build a CRAM-MD5 challenge of the conventional
/// `<random.timestamp@hostname>` shape.
#[must_use]
pub fn cram_challenge(hostname: &str) -> String {
    let nonce: u64 = rand::random();
    let stamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("<{nonce:x}.{stamp}@{hostname}>")
}

/// Decode the CRAM-MD5 response, `base64("authcid hexdigest")`.
pub fn decode_cram_response(b64: &str, challenge: &str) -> Result<Credentials, AuthError> {
    let raw = decode_line(b64)?;
    let (authcid, digest_hex) = raw.rsplit_once(' ').ok_or(AuthError::Malformed)?;
    if authcid.is_empty() || digest_hex.len() != 32 {
        return Err(AuthError::Malformed);
    }
    Ok(Credentials {
        authcid: authcid.to_owned(),
        authzid: None,
        proof: Proof::CramMd5 {
            challenge: challenge.to_owned(),
            digest_hex: digest_hex.to_owned(),
        },
    })
}

/// Build the client side of a CRAM-MD5 response from a base64 challenge.
pub fn encode_cram_response(
    challenge_b64: &str,
    authcid: &str,
    password: &str,
) -> Result<String, AuthError> {
    let challenge = decode_line(challenge_b64)?;
    let digest = hmac_md5_hex(password.as_bytes(), challenge.as_bytes());
    Ok(BASE64.encode(format!("{authcid} {digest}")))
}

/// HMAC-MD5 per RFC 2104, rendered as lowercase hex. CRAM-MD5 is the
/// only consumer; MD5 is not used for anything security-sensitive beyond
/// what that legacy mechanism demands.
#[must_use]
pub fn hmac_md5_hex(key: &[u8], message: &[u8]) -> String {
    const BLOCK: usize = 64;

    let mut key_block = [0u8; BLOCK];
    if key.len() > BLOCK {
        key_block[..16].copy_from_slice(&md5::compute(key).0);
    } else {
        key_block[..key.len()].copy_from_slice(key);
    }

    let mut inner = Vec::with_capacity(BLOCK + message.len());
    let mut outer = Vec::with_capacity(BLOCK + 16);
    for &b in &key_block {
        inner.push(b ^ 0x36);
        outer.push(b ^ 0x5c);
    }
    inner.extend_from_slice(message);
    outer.extend_from_slice(&md5::compute(&inner).0);

    format!("{:x}", md5::compute(&outer))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::{
        AuthError, Authenticator, Credentials, Mechanism, Proof, cram_challenge,
        decode_cram_response, decode_plain, encode_cram_response, encode_line, encode_plain,
        hmac_md5_hex, verify,
    };
    use base64::Engine;

    #[derive(Debug)]
    struct OneUser;

    impl Authenticator for OneUser {
        fn lookup_secret(&self, authcid: &str) -> Option<String> {
            (authcid == "tim").then(|| "tanstaaftanstaaf".to_owned())
        }
    }

    #[test]
    fn mechanism_ordering_prefers_cram_md5() {
        let mut mechs = vec![Mechanism::Plain, Mechanism::CramMd5, Mechanism::Login];
        mechs.sort();
        assert_eq!(mechs.last(), Some(&Mechanism::CramMd5));
    }

    #[test]
    fn plain_round_trip() {
        let encoded = encode_plain("tim", "tanstaaftanstaaf");
        let creds = decode_plain(&encoded).unwrap();
        assert_eq!(creds.authcid, "tim");
        assert_eq!(creds.authzid, None);
        assert!(verify(&creds, &OneUser));
    }

    #[test]
    fn plain_with_authzid() {
        let encoded = super::BASE64.encode("admin\0tim\0tanstaaftanstaaf");
        let creds = decode_plain(&encoded).unwrap();
        assert_eq!(creds.authzid.as_deref(), Some("admin"));
        assert!(verify(&creds, &OneUser));
    }

    #[test]
    fn plain_rejects_wrong_password() {
        let creds = decode_plain(&encode_plain("tim", "wrong")).unwrap();
        assert!(!verify(&creds, &OneUser));
    }

    #[test]
    fn plain_rejects_garbage() {
        assert_eq!(decode_plain("!!!not-base64!!!"), Err(AuthError::Malformed));
        let missing_nul = super::BASE64.encode("no separators");
        assert_eq!(decode_plain(&missing_nul), Err(AuthError::Malformed));
    }

    // RFC 2195 section 2 worked example.
    #[test]
    fn cram_md5_rfc_vector() {
        let challenge = "<1896.697170952@postoffice.reston.mci.net>";
        let digest = hmac_md5_hex(b"tanstaaftanstaaf", challenge.as_bytes());
        assert_eq!(digest, "b913a602c7eda7a495b4e6e7334d3890");
    }

    #[test]
    fn cram_md5_round_trip() {
        let challenge = cram_challenge("mx.example.com");
        let response =
            encode_cram_response(&encode_line(&challenge), "tim", "tanstaaftanstaaf").unwrap();
        let creds = decode_cram_response(&response, &challenge).unwrap();
        assert_eq!(creds.authcid, "tim");
        assert!(verify(&creds, &OneUser));
    }

    #[test]
    fn cram_md5_rejects_wrong_secret() {
        let challenge = cram_challenge("mx.example.com");
        let response =
            encode_cram_response(&encode_line(&challenge), "tim", "wrong-secret").unwrap();
        let creds = decode_cram_response(&response, &challenge).unwrap();
        assert!(!verify(&creds, &OneUser));
    }

    #[test]
    fn unknown_user_fails_verification() {
        let creds = Credentials {
            authcid: "nobody".into(),
            authzid: None,
            proof: Proof::Password("whatever".into()),
        };
        assert!(!verify(&creds, &OneUser));
    }

    #[test]
    fn challenges_are_unique() {
        assert_ne!(cram_challenge("a.example"), cram_challenge("a.example"));
    }
}
