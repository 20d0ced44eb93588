//! The client side of an SMTP session: connection, EHLO handshake with
//! HELO fallback, STARTTLS, SASL authentication, and pipelined envelope
//! delivery with per-recipient results.

use std::time::Duration;

use postrider_common::{Envelope, Reply};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tracing::{debug, trace};

use crate::auth::{self, Mechanism};
use crate::codec::{Io, SmtpStream};
use crate::error::SmtpError;
use crate::extensions::Extensions;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connect timed out")]
    ConnectTimeout,

    #[error("timed out waiting for a reply")]
    CommandTimeout,

    #[error("timed out transferring message data")]
    DataTimeout,

    #[error("connection lost")]
    ConnectionLost,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("TLS error: {0}")]
    Tls(String),

    /// TLS was required but the peer does not offer STARTTLS.
    #[error("TLS required but not offered by peer")]
    TlsUnavailable,

    /// The peer rejected a session-level command (banner, EHLO, MAIL,
    /// DATA); the whole envelope shares this reply's fate.
    #[error("peer rejected session: {0}")]
    Rejected(Reply),

    #[error("authentication failed: {0}")]
    AuthFailed(Reply),

    /// The peer advertises AUTH but no offered mechanism matches our
    /// credentials. Permanent by classification.
    #[error("no mutually supported authentication mechanism")]
    NoAuthMechanism,
}

impl From<SmtpError> for ClientError {
    fn from(err: SmtpError) -> Self {
        match err {
            SmtpError::ConnectionLost => Self::ConnectionLost,
            SmtpError::Io(e) => Self::Io(e),
            SmtpError::TimedOut => Self::CommandTimeout,
            SmtpError::Tls(msg) => Self::Tls(msg),
            SmtpError::BadReply(line) => Self::Protocol(format!("bad reply line: {line}")),
            SmtpError::LineTooLong(n) => Self::Protocol(format!("reply line over {n} bytes")),
            SmtpError::MessageTooBig(n) => Self::Protocol(format!("unexpected size error ({n})")),
        }
    }
}

/// How the client approaches STARTTLS.
#[derive(Clone, Default)]
pub enum TlsMode {
    /// Never upgrade.
    #[default]
    Disabled,
    /// Upgrade when the peer advertises STARTTLS; carry on in cleartext
    /// when it does not or when the upgrade is refused.
    Opportunistic(TlsConnector),
    /// Fail the delivery when TLS cannot be negotiated.
    Required(TlsConnector),
}

#[derive(Debug, Clone, Copy)]
pub struct ClientTimeouts {
    pub connect: Duration,
    pub command: Duration,
    pub data: Duration,
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            command: Duration::from_secs(10),
            data: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Default)]
pub struct ClientConfig {
    /// The EHLO/HELO identity; ordinarily this host's FQDN.
    pub ehlo_as: String,
    pub tls: TlsMode,
    /// `(authcid, secret)` to authenticate with when the peer offers AUTH.
    pub credentials: Option<(String, String)>,
    pub timeouts: ClientTimeouts,
}

impl ClientConfig {
    #[must_use]
    pub fn new(ehlo_as: impl Into<String>) -> Self {
        Self {
            ehlo_as: ehlo_as.into(),
            ..Self::default()
        }
    }
}

/// The reply each recipient ended up with after a delivery attempt.
/// Recipients whose RCPT was accepted share the final DATA reply.
pub type RecipientReplies = Vec<Reply>;

/// A connected, handshaken SMTP client session.
pub struct SmtpClient {
    io: SmtpStream<Box<dyn Io>>,
    host: String,
    extensions: Extensions,
    timeouts: ClientTimeouts,
}

impl SmtpClient {
    /// Connect to `host:port`, read the banner, and complete the EHLO /
    /// STARTTLS / AUTH handshake per `config`.
    pub async fn connect(
        host: &str,
        port: u16,
        config: &ClientConfig,
    ) -> Result<Self, ClientError> {
        let stream = timeout(
            config.timeouts.connect,
            TcpStream::connect((host, port)),
        )
        .await
        .map_err(|_| ClientError::ConnectTimeout)??;

        let mut client = Self {
            io: SmtpStream::new(Box::new(stream) as Box<dyn Io>),
            host: host.to_owned(),
            extensions: Extensions::new(),
            timeouts: config.timeouts,
        };

        let banner = client.read_reply().await?;
        if banner.is_error() {
            return Err(ClientError::Rejected(banner));
        }
        client.handshake(config).await?;
        Ok(client)
    }

    async fn handshake(&mut self, config: &ClientConfig) -> Result<(), ClientError> {
        self.ehlo(&config.ehlo_as).await?;

        match &config.tls {
            TlsMode::Disabled => {}
            TlsMode::Opportunistic(connector) => {
                if self.extensions.starttls() {
                    match self.starttls_upgrade(connector.clone()).await {
                        Ok(()) => self.ehlo(&config.ehlo_as).await?,
                        Err(ClientError::Rejected(reply)) => {
                            // Refused upgrade; continue in cleartext.
                            debug!(host = %self.host, %reply, "STARTTLS refused, continuing without TLS");
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
            TlsMode::Required(connector) => {
                if !self.extensions.starttls() {
                    return Err(ClientError::TlsUnavailable);
                }
                self.starttls_upgrade(connector.clone()).await?;
                self.ehlo(&config.ehlo_as).await?;
            }
        }

        if let Some((authcid, secret)) = &config.credentials {
            if let Some(offered) = self.extensions.auth_mechanisms() {
                let strongest = offered.iter().copied().max();
                match strongest {
                    Some(mechanism) => self.authenticate(mechanism, authcid, secret).await?,
                    None => return Err(ClientError::NoAuthMechanism),
                }
            }
        }
        Ok(())
    }

    /// Send EHLO; on a 5xx, fall back to HELO (original-protocol peers).
    async fn ehlo(&mut self, ehlo_as: &str) -> Result<(), ClientError> {
        self.send_line(format!("EHLO {ehlo_as}")).await?;
        let reply = self.read_reply().await?;

        if reply.is_permanent() {
            self.send_line(format!("HELO {ehlo_as}")).await?;
            let reply = self.read_reply().await?;
            if reply.is_error() {
                return Err(ClientError::Rejected(reply));
            }
            self.extensions = Extensions::new();
            return Ok(());
        }
        if reply.is_error() {
            return Err(ClientError::Rejected(reply));
        }

        let lines: Vec<String> = reply.lines().collect();
        self.extensions = Extensions::from_ehlo_lines(lines.iter().map(String::as_str));
        Ok(())
    }

    async fn starttls_upgrade(&mut self, connector: TlsConnector) -> Result<(), ClientError> {
        self.send_line("STARTTLS".to_owned()).await?;
        let reply = self.read_reply().await?;
        if reply.code() != 220 {
            return Err(ClientError::Rejected(reply));
        }

        let server_name = ServerName::try_from(self.host.clone())
            .map_err(|e| ClientError::Tls(format!("invalid TLS server name: {e}")))?;
        let io = std::mem::replace(&mut self.io, SmtpStream::new(dead_stream()));
        let tls = connector
            .connect(server_name, io.into_inner())
            .await
            .map_err(|e| ClientError::Tls(e.to_string()))?;
        self.io = SmtpStream::new(Box::new(tls) as Box<dyn Io>);
        debug!(host = %self.host, "client session upgraded to TLS");
        Ok(())
    }

    async fn authenticate(
        &mut self,
        mechanism: Mechanism,
        authcid: &str,
        secret: &str,
    ) -> Result<(), ClientError> {
        match mechanism {
            Mechanism::Plain => {
                let initial = auth::encode_plain(authcid, secret);
                self.send_line(format!("AUTH PLAIN {initial}")).await?;
            }
            Mechanism::Login => {
                self.send_line("AUTH LOGIN".to_owned()).await?;
                let challenge = self.read_reply().await?;
                if challenge.code() != 334 {
                    return Err(ClientError::AuthFailed(challenge));
                }
                self.send_line(auth::encode_line(authcid)).await?;
                let challenge = self.read_reply().await?;
                if challenge.code() != 334 {
                    return Err(ClientError::AuthFailed(challenge));
                }
                self.send_line(auth::encode_line(secret)).await?;
            }
            Mechanism::CramMd5 => {
                self.send_line("AUTH CRAM-MD5".to_owned()).await?;
                let challenge = self.read_reply().await?;
                if challenge.code() != 334 {
                    return Err(ClientError::AuthFailed(challenge));
                }
                let response = auth::encode_cram_response(challenge.text(), authcid, secret)
                    .map_err(|e| ClientError::Protocol(format!("bad CRAM-MD5 challenge: {e}")))?;
                self.send_line(response).await?;
            }
        }

        let outcome = self.read_reply().await?;
        if outcome.code() == 235 {
            debug!(host = %self.host, mechanism = mechanism.as_str(), "authenticated");
            Ok(())
        } else {
            Err(ClientError::AuthFailed(outcome))
        }
    }

    /// Whether the peer advertised PIPELINING in its EHLO response.
    #[must_use]
    pub fn pipelining(&self) -> bool {
        self.extensions.pipelining()
    }

    #[must_use]
    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    /// Deliver one envelope. On success the returned replies parallel
    /// `envelope.recipients`: rejected recipients keep their RCPT reply,
    /// accepted ones share the final DATA reply. A failure mid-DATA marks
    /// the not-yet-failed recipients with a transient reply rather than
    /// failing the call.
    ///
    /// # Errors
    /// Whole-session failures only: connect/reply errors before DATA, a
    /// rejected MAIL, or a rejected DATA go-ahead.
    pub async fn deliver(&mut self, envelope: &Envelope) -> Result<RecipientReplies, ClientError> {
        if self.pipelining() {
            self.deliver_pipelined(envelope).await
        } else {
            self.deliver_sequential(envelope).await
        }
    }

    async fn deliver_pipelined(
        &mut self,
        envelope: &Envelope,
    ) -> Result<RecipientReplies, ClientError> {
        let sender = envelope.sender.as_ref().map_or("", |s| s.as_str());
        self.send_line_unflushed(format!("MAIL FROM:<{sender}>")).await?;
        for recipient in &envelope.recipients {
            self.send_line_unflushed(format!("RCPT TO:<{recipient}>")).await?;
        }
        self.send_line(String::from("DATA")).await?;

        let mail_reply = self.read_reply().await?;
        let mut rcpt_replies = Vec::with_capacity(envelope.recipients.len());
        for _ in &envelope.recipients {
            rcpt_replies.push(self.read_reply().await?);
        }
        let data_reply = self.read_reply().await?;

        if mail_reply.is_error() {
            if data_reply.code() == 354 {
                self.abort_data().await?;
            }
            return Err(ClientError::Rejected(mail_reply));
        }

        let any_accepted = rcpt_replies.iter().any(|r| !r.is_error());
        if !any_accepted {
            if data_reply.code() == 354 {
                self.abort_data().await?;
            }
            return Ok(rcpt_replies);
        }

        if data_reply.code() != 354 {
            return Err(ClientError::Rejected(data_reply));
        }

        self.finish_data(envelope, rcpt_replies).await
    }

    async fn deliver_sequential(
        &mut self,
        envelope: &Envelope,
    ) -> Result<RecipientReplies, ClientError> {
        let sender = envelope.sender.as_ref().map_or("", |s| s.as_str());
        self.send_line(format!("MAIL FROM:<{sender}>")).await?;
        let mail_reply = self.read_reply().await?;
        if mail_reply.is_error() {
            return Err(ClientError::Rejected(mail_reply));
        }

        let mut rcpt_replies = Vec::with_capacity(envelope.recipients.len());
        for recipient in &envelope.recipients {
            self.send_line(format!("RCPT TO:<{recipient}>")).await?;
            rcpt_replies.push(self.read_reply().await?);
        }

        if rcpt_replies.iter().all(Reply::is_error) {
            // Nothing to send; drop the transaction instead of DATA.
            self.rset().await?;
            return Ok(rcpt_replies);
        }

        self.send_line(String::from("DATA")).await?;
        let data_reply = self.read_reply().await?;
        if data_reply.code() != 354 {
            return Err(ClientError::Rejected(data_reply));
        }

        self.finish_data(envelope, rcpt_replies).await
    }

    /// Transmit the message body and fold the final reply into the
    /// per-recipient outcome.
    async fn finish_data(
        &mut self,
        envelope: &Envelope,
        mut rcpt_replies: Vec<Reply>,
    ) -> Result<RecipientReplies, ClientError> {
        let flattened = envelope.flatten();
        let limit = self.timeouts.data;
        let outcome = async {
            self.io.send_data(&flattened).await?;
            self.io.read_reply().await
        };
        let final_reply = match timeout(limit, outcome).await {
            Err(_) => Reply::new(451, "4.4.2 Timed out transmitting message data"),
            Ok(Err(SmtpError::ConnectionLost | SmtpError::Io(_))) => {
                // A connection error during or after DATA is transient
                // for the recipients that had not already failed.
                Reply::connection_failed()
            }
            Ok(Err(err)) => return Err(err.into()),
            Ok(Ok(reply)) => reply,
        };

        trace!(host = %self.host, reply = %final_reply, "data reply");
        for reply in &mut rcpt_replies {
            if !reply.is_error() {
                *reply = final_reply.clone();
            }
        }
        Ok(rcpt_replies)
    }

    /// Every RCPT failed after a pipelined DATA was already accepted:
    /// send a lone terminator so the transaction dies cleanly.
    async fn abort_data(&mut self) -> Result<(), ClientError> {
        self.io.send_data(b"").await.map_err(ClientError::from)?;
        let _ = self.read_reply().await?;
        Ok(())
    }

    pub async fn rset(&mut self) -> Result<(), ClientError> {
        self.send_line(String::from("RSET")).await?;
        let reply = self.read_reply().await?;
        if reply.is_error() {
            return Err(ClientError::Rejected(reply));
        }
        Ok(())
    }

    /// Cheap liveness check used before reusing a pooled session: a RSET
    /// round-trip with the command timeout. Any failure means the
    /// connection should be discarded.
    pub async fn probe(&mut self) -> bool {
        self.rset().await.is_ok()
    }

    /// Politely end the session. Errors are ignored; the message, if
    /// any, has already been delivered.
    pub async fn quit(mut self) {
        if self.send_line(String::from("QUIT")).await.is_ok() {
            let _ = self.read_reply().await;
        }
    }

    async fn send_line(&mut self, line: String) -> Result<(), ClientError> {
        trace!(host = %self.host, %line, "send");
        self.io
            .write_line(line.as_bytes())
            .await
            .map_err(SmtpError::into)
    }

    /// Queue a command without waiting for its reply (pipelining).
    async fn send_line_unflushed(&mut self, line: String) -> Result<(), ClientError> {
        // Writes are small; the flush-per-line cost is irrelevant next to
        // the reply round-trips this saves.
        self.send_line(line).await
    }

    async fn read_reply(&mut self) -> Result<Reply, ClientError> {
        match timeout(self.timeouts.command, self.io.read_reply()).await {
            Err(_) => Err(ClientError::CommandTimeout),
            Ok(result) => result.map_err(SmtpError::into),
        }
    }
}

/// Placeholder stream used only across a STARTTLS swap.
fn dead_stream() -> Box<dyn Io> {
    Box::new(tokio::io::empty())
}

impl ClientError {
    /// Whether retrying later could plausibly succeed. 5xx rejections
    /// and credential problems are final; everything else is weather.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ConnectTimeout
            | Self::CommandTimeout
            | Self::DataTimeout
            | Self::ConnectionLost
            | Self::Io(_)
            | Self::Tls(_)
            | Self::Protocol(_) => true,
            Self::Rejected(reply) => !reply.is_permanent(),
            Self::AuthFailed(_) | Self::NoAuthMechanism | Self::TlsUnavailable => false,
        }
    }
}
