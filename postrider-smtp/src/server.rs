//! The server side of an SMTP session: banner, command loop, STARTTLS,
//! SASL authentication, and DATA framing, with every command routed
//! through a caller-supplied [`SmtpHandlers`] implementation that may
//! rewrite the outgoing reply.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use postrider_common::{Mailbox, Reply};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, trace, warn};

use crate::auth::{self, AuthError, Authenticator, Mechanism};
use crate::codec::{Io, SmtpStream};
use crate::command::{Command, MailParams};
use crate::error::{Result, SmtpError};
use crate::extensions::{Extension, Extensions};

/// Session callbacks. Every handler receives the reply the session is
/// about to send and may rewrite its code, enhanced status, and text;
/// setting a 221 or 421 code closes the connection after the reply.
#[async_trait]
pub trait SmtpHandlers: Send {
    async fn handle_banner(&mut self, _reply: &mut Reply, _peer: SocketAddr) {}

    async fn handle_ehlo(&mut self, _reply: &mut Reply, _ehlo_as: &str) {}

    async fn handle_helo(&mut self, _reply: &mut Reply, _helo_as: &str) {}

    /// Called after a successful STARTTLS handshake.
    async fn handle_tls(&mut self) {}

    /// Called after a successful SASL exchange, before the 235 reply.
    async fn handle_auth(&mut self, _reply: &mut Reply, _authcid: &str) {}

    async fn handle_mail(
        &mut self,
        _reply: &mut Reply,
        _sender: Option<&Mailbox>,
        _params: &MailParams,
    ) {
    }

    async fn handle_rcpt(&mut self, _reply: &mut Reply, _recipient: &Mailbox, _params: &MailParams) {
    }

    /// Called before the 354 go-ahead.
    async fn handle_data(&mut self, _reply: &mut Reply) {}

    /// Called with the complete, unstuffed message body; the receiving
    /// edge enqueues here and rewrites the reply with the queue outcome.
    async fn handle_have_data(&mut self, _reply: &mut Reply, _data: &[u8]) {}

    async fn handle_rset(&mut self) {}
}

/// Authentication offered by a server session.
#[derive(Clone)]
pub struct AuthConfig {
    pub mechanisms: Vec<Mechanism>,
    pub authenticator: Arc<dyn Authenticator>,
    /// Permit PLAIN and LOGIN over unencrypted links. Off by default;
    /// such attempts are refused with `538 5.7.11`.
    pub insecure_allowed: bool,
}

impl AuthConfig {
    #[must_use]
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            mechanisms: vec![Mechanism::CramMd5, Mechanism::Plain, Mechanism::Login],
            authenticator,
            insecure_allowed: false,
        }
    }
}

/// Static configuration shared by every session an edge spawns.
#[derive(Clone)]
pub struct ServerConfig {
    /// Hostname used in the banner and CRAM-MD5 challenges.
    pub hostname: String,
    /// Maximum DATA size; advertised via SIZE when set.
    pub max_size: Option<usize>,
    pub tls: Option<TlsAcceptor>,
    pub auth: Option<AuthConfig>,
    /// Timeout covering any single command read.
    pub command_timeout: Duration,
    /// Cumulative timeout for receiving the message body.
    pub data_timeout: Duration,
}

impl ServerConfig {
    #[must_use]
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            max_size: None,
            tls: None,
            auth: None,
            command_timeout: Duration::from_secs(300),
            data_timeout: Duration::from_secs(300),
        }
    }
}

/// One server-side SMTP session over an accepted connection.
pub struct Server<H> {
    io: Option<SmtpStream<Box<dyn Io>>>,
    config: Arc<ServerConfig>,
    handlers: H,
    peer: SocketAddr,
    bannered: bool,
    ehlo_as: Option<String>,
    extended: bool,
    tls_active: bool,
    authed: Option<String>,
    have_mail: bool,
    have_rcpt: bool,
}

enum Flow {
    Continue,
    Close,
}

impl<H: SmtpHandlers> Server<H> {
    pub fn new(
        stream: impl Io + 'static,
        peer: SocketAddr,
        config: Arc<ServerConfig>,
        handlers: H,
    ) -> Self {
        Self {
            io: Some(SmtpStream::new(Box::new(stream) as Box<dyn Io>)),
            config,
            handlers,
            peer,
            bannered: false,
            ehlo_as: None,
            extended: false,
            tls_active: false,
            authed: None,
            have_mail: false,
            have_rcpt: false,
        }
    }

    /// Run the session to completion. A peer disconnect is a normal end.
    pub async fn run(self) -> Result<()> {
        let (_tx, rx) = watch::channel(false);
        self.run_until(rx).await
    }

    /// Run the session until the peer quits, errors out, or `shutdown`
    /// flips to `true` (in which case a 421 is emitted first).
    pub async fn run_until(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        match self.session_loop(&mut shutdown).await {
            // Peer hangup between commands is the normal way out.
            Err(SmtpError::ConnectionLost) | Ok(()) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn session_loop(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        if let Flow::Close = self.banner().await? {
            return Ok(());
        }

        loop {
            let line = tokio::select! {
                () = wait_for_shutdown(shutdown) => {
                    let reply = Reply::new(421, "4.3.2 Service shutting down");
                    self.send(&reply).await?;
                    return Ok(());
                }
                line = read_command_line(
                    self.io.as_mut().ok_or(SmtpError::ConnectionLost)?,
                    self.config.command_timeout,
                ) => line,
            };

            let line = match line {
                Ok(line) => line,
                Err(SmtpError::TimedOut) => {
                    self.send(&Reply::timed_out()).await?;
                    return Err(SmtpError::TimedOut);
                }
                Err(err) => return Err(err),
            };

            match self.dispatch(&line).await? {
                Flow::Continue => {}
                Flow::Close => return Ok(()),
            }
        }
    }

    async fn banner(&mut self) -> Result<Flow> {
        let mut reply = Reply::new(220, format!("{} ESMTP postrider", self.config.hostname));
        self.handlers.handle_banner(&mut reply, self.peer).await;
        self.bannered = reply.code() == 220;
        self.finish(reply).await
    }

    async fn dispatch(&mut self, line: &[u8]) -> Result<Flow> {
        trace!(peer = %self.peer, line = %String::from_utf8_lossy(line), "command");
        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(_) => return self.finish(Reply::bad_arguments()).await,
        };

        match command {
            Command::Ehlo(ehlo_as) => self.command_ehlo(ehlo_as).await,
            Command::Helo(helo_as) => self.command_helo(helo_as).await,
            Command::StartTls => self.command_starttls().await,
            Command::Auth { mechanism, initial } => {
                self.command_auth(&mechanism, initial).await
            }
            Command::Mail { sender, params } => self.command_mail(sender, &params).await,
            Command::Rcpt { recipient, params } => self.command_rcpt(recipient, &params).await,
            Command::Data => self.command_data().await,
            Command::Rset => {
                self.handlers.handle_rset().await;
                self.reset_transaction();
                self.finish(Reply::new(250, "2.0.0 Ok")).await
            }
            Command::Noop => self.finish(Reply::new(250, "2.0.0 Ok")).await,
            Command::Vrfy(_) => {
                self.finish(Reply::new(
                    252,
                    "2.5.2 Cannot VRFY user, but will accept message and attempt delivery",
                ))
                .await
            }
            Command::Quit => self.finish(Reply::new(221, "2.0.0 Bye")).await,
            Command::Unknown(_) => self.finish(Reply::unknown_command()).await,
        }
    }

    async fn command_ehlo(&mut self, ehlo_as: String) -> Result<Flow> {
        if !self.bannered {
            return self.finish(Reply::bad_sequence()).await;
        }
        let mut reply = Reply::new(250, format!("{} Hello {}", self.config.hostname, ehlo_as));
        self.handlers.handle_ehlo(&mut reply, &ehlo_as).await;

        if reply.code() == 250 {
            for line in self.current_extensions().advertisement() {
                reply.push_line(line);
            }
            self.extended = true;
            self.ehlo_as = Some(ehlo_as);
            self.reset_transaction();
        }
        self.finish(reply).await
    }

    async fn command_helo(&mut self, helo_as: String) -> Result<Flow> {
        if !self.bannered {
            return self.finish(Reply::bad_sequence()).await;
        }
        let mut reply = Reply::new(250, format!("{} Hello {}", self.config.hostname, helo_as));
        self.handlers.handle_helo(&mut reply, &helo_as).await;

        if reply.code() == 250 {
            self.extended = false;
            self.ehlo_as = Some(helo_as);
            self.reset_transaction();
        }
        self.finish(reply).await
    }

    async fn command_starttls(&mut self) -> Result<Flow> {
        if self.tls_active {
            return self.finish(Reply::bad_sequence()).await;
        }
        let Some(acceptor) = self.config.tls.clone() else {
            return self.finish(Reply::unknown_command()).await;
        };
        if self.ehlo_as.is_none() {
            return self.finish(Reply::bad_sequence()).await;
        }

        self.send(&Reply::new(220, "2.7.0 Go ahead")).await?;

        let io = self.io.take().ok_or(SmtpError::ConnectionLost)?;
        let tls = acceptor
            .accept(io.into_inner())
            .await
            .map_err(|e| SmtpError::Tls(e.to_string()))?;
        self.io = Some(SmtpStream::new(Box::new(tls) as Box<dyn Io>));

        // The session restarts from its pre-EHLO state (RFC 3207).
        self.tls_active = true;
        self.ehlo_as = None;
        self.extended = false;
        self.authed = None;
        self.reset_transaction();
        self.handlers.handle_tls().await;
        debug!(peer = %self.peer, "session upgraded to TLS");
        Ok(Flow::Continue)
    }

    async fn command_auth(&mut self, mechanism: &str, initial: Option<String>) -> Result<Flow> {
        let Some(auth_config) = self.config.auth.clone() else {
            return self.finish(Reply::unknown_command()).await;
        };
        if self.ehlo_as.is_none() || self.authed.is_some() || self.have_mail {
            return self.finish(Reply::bad_sequence()).await;
        }
        let Some(mechanism) = Mechanism::parse(mechanism) else {
            return self
                .finish(Reply::new(504, "5.5.4 Unrecognized authentication mechanism"))
                .await;
        };
        if !auth_config.mechanisms.contains(&mechanism) {
            return self
                .finish(Reply::new(504, "5.5.4 Unrecognized authentication mechanism"))
                .await;
        }
        if mechanism.is_plaintext() && !self.tls_active && !auth_config.insecure_allowed {
            return self.finish(Reply::encryption_required()).await;
        }

        let credentials = match self.sasl_exchange(mechanism, initial).await? {
            Ok(credentials) => credentials,
            Err(AuthError::InvalidCredentials) => {
                return self.finish(Reply::invalid_credentials()).await;
            }
            Err(_) => return self.finish(Reply::bad_arguments()).await,
        };

        if !auth::verify(&credentials, auth_config.authenticator.as_ref()) {
            warn!(peer = %self.peer, authcid = %credentials.authcid, "authentication failed");
            return self.finish(Reply::invalid_credentials()).await;
        }

        let mut reply = Reply::new(235, "2.7.0 Authentication successful");
        self.handlers.handle_auth(&mut reply, &credentials.authcid).await;
        if reply.code() == 235 {
            self.authed = Some(credentials.authcid);
        }
        self.finish(reply).await
    }

    /// Run the challenge/response half of an AUTH command. The outer
    /// `Result` is I/O; the inner one is the SASL outcome.
    async fn sasl_exchange(
        &mut self,
        mechanism: Mechanism,
        initial: Option<String>,
    ) -> Result<std::result::Result<auth::Credentials, AuthError>> {
        match mechanism {
            Mechanism::Plain => {
                let response = match initial {
                    Some(response) => response,
                    None => match self.challenge("").await? {
                        Some(response) => response,
                        None => return Ok(Err(AuthError::Cancelled)),
                    },
                };
                Ok(auth::decode_plain(&response))
            }
            Mechanism::Login => {
                let username = match self.challenge(&auth::encode_line("Username:")).await? {
                    Some(response) => response,
                    None => return Ok(Err(AuthError::Cancelled)),
                };
                let password = match self.challenge(&auth::encode_line("Password:")).await? {
                    Some(response) => response,
                    None => return Ok(Err(AuthError::Cancelled)),
                };
                let (username, password) =
                    match (auth::decode_line(&username), auth::decode_line(&password)) {
                        (Ok(u), Ok(p)) => (u, p),
                        _ => return Ok(Err(AuthError::Malformed)),
                    };
                if username.is_empty() {
                    return Ok(Err(AuthError::Malformed));
                }
                Ok(Ok(auth::Credentials {
                    authcid: username,
                    authzid: None,
                    proof: auth::Proof::Password(password),
                }))
            }
            Mechanism::CramMd5 => {
                if initial.is_some() {
                    // CRAM-MD5 has no initial response.
                    return Ok(Err(AuthError::Malformed));
                }
                let challenge = auth::cram_challenge(&self.config.hostname);
                let response = match self.challenge(&auth::encode_line(&challenge)).await? {
                    Some(response) => response,
                    None => return Ok(Err(AuthError::Cancelled)),
                };
                Ok(auth::decode_cram_response(&response, &challenge))
            }
        }
    }

    /// Send a 334 challenge and read the client's base64 line. Returns
    /// `None` when the client cancels with `*`.
    async fn challenge(&mut self, challenge_b64: &str) -> Result<Option<String>> {
        let io = self.io.as_mut().ok_or(SmtpError::ConnectionLost)?;
        io.write_line(format!("334 {challenge_b64}").as_bytes())
            .await?;
        let line = timeout(self.config.command_timeout, io.read_line())
            .await
            .map_err(|_| SmtpError::TimedOut)??;
        let line = String::from_utf8_lossy(&line).trim().to_owned();
        if line == "*" {
            return Ok(None);
        }
        Ok(Some(line))
    }

    async fn command_mail(
        &mut self,
        sender: Option<Mailbox>,
        params: &MailParams,
    ) -> Result<Flow> {
        if self.ehlo_as.is_none() || self.have_mail {
            return self.finish(Reply::bad_sequence()).await;
        }
        // The null reverse-path is an ESMTP affordance for bounce
        // delivery; plain HELO peers do not get it.
        if sender.is_none() && !self.extended {
            return self.finish(Reply::bad_arguments()).await;
        }
        if params.has("SIZE") {
            match self.config.max_size {
                Some(max) => {
                    if params.size().is_some_and(|declared| declared > max) {
                        return self
                            .finish(Reply::new(
                                552,
                                format!("5.3.4 Message size exceeds {max} limit"),
                            ))
                            .await;
                    }
                }
                None => return self.finish(Reply::unknown_parameter()).await,
            }
        }

        let sender_text = sender.as_ref().map_or("", |s| s.as_str());
        let mut reply = Reply::new(250, format!("2.1.0 Sender <{sender_text}> Ok"));
        self.handlers
            .handle_mail(&mut reply, sender.as_ref(), params)
            .await;
        if reply.code() == 250 {
            self.have_mail = true;
        }
        self.finish(reply).await
    }

    async fn command_rcpt(&mut self, recipient: Mailbox, params: &MailParams) -> Result<Flow> {
        if !self.have_mail {
            return self.finish(Reply::bad_sequence()).await;
        }

        let mut reply = Reply::new(250, format!("2.1.5 Recipient <{recipient}> Ok"));
        self.handlers
            .handle_rcpt(&mut reply, &recipient, params)
            .await;
        if reply.code() == 250 {
            self.have_rcpt = true;
        }
        self.finish(reply).await
    }

    async fn command_data(&mut self) -> Result<Flow> {
        if !self.have_mail {
            return self.finish(Reply::bad_sequence()).await;
        }
        if !self.have_rcpt {
            return self.finish(Reply::new(554, "5.5.1 No valid recipients")).await;
        }

        let mut reply = Reply::new(354, "Start mail input; end with <CRLF>.<CRLF>");
        self.handlers.handle_data(&mut reply).await;
        self.send(&reply).await?;
        if reply.closes_connection() {
            return Ok(Flow::Close);
        }
        if reply.code() != 354 {
            return Ok(Flow::Continue);
        }

        let max_size = self.config.max_size;
        let io = self.io.as_mut().ok_or(SmtpError::ConnectionLost)?;
        let data = match timeout(self.config.data_timeout, io.read_data(max_size)).await {
            Err(_) => {
                self.send(&Reply::timed_out()).await?;
                return Err(SmtpError::TimedOut);
            }
            Ok(Err(SmtpError::MessageTooBig(_))) => {
                self.reset_transaction();
                return self
                    .finish(Reply::new(552, "5.3.4 Message exceeded size limit"))
                    .await;
            }
            // Anything else mid-DATA abandons the envelope unacknowledged.
            Ok(Err(err)) => return Err(err),
            Ok(Ok(data)) => data,
        };

        let mut reply = Reply::new(250, "2.6.0 Message accepted for delivery");
        self.handlers.handle_have_data(&mut reply, &data).await;
        self.reset_transaction();
        self.finish(reply).await
    }

    fn current_extensions(&self) -> Extensions {
        let mut extensions = Extensions::baseline(self.config.max_size);
        if self.config.tls.is_some() && !self.tls_active {
            extensions.add(Extension::StartTls);
        }
        if let Some(auth) = &self.config.auth {
            extensions.add(Extension::Auth(auth.mechanisms.clone()));
        }
        extensions
    }

    fn reset_transaction(&mut self) {
        self.have_mail = false;
        self.have_rcpt = false;
    }

    async fn send(&mut self, reply: &Reply) -> Result<()> {
        trace!(peer = %self.peer, reply = %reply, "reply");
        self.io
            .as_mut()
            .ok_or(SmtpError::ConnectionLost)?
            .send_reply(reply)
            .await
    }

    /// Send a reply and decide whether the session continues.
    async fn finish(&mut self, reply: Reply) -> Result<Flow> {
        self.send(&reply).await?;
        if reply.closes_connection() {
            Ok(Flow::Close)
        } else {
            Ok(Flow::Continue)
        }
    }
}

async fn read_command_line(
    io: &mut SmtpStream<Box<dyn Io>>,
    limit: Duration,
) -> Result<Vec<u8>> {
    match timeout(limit, io.read_line()).await {
        Err(_) => Err(SmtpError::TimedOut),
        Ok(result) => result,
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            // Sender dropped without signalling; never fires.
            std::future::pending::<()>().await;
        }
    }
}
