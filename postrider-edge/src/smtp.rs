//! The SMTP edge: accepts connections, runs server sessions, assembles
//! envelopes, and hands them to the queue. User-supplied validators may
//! veto or rewrite the reply at every step of a session.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hickory_resolver::TokioResolver;
use postrider_common::{ClientInfo, Envelope, Mailbox, Reply, Security};
use postrider_queue::{Enqueued, Queue};
use postrider_smtp::command::MailParams;
use postrider_smtp::server::{Server, ServerConfig, SmtpHandlers};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::proxy;
use crate::ptr::{self, PtrLookup};

/// Per-command validation hooks, the edge-facing counterpart of the
/// session's protocol handlers. Implementations may rewrite the pending
/// reply; a 221/421 code closes the connection once sent.
#[async_trait]
pub trait SmtpValidators: Send {
    async fn handle_banner(&mut self, _reply: &mut Reply, _peer: SocketAddr) {}

    async fn handle_ehlo(&mut self, _reply: &mut Reply, _ehlo_as: &str) {}

    async fn handle_helo(&mut self, _reply: &mut Reply, _helo_as: &str) {}

    async fn handle_tls(&mut self) {}

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

    async fn handle_data(&mut self, _reply: &mut Reply) {}

    /// After the body arrives, before the envelope is enqueued.
    async fn handle_have_data(&mut self, _reply: &mut Reply, _data: &[u8]) {}

    /// After the enqueue attempt, with its per-envelope results.
    async fn handle_queued(&mut self, _reply: &mut Reply, _results: &[Enqueued]) {}

    async fn handle_rset(&mut self) {}
}

/// Validators that accept everything.
#[derive(Debug, Default)]
pub struct NullValidators;

#[async_trait]
impl SmtpValidators for NullValidators {}

pub type ValidatorFactory = Arc<dyn Fn() -> Box<dyn SmtpValidators> + Send + Sync>;

/// Edge-level tuning on top of the per-session [`ServerConfig`].
#[derive(Clone)]
pub struct EdgeConfig {
    pub session: ServerConfig,
    /// Ceiling on simultaneous sessions; accepts block at the ceiling.
    pub max_connections: usize,
    /// Expect a PROXY protocol v1/v2 header ahead of each session.
    pub proxy_protocol: bool,
    /// Resolve the peer's PTR record for trace metadata.
    pub ptr_lookup: bool,
    /// How long draining sessions get after shutdown before they are
    /// told to stop with a 421.
    pub shutdown_grace: Duration,
}

impl EdgeConfig {
    #[must_use]
    pub fn new(session: ServerConfig) -> Self {
        Self {
            session,
            max_connections: 256,
            proxy_protocol: false,
            ptr_lookup: true,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// An SMTP reception edge bound to one or more sockets.
pub struct SmtpEdge {
    listeners: Vec<TcpListener>,
    queue: Arc<Queue>,
    config: EdgeConfig,
    validators: ValidatorFactory,
}

impl SmtpEdge {
    /// Bind every address (typically one IPv4 and one IPv6) and wire the
    /// edge to a queue.
    pub async fn bind(
        addrs: &[SocketAddr],
        queue: Arc<Queue>,
        config: EdgeConfig,
    ) -> std::io::Result<Self> {
        let mut listeners = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let listener = TcpListener::bind(addr).await?;
            info!(addr = %listener.local_addr()?, "edge listening");
            listeners.push(listener);
        }
        Ok(Self {
            listeners,
            queue,
            config,
            validators: Arc::new(|| Box::new(NullValidators) as Box<dyn SmtpValidators>),
        })
    }

    /// Install the validator factory; one validator instance is created
    /// per session and lives for that session.
    #[must_use]
    pub fn with_validators(mut self, factory: ValidatorFactory) -> Self {
        self.validators = factory;
        self
    }

    /// The bound addresses, useful when binding to port 0.
    pub fn local_addrs(&self) -> std::io::Result<Vec<SocketAddr>> {
        self.listeners.iter().map(TcpListener::local_addr).collect()
    }

    /// Serve until `shutdown` flips true, then drain: accepts stop at
    /// once, in-flight sessions get the grace period, and whatever is
    /// left is told to stop with a 421.
    pub async fn serve(self, shutdown: watch::Receiver<bool>) {
        let session_config = Arc::new(self.config.session.clone());
        let semaphore = Arc::new(Semaphore::new(self.config.max_connections.max(1)));
        let (kill_tx, kill_rx) = watch::channel(false);
        let resolver = if self.config.ptr_lookup {
            ptr::build_resolver()
        } else {
            None
        };

        let mut accept_loops = JoinSet::new();
        for listener in self.listeners {
            let shared = SharedEdge {
                queue: Arc::clone(&self.queue),
                session_config: Arc::clone(&session_config),
                validators: Arc::clone(&self.validators),
                semaphore: Arc::clone(&semaphore),
                resolver: resolver.clone(),
                proxy_protocol: self.config.proxy_protocol,
                hostname: self.config.session.hostname.clone(),
            };
            accept_loops.spawn(accept_loop(
                listener,
                shared,
                shutdown.clone(),
                kill_rx.clone(),
            ));
        }

        let mut shutdown = shutdown;
        wait_true(&mut shutdown).await;
        info!("edge shutting down, draining sessions");

        let grace = tokio::time::sleep(self.config.shutdown_grace);
        tokio::pin!(grace);
        let mut killed = false;
        loop {
            tokio::select! {
                joined = accept_loops.join_next() => {
                    if joined.is_none() {
                        break;
                    }
                }
                () = &mut grace, if !killed => {
                    debug!("shutdown grace expired, stopping remaining sessions");
                    killed = true;
                    let _ = kill_tx.send(true);
                }
            }
        }
    }
}

struct SharedEdge {
    queue: Arc<Queue>,
    session_config: Arc<ServerConfig>,
    validators: ValidatorFactory,
    semaphore: Arc<Semaphore>,
    resolver: Option<TokioResolver>,
    proxy_protocol: bool,
    hostname: String,
}

async fn accept_loop(
    listener: TcpListener,
    shared: SharedEdge,
    mut shutdown: watch::Receiver<bool>,
    kill: watch::Receiver<bool>,
) {
    let mut sessions = JoinSet::new();
    loop {
        // Taking the permit before accept() means a saturated edge stops
        // accepting instead of dropping connections bannerless.
        let permit = tokio::select! {
            () = wait_true(&mut shutdown) => break,
            permit = Arc::clone(&shared.semaphore).acquire_owned() => {
                match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                }
            }
        };

        let accepted = tokio::select! {
            () = wait_true(&mut shutdown) => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                warn!(error = %err, "accept failed");
                continue;
            }
        };

        let session_kill = kill.clone();
        let queue = Arc::clone(&shared.queue);
        let config = Arc::clone(&shared.session_config);
        let validators = (shared.validators)();
        let resolver = shared.resolver.clone();
        let proxy_protocol = shared.proxy_protocol;
        let hostname = shared.hostname.clone();

        sessions.spawn(async move {
            let _permit = permit;
            if let Err(err) = run_session(
                stream,
                peer,
                queue,
                config,
                validators,
                resolver,
                proxy_protocol,
                hostname,
                session_kill,
            )
            .await
            {
                debug!(%peer, error = %err, "session ended with error");
            }
        });

        while sessions.try_join_next().is_some() {}
    }

    // Accepts have stopped; wait for the sessions to drain (they end on
    // their own or when the kill signal flips them to 421).
    while sessions.join_next().await.is_some() {}
}

#[allow(clippy::too_many_arguments)]
async fn run_session(
    mut stream: TcpStream,
    socket_peer: SocketAddr,
    queue: Arc<Queue>,
    config: Arc<ServerConfig>,
    validators: Box<dyn SmtpValidators>,
    resolver: Option<TokioResolver>,
    proxy_protocol: bool,
    hostname: String,
    kill: watch::Receiver<bool>,
) -> Result<(), postrider_smtp::SmtpError> {
    let peer = if proxy_protocol {
        match proxy::read_proxy_header(&mut stream).await {
            Ok(Some(real_peer)) => real_peer,
            Ok(None) => socket_peer,
            Err(err) => {
                warn!(%socket_peer, error = %err, "dropping connection with bad proxy header");
                return Ok(());
            }
        }
    } else {
        socket_peer
    };

    debug!(%peer, "session starting");
    let session = EdgeSession {
        queue,
        hostname,
        validators,
        resolver,
        peer,
        ptr: None,
        envelope: None,
        ehlo_as: None,
        extended: false,
        security: Security::None,
        auth: None,
    };
    Server::new(stream, peer, config, session).run_until(kill).await
}

/// Per-session protocol handler: tracks session facts, assembles the
/// envelope, and enqueues on end-of-data, delegating every decision
/// point to the validators.
struct EdgeSession {
    queue: Arc<Queue>,
    hostname: String,
    validators: Box<dyn SmtpValidators>,
    resolver: Option<TokioResolver>,
    peer: SocketAddr,
    ptr: Option<PtrLookup>,
    envelope: Option<Envelope>,
    ehlo_as: Option<String>,
    extended: bool,
    security: Security,
    auth: Option<String>,
}

#[async_trait]
impl SmtpHandlers for EdgeSession {
    async fn handle_banner(&mut self, reply: &mut Reply, peer: SocketAddr) {
        self.ptr = Some(PtrLookup::start(self.resolver.clone(), self.peer.ip()));
        self.validators.handle_banner(reply, peer).await;
    }

    async fn handle_ehlo(&mut self, reply: &mut Reply, ehlo_as: &str) {
        self.validators.handle_ehlo(reply, ehlo_as).await;
        if reply.code() == 250 {
            self.ehlo_as = Some(ehlo_as.to_owned());
            self.extended = true;
            self.envelope = None;
        }
    }

    async fn handle_helo(&mut self, reply: &mut Reply, helo_as: &str) {
        self.validators.handle_helo(reply, helo_as).await;
        if reply.code() == 250 {
            self.ehlo_as = Some(helo_as.to_owned());
            self.extended = false;
            self.envelope = None;
        }
    }

    async fn handle_tls(&mut self) {
        self.security = Security::Tls;
        self.ehlo_as = None;
        self.envelope = None;
        self.validators.handle_tls().await;
    }

    async fn handle_auth(&mut self, reply: &mut Reply, authcid: &str) {
        self.validators.handle_auth(reply, authcid).await;
        if reply.code() == 235 {
            self.auth = Some(authcid.to_owned());
        }
    }

    async fn handle_mail(
        &mut self,
        reply: &mut Reply,
        sender: Option<&Mailbox>,
        params: &MailParams,
    ) {
        self.validators.handle_mail(reply, sender, params).await;
        if reply.code() == 250 {
            self.envelope = Some(Envelope::new(sender.cloned()));
        }
    }

    async fn handle_rcpt(&mut self, reply: &mut Reply, recipient: &Mailbox, params: &MailParams) {
        self.validators.handle_rcpt(reply, recipient, params).await;
        if reply.code() == 250 {
            if let Some(envelope) = self.envelope.as_mut() {
                envelope.recipients.push(recipient.clone());
            }
        }
    }

    async fn handle_data(&mut self, reply: &mut Reply) {
        self.validators.handle_data(reply).await;
    }

    async fn handle_have_data(&mut self, reply: &mut Reply, data: &[u8]) {
        self.validators.handle_have_data(reply, data).await;
        if reply.code() != 250 {
            self.envelope = None;
            return;
        }
        let Some(mut envelope) = self.envelope.take() else {
            reply.copy_from(&Reply::bad_sequence());
            return;
        };

        let reverse_name = match self.ptr.take() {
            Some(ptr) => ptr.finish().await,
            None => None,
        };
        envelope.client = ClientInfo {
            ip: Some(self.peer.ip()),
            host: reverse_name,
            name: self.ehlo_as.clone(),
            auth: self.auth.clone(),
            security: self.security,
            extended: self.extended,
        };
        envelope.receiver = Some(self.hostname.clone());
        envelope.timestamp = Some(Utc::now());
        envelope.parse_message(data);

        match self.queue.enqueue(envelope).await {
            Ok(results) => {
                match results.first().map(|r| &r.result) {
                    Some(Ok(id)) => {
                        reply.set_text(format!("2.6.0 Ok: queued as {id}"));
                    }
                    Some(Err(err)) => reply.copy_from(&err.reply()),
                    None => reply.copy_from(&Reply::new(451, "4.3.0 Error queuing message")),
                }
                self.validators.handle_queued(reply, &results).await;
            }
            Err(err) => {
                reply.copy_from(&err.reply());
                self.validators.handle_queued(reply, &[]).await;
            }
        }
    }

    async fn handle_rset(&mut self) {
        self.envelope = None;
        self.validators.handle_rset().await;
    }
}

async fn wait_true(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
