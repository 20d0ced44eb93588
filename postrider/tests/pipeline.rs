//! End-to-end tests of the reception → queue → delivery pipeline over
//! real sockets: an SMTP edge feeding a memory-backed queue whose relay
//! is scripted.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use postrider::edge::{EdgeConfig, SmtpEdge};
use postrider::queue::storage::{QueueId, QueueMetadata, QueueStorage, StorageError};
use postrider::queue::{MemoryStorage, Queue};
use postrider::relay::{DeliveryResult, RecipientStatus, Relay, RelayError};
use postrider::smtp::{ClientConfig, ServerConfig, SmtpClient};
use postrider::{Envelope, Reply};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;

/// Relay that answers per recipient address: `dead@...` gets 550,
/// `busy@...` gets 421, everyone else 250. Records what it delivered.
#[derive(Debug, Default)]
struct AddressScriptedRelay {
    seen: Mutex<Vec<Envelope>>,
}

impl AddressScriptedRelay {
    fn seen(&self) -> Vec<Envelope> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Relay for AddressScriptedRelay {
    async fn attempt(
        &self,
        envelope: &Envelope,
        _attempts: u32,
    ) -> Result<DeliveryResult, RelayError> {
        self.seen.lock().unwrap().push(envelope.clone());
        let statuses = envelope
            .recipients
            .iter()
            .map(|rcpt| {
                if rcpt.local_part() == "dead" {
                    RecipientStatus::Permanent(Reply::new(550, "5.1.1 No such user"))
                } else if rcpt.local_part() == "busy" {
                    RecipientStatus::Transient(Reply::new(421, "4.3.2 Try later"))
                } else {
                    RecipientStatus::Delivered(Reply::new(250, "2.0.0 Ok"))
                }
            })
            .collect();
        Ok(DeliveryResult { statuses })
    }
}

/// Storage whose writes always fail, as if the disk were gone.
#[derive(Debug)]
struct BrokenStorage;

#[async_trait]
impl QueueStorage for BrokenStorage {
    async fn write(
        &self,
        _envelope: &Envelope,
        _metadata: &QueueMetadata,
    ) -> Result<QueueId, StorageError> {
        Err(StorageError::Io(std::io::Error::other("storage offline")))
    }

    async fn set_recipients_delivered(
        &self,
        _id: &QueueId,
        _indexes: &[usize],
    ) -> Result<(), StorageError> {
        Err(StorageError::Io(std::io::Error::other("storage offline")))
    }

    async fn load_all(&self) -> Result<Vec<(QueueId, QueueMetadata)>, StorageError> {
        Ok(Vec::new())
    }

    async fn get(&self, id: &QueueId) -> Result<(Envelope, QueueMetadata), StorageError> {
        Err(StorageError::NotFound(id.clone()))
    }

    async fn write_metadata(
        &self,
        _id: &QueueId,
        _metadata: &QueueMetadata,
    ) -> Result<(), StorageError> {
        Err(StorageError::Io(std::io::Error::other("storage offline")))
    }

    async fn remove(&self, _id: &QueueId) -> Result<(), StorageError> {
        Ok(())
    }
}

struct Harness {
    addr: SocketAddr,
    relay: Arc<AddressScriptedRelay>,
    storage: Arc<MemoryStorage>,
    queue: Arc<Queue>,
    _shutdown: watch::Sender<bool>,
}

async fn start_edge_with_storage(storage: Arc<dyn QueueStorage>) -> (SocketAddr, Arc<Queue>, Arc<AddressScriptedRelay>, watch::Sender<bool>) {
    let relay = Arc::new(AddressScriptedRelay::default());
    let queue = Arc::new(
        Queue::builder(storage)
            .relay(relay.clone())
            .backoff(Box::new(|_, _| None))
            .start()
            .await
            .unwrap(),
    );

    let mut config = EdgeConfig::new(ServerConfig::new("edge.test.example"));
    config.ptr_lookup = false;
    config.session.max_size = Some(1_048_576);

    let edge = SmtpEdge::bind(&["127.0.0.1:0".parse().unwrap()], queue.clone(), config)
        .await
        .unwrap();
    let addr = edge.local_addrs().unwrap()[0];

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(edge.serve(shutdown_rx));
    (addr, queue, relay, shutdown_tx)
}

async fn start_harness() -> Harness {
    let storage = Arc::new(MemoryStorage::new());
    let (addr, queue, relay, shutdown) =
        start_edge_with_storage(storage.clone() as Arc<dyn QueueStorage>).await;
    Harness {
        addr,
        relay,
        storage,
        queue,
        _shutdown: shutdown,
    }
}

struct Chat {
    reader: BufReader<ReadHalf<TcpStream>>,
    writer: WriteHalf<TcpStream>,
}

impl Chat {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\r\n").await.unwrap();
    }

    /// Read one complete (possibly multi-line) reply; returns the code
    /// and the final line's text.
    async fn reply(&mut self) -> (u16, String) {
        loop {
            let mut line = String::new();
            self.reader.read_line(&mut line).await.unwrap();
            let line = line.trim_end().to_owned();
            assert!(line.len() >= 3, "short reply line: {line:?}");
            let code: u16 = line[..3].parse().unwrap();
            if line.as_bytes().get(3) != Some(&b'-') {
                return (code, line.get(4..).unwrap_or("").to_owned());
            }
        }
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within five seconds");
}

#[tokio::test]
async fn accepted_message_is_delivered_exactly_once() {
    let harness = start_harness().await;
    let mut chat = Chat::connect(harness.addr).await;

    let (code, _) = chat.reply().await;
    assert_eq!(code, 220);

    chat.send("EHLO c.example").await;
    assert_eq!(chat.reply().await.0, 250);
    chat.send("MAIL FROM:<a@c.example>").await;
    assert_eq!(chat.reply().await.0, 250);
    chat.send("RCPT TO:<b@s.example>").await;
    assert_eq!(chat.reply().await.0, 250);
    chat.send("DATA").await;
    assert_eq!(chat.reply().await.0, 354);
    chat.send("Subject: hi\r\n\r\nhi\r\n.").await;
    let (code, text) = chat.reply().await;
    assert_eq!(code, 250);
    assert!(text.contains("queued as"), "no queue id in: {text}");
    chat.send("QUIT").await;
    assert_eq!(chat.reply().await.0, 221);

    wait_for(|| harness.storage.is_empty()).await;
    let seen = harness.relay.seen();
    assert_eq!(seen.len(), 1, "expected exactly one delivery, no bounce");
    assert_eq!(seen[0].sender.as_ref().unwrap().as_str(), "a@c.example");
    assert_eq!(seen[0].recipients[0].as_str(), "b@s.example");
    assert_eq!(seen[0].header("Subject"), Some("hi"));
    harness.queue.shutdown().await;
}

#[tokio::test]
async fn permanent_failure_bounces_to_the_sender() {
    let harness = start_harness().await;
    let mut chat = Chat::connect(harness.addr).await;
    chat.reply().await;

    chat.send("EHLO c.example").await;
    chat.reply().await;
    chat.send("MAIL FROM:<a@c.example>").await;
    chat.reply().await;
    chat.send("RCPT TO:<dead@s.example>").await;
    chat.reply().await;
    chat.send("DATA").await;
    chat.reply().await;
    chat.send("Subject: doomed\r\n\r\nbody\r\n.").await;
    assert_eq!(chat.reply().await.0, 250);
    chat.send("QUIT").await;
    chat.reply().await;

    // First the failing delivery, then the bounce delivery.
    wait_for(|| harness.relay.seen().len() == 2).await;
    let seen = harness.relay.seen();
    let bounce = &seen[1];
    assert!(bounce.sender.is_none());
    assert_eq!(bounce.recipients[0].as_str(), "a@c.example");
    let body = String::from_utf8_lossy(&bounce.body);
    assert!(body.contains("550 5.1.1 No such user"));
    assert!(body.contains("Subject: doomed"));

    wait_for(|| harness.storage.is_empty()).await;
    harness.queue.shutdown().await;
}

#[tokio::test]
async fn pipelined_transaction_with_one_bad_recipient() {
    let harness = start_harness().await;
    let mut chat = Chat::connect(harness.addr).await;
    chat.reply().await;
    chat.send("EHLO c.example").await;
    chat.reply().await;

    // Pipelined: all commands first, then read the replies in order.
    chat.send("MAIL FROM:<a@c.example>").await;
    chat.send("RCPT TO:<good@s.example>").await;
    chat.send("RCPT TO:<dead@s.example>").await;
    chat.send("DATA").await;
    assert_eq!(chat.reply().await.0, 250); // MAIL
    assert_eq!(chat.reply().await.0, 250); // RCPT good
    assert_eq!(chat.reply().await.0, 250); // RCPT dead (server can't know yet)
    assert_eq!(chat.reply().await.0, 354); // DATA
    chat.send("Subject: split\r\n\r\nbody\r\n.").await;
    assert_eq!(chat.reply().await.0, 250);
    chat.send("QUIT").await;
    chat.reply().await;

    // One delivery with both recipients, then a bounce for the dead one.
    wait_for(|| harness.relay.seen().len() == 2).await;
    let seen = harness.relay.seen();
    assert_eq!(seen[0].recipients.len(), 2);
    let bounce = &seen[1];
    assert!(bounce.sender.is_none());
    let body = String::from_utf8_lossy(&bounce.body);
    assert!(body.contains("Final-Recipient: rfc822; dead@s.example"));
    assert!(!body.contains("Final-Recipient: rfc822; good@s.example"));

    wait_for(|| harness.storage.is_empty()).await;
    harness.queue.shutdown().await;
}

#[tokio::test]
async fn broken_storage_yields_451_and_no_record() {
    let (addr, queue, relay, _shutdown) =
        start_edge_with_storage(Arc::new(BrokenStorage) as Arc<dyn QueueStorage>).await;
    let mut chat = Chat::connect(addr).await;
    chat.reply().await;

    chat.send("EHLO c.example").await;
    chat.reply().await;
    chat.send("MAIL FROM:<a@c.example>").await;
    chat.reply().await;
    chat.send("RCPT TO:<b@s.example>").await;
    chat.reply().await;
    chat.send("DATA").await;
    assert_eq!(chat.reply().await.0, 354);
    chat.send("body\r\n.").await;
    let (code, _) = chat.reply().await;
    assert_eq!(code, 451);
    chat.send("QUIT").await;
    chat.reply().await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(relay.seen().is_empty(), "nothing should have been delivered");
    queue.shutdown().await;
}

#[tokio::test]
async fn own_client_delivers_through_own_edge() {
    let harness = start_harness().await;

    let config = ClientConfig::new("relay.test.example");
    let mut client = SmtpClient::connect("127.0.0.1", harness.addr.port(), &config)
        .await
        .unwrap();
    assert!(client.pipelining(), "edge should advertise PIPELINING");

    let mut envelope = Envelope::new(Some(
        postrider::Mailbox::parse("from@here.example").unwrap(),
    ));
    envelope.recipients = vec![
        postrider::Mailbox::parse("ok@there.example").unwrap(),
        postrider::Mailbox::parse("also@there.example").unwrap(),
    ];
    envelope.append_header("Subject", "client to edge");
    envelope.body = b"round and round\r\n".to_vec();

    let replies = client.deliver(&envelope).await.unwrap();
    assert_eq!(replies.len(), 2);
    assert!(replies.iter().all(Reply::is_success));
    client.quit().await;

    wait_for(|| harness.relay.seen().len() == 1).await;
    let delivered = &harness.relay.seen()[0];
    assert_eq!(delivered.recipients.len(), 2);
    assert_eq!(delivered.header("Subject"), Some("client to edge"));
    assert_eq!(delivered.body, b"round and round\r\n");
    harness.queue.shutdown().await;
}

#[tokio::test]
async fn oversized_message_is_rejected_at_the_edge() {
    let storage = Arc::new(MemoryStorage::new());
    let relay = Arc::new(AddressScriptedRelay::default());
    let queue = Arc::new(
        Queue::builder(storage.clone() as Arc<dyn QueueStorage>)
            .relay(relay.clone())
            .start()
            .await
            .unwrap(),
    );
    let mut config = EdgeConfig::new(ServerConfig::new("edge.test.example"));
    config.ptr_lookup = false;
    config.session.max_size = Some(64);
    let edge = SmtpEdge::bind(&["127.0.0.1:0".parse().unwrap()], queue.clone(), config)
        .await
        .unwrap();
    let addr = edge.local_addrs().unwrap()[0];
    let (_shutdown, rx) = watch::channel(false);
    tokio::spawn(edge.serve(rx));

    let mut chat = Chat::connect(addr).await;
    let (_, banner) = chat.reply().await;
    assert!(banner.contains("edge.test.example"));

    chat.send("EHLO c.example").await;
    chat.reply().await;
    chat.send("MAIL FROM:<a@c.example>").await;
    chat.reply().await;
    chat.send("RCPT TO:<b@s.example>").await;
    chat.reply().await;
    chat.send("DATA").await;
    assert_eq!(chat.reply().await.0, 354);
    chat.send(&format!("{}\r\n.", "x".repeat(200))).await;
    assert_eq!(chat.reply().await.0, 552);

    // The session survives and the queue never saw the message.
    chat.send("NOOP").await;
    assert_eq!(chat.reply().await.0, 250);
    chat.send("QUIT").await;
    chat.reply().await;
    assert!(storage.is_empty());
    queue.shutdown().await;
}
