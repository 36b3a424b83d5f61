//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mxlink::protocol::{
    decode, encode, read_channel_token, read_frame, write_channel_token, write_frame, Attribute,
    AttributeInfo, Frame, FrameKind, HandshakeReply, Hello, JsonCodec, Notification, Operation,
    OperationInfo, PayloadCodec, RemoteFault, ResourceInfo, ResourceName, ResponseBody,
    DEFAULT_MAX_FRAME_SIZE, PROTOCOL_VERSION,
};
use mxlink::{
    AuthorizationChecker, BoxedStream, ClientConfig, ConnectionEvent, ConnectionObserver,
    ConnectorServer, Dialer, ManagedResource, ObserverFn, RemoteClient, ResourceRegistry,
    ServerConfig,
};
use serde_json::{json, Value};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

pub fn r1() -> ResourceName {
    ResourceName::parse("test:name=R1").unwrap()
}

/// Installs a test-captured subscriber once; filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Polls `check` until it holds or `limit` elapses.
pub async fn eventually<F>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Runs `fut` with a generous upper bound so a hang fails the test.
pub async fn bounded<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("operation did not finish in time")
}

// ════════════════════════════════════════════════════════════════════
// Counter resource
// ════════════════════════════════════════════════════════════════════

/// Resource that counts every call reaching it.
#[derive(Default)]
pub struct Counter {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub invocations: AtomicU64,
    pub value: Mutex<Value>,
    /// Labels of completed `slow` invocations, in completion order.
    pub completed: Mutex<Vec<String>>,
}

impl Counter {
    pub fn touched(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
            + self.writes.load(Ordering::SeqCst)
            + self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ManagedResource for Counter {
    fn info(&self) -> ResourceInfo {
        ResourceInfo {
            class_name: "Counter".into(),
            description: "Test counter".into(),
            attributes: vec![AttributeInfo {
                name: "Count".into(),
                type_name: "int".into(),
                readable: true,
                writable: true,
                description: String::new(),
            }],
            operations: vec![
                OperationInfo {
                    name: "op".into(),
                    signature: Vec::new(),
                    return_type: "object".into(),
                    description: String::new(),
                },
                OperationInfo {
                    name: "slow".into(),
                    signature: vec!["long".into(), "string".into()],
                    return_type: "string".into(),
                    description: String::new(),
                },
            ],
            notifications: vec!["job".into()],
        }
    }

    async fn get_attribute(&self, name: &str) -> anyhow::Result<Value> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        match name {
            "Count" => Ok(self.value.lock().unwrap().clone()),
            other => Err(RemoteFault::not_found(format!("attribute '{}'", other)).into()),
        }
    }

    async fn set_attribute(&self, attribute: &Attribute) -> anyhow::Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        anyhow::ensure!(attribute.name == "Count", "unknown attribute {}", attribute.name);
        *self.value.lock().unwrap() = attribute.value.clone();
        Ok(())
    }

    async fn invoke(
        &self,
        operation: &str,
        params: &[Value],
        _signature: &[String],
    ) -> anyhow::Result<Value> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        match operation {
            "op" => Ok(json!({ "echo": params })),
            "slow" => {
                let millis = params.first().and_then(Value::as_u64).unwrap_or(0);
                let label = params
                    .get(1)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                tokio::time::sleep(Duration::from_millis(millis)).await;
                self.completed.lock().unwrap().push(label.clone());
                Ok(Value::String(label))
            }
            other => Err(RemoteFault::invalid_argument(format!("no operation '{}'", other)).into()),
        }
    }
}

// ════════════════════════════════════════════════════════════════════
// Real server fixture
// ════════════════════════════════════════════════════════════════════

pub struct Fixture {
    pub server: ConnectorServer,
    pub address: String,
    pub resources: ResourceRegistry,
    pub counter: Arc<Counter>,
}

impl Fixture {
    pub async fn start(checker: impl AuthorizationChecker) -> Self {
        let builder =
            ConnectorServer::builder(ServerConfig::default()).with_authorization(checker);
        Self::start_with(builder).await
    }

    pub async fn start_with(builder: mxlink::ConnectorServerBuilder) -> Self {
        init_tracing();
        let resources = ResourceRegistry::default();
        let counter = Arc::new(Counter::default());
        resources.register(r1(), counter.clone()).unwrap();
        let server = builder.with_resources(resources.clone()).build();
        let address = server.start().await.unwrap().to_string();
        Self {
            server,
            address,
            resources,
            counter,
        }
    }

    pub fn client(&self) -> RemoteClient {
        self.client_with(ClientConfig::default())
    }

    pub fn client_with(&self, config: ClientConfig) -> RemoteClient {
        RemoteClient::tcp(self.address.clone(), config)
    }
}

// ════════════════════════════════════════════════════════════════════
// Lifecycle recorder
// ════════════════════════════════════════════════════════════════════

pub type EventLog = Arc<Mutex<Vec<String>>>;

pub fn recorder() -> (EventLog, Arc<dyn ConnectionObserver>) {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    let observer = Arc::new(ObserverFn(move |event: &ConnectionEvent| {
        let entry = match event {
            ConnectionEvent::Opened { .. } => "opened",
            ConnectionEvent::Closed { .. } => "closed",
            ConnectionEvent::Failed { .. } => "failed",
        };
        sink.lock().unwrap().push(entry.to_string());
    }));
    (log, observer)
}

pub fn events(log: &EventLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

// ════════════════════════════════════════════════════════════════════
// Scripted peer over an in-memory duplex stream
// ════════════════════════════════════════════════════════════════════

/// Dialer handing the far end of every dialed duplex stream to the test.
pub struct DuplexDialer {
    peers: mpsc::UnboundedSender<DuplexStream>,
    pub dials: AtomicUsize,
    delay: Duration,
}

impl DuplexDialer {
    pub fn new(delay: Duration) -> (Arc<Self>, mpsc::UnboundedReceiver<DuplexStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dialer = Arc::new(Self {
            peers: tx,
            dials: AtomicUsize::new(0),
            delay,
        });
        (dialer, rx)
    }
}

#[async_trait]
impl Dialer for DuplexDialer {
    async fn dial(&self) -> io::Result<BoxedStream> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let (near, far) = tokio::io::duplex(64 * 1024);
        self.peers
            .send(far)
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "no peer listening"))?;
        Ok(Box::new(near))
    }

    fn endpoint(&self) -> String {
        "duplex".to_string()
    }
}

/// Hand-driven server end of a connection.
pub struct ScriptedPeer {
    reader: ReadHalf<DuplexStream>,
    writer: WriteHalf<DuplexStream>,
    pub hello: Hello,
}

impl ScriptedPeer {
    /// Reads the token and hello, and welcomes the client as `connection_id`.
    pub async fn accept(stream: DuplexStream, connection_id: &str) -> Self {
        let (mut reader, mut writer) = tokio::io::split(stream);
        read_channel_token(&mut reader).await.unwrap();
        let frame = read_frame(&mut reader, DEFAULT_MAX_FRAME_SIZE).await.unwrap();
        assert_eq!(frame.kind, FrameKind::Handshake);
        let hello: Hello = decode(&JsonCodec, &frame.payload).unwrap();

        let reply = HandshakeReply::Welcome {
            connection_id: connection_id.to_string(),
            version: PROTOCOL_VERSION.to_string(),
            principal: None,
            max_frame_size: None,
        };
        let payload = encode(&JsonCodec, &reply).unwrap();
        write_frame(&mut writer, &Frame::new(FrameKind::Handshake, 0, payload))
            .await
            .unwrap();
        Self {
            reader,
            writer,
            hello,
        }
    }

    /// Next request frame, as `(correlation id, operation)`.
    pub async fn next_request(&mut self) -> (u64, Operation) {
        let frame = read_frame(&mut self.reader, DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap();
        assert_eq!(frame.kind, FrameKind::Request);
        (frame.id, decode(&JsonCodec, &frame.payload).unwrap())
    }

    pub async fn respond(&mut self, id: u64, body: ResponseBody) {
        let payload = encode(&JsonCodec, &body).unwrap();
        write_frame(&mut self.writer, &Frame::response(id, payload))
            .await
            .unwrap();
    }

    pub async fn respond_ok(&mut self, id: u64, result: Value) {
        self.respond(id, ResponseBody::ok(result)).await
    }

    pub async fn notify(&mut self, listener_id: u64, notification: &Notification) {
        let payload = encode(&JsonCodec, notification).unwrap();
        write_frame(&mut self.writer, &Frame::notification(listener_id, payload))
            .await
            .unwrap();
    }

    pub async fn send_raw(&mut self, frame: Frame) {
        write_frame(&mut self.writer, &frame).await.unwrap();
    }
}

/// Client over a [`DuplexDialer`].
pub fn scripted_client(
    delay: Duration,
    config: ClientConfig,
) -> (
    RemoteClient,
    Arc<DuplexDialer>,
    mpsc::UnboundedReceiver<DuplexStream>,
) {
    init_tracing();
    let (dialer, peers) = DuplexDialer::new(delay);
    let client = RemoteClient::with_dialer(dialer.clone(), config);
    (client, dialer, peers)
}

/// Connects `client` while accepting the next peer stream.
pub async fn connect_scripted(
    client: &RemoteClient,
    peers: &mut mpsc::UnboundedReceiver<DuplexStream>,
    connection_id: &str,
) -> ScriptedPeer {
    let (connected, peer) = tokio::join!(client.connect(), async {
        let stream = peers.recv().await.unwrap();
        ScriptedPeer::accept(stream, connection_id).await
    });
    connected.unwrap();
    peer
}

/// Hand-written client handshake over TCP; returns the granted identity
/// and the open stream.
pub async fn raw_handshake(address: &str, resume_id: Option<&str>) -> (String, TcpStream) {
    let mut stream = TcpStream::connect(address).await.unwrap();
    write_channel_token(&mut stream).await.unwrap();
    let mut hello = Hello::new(JsonCodec.name());
    hello.resume_id = resume_id.map(str::to_string);
    let payload = encode(&JsonCodec, &hello).unwrap();
    write_frame(&mut stream, &Frame::new(FrameKind::Handshake, 0, payload))
        .await
        .unwrap();
    let reply = read_frame(&mut stream, DEFAULT_MAX_FRAME_SIZE).await.unwrap();
    match decode(&JsonCodec, &reply.payload).unwrap() {
        HandshakeReply::Welcome { connection_id, .. } => (connection_id, stream),
        other => panic!("handshake rejected: {:?}", other),
    }
}
