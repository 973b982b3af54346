//! Scripted node for integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use ew_client::transport::{Outbound, Socket, SocketPeer, Transport};
use ew_client::{AuthParams, ClientConfig, ProtocolClient, TransportError};
use ew_core::config::ReconnectConfig;
use ew_core::store::MemoryStore;
use ew_core::{Address, KeyManager};
use ew_protocol::{encode_error, encode_response, RequestFrame, PUSH_REQUEST_ID};

/// How long a test waits for the client before failing
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Hands every opened socket's far end to the test
pub struct MockTransport {
    nodes: mpsc::UnboundedSender<MockNode>,
    opens: AtomicUsize,
    refuse: AtomicBool,
}

impl MockTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockNode>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                nodes: tx,
                opens: AtomicUsize::new(0),
                refuse: AtomicBool::new(false),
            }),
            rx,
        )
    }

    /// Fail every subsequent open
    pub fn refuse_connections(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }

    /// Number of open attempts so far
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, _url: &str) -> Result<Socket, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("connection refused".into()));
        }

        let (socket, peer) = Socket::pair();
        let _ = self.nodes.send(MockNode { peer });
        Ok(socket)
    }
}

/// Node side of one socket
pub struct MockNode {
    pub peer: SocketPeer,
}

impl MockNode {
    /// Next request the client wrote
    pub async fn next_request(&mut self) -> RequestFrame {
        match tokio::time::timeout(STEP_TIMEOUT, self.peer.recv()).await {
            Ok(Some(Outbound::Text(text))) => RequestFrame::decode(&text).unwrap(),
            Ok(other) => panic!("expected a request, got {:?}", other),
            Err(_) => panic!("no request within {:?}", STEP_TIMEOUT),
        }
    }

    /// Next thing the client wrote, request or close
    pub async fn next_outbound(&mut self) -> Option<Outbound> {
        tokio::time::timeout(STEP_TIMEOUT, self.peer.recv())
            .await
            .unwrap_or(None)
    }

    /// Whether the client wrote anything not yet read
    pub fn has_unread(&mut self) -> bool {
        self.peer.try_recv().is_some()
    }

    pub async fn respond(&self, request: &RequestFrame, method: &str, result: Value) {
        self.peer
            .send_text(encode_response(request.id, method, vec![result], 1))
            .await;
    }

    pub async fn respond_to(&self, id: u64, method: &str, result: Value) {
        self.peer
            .send_text(encode_response(id, method, vec![result], 1))
            .await;
    }

    pub async fn error(&self, request: &RequestFrame, code: &str, message: &str) {
        self.peer
            .send_text(encode_error(request.id, code, message, 1))
            .await;
    }

    pub async fn push(&self, method: &str, payload: Value) {
        self.peer
            .send_text(encode_response(PUSH_REQUEST_ID, method, vec![payload], 1))
            .await;
    }

    pub async fn drop_connection(&self) {
        self.peer.close(Some("node restart".into())).await;
    }

    /// Answer the full challenge handshake
    pub async fn accept_challenge_auth(&mut self) {
        let request = self.next_request().await;
        assert_eq!(request.method, "auth_request");
        self.respond(
            &request,
            "auth_challenge",
            json!({"challenge_message": "challenge-1"}),
        )
        .await;

        let verify = self.next_request().await;
        assert_eq!(verify.method, "auth_verify");
        self.respond(
            &verify,
            "auth_verify",
            json!({"success": true, "jwt_token": "jwt-1"}),
        )
        .await;
    }
}

/// Route client logs to the test output; `RUST_LOG=ew_client=debug` shows
/// the frame flow of a failing test
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Everything a test needs around one client
pub struct Harness {
    pub client: ProtocolClient,
    pub transport: Arc<MockTransport>,
    pub nodes: mpsc::UnboundedReceiver<MockNode>,
    pub store: Arc<MemoryStore>,
    pub wallet: KeyManager,
    pub session: KeyManager,
}

impl Harness {
    pub fn new(config: ClientConfig) -> Self {
        init_tracing();
        let (transport, nodes) = MockTransport::new();
        let store = Arc::new(MemoryStore::new());
        let wallet = KeyManager::generate();
        let session = KeyManager::generate();
        let client = ProtocolClient::new(config, transport.clone(), session.signer(), store.clone());

        Self {
            client,
            transport,
            nodes,
            store,
            wallet,
            session,
        }
    }

    pub fn auth_params(&self) -> AuthParams {
        AuthParams {
            wallet: self.wallet.signer(),
            application: Address::from_bytes([0xaa; 20]),
            app_name: "event-wallet".into(),
            scope: "app.event-wallet".into(),
            domain_name: "event-wallet".into(),
            ttl: Duration::from_secs(3600),
            allowances: vec![],
        }
    }

    /// Next socket the client opened
    pub async fn next_node(&mut self) -> MockNode {
        tokio::time::timeout(STEP_TIMEOUT, self.nodes.recv())
            .await
            .expect("client did not open a socket")
            .expect("transport dropped")
    }

    /// Connect through a full challenge handshake
    pub async fn connect(&mut self) -> MockNode {
        let client = self.client.clone();
        let params = self.auth_params();
        let connect = tokio::spawn(async move { client.connect(params).await });

        let mut node = self.next_node().await;
        node.accept_challenge_auth().await;
        connect.await.unwrap().unwrap();
        node
    }
}

pub fn test_config() -> ClientConfig {
    ClientConfig {
        url: "ws://node.test/ws".into(),
        request_timeout: Duration::from_secs(2),
        auth_timeout: Duration::from_secs(2),
        reconnect: ReconnectConfig {
            enabled: false,
            base_delay: Duration::from_millis(100),
            max_attempts: 5,
        },
    }
}
