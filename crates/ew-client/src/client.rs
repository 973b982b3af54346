//! Protocol client
//!
//! [`ProtocolClient`] is a cheap handle onto a driver task that owns the
//! socket, the connection state machine, the reconnect timer and the
//! correlation table. Handles talk to the driver through commands; state
//! changes go out on a `watch` channel and unsolicited frames on a
//! `broadcast` channel.
//!
//! # State Machine
//!
//! ```text
//! disconnected ──connect()──▶ connecting ──open──▶ authenticating ──ok──▶ connected
//!       ▲                        │    ▲                  │                  │
//!       │                        │    │             rejected                │ drop
//!       │                        │    │                  ▼                  │
//!       │                        │    └──timer── reconnecting ◀── auth_failed
//!       │                        │                  ▲    │                  │
//!       └──── close() / attempts exhausted ─────────┴────┘◀─────────────────┘
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};

use ew_core::config::{ReconnectConfig, WalletConfig};
use ew_core::time::{current_time_millis, MonotonicIds};
use ew_core::traits::{get_json, put_json};
use ew_core::{Address, ConnectionState, KeyError, KeyValueStore, Signer};
use ew_protocol::{InboundFrame, PushMessage, RequestFrame, RpcMethod, RpcResponse};

use crate::auth::{AuthNegotiator, AuthOutcome, AuthParams, AuthToken, AUTH_TOKEN_KEY};
use crate::error::{AuthError, ClientError, TransportError};
use crate::reconnect::LinearBackoff;
use crate::transport::{Socket, SocketEvent, Transport};

/// Capacity of the command channel from handles to the driver
const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Capacity of the push broadcast; slow subscribers see `Lagged`
const PUSH_CHANNEL_CAPACITY: usize = 256;

/// Sign a request frame's canonical bytes and attach the signature
pub async fn sign_request(signer: &dyn Signer, frame: RequestFrame) -> Result<RequestFrame, KeyError> {
    let bytes = frame
        .canonical_bytes()
        .map_err(|e| KeyError::Signing(e.to_string()))?;
    let signature = signer.sign_payload(&bytes).await?;
    Ok(frame.with_signature(signature.to_hex()))
}

/// Connection settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Node endpoint
    pub url: String,
    /// Default deadline for requests
    pub request_timeout: Duration,
    /// Deadline for each handshake round-trip
    pub auth_timeout: Duration,
    pub reconnect: ReconnectConfig,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            request_timeout: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(10),
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn from_wallet_config(config: &WalletConfig) -> Self {
        Self {
            url: config.node_url.clone(),
            request_timeout: config.request_timeout,
            auth_timeout: config.auth_timeout,
            reconnect: config.reconnect.clone(),
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, ClientError>>;

enum Command {
    Connect {
        params: AuthParams,
        reply: Reply<()>,
    },
    Send {
        frame: RequestFrame,
        timeout: Duration,
        reply: Reply<RpcResponse>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Handle onto one node connection
#[derive(Clone)]
pub struct ProtocolClient {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    pushes: broadcast::Sender<PushMessage>,
    signer: Arc<dyn Signer>,
    ids: Arc<MonotonicIds>,
    pending: Arc<AtomicUsize>,
    request_timeout: Duration,
}

impl ProtocolClient {
    /// Create a client and spawn its driver on the current runtime.
    ///
    /// `session` signs every request; `store` holds the cached auth token.
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        session: Arc<dyn Signer>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (push_tx, _) = broadcast::channel(PUSH_CHANNEL_CAPACITY);
        let ids = Arc::new(MonotonicIds::new());
        let pending = Arc::new(AtomicUsize::new(0));

        let driver = Driver {
            negotiator: AuthNegotiator::new(session.clone(), ids.clone(), config.auth_timeout),
            backoff: LinearBackoff::from_config(&config.reconnect),
            config: config.clone(),
            transport,
            store,
            commands: command_rx,
            state: state_tx,
            pushes: push_tx.clone(),
            pending: HashMap::new(),
            pending_count: pending.clone(),
            socket: None,
            attempt: None,
            connect_waiters: Vec::new(),
            auth_params: None,
            reconnect_at: None,
        };
        tokio::spawn(driver.run());

        Self {
            commands: command_tx,
            state: state_rx,
            pushes: push_tx,
            signer: session,
            ids,
            pending,
            request_timeout: config.request_timeout,
        }
    }

    /// Connect and authenticate.
    ///
    /// Returns once the first attempt succeeds or fails; later reconnects
    /// happen in the background. Calling this while connected is a no-op,
    /// and calling it while an attempt is in flight waits for that attempt.
    pub async fn connect(&self, params: AuthParams) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect { params, reply })
            .await
            .map_err(|_| ClientError::ConnectionClosed)?;
        rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Send an already-signed request and wait for its response
    pub async fn send_signed(&self, frame: RequestFrame) -> Result<RpcResponse, ClientError> {
        self.send_signed_with_timeout(frame, self.request_timeout).await
    }

    /// [`send_signed`](Self::send_signed) with an explicit deadline
    pub async fn send_signed_with_timeout(
        &self,
        frame: RequestFrame,
        timeout: Duration,
    ) -> Result<RpcResponse, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Send {
                frame,
                timeout,
                reply,
            })
            .await
            .map_err(|_| ClientError::ConnectionClosed)?;
        rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Build, sign and send a request
    pub async fn send_request(
        &self,
        method: impl Into<String>,
        params: Vec<Value>,
    ) -> Result<RpcResponse, ClientError> {
        let frame = self.signed_frame(method, params).await?;
        self.send_signed(frame).await
    }

    /// Typed call: one parameter object in, first result element out
    pub async fn call<P, R>(&self, method: RpcMethod, params: &P) -> Result<R, ClientError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let response = self
            .send_request(method, vec![serde_json::to_value(params)?])
            .await?;
        Ok(response.first()?)
    }

    /// A fresh request frame signed by the session key
    pub async fn signed_frame(
        &self,
        method: impl Into<String>,
        params: Vec<Value>,
    ) -> Result<RequestFrame, ClientError> {
        let frame = RequestFrame::new(self.ids.next_id(), method, params, current_time_millis());
        Ok(sign_request(self.signer.as_ref(), frame).await?)
    }

    /// Close the connection, cancel reconnects and reject every outstanding request
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Close { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Wait until the client is connected.
    ///
    /// Returns [`ClientError::NotConnected`] once the client settles in
    /// `Disconnected` or `AuthFailed`, or when `timeout` passes while a
    /// connect or reconnect is still in progress.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), ClientError> {
        let mut states = self.state.clone();
        let settled = tokio::time::timeout(
            timeout,
            states.wait_for(|state| {
                matches!(
                    state,
                    ConnectionState::Connected
                        | ConnectionState::Disconnected
                        | ConnectionState::AuthFailed
                )
            }),
        )
        .await;

        match settled {
            Ok(Ok(state)) if state.is_connected() => Ok(()),
            Ok(Ok(state)) => {
                tracing::debug!(state = %*state, "Not connected");
                Err(ClientError::NotConnected)
            }
            // Driver gone
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                tracing::debug!("Still not connected after {:?}", timeout);
                Err(ClientError::NotConnected)
            }
        }
    }

    /// Deadline applied to requests sent without an explicit one
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Observe connection state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Observe unsolicited frames; dropping the receiver unsubscribes
    pub fn subscribe_pushes(&self) -> broadcast::Receiver<PushMessage> {
        self.pushes.subscribe()
    }

    /// Requests awaiting a response
    pub fn pending_requests(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Session key address; the participant every request is signed by
    pub fn address(&self) -> Address {
        self.signer.address()
    }
}

struct PendingRequest {
    method: String,
    issued_at: Instant,
    deadline: Instant,
    reply: Reply<RpcResponse>,
}

enum AttemptStep {
    Opened(Result<Socket, TransportError>),
    Negotiated {
        socket: Socket,
        result: Result<AuthOutcome, AuthError>,
    },
}

type AttemptFuture = Pin<Box<dyn Future<Output = AttemptStep> + Send>>;

/// Owns all mutable connection state; runs until every handle is dropped
struct Driver {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    negotiator: AuthNegotiator,
    store: Arc<dyn KeyValueStore>,
    commands: mpsc::Receiver<Command>,
    state: watch::Sender<ConnectionState>,
    pushes: broadcast::Sender<PushMessage>,
    pending: HashMap<u64, PendingRequest>,
    pending_count: Arc<AtomicUsize>,
    socket: Option<Socket>,
    attempt: Option<AttemptFuture>,
    connect_waiters: Vec<Reply<()>>,
    auth_params: Option<AuthParams>,
    backoff: LinearBackoff,
    reconnect_at: Option<Instant>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            let request_deadline = self.pending.values().map(|p| p.deadline).min();

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },

                step = next_step(&mut self.attempt) => {
                    self.attempt = None;
                    self.handle_step(step).await;
                }

                event = next_event(&mut self.socket) => self.handle_socket_event(event).await,

                _ = sleep_until_opt(request_deadline) => self.expire_requests(),

                _ = sleep_until_opt(self.reconnect_at) => {
                    self.reconnect_at = None;
                    tracing::info!(
                        "Reconnecting to {} (attempt {}/{})",
                        self.config.url,
                        self.backoff.attempt(),
                        self.backoff.max_attempts()
                    );
                    self.start_attempt();
                }
            }
        }

        tracing::debug!("All client handles dropped, shutting down");
        self.shutdown().await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { params, reply } => {
                self.auth_params = Some(params);

                if self.current_state().is_connected() {
                    let _ = reply.send(Ok(()));
                    return;
                }

                self.connect_waiters.push(reply);
                if self.attempt.is_none() {
                    self.reconnect_at = None;
                    self.backoff.reset();
                    self.start_attempt();
                }
            }

            Command::Send {
                frame,
                timeout,
                reply,
            } => self.send(frame, timeout, reply).await,

            Command::Close { reply } => {
                self.close().await;
                let _ = reply.send(());
            }
        }
    }

    async fn send(&mut self, frame: RequestFrame, timeout: Duration, reply: Reply<RpcResponse>) {
        let socket = match (&self.socket, self.current_state()) {
            (Some(socket), ConnectionState::Connected) => socket,
            _ => {
                let _ = reply.send(Err(ClientError::NotConnected));
                return;
            }
        };

        if self.pending.contains_key(&frame.id) {
            let _ = reply.send(Err(ClientError::DuplicateRequest(frame.id)));
            return;
        }

        let text = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                let _ = reply.send(Err(e.into()));
                return;
            }
        };

        // Registered before the write so a fast response always finds its entry
        let id = frame.id;
        let now = Instant::now();
        self.pending.insert(
            id,
            PendingRequest {
                method: frame.method,
                issued_at: now,
                deadline: now + timeout,
                reply,
            },
        );
        self.sync_pending_count();

        if let Err(e) = socket.send_text(text) {
            if let Some(pending) = self.pending.remove(&id) {
                let _ = pending.reply.send(Err(e.into()));
            }
            self.sync_pending_count();
            return;
        }

        tracing::debug!(id, "Sent request");
    }

    async fn close(&mut self) {
        tracing::info!("Closing connection to {}", self.config.url);
        self.reconnect_at = None;
        self.attempt = None;
        self.backoff.reset();

        if let Some(socket) = self.socket.take() {
            socket.close();
        }

        self.reject_pending(|| ClientError::ConnectionClosed);
        self.notify_waiters(Err(ClientError::ConnectionClosed));
        self.set_state(ConnectionState::Disconnected);
    }

    async fn shutdown(&mut self) {
        if let Some(socket) = self.socket.take() {
            socket.close();
        }
        self.reject_pending(|| ClientError::ConnectionClosed);
        self.notify_waiters(Err(ClientError::ConnectionClosed));
        self.set_state(ConnectionState::Disconnected);
    }

    fn start_attempt(&mut self) {
        if self.auth_params.is_none() {
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        self.set_state(ConnectionState::Connecting);
        let transport = self.transport.clone();
        let url = self.config.url.clone();
        self.attempt = Some(Box::pin(async move {
            AttemptStep::Opened(transport.open(&url).await)
        }));
    }

    async fn handle_step(&mut self, step: AttemptStep) {
        match step {
            AttemptStep::Opened(Ok(socket)) => {
                self.set_state(ConnectionState::Authenticating);
                if let Some(params) = self.auth_params.clone() {
                    self.attempt = Some(self.negotiate(socket, params));
                }
            }

            AttemptStep::Opened(Err(e)) => {
                tracing::warn!("Connection to {} failed: {}", self.config.url, e);
                if !self.schedule_reconnect() {
                    self.set_state(ConnectionState::Disconnected);
                }
                self.notify_waiters(Err(e.into()));
            }

            AttemptStep::Negotiated {
                socket,
                result: Ok(outcome),
            } => {
                tracing::info!(
                    cached = outcome.used_cached_token,
                    "Authenticated with {}",
                    self.config.url
                );
                self.socket = Some(socket);
                self.backoff.reset();
                self.set_state(ConnectionState::Connected);
                self.notify_waiters(Ok(()));
            }

            AttemptStep::Negotiated {
                socket,
                result: Err(e),
            } => {
                tracing::warn!("Authentication with {} failed: {}", self.config.url, e);
                socket.close();
                self.set_state(ConnectionState::AuthFailed);
                // Reconnection disabled leaves the client in auth_failed
                self.schedule_reconnect();
                self.notify_waiters(Err(e.into()));
            }
        }
    }

    /// Handshake future; owns the socket until it resolves
    fn negotiate(&self, mut socket: Socket, params: AuthParams) -> AttemptFuture {
        let negotiator = self.negotiator.clone();
        let store = self.store.clone();

        Box::pin(async move {
            let cached = match get_json::<AuthToken>(store.as_ref(), AUTH_TOKEN_KEY).await {
                Ok(token) => token,
                Err(e) => {
                    tracing::warn!("Failed to read cached auth token: {}", e);
                    None
                }
            };

            let result = negotiator
                .negotiate(&mut socket, &params, cached.as_ref())
                .await;

            let persisted = match &result {
                Ok(AuthOutcome {
                    token: Some(token), ..
                }) => put_json(store.as_ref(), AUTH_TOKEN_KEY, token).await,
                Ok(_) => Ok(()),
                Err(_) => store.delete(AUTH_TOKEN_KEY).await,
            };
            if let Err(e) = persisted {
                tracing::warn!("Failed to update cached auth token: {}", e);
            }

            AttemptStep::Negotiated { socket, result }
        })
    }

    /// Schedule the next attempt; false when reconnection is off or exhausted
    fn schedule_reconnect(&mut self) -> bool {
        if !self.config.reconnect.enabled || self.auth_params.is_none() {
            return false;
        }

        match self.backoff.next_delay() {
            Some(delay) => {
                tracing::info!("Reconnecting in {:?}", delay);
                self.reconnect_at = Some(Instant::now() + delay);
                self.set_state(ConnectionState::Reconnecting);
                true
            }
            None => {
                tracing::warn!(
                    "Giving up on {} after {} reconnect attempts",
                    self.config.url,
                    self.backoff.max_attempts()
                );
                self.backoff.reset();
                self.set_state(ConnectionState::Disconnected);
                false
            }
        }
    }

    async fn handle_socket_event(&mut self, event: Option<SocketEvent>) {
        let text = match event {
            Some(SocketEvent::Text(text)) => text,
            Some(SocketEvent::Closed(reason)) => return self.connection_lost(reason),
            None => return self.connection_lost(None),
        };

        let frame = match InboundFrame::decode(&text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Dropping malformed frame: {}", e);
                return;
            }
        };

        match frame {
            InboundFrame::Response(response) => {
                let id = response.id;
                self.complete(id, Ok(response));
            }
            InboundFrame::Error(error) => {
                let id = error.id;
                self.complete(
                    id,
                    Err(ClientError::Protocol {
                        code: error.code,
                        message: error.message,
                    }),
                );
            }
            InboundFrame::Push(push) => {
                tracing::debug!(method = ?push.method, "Received push");
                // No subscribers is fine
                let _ = self.pushes.send(push);
            }
        }
    }

    fn complete(&mut self, id: u64, result: Result<RpcResponse, ClientError>) {
        match self.pending.remove(&id) {
            Some(pending) => {
                tracing::debug!(
                    id,
                    method = %pending.method,
                    elapsed_ms = pending.issued_at.elapsed().as_millis() as u64,
                    ok = result.is_ok(),
                    "Request completed"
                );
                let _ = pending.reply.send(result);
                self.sync_pending_count();
            }
            None => {
                tracing::debug!(id, "Discarding response for unknown or expired request");
            }
        }
    }

    fn connection_lost(&mut self, reason: Option<String>) {
        tracing::warn!("Connection to {} lost: {:?}", self.config.url, reason);
        self.socket = None;
        self.reject_pending(|| ClientError::Transport(TransportError::Closed(reason.clone())));

        if !self.schedule_reconnect() {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    fn expire_requests(&mut self) {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            if let Some(pending) = self.pending.remove(&id) {
                tracing::warn!(id, method = %pending.method, "Request timed out");
                let _ = pending.reply.send(Err(ClientError::Timeout {
                    id,
                    method: pending.method,
                }));
            }
        }
        self.sync_pending_count();
    }

    fn reject_pending(&mut self, error: impl Fn() -> ClientError) {
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(error()));
        }
        self.sync_pending_count();
    }

    fn notify_waiters(&mut self, result: Result<(), ClientError>) {
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::info!("Connection state: {} -> {}", previous, state);
        }
    }

    fn sync_pending_count(&self) {
        self.pending_count.store(self.pending.len(), Ordering::Release);
    }
}

async fn next_step(attempt: &mut Option<AttemptFuture>) -> AttemptStep {
    match attempt {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

async fn next_event(socket: &mut Option<Socket>) -> Option<SocketEvent> {
    match socket {
        Some(socket) => socket.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
