//! Client error taxonomy
//!
//! Every error here is `Clone`: one channel-creation outcome is shared by
//! all concurrent callers, and one connection failure is delivered to every
//! waiting `connect()`.

use ew_core::types::{ChannelStatus, EventWalletId, SessionStatus};
use ew_core::{KeyError, StoreError};
use ew_protocol::CodecError;
use thiserror::Error;

/// Socket-level failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The socket could not be opened
    #[error("Failed to connect: {0}")]
    Connect(String),

    /// The socket closed, optionally with a reason
    #[error("Connection closed{}", .0.as_ref().map(|r| format!(": {r}")).unwrap_or_default())]
    Closed(Option<String>),

    /// A frame could not be written
    #[error("Failed to send frame: {0}")]
    Send(String),
}

/// Handshake failures.
///
/// A rejection by the node and a transport failure mid-handshake surface as
/// the same type so the reconnect policy treats them alike.
#[derive(Error, Debug, Clone)]
pub enum AuthError {
    /// The node answered `auth_failure` or an unsuccessful `auth_verify`
    #[error("Authentication rejected: {0}")]
    Rejected(String),

    /// The node answered with an error frame
    #[error("Node error during authentication ({code}): {message}")]
    Protocol { code: String, message: String },

    /// No answer within the handshake deadline
    #[error("Authentication timed out")]
    Timeout,

    /// The socket failed mid-handshake
    #[error("Transport error during authentication: {0}")]
    Transport(#[from] TransportError),

    /// A signer refused or failed
    #[error("Signing failed: {0}")]
    Signing(#[from] KeyError),

    /// A handshake reply could not be decoded
    #[error("Malformed handshake reply: {0}")]
    Malformed(String),
}

impl From<CodecError> for AuthError {
    fn from(e: CodecError) -> Self {
        AuthError::Malformed(e.to_string())
    }
}

/// Errors returned by [`ProtocolClient`](crate::ProtocolClient)
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    /// Socket failure; recoverable through reconnect
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Handshake failure; recoverable through reconnect
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// No response before the request deadline
    #[error("Request {id} ({method}) timed out")]
    Timeout { id: u64, method: String },

    /// Structured error frame from the node
    #[error("Node error ({code}): {message}")]
    Protocol { code: String, message: String },

    /// Request issued while the client is not connected
    #[error("Not connected")]
    NotConnected,

    /// The client was closed while the request was outstanding
    #[error("Connection closed")]
    ConnectionClosed,

    /// A request with the same id is already outstanding
    #[error("Duplicate request id {0}")]
    DuplicateRequest(u64),

    /// A request or response could not be (de)serialized
    #[error("Codec error: {0}")]
    Codec(String),

    /// The request could not be signed
    #[error("Signing failed: {0}")]
    Signing(#[from] KeyError),
}

impl From<CodecError> for ClientError {
    fn from(e: CodecError) -> Self {
        ClientError::Codec(e.to_string())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::Codec(e.to_string())
    }
}

/// Operation not valid for the current local state; never retried
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("No channel for {0}")]
    UnknownChannel(EventWalletId),

    #[error("Channel for {id} is {status}, not open")]
    ChannelNotOpen {
        id: EventWalletId,
        status: ChannelStatus,
    },

    #[error("No session {0}")]
    UnknownSession(String),

    #[error("Session {session_id} is {status}, not open")]
    SessionNotOpen {
        session_id: String,
        status: SessionStatus,
    },
}

/// Errors returned by [`ChannelManager`](crate::ChannelManager)
#[derive(Error, Debug, Clone)]
pub enum ChannelError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ChannelError {
    /// Whether this is a [`StateError`]
    pub fn is_state_error(&self) -> bool {
        matches!(self, ChannelError::State(_))
    }
}
