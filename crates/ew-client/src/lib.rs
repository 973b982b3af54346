//! ew-client: Protocol client for event-wallet
//!
//! Holds one authenticated WebSocket connection to the coordination node,
//! correlates signed requests with their responses, and manages the payment
//! channels and application sessions built on top of it.

pub mod auth;
pub mod channel;
pub mod client;
pub mod coordinator;
pub mod error;
pub mod reconnect;
pub mod transport;

pub use auth::{AuthNegotiator, AuthParams, AuthToken};
pub use channel::{Channel, ChannelManager, Session};
pub use client::{ClientConfig, ProtocolClient};
pub use coordinator::SessionCoordinator;
pub use error::{AuthError, ChannelError, ClientError, StateError, TransportError};
pub use transport::{Socket, SocketPeer, Transport, WsTransport};
