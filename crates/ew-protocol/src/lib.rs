//! ew-protocol: Wire protocol for the event-wallet node connection
//!
//! This crate defines the JSON-RPC style frames exchanged with the
//! coordination node over a persistent WebSocket: signed request tuples,
//! correlated responses and errors, and unsolicited pushes.

pub mod codec;
pub mod error;
pub mod message;

pub use codec::{
    encode_error, encode_response, InboundFrame, PushMessage, RequestFrame, RpcError,
    RpcResponse, PUSH_REQUEST_ID,
};
pub use error::CodecError;
pub use message::RpcMethod;
