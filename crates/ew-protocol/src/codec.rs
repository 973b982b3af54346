//! Request canonicalization and inbound frame classification
//!
//! Outbound calls are the fixed 4-tuple `(id, method, params, timestamp)`
//! wrapped with a signature array:
//!
//! ```text
//! {"req": [id, method, params, timestamp], "sig": ["0x..."]}
//! ```
//!
//! The signature covers [`RequestFrame::canonical_bytes`], the compact JSON
//! encoding of the `req` tuple. `serde_json` maps are ordered, so the same
//! call always canonicalizes to the same bytes.
//!
//! Inbound frames are classified exactly once, here, into [`InboundFrame`].
//! The client routes on that tag and never inspects fields itself.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CodecError;
use crate::message::RpcMethod;

/// Request id reserved for unsolicited server pushes
pub const PUSH_REQUEST_ID: u64 = 0;

/// An outbound RPC call, optionally carrying signatures
#[derive(Debug, Clone, PartialEq)]
pub struct RequestFrame {
    /// Correlation id
    pub id: u64,
    /// RPC method name
    pub method: String,
    /// Positional parameters
    pub params: Vec<Value>,
    /// Client timestamp in milliseconds
    pub timestamp: u64,
    signatures: Vec<String>,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    req: (u64, &'a str, &'a [Value], u64),
    sig: &'a [String],
}

#[derive(Deserialize)]
struct WireRequestOwned {
    req: (u64, String, Vec<Value>, u64),
    #[serde(default)]
    sig: Vec<String>,
}

impl RequestFrame {
    /// Create an unsigned request
    pub fn new(id: u64, method: impl Into<String>, params: Vec<Value>, timestamp: u64) -> Self {
        Self {
            id,
            method: method.into(),
            params,
            timestamp,
            signatures: Vec::new(),
        }
    }

    /// Deterministic bytes that signers sign over
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let tuple = (self.id, self.method.as_str(), &self.params, self.timestamp);
        Ok(serde_json::to_vec(&tuple)?)
    }

    /// Append a hex-encoded signature
    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signatures.push(signature.into());
        self
    }

    /// Signatures attached so far
    pub fn signatures(&self) -> &[String] {
        &self.signatures
    }

    /// Parsed method, if it is one this crate knows
    pub fn rpc_method(&self) -> Option<RpcMethod> {
        RpcMethod::parse(&self.method)
    }

    /// Encode to the text frame written on the socket
    pub fn encode(&self) -> Result<String, CodecError> {
        let wire = WireRequest {
            req: (self.id, &self.method, &self.params, self.timestamp),
            sig: &self.signatures,
        };
        Ok(serde_json::to_string(&wire)?)
    }

    /// Decode a request frame (used by node-side tooling and tests)
    pub fn decode(text: &str) -> Result<Self, CodecError> {
        let wire: WireRequestOwned = serde_json::from_str(text)?;
        let (id, method, params, timestamp) = wire.req;
        Ok(Self {
            id,
            method,
            params,
            timestamp,
            signatures: wire.sig,
        })
    }

    /// Decode the first positional parameter
    pub fn first_param<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        let value = self.params.first().ok_or_else(|| CodecError::EmptyResult {
            method: self.method.clone(),
        })?;
        Ok(T::deserialize(value)?)
    }
}

/// A correlated success response
#[derive(Debug, Clone, PartialEq)]
pub struct RpcResponse {
    pub id: u64,
    pub method: String,
    pub result: Vec<Value>,
    pub timestamp: u64,
}

impl RpcResponse {
    /// Decode the first element of the result array
    pub fn first<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        let value = self.result.first().ok_or_else(|| CodecError::EmptyResult {
            method: self.method.clone(),
        })?;
        Ok(T::deserialize(value)?)
    }

    /// Parsed method, if it is one this crate knows
    pub fn rpc_method(&self) -> Option<RpcMethod> {
        RpcMethod::parse(&self.method)
    }
}

/// A correlated error reported by the node
#[derive(Debug, Clone, PartialEq)]
pub struct RpcError {
    pub id: u64,
    pub code: String,
    pub message: String,
    pub timestamp: u64,
}

/// An unsolicited message from the node
#[derive(Debug, Clone, PartialEq)]
pub struct PushMessage {
    /// Method name when the push used the `res` envelope
    pub method: Option<String>,
    /// Result array for `res` pushes, otherwise the whole frame
    pub payload: Value,
}

impl PushMessage {
    /// Parsed method, if it is one this crate knows
    pub fn rpc_method(&self) -> Option<RpcMethod> {
        self.method.as_deref().and_then(RpcMethod::parse)
    }
}

/// Every inbound frame is exactly one of these
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Response(RpcResponse),
    Error(RpcError),
    Push(PushMessage),
}

impl InboundFrame {
    /// Classify a text frame received from the node.
    ///
    /// - `{"res": [...]}` with a non-zero id is a response, unless its method
    ///   is `error`, which the node uses for some failures
    /// - `{"err": [...]}` is an error
    /// - `{"res": [0, ...]}` and any other JSON object is a push
    pub fn decode(text: &str) -> Result<Self, CodecError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(mut object) = value else {
            return Err(CodecError::Malformed("frame is not a JSON object".into()));
        };

        if let Some(res) = object.remove("res") {
            let (id, method, result, timestamp): (u64, String, Vec<Value>, u64) =
                serde_json::from_value(res)
                    .map_err(|e| CodecError::Malformed(format!("bad res envelope: {e}")))?;

            if id == PUSH_REQUEST_ID {
                return Ok(Self::Push(PushMessage {
                    method: Some(method),
                    payload: Value::Array(result),
                }));
            }

            if RpcMethod::parse(&method) == Some(RpcMethod::Error) {
                tracing::debug!(id, "Error carried in a res envelope");
                return Ok(Self::Error(RpcError {
                    id,
                    code: method,
                    message: error_message(&result),
                    timestamp,
                }));
            }

            return Ok(Self::Response(RpcResponse {
                id,
                method,
                result,
                timestamp,
            }));
        }

        if let Some(err) = object.remove("err") {
            let (id, code, message, timestamp): (u64, String, String, u64) =
                serde_json::from_value(err)
                    .map_err(|e| CodecError::Malformed(format!("bad err envelope: {e}")))?;
            return Ok(Self::Error(RpcError {
                id,
                code,
                message,
                timestamp,
            }));
        }

        tracing::debug!(
            keys = ?object.keys().collect::<Vec<_>>(),
            "Frame without res or err envelope, treating as push"
        );
        Ok(Self::Push(PushMessage {
            method: None,
            payload: Value::Object(object),
        }))
    }

    /// Correlation id, if this frame answers a request
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Self::Response(res) => Some(res.id),
            Self::Error(err) => Some(err.id),
            Self::Push(_) => None,
        }
    }
}

/// Encode a success response (node-side tooling and tests)
pub fn encode_response(id: u64, method: &str, result: Vec<Value>, timestamp: u64) -> String {
    serde_json::json!({ "res": [id, method, result, timestamp] }).to_string()
}

/// Encode an error response (node-side tooling and tests)
pub fn encode_error(id: u64, code: &str, message: &str, timestamp: u64) -> String {
    serde_json::json!({ "err": [id, code, message, timestamp] }).to_string()
}

fn error_message(result: &[Value]) -> String {
    match result.first() {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Object(map)) => map
            .get("error")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Value::Object(map.clone()).to_string()),
        Some(other) => other.to_string(),
        None => "unknown error".to_string(),
    }
}
