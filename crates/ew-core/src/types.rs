//! Core domain types

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::ParseError;

/// Decode a `0x`-prefixed hex string into exactly `N` bytes
fn decode_prefixed_hex<const N: usize>(s: &str) -> Result<[u8; N], ParseError> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .ok_or_else(|| ParseError::InvalidHex(s.to_string()))?;
    let bytes = hex::decode(digits).map_err(|_| ParseError::InvalidHex(s.to_string()))?;
    let actual = bytes.len();
    bytes.try_into().map_err(|_| ParseError::InvalidLength {
        expected: N,
        actual,
    })
}

/// 20-byte account address, rendered as lowercase `0x` hex
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address([u8; 20]);

impl Address {
    /// The all-zero address
    pub const ZERO: Address = Address([0u8; 20]);

    /// Create an address from raw bytes
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Lowercase `0x`-prefixed hex
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_hex())
    }
}

impl FromStr for Address {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_prefixed_hex::<20>(s.trim()).map(Self)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// 65-byte recoverable ECDSA signature (`r || s || v`, `v` in {27, 28})
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature([u8; 65]);

impl Signature {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; 65]) -> Self {
        Self(bytes)
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; 65] {
        &self.0
    }

    /// Lowercase `0x`-prefixed hex, the form carried in the `sig` array
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", self.to_hex())
    }
}

impl FromStr for Signature {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_prefixed_hex::<65>(s.trim()).map(Self)
    }
}

/// Identity of one wallet's participation in one event
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventWalletId(pub String);

impl EventWalletId {
    /// Create a new event wallet ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventWalletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for EventWalletId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for EventWalletId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Connection state of a protocol client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No socket and no reconnect scheduled
    Disconnected,
    /// Socket is being opened
    Connecting,
    /// Socket is open, handshake in progress
    Authenticating,
    /// Authenticated and ready for requests
    Connected,
    /// Waiting to retry after an unexpected drop
    Reconnecting,
    /// The node rejected authentication for this attempt
    AuthFailed,
}

impl ConnectionState {
    /// Whether requests can be sent
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Authenticating => write!(f, "authenticating"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::AuthFailed => write!(f, "auth_failed"),
        }
    }
}

/// Lifecycle of a payment channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    /// Known locally (e.g. recovered), not yet confirmed by the node
    Pending,
    /// Creation request in flight
    Connecting,
    /// Confirmed open by the node
    Open,
    /// Creation failed; kept so retries can see it
    Failed,
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelStatus::Pending => write!(f, "pending"),
            ChannelStatus::Connecting => write!(f, "connecting"),
            ChannelStatus::Open => write!(f, "open"),
            ChannelStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Lifecycle of an application session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Open,
    /// Transfer-and-close in flight
    Settling,
    Closed,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Open => write!(f, "open"),
            SessionStatus::Settling => write!(f, "settling"),
            SessionStatus::Closed => write!(f, "closed"),
        }
    }
}

/// One asset amount exactly as reported by the node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetBalance {
    pub asset: String,
    /// Decimal string; never computed locally
    pub amount: String,
}

impl From<ew_protocol::message::LedgerBalance> for AssetBalance {
    fn from(balance: ew_protocol::message::LedgerBalance) -> Self {
        Self {
            asset: balance.asset,
            amount: balance.amount,
        }
    }
}
