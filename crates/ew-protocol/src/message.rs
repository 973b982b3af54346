//! RPC methods and payload shapes exchanged with the coordination node
//!
//! # Message Flow
//!
//! 1. Client sends `auth_request` (or `auth_verify` with a cached token)
//! 2. Node answers `auth_challenge`; client sends a signed `auth_verify`
//! 3. Node answers `auth_verify` with `success` and, optionally, a token
//! 4. Channel and session RPCs (`create_channel`, `create_app_session`,
//!    `get_ledger_balances`, `close_app_session`, `get_channels`) follow
//! 5. Node pushes balance (`bu`) and channel (`cu`) updates with id 0

use serde::{Deserialize, Serialize};

/// Session protocol version advertised in app session definitions
pub const APP_PROTOCOL_VERSION: &str = "NitroRPC/0.2";

/// Known RPC method names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcMethod {
    AuthRequest,
    AuthChallenge,
    AuthVerify,
    AuthFailure,
    GetChannels,
    CreateChannel,
    CreateAppSession,
    GetLedgerBalances,
    CloseAppSession,
    GetAppSessions,
    /// Error envelope used inside `res` frames
    Error,
    /// Balance update push
    BalanceUpdate,
    /// Channel update push
    ChannelUpdate,
}

impl RpcMethod {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthRequest => "auth_request",
            Self::AuthChallenge => "auth_challenge",
            Self::AuthVerify => "auth_verify",
            Self::AuthFailure => "auth_failure",
            Self::GetChannels => "get_channels",
            Self::CreateChannel => "create_channel",
            Self::CreateAppSession => "create_app_session",
            Self::GetLedgerBalances => "get_ledger_balances",
            Self::CloseAppSession => "close_app_session",
            Self::GetAppSessions => "get_app_sessions",
            Self::Error => "error",
            Self::BalanceUpdate => "bu",
            Self::ChannelUpdate => "cu",
        }
    }

    /// Parse a wire name
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "auth_request" => Some(Self::AuthRequest),
            "auth_challenge" => Some(Self::AuthChallenge),
            "auth_verify" => Some(Self::AuthVerify),
            "auth_failure" => Some(Self::AuthFailure),
            "get_channels" => Some(Self::GetChannels),
            "create_channel" => Some(Self::CreateChannel),
            "create_app_session" => Some(Self::CreateAppSession),
            "get_ledger_balances" => Some(Self::GetLedgerBalances),
            "close_app_session" => Some(Self::CloseAppSession),
            "get_app_sessions" => Some(Self::GetAppSessions),
            "error" => Some(Self::Error),
            "bu" => Some(Self::BalanceUpdate),
            "cu" => Some(Self::ChannelUpdate),
            _ => None,
        }
    }
}

impl std::fmt::Display for RpcMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<RpcMethod> for String {
    fn from(method: RpcMethod) -> Self {
        method.as_str().to_string()
    }
}

/// Spending allowance granted to the session key during auth
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowanceParam {
    pub asset: String,
    pub amount: String,
}

/// `auth_request` parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthRequestParams {
    /// Wallet (primary identity) address
    pub address: String,
    /// Participant address, the key that will sign protocol messages
    pub session_key: String,
    pub app_name: String,
    /// Application identity address
    pub application: String,
    pub allowances: Vec<AllowanceParam>,
    /// Unix seconds
    pub expire: u64,
    pub scope: String,
}

/// `auth_challenge` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthChallenge {
    pub challenge_message: String,
}

/// `auth_verify` parameters for a signed challenge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeVerifyParams {
    pub challenge: String,
}

/// `auth_verify` parameters for the token fast path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenVerifyParams {
    pub jwt: String,
}

/// `auth_verify` result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthVerifyResult {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub session_key: Option<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt_token: Option<String>,
}

/// `create_channel` parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateChannelParams {
    pub chain_id: u64,
    pub token: String,
    /// Initial allocation; always zero, funding happens on chain
    pub amount: String,
    pub session_key: String,
}

/// `create_channel` result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateChannelResult {
    pub channel_id: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// `get_channels` parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetChannelsParams {
    pub participant: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// One entry of a `get_channels` result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub channel_id: String,
    #[serde(default)]
    pub participant: Option<String>,
    pub status: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub amount: Option<String>,
    #[serde(default)]
    pub chain_id: Option<u64>,
}

/// `get_channels` result, either wrapped or bare
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelsResult {
    Wrapped { channels: Vec<ChannelInfo> },
    Bare(Vec<ChannelInfo>),
}

impl ChannelsResult {
    pub fn into_channels(self) -> Vec<ChannelInfo> {
        match self {
            Self::Wrapped { channels } => channels,
            Self::Bare(channels) => channels,
        }
    }
}

/// Application session definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppDefinition {
    pub protocol: String,
    pub participants: Vec<String>,
    pub weights: Vec<u64>,
    pub quorum: u64,
    pub challenge: u64,
    pub nonce: u64,
}

/// Per-participant allocation inside an application session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppAllocation {
    pub participant: String,
    pub asset: String,
    pub amount: String,
}

/// `create_app_session` parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateAppSessionParams {
    pub definition: AppDefinition,
    pub allocations: Vec<AppAllocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_data: Option<String>,
}

/// `create_app_session` / `close_app_session` result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSessionResult {
    pub app_session_id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub version: Option<u64>,
}

/// `close_app_session` parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseAppSessionParams {
    pub app_session_id: String,
    /// Final allocations; the node returns any remainder to the owner
    pub allocations: Vec<AppAllocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_data: Option<String>,
}

/// `get_app_sessions` parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetAppSessionsParams {
    pub participant: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// One entry of a `get_app_sessions` result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSessionInfo {
    pub app_session_id: String,
    pub status: String,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default)]
    pub version: Option<u64>,
}

/// `get_app_sessions` result, either wrapped or bare
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AppSessionsResult {
    Wrapped { app_sessions: Vec<AppSessionInfo> },
    Bare(Vec<AppSessionInfo>),
}

impl AppSessionsResult {
    pub fn into_sessions(self) -> Vec<AppSessionInfo> {
        match self {
            Self::Wrapped { app_sessions } => app_sessions,
            Self::Bare(app_sessions) => app_sessions,
        }
    }
}

/// `get_ledger_balances` parameters; `participant` is a wallet address or
/// an app session id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetLedgerBalancesParams {
    pub participant: String,
}

/// One asset balance as reported by the node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerBalance {
    pub asset: String,
    pub amount: String,
}

/// Balance payloads: query results and `bu` pushes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BalancesPayload {
    Ledger { ledger_balances: Vec<LedgerBalance> },
    Updates { balance_updates: Vec<LedgerBalance> },
    Bare(Vec<LedgerBalance>),
}

impl BalancesPayload {
    pub fn into_balances(self) -> Vec<LedgerBalance> {
        match self {
            Self::Ledger { ledger_balances } => ledger_balances,
            Self::Updates { balance_updates } => balance_updates,
            Self::Bare(balances) => balances,
        }
    }
}
