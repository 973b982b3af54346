//! EIP-712 structured data for the auth challenge
//!
//! The wallet signs a `Policy` binding the node's challenge to the session
//! key it authorizes:
//!
//! ```text
//! Policy(string challenge,string scope,address wallet,address application,
//!        address participant,uint256 expire,Allowance[] allowances)
//! Allowance(string asset,uint256 amount)
//! ```
//!
//! under the domain `EIP712Domain(string name)`.

use serde_json::{json, Value};

use crate::error::TypedDataError;
use crate::keys::keccak256;
use crate::types::Address;

/// Domain type string
pub const DOMAIN_TYPE: &str = "EIP712Domain(string name)";

/// Allowance type string
pub const ALLOWANCE_TYPE: &str = "Allowance(string asset,uint256 amount)";

/// Policy type string, referenced types appended in name order
pub const POLICY_TYPE: &str = "Policy(string challenge,string scope,address wallet,address application,address participant,uint256 expire,Allowance[] allowances)Allowance(string asset,uint256 amount)";

/// Spending allowance bound into the policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyAllowance {
    pub asset: String,
    /// Decimal uint256
    pub amount: String,
}

/// The message the wallet signs to authorize a session key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPolicy {
    pub challenge: String,
    pub scope: String,
    pub wallet: Address,
    pub application: Address,
    pub participant: Address,
    /// Unix seconds
    pub expire: u64,
    pub allowances: Vec<PolicyAllowance>,
}

/// A policy under a named signing domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedData {
    pub domain_name: String,
    pub policy: AuthPolicy,
}

impl TypedData {
    pub fn new(domain_name: impl Into<String>, policy: AuthPolicy) -> Self {
        Self {
            domain_name: domain_name.into(),
            policy,
        }
    }

    /// `hashStruct(EIP712Domain)`
    pub fn domain_separator(&self) -> [u8; 32] {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&keccak256(DOMAIN_TYPE.as_bytes()));
        buf.extend_from_slice(&keccak256(self.domain_name.as_bytes()));
        keccak256(&buf)
    }

    /// `hashStruct(Policy)`
    pub fn struct_hash(&self) -> Result<[u8; 32], TypedDataError> {
        let policy = &self.policy;

        let mut allowance_hashes = Vec::with_capacity(policy.allowances.len() * 32);
        for allowance in &policy.allowances {
            allowance_hashes.extend_from_slice(&hash_allowance(allowance)?);
        }

        let mut buf = Vec::with_capacity(32 * 8);
        buf.extend_from_slice(&keccak256(POLICY_TYPE.as_bytes()));
        buf.extend_from_slice(&keccak256(policy.challenge.as_bytes()));
        buf.extend_from_slice(&keccak256(policy.scope.as_bytes()));
        buf.extend_from_slice(&encode_address(&policy.wallet));
        buf.extend_from_slice(&encode_address(&policy.application));
        buf.extend_from_slice(&encode_address(&policy.participant));
        buf.extend_from_slice(&encode_uint(u128::from(policy.expire)));
        buf.extend_from_slice(&keccak256(&allowance_hashes));
        Ok(keccak256(&buf))
    }

    /// Final digest: `keccak256(0x19 0x01 || domainSeparator || hashStruct(message))`
    pub fn digest(&self) -> Result<[u8; 32], TypedDataError> {
        let mut buf = Vec::with_capacity(66);
        buf.extend_from_slice(&[0x19, 0x01]);
        buf.extend_from_slice(&self.domain_separator());
        buf.extend_from_slice(&self.struct_hash()?);
        Ok(keccak256(&buf))
    }

    /// `eth_signTypedData_v4` payload for external wallet providers
    pub fn to_json(&self) -> Value {
        let policy = &self.policy;
        json!({
            "types": {
                "EIP712Domain": [{"name": "name", "type": "string"}],
                "Policy": [
                    {"name": "challenge", "type": "string"},
                    {"name": "scope", "type": "string"},
                    {"name": "wallet", "type": "address"},
                    {"name": "application", "type": "address"},
                    {"name": "participant", "type": "address"},
                    {"name": "expire", "type": "uint256"},
                    {"name": "allowances", "type": "Allowance[]"}
                ],
                "Allowance": [
                    {"name": "asset", "type": "string"},
                    {"name": "amount", "type": "uint256"}
                ]
            },
            "primaryType": "Policy",
            "domain": {"name": self.domain_name},
            "message": {
                "challenge": policy.challenge,
                "scope": policy.scope,
                "wallet": policy.wallet.to_hex(),
                "application": policy.application.to_hex(),
                "participant": policy.participant.to_hex(),
                "expire": policy.expire.to_string(),
                "allowances": policy.allowances.iter().map(|a| json!({
                    "asset": a.asset,
                    "amount": a.amount,
                })).collect::<Vec<_>>()
            }
        })
    }
}

fn hash_allowance(allowance: &PolicyAllowance) -> Result<[u8; 32], TypedDataError> {
    let amount = allowance
        .amount
        .trim()
        .parse::<u128>()
        .map_err(|_| TypedDataError::InvalidUint {
            field: format!("allowances[{}].amount", allowance.asset),
            value: allowance.amount.clone(),
        })?;

    let mut buf = Vec::with_capacity(96);
    buf.extend_from_slice(&keccak256(ALLOWANCE_TYPE.as_bytes()));
    buf.extend_from_slice(&keccak256(allowance.asset.as_bytes()));
    buf.extend_from_slice(&encode_uint(amount));
    Ok(keccak256(&buf))
}

fn encode_address(address: &Address) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(address.as_bytes());
    word
}

fn encode_uint(value: u128) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[16..].copy_from_slice(&value.to_be_bytes());
    word
}
