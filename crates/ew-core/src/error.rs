//! Core error types for event-wallet

use std::path::PathBuf;
use thiserror::Error;

/// Address or signature text could not be parsed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Missing `0x` prefix or non-hex characters
    #[error("Invalid hex: {0}")]
    InvalidHex(String),

    /// Decoded byte length did not match the expected length
    #[error("Invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// Signing key errors
#[derive(Error, Debug, Clone)]
pub enum KeyError {
    /// Key material could not be parsed
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    /// Key file could not be read or written
    #[error("Key file error at {path}: {message}")]
    Io { path: PathBuf, message: String },

    /// The signing primitive failed
    #[error("Signing failed: {0}")]
    Signing(String),

    /// An external signer refused the request
    #[error("Signer rejected request: {0}")]
    Rejected(String),

    /// Typed data could not be hashed
    #[error("Typed data error: {0}")]
    TypedData(#[from] TypedDataError),

    /// Signature recovery failed
    #[error("Signature recovery failed: {0}")]
    Recovery(String),
}

/// EIP-712 encoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TypedDataError {
    /// A uint256 field was not a non-negative decimal integer
    #[error("Invalid uint256 value for {field}: {value}")]
    InvalidUint { field: String, value: String },
}

/// Persistence port errors
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// Backend I/O failed
    #[error("Store I/O error: {0}")]
    Io(String),

    /// A stored value could not be (de)serialized
    #[error("Store serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// An environment override held an unusable value
    #[error("Invalid value for {var}: {value}")]
    InvalidEnv { var: String, value: String },
}
