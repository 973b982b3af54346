//! ew-core: Core abstractions and configuration for event-wallet
//!
//! This crate provides the shared domain types, signing keys, EIP-712
//! policy hashing, persistence ports and configuration used by the
//! protocol client and the CLI.

pub mod config;
pub mod error;
pub mod keys;
pub mod store;
pub mod time;
pub mod traits;
pub mod typed_data;
pub mod types;

pub use error::{ConfigError, KeyError, ParseError, StoreError, TypedDataError};
pub use keys::{KeyManager, LocalSigner};
pub use traits::{ChannelStore, KeyValueStore, Signer};
pub use typed_data::{AuthPolicy, PolicyAllowance, TypedData};
pub use types::{
    Address, AssetBalance, ChannelStatus, ConnectionState, EventWalletId, SessionStatus, Signature,
};
