//! Core trait definitions

mod signer;
mod store;

pub use signer::Signer;
pub use store::{get_json, put_json, ChannelStore, KeyValueStore};
