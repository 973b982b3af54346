//! Payment channels and application sessions

mod manager;
mod types;

pub use manager::ChannelManager;
pub use types::{balance_of, channel_record_key, Channel, ChannelRecord, Session, CHANNEL_RECORD_PREFIX};
