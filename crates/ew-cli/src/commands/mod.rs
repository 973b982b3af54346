//! CLI command implementations

mod balance;
mod channels;
mod config;
mod keygen;
mod status;

pub use balance::balance_command;
pub use channels::{channels_command, open_command};
pub use config::{config_get, config_init, config_path, config_show};
pub use keygen::keygen_command;
pub use status::status_command;
