//! event-wallet CLI library
//!
//! Command implementations and terminal formatting for the `event-wallet`
//! binary, split out so they can be tested without spawning the process.

pub mod commands;
pub mod node;
pub mod output;
