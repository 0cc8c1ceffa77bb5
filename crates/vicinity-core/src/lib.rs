//! vicinity-core — shared types, LBN wire protocol, configuration, and
//! identity keys. All other vicinity crates depend on this one.

pub mod config;
pub mod crypto;
pub mod proto;
pub mod wire;

pub use config::VicinityConfig;
pub use proto::{Message, MessageBuilder};
