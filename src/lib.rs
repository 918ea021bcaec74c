pub mod common;
pub mod config;
pub mod error;
pub mod messaging;
pub mod network;
pub mod node;
pub mod storage;

pub use error::{ChatError, Result};
pub use node::{ChatNode, PeerStatus};
