pub mod commands;
pub mod events;
pub mod types;

pub use commands::ShellCommand;
pub use events::{Direction, NetworkEvent};
pub use types::{EnvelopeKind, MessageEnvelope, PeerAddress, PeerId};
