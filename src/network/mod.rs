pub mod connection;
pub mod directory;
pub mod discovery;
pub mod protocol;
pub mod transport;

pub use connection::{ConnectionInfo, ConnectionManager};
pub use directory::PeerDirectory;
pub use discovery::Discovery;
pub use protocol::WireFrame;
pub use transport::FrameCodec;
