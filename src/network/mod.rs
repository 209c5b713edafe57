//! Networking boundary: the peer messaging facade, the wire protocol and
//! the master server message dispatch.

pub mod peer;
pub mod protocol;
pub mod server;

pub use peer::{IncomingMessage, OutgoingRequest, Peer, PeerId, Response};
pub use server::{MasterConfig, MasterServer};
