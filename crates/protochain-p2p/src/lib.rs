//! Peer messages and the transport seam of the protochain validator.

pub mod message;
pub mod transport;

pub use message::{Envelope, PeerMessage, ValidatorState, PROTOCOL_VERSION};
pub use transport::{MemoryHub, MemoryTransport, Transport, TransportError};
