//! git-lfs-transfer protocol layer
//!
//! pkt-line framing over any `Read`/`Write` pair and the session state
//! machine that maps requests onto the object store and lock registry.

pub mod error;
pub mod pktline;
pub mod request;
pub mod session;

pub use error::{ArgumentError, ProtocolError, ProtocolResult, SessionError};
pub use pktline::{MAX_PACKET_DATA, Packet, PacketDataReader, PacketReader, PacketWriter};
pub use request::{Request, RequestBody};
pub use session::{CommandHandler, Flow, SessionEngine};
