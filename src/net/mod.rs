// # Networking
//
// Wire framing, the per-connection request/data multiplexer, the payload
// buffer pool, the server-to-server connection pool, and the opening
// handshakes.

pub mod buffer_pool;
pub mod connection;
pub mod handshake;
pub mod header;
pub mod pool;

pub use buffer_pool::NetBufferPool;
pub use connection::{ConnStatus, Connection, PacketSink, RouteOpener};
pub use handshake::{
    master_handshake, read_packet, s2s_client_handshake, write_packet, MasterProtocol,
    MasterReply, S2sHandshake,
};
pub use header::{PacketHeader, PacketType, HEADER_SIZE, MAGIC};
pub use pool::{S2sOpener, S2sPool, S2sPoolConfig, TwoPhaseRegistrar};
