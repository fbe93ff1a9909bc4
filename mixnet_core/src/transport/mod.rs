/*! Transport adapter: framing, connection reuse and delayed dispatch.
*/

pub mod codec;
pub mod delay_sender;
pub mod handshake;
pub mod pool;

pub use self::codec::{DecodeError, EncodeError, FrameCodec, MAX_FRAME_SIZE};
pub use self::delay_sender::DelaySender;
pub use self::handshake::NetHandshake;
pub use self::pool::{ConnectionPool, PoolConfig, TransportError};
