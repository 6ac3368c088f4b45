//! Wire protocol: typed packets, stream framing and the key exchange.

pub mod frame;
pub mod handshake;
pub mod packet;

pub use frame::{FrameError, MAX_FRAME_SIZE, read_frame, write_frame};
pub use handshake::{
    HandshakeError, SecureSession, SessionError, establish_as_initiator, establish_as_listener,
};
pub use packet::{CodecError, Packet, Payload, PayloadType};
