// src/core/protocol/mod.rs

//! The subset of the MySQL client/server protocol the probe decodes: packet
//! framing, the handshake response, the commands it correlates and the first
//! packet of each reply.

pub mod handshake;
pub mod normalize;
pub mod packet;
pub mod request;
pub mod response;

pub use handshake::HandshakeResponse;
pub use normalize::normalize_query;
pub use packet::{BasePacket, HEADER_LEN, PayloadReader, REQUEST_SEQ, RESPONSE_SEQ};
pub use request::{Command, Request};
pub use response::{ErrPacket, OkPacket, PrepareOk, Response};
