// src/core/mod.rs

//! The central module containing the protocol decoders and data types of the probe.

pub mod errors;
pub mod flow;
pub mod message;
pub mod metrics;
pub mod protocol;
pub mod resolver;

pub use errors::ProbeError;
pub use flow::{CapturedPacket, FlowKey, IsRequest, NetworkFlow, TcpFlags, TransportFlow};
pub use message::{Message, UNKNOWN_DB_NAME};
pub use resolver::{ConnectionWatcher, DbNameResolver};
