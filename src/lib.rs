// src/lib.rs

pub mod config;
pub mod connection;
pub mod core;
pub mod server;

// Re-export
pub use crate::connection::Assembly;
pub use crate::core::{CapturedPacket, FlowKey, Message, ProbeError};
pub use crate::server::Probe;
