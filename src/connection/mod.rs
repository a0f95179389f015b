// src/connection/mod.rs

//! Per-connection state and the dispatcher that routes packets to it.

pub mod assembly;
pub mod phase;
pub mod stream;

pub use assembly::Assembly;
pub use phase::{PendingRequest, StreamPhase};
pub use stream::{Endpoints, StreamHandle, StreamState};
