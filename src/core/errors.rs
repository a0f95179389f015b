// src/core/errors.rs

//! Defines the primary error type for the probe.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, covering decode failures of captured MySQL traffic as
/// well as the plumbing around the stream actors.
///
/// None of the decode variants are fatal: a stream that hits one drops the
/// offending packet and carries on with the next.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    /// A buffer ended before a fixed-size field could be read.
    #[error("{what}: truncated (need {needed} bytes, have {have})")]
    Truncated {
        what: &'static str,
        needed: usize,
        have: usize,
    },

    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    #[error("Unsupported handshake response: {0}")]
    UnsupportedHandshake(&'static str),

    /// The receiving side of an internal channel has gone away.
    #[error("Channel closed")]
    ChannelClosed,

    #[error("Capture error: {0}")]
    Capture(String),
}

impl ProbeError {
    /// A short, stable label used for the `reason` metric dimension.
    pub fn reason(&self) -> &'static str {
        match self {
            ProbeError::Io(_) => "io",
            ProbeError::Truncated { .. } => "truncated",
            ProbeError::InvalidPacket(_) => "invalid",
            ProbeError::UnsupportedHandshake(_) => "handshake",
            ProbeError::ChannelClosed => "channel_closed",
            ProbeError::Capture(_) => "capture",
        }
    }
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
impl Clone for ProbeError {
    fn clone(&self) -> Self {
        match self {
            ProbeError::Io(e) => ProbeError::Io(Arc::clone(e)),
            ProbeError::Truncated { what, needed, have } => ProbeError::Truncated {
                what,
                needed: *needed,
                have: *have,
            },
            ProbeError::InvalidPacket(s) => ProbeError::InvalidPacket(s.clone()),
            ProbeError::UnsupportedHandshake(s) => ProbeError::UnsupportedHandshake(s),
            ProbeError::ChannelClosed => ProbeError::ChannelClosed,
            ProbeError::Capture(s) => ProbeError::Capture(s.clone()),
        }
    }
}

impl From<std::io::Error> for ProbeError {
    fn from(e: std::io::Error) -> Self {
        ProbeError::Io(Arc::new(e))
    }
}

impl PartialEq for ProbeError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ProbeError::Io(a), ProbeError::Io(b)) => a.kind() == b.kind(),
            (
                ProbeError::Truncated {
                    what: w1,
                    needed: n1,
                    have: h1,
                },
                ProbeError::Truncated {
                    what: w2,
                    needed: n2,
                    have: h2,
                },
            ) => w1 == w2 && n1 == n2 && h1 == h2,
            (ProbeError::InvalidPacket(a), ProbeError::InvalidPacket(b)) => a == b,
            (ProbeError::UnsupportedHandshake(a), ProbeError::UnsupportedHandshake(b)) => a == b,
            (ProbeError::ChannelClosed, ProbeError::ChannelClosed) => true,
            (ProbeError::Capture(a), ProbeError::Capture(b)) => a == b,
            _ => false,
        }
    }
}
