// src/connection/phase.rs

//! The correlation phase of a single MySQL connection.
//!
//! A connection alternates between waiting for a client command and waiting
//! for the reply to it. Independently, a server greeting announces that the
//! next client packet is a handshake response. The three situations are
//! mutually exclusive in practice, so they are a single enum instead of a set
//! of flags:
//!
//! | from               | event                          | to                  |
//! |--------------------|--------------------------------|---------------------|
//! | any                | server packet with seq 0       | `HandshakeExpected` |
//! | `HandshakeExpected`| client packet with seq 1       | `Idle`              |
//! | any                | supported client command       | `RequestCaptured`   |
//! | any                | unsupported client command     | `Idle`              |
//! | `RequestCaptured`  | server packet with seq 1       | `Idle`              |

use crate::core::protocol::Command;
use std::mem;

/// The client half of an exchange, captured when the command is seen and
/// completed when the reply arrives.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest {
    pub command: Command,
    /// Capture time of the command, in nanoseconds since the Unix epoch.
    pub timestamp: i64,
    /// Normalized statement text reported in the record. Empty when unknown.
    pub sql: String,
    /// Statement text as sent. For executions, the prepared text.
    pub raw: String,
    /// Statement text to register once a `COM_STMT_PREPARE` succeeds.
    pub prepared_sql: Option<String>,
    /// Database requested by `COM_INIT_DB`.
    pub target_db: Option<String>,
}

impl PendingRequest {
    pub fn new(command: Command, timestamp: i64) -> Self {
        Self {
            command,
            timestamp,
            sql: String::new(),
            raw: String::new(),
            prepared_sql: None,
            target_db: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum StreamPhase {
    /// No command is outstanding.
    #[default]
    Idle,
    /// The server sent its greeting; the next client packet with sequence 1
    /// should be a handshake response.
    HandshakeExpected,
    /// A command was captured and its reply is awaited.
    RequestCaptured(PendingRequest),
}

impl StreamPhase {
    pub fn is_awaiting_response(&self) -> bool {
        matches!(self, StreamPhase::RequestCaptured(_))
    }

    pub fn expects_handshake(&self) -> bool {
        matches!(self, StreamPhase::HandshakeExpected)
    }

    pub fn pending(&self) -> Option<&PendingRequest> {
        match self {
            StreamPhase::RequestCaptured(req) => Some(req),
            _ => None,
        }
    }

    /// Moves back to `Idle`, returning the request that was outstanding.
    pub fn take_pending(&mut self) -> Option<PendingRequest> {
        match mem::take(self) {
            StreamPhase::RequestCaptured(req) => Some(req),
            other => {
                *self = other;
                None
            }
        }
    }
}
