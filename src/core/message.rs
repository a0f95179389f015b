// src/core/message.rs

//! The record emitted for every completed request/response pair.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Database name reported when neither the connection nor the resolver knows it.
pub const UNKNOWN_DB_NAME: &str = "unknown";

/// One completed request/response exchange.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Normalized statement text.
    pub sql: String,
    /// Statement text as sent. Empty for prepared-statement executions.
    pub raw: String,
    pub err: bool,
    pub errno: u16,
    pub err_msg: String,
    pub affected_rows: u64,
    pub server_status: u16,
    /// Capture time of the request, in nanoseconds since the Unix epoch.
    pub timestamp_req: i64,
    /// Capture time of the response, in nanoseconds since the Unix epoch.
    pub timestamp_rsp: i64,
    /// Response time in milliseconds.
    pub latency: f64,
    pub server_ip: String,
    pub server_port: u16,
    pub client_ip: String,
    pub client_port: u16,
    pub db: String,
    /// Grouping key for downstream aggregation, see [`Message::assembly_hash_key`].
    pub assembly_key: String,
}

impl Message {
    /// Records the response time and derives the latency from it.
    pub fn set_response_time(&mut self, timestamp_rsp: i64) {
        self.timestamp_rsp = timestamp_rsp;
        self.latency = (timestamp_rsp - self.timestamp_req) as f64 / 1_000_000.0;
    }

    /// The hex SHA-1 of database, normalized statement and server endpoint.
    /// Executions of the same statement against the same server and database
    /// share a key.
    pub fn assembly_hash_key(&self) -> String {
        let mut hasher = Sha1::new();
        hasher.update(self.db.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.sql.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.server_ip.as_bytes());
        hasher.update(b":");
        hasher.update(self.server_port.to_be_bytes());
        hex::encode(hasher.finalize())
    }

    /// The client address in socket address notation (`ip:port`, with IPv6
    /// addresses in brackets). Resolver entries are keyed the same way.
    pub fn client_addr(&self) -> String {
        if self.client_ip.contains(':') {
            format!("[{}]:{}", self.client_ip, self.client_port)
        } else {
            format!("{}:{}", self.client_ip, self.client_port)
        }
    }
}
