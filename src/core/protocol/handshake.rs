// src/core/protocol/handshake.rs

//! Decoding of the client's handshake response (HandshakeResponse41), which
//! carries the username and, optionally, the initial database.

use super::packet::PayloadReader;
use crate::core::ProbeError;

pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
pub const CLIENT_SSL: u32 = 1 << 11;
pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;

/// Size of the fixed part of HandshakeResponse41, which is also the full size
/// of an SSLRequest packet.
const FIXED_PART_LEN: usize = 32;

/// The fields of a handshake response the probe cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub capability_flags: u32,
    pub max_packet_size: u32,
    pub charset: u8,
    pub username: String,
    pub database: Option<String>,
    pub auth_plugin: Option<String>,
}

impl HandshakeResponse {
    pub fn decode(payload: &[u8]) -> Result<Self, ProbeError> {
        let mut reader = PayloadReader::new(payload);
        let capability_flags = reader.u32_le("capability flags")?;
        if capability_flags & CLIENT_PROTOCOL_41 == 0 {
            return Err(ProbeError::UnsupportedHandshake("pre-4.1 protocol"));
        }
        if capability_flags & CLIENT_SSL != 0 && payload.len() <= FIXED_PART_LEN {
            return Err(ProbeError::UnsupportedHandshake("ssl request"));
        }

        let max_packet_size = reader.u32_le("max packet size")?;
        let charset = reader.u8("charset")?;
        reader.skip(23, "reserved")?;
        let username = reader.null_str("username")?;

        if capability_flags & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            let len = reader.lenenc_int("auth response length")? as usize;
            reader.skip(len, "auth response")?;
        } else if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            let len = reader.u8("auth response length")? as usize;
            reader.skip(len, "auth response")?;
        } else {
            reader.null_str("auth response")?;
        }

        let database = if capability_flags & CLIENT_CONNECT_WITH_DB != 0 && !reader.is_empty() {
            Some(reader.null_str_or_eof())
        } else {
            None
        };

        let auth_plugin = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && !reader.is_empty() {
            Some(reader.null_str_or_eof())
        } else {
            None
        };

        Ok(Self {
            capability_flags,
            max_packet_size,
            charset,
            username,
            database,
            auth_plugin,
        })
    }
}
