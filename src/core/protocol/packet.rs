// src/core/protocol/packet.rs

//! MySQL packet framing (3-byte little-endian length plus a sequence number)
//! and a bounds-checked reader for packet payloads.

use crate::core::ProbeError;
use bytes::{BufMut, Bytes, BytesMut};

/// Size of the MySQL packet header.
pub const HEADER_LEN: usize = 4;

/// The sequence number of the first packet of a command, sent by the client.
/// A server packet with this sequence number is the initial handshake.
pub const REQUEST_SEQ: u8 = 0;

/// The sequence number of the first packet of the server's reply to a command.
pub const RESPONSE_SEQ: u8 = 1;

/// Largest payload a single MySQL packet can carry.
pub const MAX_PAYLOAD_LEN: usize = 0xff_ff_ff;

/// The first MySQL packet found at the start of a TCP segment payload.
///
/// Segments that coalesce several MySQL packets are not split: anything past
/// the first packet is ignored.
#[derive(Debug, Clone, PartialEq)]
pub struct BasePacket {
    seq: u8,
    length: usize,
    payload: Bytes,
}

impl BasePacket {
    /// Decodes the packet header at the start of `data`.
    ///
    /// A payload that runs past the end of the segment is kept truncated;
    /// statements larger than one segment still yield their leading text.
    pub fn decode(data: &Bytes) -> Result<Self, ProbeError> {
        if data.len() < HEADER_LEN {
            return Err(ProbeError::Truncated {
                what: "packet header",
                needed: HEADER_LEN,
                have: data.len(),
            });
        }

        let length = data[0] as usize | (data[1] as usize) << 8 | (data[2] as usize) << 16;
        let seq = data[3];
        if length == 0 {
            return Err(ProbeError::InvalidPacket(
                "zero-length mysql packet".to_string(),
            ));
        }

        let end = (HEADER_LEN + length).min(data.len());
        if end == HEADER_LEN {
            return Err(ProbeError::Truncated {
                what: "packet payload",
                needed: length,
                have: 0,
            });
        }

        Ok(Self {
            seq,
            length,
            payload: data.slice(HEADER_LEN..end),
        })
    }

    pub fn seq(&self) -> u8 {
        self.seq
    }

    /// The payload length announced by the header.
    pub fn length(&self) -> usize {
        self.length
    }

    /// The payload bytes present in the segment.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// True when the segment ended before the announced payload length.
    pub fn is_truncated(&self) -> bool {
        self.payload.len() < self.length
    }

    /// Frames `payload` into a complete MySQL packet.
    pub fn encode(seq: u8, payload: &[u8]) -> Bytes {
        let len = payload.len().min(MAX_PAYLOAD_LEN);
        let mut buf = BytesMut::with_capacity(HEADER_LEN + len);
        buf.put_u8((len & 0xff) as u8);
        buf.put_u8(((len >> 8) & 0xff) as u8);
        buf.put_u8(((len >> 16) & 0xff) as u8);
        buf.put_u8(seq);
        buf.extend_from_slice(&payload[..len]);
        buf.freeze()
    }
}

/// A cursor over a packet payload. Every read is bounds-checked and reports
/// which field ran out of bytes.
#[derive(Debug)]
pub struct PayloadReader<'a> {
    buf: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn peek_u8(&self) -> Option<u8> {
        self.buf.first().copied()
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], ProbeError> {
        if self.buf.len() < n {
            return Err(ProbeError::Truncated {
                what,
                needed: n,
                have: self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn skip(&mut self, n: usize, what: &'static str) -> Result<(), ProbeError> {
        self.take(n, what).map(|_| ())
    }

    pub fn u8(&mut self, what: &'static str) -> Result<u8, ProbeError> {
        Ok(self.take(1, what)?[0])
    }

    pub fn u16_le(&mut self, what: &'static str) -> Result<u16, ProbeError> {
        let b = self.take(2, what)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32_le(&mut self, what: &'static str) -> Result<u32, ProbeError> {
        let b = self.take(4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a length-encoded integer.
    pub fn lenenc_int(&mut self, what: &'static str) -> Result<u64, ProbeError> {
        let first = self.u8(what)?;
        match first {
            0x00..=0xfa => Ok(first as u64),
            0xfc => {
                let b = self.take(2, what)?;
                Ok(b[0] as u64 | (b[1] as u64) << 8)
            }
            0xfd => {
                let b = self.take(3, what)?;
                Ok(b[0] as u64 | (b[1] as u64) << 8 | (b[2] as u64) << 16)
            }
            0xfe => {
                let b = self.take(8, what)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(b);
                Ok(u64::from_le_bytes(raw))
            }
            marker => Err(ProbeError::InvalidPacket(format!(
                "{what}: invalid length-encoded integer marker {marker:#04x}"
            ))),
        }
    }

    /// Reads a NUL-terminated string, consuming the terminator.
    pub fn null_str(&mut self, what: &'static str) -> Result<String, ProbeError> {
        let pos = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| ProbeError::InvalidPacket(format!("{what}: missing NUL terminator")))?;
        let s = String::from_utf8_lossy(&self.buf[..pos]).into_owned();
        self.buf = &self.buf[pos + 1..];
        Ok(s)
    }

    /// Reads a string that may or may not be NUL-terminated before the end of
    /// the payload.
    pub fn null_str_or_eof(&mut self) -> String {
        let pos = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.buf.len());
        let s = String::from_utf8_lossy(&self.buf[..pos]).into_owned();
        self.buf = &self.buf[(pos + 1).min(self.buf.len())..];
        s
    }

    pub fn bytes(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], ProbeError> {
        self.take(n, what)
    }

    /// Consumes and returns everything left in the payload.
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = self.buf;
        self.buf = &[];
        rest
    }
}

/// Appends a length-encoded integer.
pub fn put_lenenc_int(dst: &mut BytesMut, val: u64) {
    if val < 251 {
        dst.put_u8(val as u8);
    } else if val < (1 << 16) {
        dst.put_u8(0xfc);
        dst.put_u16_le(val as u16);
    } else if val < (1 << 24) {
        dst.put_u8(0xfd);
        dst.put_u8((val & 0xff) as u8);
        dst.put_u8(((val >> 8) & 0xff) as u8);
        dst.put_u8(((val >> 16) & 0xff) as u8);
    } else {
        dst.put_u8(0xfe);
        dst.put_u64_le(val);
    }
}
