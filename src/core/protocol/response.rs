// src/core/protocol/response.rs

//! Decoding of the first packet of a server reply. Result sets are recognized
//! but their column and row packets are never decoded.

use super::packet::{PayloadReader, put_lenenc_int};
use super::request::Command;
use crate::core::ProbeError;
use bytes::{BufMut, BytesMut};

/// Leading byte of an OK packet.
pub const OK_HEADER: u8 = 0x00;
/// Leading byte of an ERR packet.
pub const ERR_HEADER: u8 = 0xff;

/// A generic OK packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status: u16,
    pub warnings: u16,
}

impl OkPacket {
    fn decode(reader: &mut PayloadReader<'_>) -> Result<Self, ProbeError> {
        let affected_rows = reader.lenenc_int("affected rows")?;
        let last_insert_id = reader.lenenc_int("last insert id")?;
        // Pre-4.1 servers omit the status and warning fields.
        let status = if reader.remaining() >= 2 {
            reader.u16_le("status flags")?
        } else {
            0
        };
        let warnings = if reader.remaining() >= 2 {
            reader.u16_le("warnings")?
        } else {
            0
        };
        Ok(Self {
            affected_rows,
            last_insert_id,
            status,
            warnings,
        })
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(OK_HEADER);
        put_lenenc_int(&mut buf, self.affected_rows);
        put_lenenc_int(&mut buf, self.last_insert_id);
        buf.put_u16_le(self.status);
        buf.put_u16_le(self.warnings);
        buf
    }
}

/// The OK reply to `COM_STMT_PREPARE`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrepareOk {
    pub stmt_id: u32,
    pub num_columns: u16,
    pub num_params: u16,
    pub warnings: u16,
}

impl PrepareOk {
    fn decode(reader: &mut PayloadReader<'_>) -> Result<Self, ProbeError> {
        let stmt_id = reader.u32_le("statement id")?;
        let num_columns = reader.u16_le("column count")?;
        let num_params = reader.u16_le("parameter count")?;
        let warnings = if reader.remaining() >= 3 {
            reader.skip(1, "reserved")?;
            reader.u16_le("warnings")?
        } else {
            0
        };
        Ok(Self {
            stmt_id,
            num_columns,
            num_params,
            warnings,
        })
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(OK_HEADER);
        buf.put_u32_le(self.stmt_id);
        buf.put_u16_le(self.num_columns);
        buf.put_u16_le(self.num_params);
        buf.put_u8(0);
        buf.put_u16_le(self.warnings);
        buf
    }
}

/// An ERR packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrPacket {
    pub errno: u16,
    pub sql_state: Option<String>,
    pub message: String,
}

impl ErrPacket {
    fn decode(reader: &mut PayloadReader<'_>) -> Result<Self, ProbeError> {
        let errno = reader.u16_le("error code")?;
        let sql_state = if reader.peek_u8() == Some(b'#') && reader.remaining() >= 6 {
            reader.skip(1, "sql state marker")?;
            let state = reader.bytes(5, "sql state")?;
            Some(String::from_utf8_lossy(state).into_owned())
        } else {
            None
        };
        let message = String::from_utf8_lossy(reader.rest()).into_owned();
        Ok(Self {
            errno,
            sql_state,
            message,
        })
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(ERR_HEADER);
        buf.put_u16_le(self.errno);
        if let Some(state) = &self.sql_state {
            buf.put_u8(b'#');
            let mut raw = [b'0'; 5];
            for (dst, src) in raw.iter_mut().zip(state.bytes()) {
                *dst = src;
            }
            buf.extend_from_slice(&raw);
        }
        buf.extend_from_slice(self.message.as_bytes());
        buf
    }
}

/// The classified first packet of a server reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Ok(OkPacket),
    PrepareOk(PrepareOk),
    Err(ErrPacket),
    /// Any other leading byte: the start of a result set (or an EOF/LOCAL
    /// INFILE marker). Treated as success without further decoding.
    ResultSet { header: u8 },
}

impl Response {
    /// Decodes a reply payload, using the command that was sent as context:
    /// an OK to `COM_STMT_PREPARE` has a different layout.
    pub fn decode(payload: &[u8], command: Command) -> Result<Self, ProbeError> {
        let mut reader = PayloadReader::new(payload);
        let header = reader.u8("response header")?;
        match header {
            OK_HEADER if command == Command::StmtPrepare => {
                Ok(Response::PrepareOk(PrepareOk::decode(&mut reader)?))
            }
            OK_HEADER => Ok(Response::Ok(OkPacket::decode(&mut reader)?)),
            ERR_HEADER => Ok(Response::Err(ErrPacket::decode(&mut reader)?)),
            other => Ok(Response::ResultSet { header: other }),
        }
    }
}
