// src/core/protocol/request.rs

//! Decoding of client command packets (the first packet of each command).

use super::packet::PayloadReader;
use crate::core::ProbeError;
use bytes::{BufMut, BytesMut};

/// A client command byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Sleep,
    Quit,
    InitDb,
    Query,
    FieldList,
    CreateDb,
    DropDb,
    Refresh,
    Statistics,
    ProcessInfo,
    ProcessKill,
    Debug,
    Ping,
    ChangeUser,
    BinlogDump,
    StmtPrepare,
    StmtExecute,
    StmtSendLongData,
    StmtClose,
    StmtReset,
    SetOption,
    StmtFetch,
    ResetConnection,
    Other(u8),
}

impl Command {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x00 => Command::Sleep,
            0x01 => Command::Quit,
            0x02 => Command::InitDb,
            0x03 => Command::Query,
            0x04 => Command::FieldList,
            0x05 => Command::CreateDb,
            0x06 => Command::DropDb,
            0x07 => Command::Refresh,
            0x09 => Command::Statistics,
            0x0a => Command::ProcessInfo,
            0x0c => Command::ProcessKill,
            0x0d => Command::Debug,
            0x0e => Command::Ping,
            0x11 => Command::ChangeUser,
            0x12 => Command::BinlogDump,
            0x16 => Command::StmtPrepare,
            0x17 => Command::StmtExecute,
            0x18 => Command::StmtSendLongData,
            0x19 => Command::StmtClose,
            0x1a => Command::StmtReset,
            0x1b => Command::SetOption,
            0x1c => Command::StmtFetch,
            0x1f => Command::ResetConnection,
            other => Command::Other(other),
        }
    }

    pub fn as_byte(&self) -> u8 {
        match self {
            Command::Sleep => 0x00,
            Command::Quit => 0x01,
            Command::InitDb => 0x02,
            Command::Query => 0x03,
            Command::FieldList => 0x04,
            Command::CreateDb => 0x05,
            Command::DropDb => 0x06,
            Command::Refresh => 0x07,
            Command::Statistics => 0x09,
            Command::ProcessInfo => 0x0a,
            Command::ProcessKill => 0x0c,
            Command::Debug => 0x0d,
            Command::Ping => 0x0e,
            Command::ChangeUser => 0x11,
            Command::BinlogDump => 0x12,
            Command::StmtPrepare => 0x16,
            Command::StmtExecute => 0x17,
            Command::StmtSendLongData => 0x18,
            Command::StmtClose => 0x19,
            Command::StmtReset => 0x1a,
            Command::SetOption => 0x1b,
            Command::StmtFetch => 0x1c,
            Command::ResetConnection => 0x1f,
            Command::Other(b) => *b,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Sleep => "COM_SLEEP",
            Command::Quit => "COM_QUIT",
            Command::InitDb => "COM_INIT_DB",
            Command::Query => "COM_QUERY",
            Command::FieldList => "COM_FIELD_LIST",
            Command::CreateDb => "COM_CREATE_DB",
            Command::DropDb => "COM_DROP_DB",
            Command::Refresh => "COM_REFRESH",
            Command::Statistics => "COM_STATISTICS",
            Command::ProcessInfo => "COM_PROCESS_INFO",
            Command::ProcessKill => "COM_PROCESS_KILL",
            Command::Debug => "COM_DEBUG",
            Command::Ping => "COM_PING",
            Command::ChangeUser => "COM_CHANGE_USER",
            Command::BinlogDump => "COM_BINLOG_DUMP",
            Command::StmtPrepare => "COM_STMT_PREPARE",
            Command::StmtExecute => "COM_STMT_EXECUTE",
            Command::StmtSendLongData => "COM_STMT_SEND_LONG_DATA",
            Command::StmtClose => "COM_STMT_CLOSE",
            Command::StmtReset => "COM_STMT_RESET",
            Command::SetOption => "COM_SET_OPTION",
            Command::StmtFetch => "COM_STMT_FETCH",
            Command::ResetConnection => "COM_RESET_CONNECTION",
            Command::Other(_) => "COM_UNKNOWN",
        }
    }
}

/// A decoded client command. Only the commands the probe correlates carry
/// their arguments; everything else is `Other`.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Query { sql: String },
    StmtPrepare { sql: String },
    StmtExecute { stmt_id: u32 },
    InitDb { db: String },
    Other(Command),
}

impl Request {
    /// Decodes a command packet payload.
    pub fn decode(payload: &[u8]) -> Result<Self, ProbeError> {
        let mut reader = PayloadReader::new(payload);
        let command = Command::from_byte(reader.u8("command")?);

        let request = match command {
            Command::Query => Request::Query {
                sql: String::from_utf8_lossy(reader.rest()).into_owned(),
            },
            Command::StmtPrepare => Request::StmtPrepare {
                sql: String::from_utf8_lossy(reader.rest()).into_owned(),
            },
            Command::StmtExecute => Request::StmtExecute {
                stmt_id: reader.u32_le("statement id")?,
            },
            Command::InitDb => Request::InitDb {
                db: String::from_utf8_lossy(reader.rest()).into_owned(),
            },
            other => Request::Other(other),
        };
        Ok(request)
    }

    pub fn command(&self) -> Command {
        match self {
            Request::Query { .. } => Command::Query,
            Request::StmtPrepare { .. } => Command::StmtPrepare,
            Request::StmtExecute { .. } => Command::StmtExecute,
            Request::InitDb { .. } => Command::InitDb,
            Request::Other(cmd) => *cmd,
        }
    }

    /// The SQL text as sent by the client, for commands that carry one.
    pub fn sql(&self) -> Option<&str> {
        match self {
            Request::Query { sql } | Request::StmtPrepare { sql } => Some(sql.as_str()),
            _ => None,
        }
    }

    /// Encodes the request back into a command payload.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(self.command().as_byte());
        match self {
            Request::Query { sql } | Request::StmtPrepare { sql } => {
                buf.extend_from_slice(sql.as_bytes())
            }
            Request::StmtExecute { stmt_id } => {
                buf.put_u32_le(*stmt_id);
                // flags (CURSOR_TYPE_NO_CURSOR) and iteration count
                buf.put_u8(0);
                buf.put_u32_le(1);
            }
            Request::InitDb { db } => buf.extend_from_slice(db.as_bytes()),
            Request::Other(_) => {}
        }
        buf
    }
}
