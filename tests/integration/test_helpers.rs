// tests/integration/test_helpers.rs

//! Test helpers: builders for MySQL traffic on a single simulated connection.

#![allow(dead_code)]

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Duration, TimeZone, Utc};
use mysqlprobe::connection::{Endpoints, StreamState};
use mysqlprobe::core::flow::{
    CapturedPacket, NetworkFlow, TcpFlags, TransportFlow, dst_port_classifier,
};
use mysqlprobe::core::protocol::handshake::{
    CLIENT_CONNECT_WITH_DB, CLIENT_PLUGIN_AUTH, CLIENT_PROTOCOL_41, CLIENT_SECURE_CONNECTION,
};
use mysqlprobe::core::protocol::{BasePacket, ErrPacket, OkPacket, PrepareOk, Request};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, reload};

pub const SERVER_PORT: u16 = 3306;

/// Installs a test-writer subscriber once per test binary.
pub fn init_tracing() {
    let (filter, _reload_handle) = reload::Layer::new(EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// A fixed reference time; packet times are given in milliseconds after it.
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

pub fn at(ms: i64) -> DateTime<Utc> {
    epoch() + Duration::milliseconds(ms)
}

/// One simulated client connection to a MySQL server on port 3306.
#[derive(Debug, Clone, Copy)]
pub struct Conn {
    pub client: SocketAddr,
    pub server: SocketAddr,
}

impl Conn {
    pub fn new(client_port: u16) -> Self {
        Self {
            client: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)), client_port),
            server: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), SERVER_PORT),
        }
    }

    /// The same connection shape over IPv6: `[fd00::7]` to `[fd00::1]:3306`.
    pub fn v6(client_port: u16) -> Self {
        Self {
            client: SocketAddr::new(
                IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 7)),
                client_port,
            ),
            server: SocketAddr::new(
                IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 1)),
                SERVER_PORT,
            ),
        }
    }

    /// Decode state for this connection, as the dispatcher would create it.
    pub fn state(&self) -> StreamState {
        let is_request = dst_port_classifier(SERVER_PORT);
        let endpoints = Endpoints {
            server: self.server,
            client: self.client,
        };
        StreamState::new(format!("test-{}", self.client), endpoints, is_request)
    }

    fn packet(&self, from_client: bool, payload: Bytes, ms: i64) -> CapturedPacket {
        let (src, dst) = if from_client {
            (self.client, self.server)
        } else {
            (self.server, self.client)
        };
        CapturedPacket {
            net: NetworkFlow::new(src.ip(), dst.ip()),
            transport: TransportFlow::new(src.port(), dst.port()),
            flags: TcpFlags::default(),
            payload,
            timestamp: at(ms),
        }
    }

    pub fn client_raw(&self, payload: Bytes, ms: i64) -> CapturedPacket {
        self.packet(true, payload, ms)
    }

    pub fn server_raw(&self, payload: Bytes, ms: i64) -> CapturedPacket {
        self.packet(false, payload, ms)
    }

    pub fn client(&self, seq: u8, payload: &[u8], ms: i64) -> CapturedPacket {
        self.packet(true, BasePacket::encode(seq, payload), ms)
    }

    pub fn server(&self, seq: u8, payload: &[u8], ms: i64) -> CapturedPacket {
        self.packet(false, BasePacket::encode(seq, payload), ms)
    }

    pub fn query(&self, sql: &str, ms: i64) -> CapturedPacket {
        let req = Request::Query {
            sql: sql.to_string(),
        };
        self.client(0, &req.encode(), ms)
    }

    pub fn prepare(&self, sql: &str, ms: i64) -> CapturedPacket {
        let req = Request::StmtPrepare {
            sql: sql.to_string(),
        };
        self.client(0, &req.encode(), ms)
    }

    pub fn execute(&self, stmt_id: u32, ms: i64) -> CapturedPacket {
        self.client(0, &Request::StmtExecute { stmt_id }.encode(), ms)
    }

    pub fn init_db(&self, db: &str, ms: i64) -> CapturedPacket {
        let req = Request::InitDb { db: db.to_string() };
        self.client(0, &req.encode(), ms)
    }

    pub fn ping(&self, ms: i64) -> CapturedPacket {
        self.client(0, &[0x0e], ms)
    }

    pub fn ok(&self, affected_rows: u64, status: u16, ms: i64) -> CapturedPacket {
        let ok = OkPacket {
            affected_rows,
            last_insert_id: 0,
            status,
            warnings: 0,
        };
        self.server(1, &ok.encode(), ms)
    }

    pub fn prepare_ok(&self, stmt_id: u32, ms: i64) -> CapturedPacket {
        let ok = PrepareOk {
            stmt_id,
            num_columns: 1,
            num_params: 1,
            warnings: 0,
        };
        self.server(1, &ok.encode(), ms)
    }

    pub fn err(&self, errno: u16, message: &str, ms: i64) -> CapturedPacket {
        let err = ErrPacket {
            errno,
            sql_state: Some("42S02".to_string()),
            message: message.to_string(),
        };
        self.server(1, &err.encode(), ms)
    }

    /// The first packet of a result set: a column count of one.
    pub fn result_set(&self, ms: i64) -> CapturedPacket {
        self.server(1, &[0x01], ms)
    }

    /// The server greeting that opens a connection.
    pub fn greeting(&self, ms: i64) -> CapturedPacket {
        let mut payload = vec![0x0a];
        payload.extend_from_slice(b"8.0.36\0");
        payload.extend_from_slice(&[0u8; 40]);
        self.server(0, &payload, ms)
    }

    pub fn handshake_response(&self, user: &str, db: Option<&str>, ms: i64) -> CapturedPacket {
        self.client(1, &handshake_response_payload(user, db), ms)
    }

    pub fn empty_ack(&self, from_client: bool, ms: i64) -> CapturedPacket {
        self.packet(from_client, Bytes::new(), ms)
    }

    pub fn control(&self, from_client: bool, flags: TcpFlags, ms: i64) -> CapturedPacket {
        let mut packet = self.packet(from_client, Bytes::new(), ms);
        packet.flags = flags;
        packet
    }
}

/// A HandshakeResponse41 payload with a 20-byte auth response.
pub fn handshake_response_payload(user: &str, db: Option<&str>) -> BytesMut {
    let mut flags = CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION | CLIENT_PLUGIN_AUTH;
    if db.is_some() {
        flags |= CLIENT_CONNECT_WITH_DB;
    }
    let mut buf = BytesMut::new();
    buf.put_u32_le(flags);
    buf.put_u32_le(16 * 1024 * 1024);
    buf.put_u8(33);
    buf.put_bytes(0, 23);
    buf.extend_from_slice(user.as_bytes());
    buf.put_u8(0);
    buf.put_u8(20);
    buf.put_bytes(0xab, 20);
    if let Some(db) = db {
        buf.extend_from_slice(db.as_bytes());
        buf.put_u8(0);
    }
    buf.extend_from_slice(b"mysql_native_password\0");
    buf
}
