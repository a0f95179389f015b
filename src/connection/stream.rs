// src/connection/stream.rs

//! The per-connection decoder and the task that drives it.
//!
//! [`StreamState`] holds everything the probe knows about one TCP connection
//! and turns captured packets into [`Message`]s. It performs no I/O, so it can
//! be driven directly in tests. [`StreamHandle::spawn`] wraps it in a Tokio
//! task fed through a bounded channel, which is how the dispatcher runs it.

use super::phase::{PendingRequest, StreamPhase};
use crate::core::flow::{CapturedPacket, FlowKey, IsRequest};
use crate::core::message::{Message, UNKNOWN_DB_NAME};
use crate::core::metrics::{MESSAGES_EMITTED_TOTAL, PACKETS_DROPPED_TOTAL, QUERY_LATENCY_SECONDS};
use crate::core::protocol::{
    BasePacket, HandshakeResponse, REQUEST_SEQ, RESPONSE_SEQ, Request, Response, normalize_query,
};
use crate::core::resolver::DbNameResolver;
use crate::core::ProbeError;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

/// Statements shorter than this are never reported. This filters out
/// replies to commands for which no text was captured.
const MIN_REPORTED_SQL_LEN: usize = 5;

/// The server and client side of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoints {
    pub server: SocketAddr,
    pub client: SocketAddr,
}

impl Endpoints {
    /// Derives the roles from the first packet seen on a connection: if that
    /// packet travels in the request direction, the server is its destination.
    pub fn classify(key: &FlowKey, is_request: &IsRequest) -> Self {
        let src = SocketAddr::new(key.net.src, key.transport.src);
        let dst = SocketAddr::new(key.net.dst, key.transport.dst);
        if is_request(&key.net, &key.transport) {
            Self {
                server: dst,
                client: src,
            }
        } else {
            Self {
                server: src,
                client: dst,
            }
        }
    }
}

/// Decode and correlation state of a single MySQL connection.
pub struct StreamState {
    name: String,
    endpoints: Endpoints,
    is_request: IsRequest,
    resolver: Option<Arc<dyn DbNameResolver>>,
    phase: StreamPhase,
    /// Prepared statement id → statement text as sent.
    statements: HashMap<u32, String>,
    db: Option<String>,
    user: Option<String>,
}

impl StreamState {
    pub fn new(name: impl Into<String>, endpoints: Endpoints, is_request: IsRequest) -> Self {
        Self {
            name: name.into(),
            endpoints,
            is_request,
            resolver: None,
            phase: StreamPhase::Idle,
            statements: HashMap::new(),
            db: None,
            user: None,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn DbNameResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoints(&self) -> Endpoints {
        self.endpoints
    }

    pub fn phase(&self) -> &StreamPhase {
        &self.phase
    }

    /// The text a prepared statement was registered with.
    pub fn statement(&self, stmt_id: u32) -> Option<&str> {
        self.statements.get(&stmt_id).map(String::as_str)
    }

    pub fn statement_count(&self) -> usize {
        self.statements.len()
    }

    /// The database this connection is known to use.
    pub fn db(&self) -> Option<&str> {
        self.db.as_deref()
    }

    /// The user name seen in the last handshake response.
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Feeds one captured packet through the state machine, returning a
    /// record if the packet completed a reportable exchange.
    ///
    /// Decode failures are logged and counted, never returned: a bad packet
    /// costs that one event, not the connection.
    pub fn process(&mut self, packet: &CapturedPacket) -> Option<Message> {
        if packet.is_empty_ack() {
            return None;
        }
        if packet.payload.is_empty() {
            trace!("[{}] control packet {:?}", self.name, packet.flags);
            return None;
        }

        let base = match BasePacket::decode(&packet.payload) {
            Ok(base) => base,
            Err(e) => {
                self.drop_packet("base packet", &e);
                return None;
            }
        };

        if (self.is_request)(&packet.net, &packet.transport) {
            self.on_client_packet(&base, packet.timestamp_nanos());
            None
        } else {
            self.on_server_packet(&base, packet.timestamp_nanos())
        }
    }

    fn on_client_packet(&mut self, base: &BasePacket, timestamp: i64) {
        if self.phase.expects_handshake() && base.seq() == 1 {
            self.phase = StreamPhase::Idle;
            match HandshakeResponse::decode(base.payload()) {
                Ok(handshake) => self.on_handshake(handshake),
                Err(e) => {
                    warn!("[{}] parse handshake response failed: {}", self.name, e);
                    PACKETS_DROPPED_TOTAL.with_label_values(&[e.reason()]).inc();
                }
            }
            return;
        }

        if base.seq() != REQUEST_SEQ {
            trace!("[{}] skip client packet with seq {}", self.name, base.seq());
            return;
        }

        let request = match Request::decode(base.payload()) {
            Ok(request) => request,
            Err(e) => {
                self.drop_packet("request", &e);
                return;
            }
        };

        let mut pending = PendingRequest::new(request.command(), timestamp);
        if let Some(sql) = request.sql() {
            debug!("[{}] [{}] sql: {}", self.name, request.command().name(), sql);
        }
        match request {
            Request::Query { sql } => {
                pending.sql = normalize_query(&sql);
                pending.raw = sql;
            }
            Request::StmtPrepare { sql } => pending.prepared_sql = Some(sql),
            Request::StmtExecute { stmt_id } => match self.statements.get(&stmt_id) {
                Some(sql) => {
                    debug!("[{}] [execute] stmt {}: {}", self.name, stmt_id, sql);
                    pending.sql = normalize_query(sql);
                    pending.raw = sql.clone();
                }
                None => {
                    debug!(
                        "[{}] [execute] no prepared statement known for id {}",
                        self.name, stmt_id
                    );
                }
            },
            Request::InitDb { db } => {
                debug!("[{}] [init db] db: {}", self.name, db);
                pending.target_db = Some(db);
            }
            Request::Other(command) => {
                trace!("[{}] skip command {}", self.name, command.name());
                self.phase = StreamPhase::Idle;
                return;
            }
        }
        self.phase = StreamPhase::RequestCaptured(pending);
    }

    fn on_handshake(&mut self, handshake: HandshakeResponse) {
        debug!(
            "[{}] handshake response: user {}, db {:?}",
            self.name, handshake.username, handshake.database
        );
        self.user = Some(handshake.username);
        self.db = handshake.database.filter(|db| !db.is_empty());
        if let Some(db) = &self.db {
            self.publish_db(db);
        }
        if !self.statements.is_empty() {
            debug!(
                "[{}] new handshake, dropping {} prepared statements",
                self.name,
                self.statements.len()
            );
            self.statements.clear();
        }
    }

    fn on_server_packet(&mut self, base: &BasePacket, timestamp: i64) -> Option<Message> {
        if base.seq() == REQUEST_SEQ {
            trace!("[{}] server greeting", self.name);
            self.phase = StreamPhase::HandshakeExpected;
            return None;
        }

        let command = self.phase.pending()?.command;

        if base.seq() != RESPONSE_SEQ {
            trace!("[{}] skip server packet with seq {}", self.name, base.seq());
            return None;
        }

        let response = match Response::decode(base.payload(), command) {
            Ok(response) => response,
            Err(e) => {
                self.drop_packet("response", &e);
                return None;
            }
        };

        let pending = self.phase.take_pending()?;
        let mut msg = Message {
            sql: pending.sql,
            raw: pending.raw,
            timestamp_req: pending.timestamp,
            ..Default::default()
        };
        msg.set_response_time(timestamp);

        match response {
            Response::Ok(ok) => {
                msg.affected_rows = ok.affected_rows;
                msg.server_status = ok.status;
                if let Some(db) = pending.target_db {
                    debug!("[{}] [init db] switched to {}", self.name, db);
                    self.publish_db(&db);
                    self.db = Some(db).filter(|db| !db.is_empty());
                }
            }
            Response::PrepareOk(prepare) => {
                if let Some(sql) = pending.prepared_sql {
                    debug!(
                        "[{}] [prepare] registered stmt {}: {}",
                        self.name, prepare.stmt_id, sql
                    );
                    self.statements.insert(prepare.stmt_id, sql);
                }
            }
            Response::Err(err) => {
                msg.err = true;
                msg.errno = err.errno;
                msg.err_msg = err.message;
            }
            Response::ResultSet { .. } => {}
        }

        if msg.sql.len() <= MIN_REPORTED_SQL_LEN {
            return None;
        }
        Some(self.finish(msg))
    }

    /// Stamps the connection details on a completed record.
    fn finish(&self, mut msg: Message) -> Message {
        msg.server_ip = self.endpoints.server.ip().to_string();
        msg.server_port = self.endpoints.server.port();
        msg.client_ip = self.endpoints.client.ip().to_string();
        msg.client_port = self.endpoints.client.port();
        msg.db = match &self.db {
            Some(db) => db.clone(),
            None => self
                .resolver
                .as_ref()
                .and_then(|r| r.lookup(&self.client_key()))
                .unwrap_or_else(|| UNKNOWN_DB_NAME.to_string()),
        };
        msg.assembly_key = msg.assembly_hash_key();
        debug!("[{}] exchange complete: {}", self.name, msg.sql);
        msg
    }

    fn publish_db(&self, db: &str) {
        if let Some(resolver) = &self.resolver {
            resolver.observe(&self.client_key(), db);
        }
    }

    /// The key this connection has in the resolver.
    fn client_key(&self) -> String {
        self.endpoints.client.to_string()
    }

    fn drop_packet(&self, what: &str, err: &ProbeError) {
        debug!("[{}] parse {} failed: {}", self.name, what, err);
        PACKETS_DROPPED_TOTAL.with_label_values(&[err.reason()]).inc();
    }
}

/// The dispatcher's side of a running stream task.
#[derive(Debug)]
pub struct StreamHandle {
    name: String,
    endpoints: Endpoints,
    tx: mpsc::Sender<CapturedPacket>,
    stop_tx: broadcast::Sender<()>,
    last_seen: DateTime<Utc>,
    closed: bool,
}

impl StreamHandle {
    /// Starts a task that feeds packets from a queue of `queue_len` entries
    /// through `state`, delivering records to `out`.
    pub fn spawn(
        state: StreamState,
        queue_len: usize,
        out: mpsc::UnboundedSender<Message>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_len.max(1));
        let (stop_tx, stop_rx) = broadcast::channel(1);
        let handle = Self {
            name: state.name().to_string(),
            endpoints: state.endpoints(),
            tx,
            stop_tx,
            last_seen: created_at,
            closed: false,
        };
        tokio::spawn(run(state, rx, stop_rx, out));
        handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoints(&self) -> Endpoints {
        self.endpoints
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_seen
    }

    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.last_seen = at;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Queues a packet for the task, waiting while the queue is full.
    pub async fn send(&self, packet: CapturedPacket) -> Result<(), ProbeError> {
        self.tx
            .send(packet)
            .await
            .map_err(|_| ProbeError::ChannelClosed)
    }

    /// Signals the task to stop. Packets still queued are abandoned. Calling
    /// this more than once has no further effect.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        // The task may already be gone; there is nothing left to stop then.
        let _ = self.stop_tx.send(());
    }
}

async fn run(
    mut state: StreamState,
    mut rx: mpsc::Receiver<CapturedPacket>,
    mut stop_rx: broadcast::Receiver<()>,
    out: mpsc::UnboundedSender<Message>,
) {
    // Set once the handle is dropped without a close signal; the task then
    // works through whatever is queued and exits when the queue runs dry.
    let mut detached = false;
    loop {
        tokio::select! {
            biased;
            res = stop_rx.recv(), if !detached => {
                if let Err(broadcast::error::RecvError::Closed) = res {
                    detached = true;
                    continue;
                }
                debug!("[{}] close stream", state.name());
                return;
            }
            packet = rx.recv() => {
                let Some(packet) = packet else {
                    debug!("[{}] packet queue closed", state.name());
                    return;
                };
                if let Some(msg) = state.process(&packet) {
                    MESSAGES_EMITTED_TOTAL.inc();
                    QUERY_LATENCY_SECONDS.observe(msg.latency / 1000.0);
                    if out.send(msg).is_err() {
                        debug!("[{}] output closed, dropping record", state.name());
                    }
                }
            }
        }
    }
}
