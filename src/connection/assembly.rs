// src/connection/assembly.rs

//! Routes captured packets to the stream task owning their connection.

use super::stream::{Endpoints, StreamHandle, StreamState};
use crate::core::flow::{CapturedPacket, FlowKey, IsRequest};
use crate::core::message::Message;
use crate::core::metrics::{ACTIVE_STREAMS, PACKETS_RECEIVED_TOTAL, STREAMS_EVICTED_TOTAL};
use crate::core::resolver::DbNameResolver;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Default depth of each stream's packet queue.
pub const DEFAULT_INPUT_QUEUE_LENGTH: usize = 100;

/// The flow dispatcher of one worker.
///
/// Each connection is registered under the key of the first packet seen on
/// it and found again through either orientation of that key. The table is
/// only reachable through `&mut self`, so insertion and eviction never race.
pub struct Assembly {
    name: String,
    streams: HashMap<FlowKey, StreamHandle>,
    out: mpsc::UnboundedSender<Message>,
    is_request: IsRequest,
    resolver: Option<Arc<dyn DbNameResolver>>,
    input_queue_length: usize,
}

impl Assembly {
    pub fn new(
        name: impl Into<String>,
        is_request: IsRequest,
        out: mpsc::UnboundedSender<Message>,
    ) -> Self {
        Self {
            name: name.into(),
            streams: HashMap::new(),
            out,
            is_request,
            resolver: None,
            input_queue_length: DEFAULT_INPUT_QUEUE_LENGTH,
        }
    }

    /// Sets the resolver consulted for connections whose database is unknown.
    pub fn with_resolver(mut self, resolver: Arc<dyn DbNameResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_input_queue_length(mut self, len: usize) -> Self {
        self.input_queue_length = len.max(1);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Finds the stream of the connection `key` belongs to, in either direction.
    pub fn find(&self, key: &FlowKey) -> Option<&StreamHandle> {
        self.streams
            .get(key)
            .or_else(|| self.streams.get(&key.reverse()))
    }

    /// Hands a packet to the stream of its connection, starting one if the
    /// connection is new. Waits while that stream's queue is full.
    pub async fn assemble(&mut self, packet: CapturedPacket) {
        PACKETS_RECEIVED_TOTAL.inc();

        let key = self.resolve_key(&packet);
        let Some(stream) = self.streams.get_mut(&key) else {
            return;
        };
        stream.touch(packet.timestamp);

        if stream.send(packet).await.is_err() {
            // The task ended on its own; forget it so the next packet starts over.
            debug!("[{}] stream {} is gone, unregistering", self.name, key);
            if let Some(mut stream) = self.streams.remove(&key) {
                stream.close();
                ACTIVE_STREAMS.dec();
            }
        }
    }

    /// Returns the registered key for the packet's connection, creating the
    /// stream when neither orientation is known.
    fn resolve_key(&mut self, packet: &CapturedPacket) -> FlowKey {
        let key = packet.key();
        if self.streams.contains_key(&key) {
            return key;
        }
        let reversed = key.reverse();
        if self.streams.contains_key(&reversed) {
            return reversed;
        }

        let endpoints = Endpoints::classify(&key, &self.is_request);
        let name = format!("{}-{}", self.name, key);
        let mut state = StreamState::new(name, endpoints, self.is_request.clone());
        if let Some(resolver) = &self.resolver {
            state = state.with_resolver(resolver.clone());
        }
        debug!(
            "[{}] new stream {}, server {}, client {}",
            self.name, key, endpoints.server, endpoints.client
        );
        let handle = StreamHandle::spawn(
            state,
            self.input_queue_length,
            self.out.clone(),
            packet.timestamp,
        );
        self.streams.insert(key, handle);
        ACTIVE_STREAMS.inc();
        key
    }

    /// Closes and unregisters every stream last active strictly before
    /// `cutoff`, returning how many were closed.
    pub fn close_older_than(&mut self, cutoff: DateTime<Utc>) -> usize {
        let mut closed = 0;
        let resolver = self.resolver.as_deref();
        self.streams.retain(|_, stream| {
            if stream.last_seen() < cutoff {
                close_stream(stream, resolver);
                closed += 1;
                false
            } else {
                true
            }
        });

        if closed > 0 {
            ACTIVE_STREAMS.sub(closed as f64);
            STREAMS_EVICTED_TOTAL.inc_by(closed as f64);
            info!(
                "[{}] closed {} streams idle since before {}",
                self.name, closed, cutoff
            );
        }
        closed
    }

    /// Unregisters every stream without closing it. Each task keeps going
    /// until it has processed the packets already queued to it.
    pub fn release_all(&mut self) -> usize {
        let count = self.streams.len();
        self.streams.clear();
        ACTIVE_STREAMS.sub(count as f64);
        count
    }

    /// Closes and unregisters every stream.
    pub fn close_all(&mut self) -> usize {
        let count = self.streams.len();
        for (_, mut stream) in self.streams.drain() {
            close_stream(&mut stream, self.resolver.as_deref());
        }
        ACTIVE_STREAMS.sub(count as f64);
        count
    }
}

/// Stops a stream and tells the resolver its connection is gone.
fn close_stream(stream: &mut StreamHandle, resolver: Option<&dyn DbNameResolver>) {
    stream.close();
    if let Some(resolver) = resolver {
        resolver.connection_closed(&stream.endpoints().client.to_string());
    }
}
