// src/core/flow.rs

//! Flow identities for captured TCP traffic and the packet type handed over
//! by the capture layer.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;

/// The network-layer half of a flow: source and destination address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkFlow {
    pub src: IpAddr,
    pub dst: IpAddr,
}

impl NetworkFlow {
    pub fn new(src: IpAddr, dst: IpAddr) -> Self {
        Self { src, dst }
    }

    /// Returns the same flow seen from the other endpoint.
    pub fn reverse(&self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
        }
    }
}

impl fmt::Display for NetworkFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.src, self.dst)
    }
}

/// The transport-layer half of a flow: source and destination TCP port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportFlow {
    pub src: u16,
    pub dst: u16,
}

impl TransportFlow {
    pub fn new(src: u16, dst: u16) -> Self {
        Self { src, dst }
    }

    pub fn reverse(&self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
        }
    }
}

impl fmt::Display for TransportFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.src, self.dst)
    }
}

/// The pair of network and transport flow that identifies one direction of a
/// TCP connection. A key and its [`reverse`](FlowKey::reverse) name the same
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub net: NetworkFlow,
    pub transport: TransportFlow,
}

impl FlowKey {
    pub fn new(net: NetworkFlow, transport: TransportFlow) -> Self {
        Self { net, transport }
    }

    /// Reverses both halves of the key.
    pub fn reverse(&self) -> Self {
        Self {
            net: self.net.reverse(),
            transport: self.transport.reverse(),
        }
    }

    /// True if `other` is this key or its exact reverse.
    pub fn same_connection(&self, other: &FlowKey) -> bool {
        self == other || *self == other.reverse()
    }

    /// A hash that is identical for both directions of the connection, used
    /// to pin a connection to a single worker.
    pub fn symmetric_hash(&self) -> u64 {
        let a = (self.net.src, self.transport.src);
        let b = (self.net.dst, self.transport.dst);
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let mut hasher = DefaultHasher::new();
        lo.hash(&mut hasher);
        hi.hash(&mut hasher);
        hasher.finish()
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.net, self.transport)
    }
}

/// TCP control flags relevant to the probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
}

impl TcpFlags {
    /// True if any connection-control flag is set.
    pub fn is_control(&self) -> bool {
        self.syn || self.fin || self.rst
    }
}

/// A TCP packet as delivered by the capture layer, already decoded down to
/// its transport payload.
#[derive(Debug, Clone)]
pub struct CapturedPacket {
    pub net: NetworkFlow,
    pub transport: TransportFlow,
    pub flags: TcpFlags,
    pub payload: Bytes,
    pub timestamp: DateTime<Utc>,
}

impl CapturedPacket {
    pub fn key(&self) -> FlowKey {
        FlowKey::new(self.net, self.transport)
    }

    /// Capture timestamp as nanoseconds since the Unix epoch.
    pub fn timestamp_nanos(&self) -> i64 {
        self.timestamp.timestamp_nanos_opt().unwrap_or_default()
    }

    /// True for packets that carry neither payload nor a control flag.
    pub fn is_empty_ack(&self) -> bool {
        self.payload.is_empty() && !self.flags.is_control()
    }
}

/// Decides whether a flow, as oriented, travels from client to server.
///
/// Supplied once to each dispatcher; must give consistent answers for the
/// lifetime of a connection.
pub type IsRequest = std::sync::Arc<dyn Fn(&NetworkFlow, &TransportFlow) -> bool + Send + Sync>;

/// The classifier used by the probe: a packet is a request if it is addressed
/// to the MySQL server port.
pub fn dst_port_classifier(server_port: u16) -> IsRequest {
    std::sync::Arc::new(move |_net: &NetworkFlow, transport: &TransportFlow| {
        transport.dst == server_port
    })
}
