// src/server/capture.rs

//! Offline packet source: replays a legacy pcap file as [`CapturedPacket`]s.
//!
//! Frames are decoded down to TCP. Anything that is not TCP over IPv4 or IPv6
//! is skipped, as are IP fragments past the first.

use crate::core::ProbeError;
use crate::core::flow::{CapturedPacket, NetworkFlow, TcpFlags, TransportFlow};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use etherparse::{Ethernet2HeaderSlice, Ipv4HeaderSlice, Ipv6HeaderSlice, TcpHeaderSlice};
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{LegacyPcapReader, PcapBlockOwned, PcapError};
use std::fs::File;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::{debug, trace};

/// Buffer size for reading pcap files (64KB).
const BUFFER_SIZE: usize = 65536;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86dd;
const ETHERTYPE_VLAN: u16 = 0x8100;
const IP_PROTO_TCP: u8 = 6;

/// Link-layer header types (LINKTYPE_*) the replay understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// BSD loopback: a 4-byte address family.
    Null,
    Ethernet,
    /// Bare IPv4/IPv6 with no link header.
    Raw,
    /// Linux "cooked" capture (SLL).
    LinuxSll,
}

impl LinkType {
    pub fn from_linktype(value: i32) -> Option<Self> {
        match value {
            0 => Some(LinkType::Null),
            1 => Some(LinkType::Ethernet),
            101 => Some(LinkType::Raw),
            113 => Some(LinkType::LinuxSll),
            _ => None,
        }
    }
}

/// Reads TCP packets from a pcap file.
pub struct PcapReplay {
    reader: LegacyPcapReader<File>,
    link_type: Option<LinkType>,
    nanosecond: bool,
    frames: u64,
}

impl PcapReplay {
    pub fn open(path: &str) -> Result<Self, ProbeError> {
        let file = File::open(path)?;
        let reader = LegacyPcapReader::new(BUFFER_SIZE, file)
            .map_err(|e| ProbeError::Capture(format!("failed to read pcap header: {e}")))?;
        Ok(Self {
            reader,
            link_type: None,
            nanosecond: false,
            frames: 0,
        })
    }

    /// Number of frames read so far, including skipped ones.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Returns the next TCP packet in the file, or `None` at the end.
    pub fn next_packet(&mut self) -> Result<Option<CapturedPacket>, ProbeError> {
        loop {
            match self.reader.next() {
                Ok((offset, block)) => {
                    let packet = match block {
                        PcapBlockOwned::LegacyHeader(header) => {
                            self.link_type = LinkType::from_linktype(header.network.0);
                            self.nanosecond = header.is_nanosecond_precision();
                            if self.link_type.is_none() {
                                return Err(ProbeError::Capture(format!(
                                    "unsupported link type {}",
                                    header.network.0
                                )));
                            }
                            None
                        }
                        PcapBlockOwned::Legacy(frame) => {
                            self.frames += 1;
                            let timestamp = frame_timestamp(
                                frame.ts_sec,
                                frame.ts_usec,
                                self.nanosecond,
                            );
                            self.link_type.and_then(|link| {
                                decode_frame(link, frame.data, timestamp)
                            })
                        }
                        _ => None,
                    };
                    self.reader.consume(offset);
                    if let Some(packet) = packet {
                        return Ok(Some(packet));
                    }
                }
                Err(PcapError::Eof) => {
                    debug!("pcap replay finished after {} frames", self.frames);
                    return Ok(None);
                }
                Err(PcapError::Incomplete(_)) => {
                    self.reader
                        .refill()
                        .map_err(|e| ProbeError::Capture(format!("refill error: {e}")))?;
                }
                Err(e) => return Err(ProbeError::Capture(format!("parse error: {e}"))),
            }
        }
    }
}

impl Iterator for PcapReplay {
    type Item = Result<CapturedPacket, ProbeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_packet().transpose()
    }
}

fn frame_timestamp(ts_sec: u32, ts_frac: u32, nanosecond: bool) -> DateTime<Utc> {
    let nanos = if nanosecond {
        ts_frac
    } else {
        ts_frac.saturating_mul(1000)
    };
    DateTime::from_timestamp(ts_sec as i64, nanos).unwrap_or_default()
}

/// Decodes one captured frame down to its TCP payload. Returns `None` for
/// frames that are not TCP or are too short to carry a TCP header.
pub fn decode_frame(
    link: LinkType,
    data: &[u8],
    timestamp: DateTime<Utc>,
) -> Option<CapturedPacket> {
    let (ethertype, ip) = match link {
        LinkType::Ethernet => {
            let eth = Ethernet2HeaderSlice::from_slice(data).ok()?;
            let mut ethertype = eth.ether_type().0;
            let mut rest = &data[eth.slice().len()..];
            if ethertype == ETHERTYPE_VLAN {
                if rest.len() < 4 {
                    return None;
                }
                ethertype = u16::from_be_bytes([rest[2], rest[3]]);
                rest = &rest[4..];
            }
            (ethertype, rest)
        }
        LinkType::LinuxSll => {
            if data.len() < 16 {
                return None;
            }
            (u16::from_be_bytes([data[14], data[15]]), &data[16..])
        }
        LinkType::Null => {
            if data.len() < 4 {
                return None;
            }
            (version_ethertype(&data[4..])?, &data[4..])
        }
        LinkType::Raw => (version_ethertype(data)?, data),
    };

    let (net, segment) = match ethertype {
        ETHERTYPE_IPV4 => {
            let ipv4 = Ipv4HeaderSlice::from_slice(ip).ok()?;
            if ipv4.protocol().0 != IP_PROTO_TCP || ipv4.fragments_offset().value() != 0 {
                return None;
            }
            let end = (ipv4.total_len() as usize).clamp(ipv4.slice().len(), ip.len());
            let net = NetworkFlow::new(
                IpAddr::V4(Ipv4Addr::from(ipv4.source())),
                IpAddr::V4(Ipv4Addr::from(ipv4.destination())),
            );
            (net, &ip[ipv4.slice().len()..end])
        }
        ETHERTYPE_IPV6 => {
            let ipv6 = Ipv6HeaderSlice::from_slice(ip).ok()?;
            // Extension headers are not walked.
            if ipv6.next_header().0 != IP_PROTO_TCP {
                return None;
            }
            let header_len = ipv6.slice().len();
            let end = (header_len + ipv6.payload_length() as usize).min(ip.len());
            let net = NetworkFlow::new(
                IpAddr::V6(Ipv6Addr::from(ipv6.source())),
                IpAddr::V6(Ipv6Addr::from(ipv6.destination())),
            );
            (net, &ip[header_len..end])
        }
        other => {
            trace!("skipping frame with ethertype {:#06x}", other);
            return None;
        }
    };

    let tcp = TcpHeaderSlice::from_slice(segment).ok()?;
    let payload = &segment[tcp.slice().len()..];
    Some(CapturedPacket {
        net,
        transport: TransportFlow::new(tcp.source_port(), tcp.destination_port()),
        flags: TcpFlags {
            syn: tcp.syn(),
            fin: tcp.fin(),
            rst: tcp.rst(),
        },
        payload: Bytes::copy_from_slice(payload),
        timestamp,
    })
}

/// Infers the ethertype of a bare IP packet from its version nibble.
fn version_ethertype(ip: &[u8]) -> Option<u16> {
    match ip.first()? >> 4 {
        4 => Some(ETHERTYPE_IPV4),
        6 => Some(ETHERTYPE_IPV6),
        _ => None,
    }
}
