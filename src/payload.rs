//! # Payload Codec Module
//!
//! Compact binary encoding for the DATA and ACK payloads.
//!
//! ## DATA Layout
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 1 | source node id |
//! | 1 | 1 | destination node id |
//! | 2 | 4 | packet id (big-endian) |
//! | 6 | 4 | origination timestamp, wall-clock milliseconds (big-endian) |
//! | 10 | 1 | application data length `n` |
//! | 11 | n | application data, opaque |
//! | 11+n | 1 | path entry count `p` |
//! | .. | p | traversed node ids, in order |
//! | .. | 1 | hop metric count `m` |
//! | .. | 5m | hop metrics: from, to, rssi (i8), delay ms (big-endian u16) |
//!
//! The path and hop-metric lists sit at the tail so relays extend them by
//! re-encoding without shifting the application bytes. A packet id of zero is
//! a sentinel: such DATA is delivered but never acknowledged.
//!
//! ## ACK Layout
//!
//! Fixed 16 bytes: packet id (4), acknowledging node, sink destination,
//! original source, original destination, sent timestamp (4), ack
//! timestamp (4). Timestamps are wall-clock milliseconds, big-endian.

use crate::{MAX_APP_DATA, MAX_HOP_METRICS, MAX_PATH_ENTRIES};

/// Error type for payload encode/parse operations.
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub enum PayloadError {
    /// The buffer ended before a declared field.
    Truncated,
    /// A list exceeds its bounded capacity.
    CapacityExceeded,
    /// The encoded payload does not fit the output buffer.
    BufferTooSmall,
}

/// One per-hop link observation appended by each traversing node.
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct HopMetric {
    /// Node the frame arrived from.
    pub from: u8,
    /// Node that recorded the observation.
    pub to: u8,
    /// Received signal strength at `to`, dBm.
    pub rssi: i8,
    /// Milliseconds elapsed since the payload was originated.
    pub delay_ms: u16,
}

const HOP_METRIC_LEN: usize = 5;
const DATA_FIXED_LEN: usize = 11;

/// Parsed DATA payload.
///
/// The routing core extracts and mutates the addressing fields, the path
/// list, and the hop-metric list; the application bytes pass through
/// untouched.
#[derive(Clone, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct DataPayload {
    pub source_id: u8,
    pub destination_id: u8,
    pub packet_id: u32,
    /// Wall-clock milliseconds at origination (truncated to 32 bits).
    pub timestamp_ms: u32,
    pub app_data: heapless::Vec<u8, MAX_APP_DATA>,
    /// Node ids traversed so far, originator first.
    pub path: heapless::Vec<u8, MAX_PATH_ENTRIES>,
    pub hop_metrics: heapless::Vec<HopMetric, MAX_HOP_METRICS>,
}

impl DataPayload {
    /// Builds a fresh payload at the originating node.
    ///
    /// The path is seeded with the originator so downstream nodes extend it
    /// to the full traversal.
    pub fn originate(
        source_id: u8,
        destination_id: u8,
        packet_id: u32,
        timestamp_ms: u32,
        app_data: &[u8],
    ) -> Result<DataPayload, PayloadError> {
        let app_data = heapless::Vec::from_slice(app_data).map_err(|_| PayloadError::CapacityExceeded)?;
        let mut path = heapless::Vec::new();
        // Capacity is at least one entry.
        let _ = path.push(source_id);
        Ok(DataPayload {
            source_id,
            destination_id,
            packet_id,
            timestamp_ms,
            app_data,
            path,
            hop_metrics: heapless::Vec::new(),
        })
    }

    /// Parses a payload from received frame bytes.
    pub fn parse(bytes: &[u8]) -> Result<DataPayload, PayloadError> {
        if bytes.len() < DATA_FIXED_LEN {
            return Err(PayloadError::Truncated);
        }
        let source_id = bytes[0];
        let destination_id = bytes[1];
        let packet_id = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        let timestamp_ms = u32::from_be_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);
        let app_len = bytes[10] as usize;

        let mut at = DATA_FIXED_LEN;
        let app_end = at.checked_add(app_len).ok_or(PayloadError::Truncated)?;
        if bytes.len() < app_end + 1 {
            return Err(PayloadError::Truncated);
        }
        let app_data =
            heapless::Vec::from_slice(&bytes[at..app_end]).map_err(|_| PayloadError::CapacityExceeded)?;
        at = app_end;

        let path_len = bytes[at] as usize;
        at += 1;
        if bytes.len() < at + path_len + 1 {
            return Err(PayloadError::Truncated);
        }
        let path =
            heapless::Vec::from_slice(&bytes[at..at + path_len]).map_err(|_| PayloadError::CapacityExceeded)?;
        at += path_len;

        let metric_len = bytes[at] as usize;
        at += 1;
        if bytes.len() < at + metric_len * HOP_METRIC_LEN {
            return Err(PayloadError::Truncated);
        }
        let mut hop_metrics = heapless::Vec::new();
        for _ in 0..metric_len {
            let metric = HopMetric {
                from: bytes[at],
                to: bytes[at + 1],
                rssi: bytes[at + 2] as i8,
                delay_ms: u16::from_be_bytes([bytes[at + 3], bytes[at + 4]]),
            };
            hop_metrics.push(metric).map_err(|_| PayloadError::CapacityExceeded)?;
            at += HOP_METRIC_LEN;
        }

        Ok(DataPayload {
            source_id,
            destination_id,
            packet_id,
            timestamp_ms,
            app_data,
            path,
            hop_metrics,
        })
    }

    /// Number of bytes `encode` will write.
    pub fn encoded_len(&self) -> usize {
        DATA_FIXED_LEN + self.app_data.len() + 1 + self.path.len() + 1 + self.hop_metrics.len() * HOP_METRIC_LEN
    }

    /// Serializes the payload into `out`, returning the number of bytes
    /// written.
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, PayloadError> {
        let total = self.encoded_len();
        if out.len() < total {
            return Err(PayloadError::BufferTooSmall);
        }
        out[0] = self.source_id;
        out[1] = self.destination_id;
        out[2..6].copy_from_slice(&self.packet_id.to_be_bytes());
        out[6..10].copy_from_slice(&self.timestamp_ms.to_be_bytes());
        out[10] = self.app_data.len() as u8;

        let mut at = DATA_FIXED_LEN;
        out[at..at + self.app_data.len()].copy_from_slice(&self.app_data);
        at += self.app_data.len();

        out[at] = self.path.len() as u8;
        at += 1;
        out[at..at + self.path.len()].copy_from_slice(&self.path);
        at += self.path.len();

        out[at] = self.hop_metrics.len() as u8;
        at += 1;
        for metric in &self.hop_metrics {
            out[at] = metric.from;
            out[at + 1] = metric.to;
            out[at + 2] = metric.rssi as u8;
            out[at + 3..at + 5].copy_from_slice(&metric.delay_ms.to_be_bytes());
            at += HOP_METRIC_LEN;
        }
        Ok(at)
    }

    /// Appends this node's traversal record: one hop metric and one path
    /// entry. Full lists drop the newest observation rather than the packet.
    pub fn record_hop(&mut self, metric: HopMetric) -> bool {
        let metric_ok = self.hop_metrics.push(metric).is_ok();
        let path_ok = self.path.push(metric.to).is_ok();
        metric_ok && path_ok
    }
}

const ACK_PAYLOAD_LEN: usize = 16;

/// End-to-end acknowledgement payload, always destined for the sink.
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct AckPayload {
    pub packet_id: u32,
    /// Node that delivered the DATA and produced this ACK.
    pub ack_from: u8,
    /// Collector id; ACKs terminate off-mesh.
    pub destination: u8,
    pub orig_source: u8,
    pub orig_destination: u8,
    pub sent_ts_ms: u32,
    pub ack_ts_ms: u32,
}

impl AckPayload {
    /// Parses a received ACK payload.
    pub fn parse(bytes: &[u8]) -> Result<AckPayload, PayloadError> {
        if bytes.len() < ACK_PAYLOAD_LEN {
            return Err(PayloadError::Truncated);
        }
        Ok(AckPayload {
            packet_id: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            ack_from: bytes[4],
            destination: bytes[5],
            orig_source: bytes[6],
            orig_destination: bytes[7],
            sent_ts_ms: u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            ack_ts_ms: u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
        })
    }

    /// Serializes into `out`, which must hold at least 16 bytes, returning
    /// the number of bytes written.
    pub fn encode(&self, out: &mut [u8]) -> usize {
        out[0..4].copy_from_slice(&self.packet_id.to_be_bytes());
        out[4] = self.ack_from;
        out[5] = self.destination;
        out[6] = self.orig_source;
        out[7] = self.orig_destination;
        out[8..12].copy_from_slice(&self.sent_ts_ms.to_be_bytes());
        out[12..16].copy_from_slice(&self.ack_ts_ms.to_be_bytes());
        ACK_PAYLOAD_LEN
    }
}
