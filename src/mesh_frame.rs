//! # Mesh Frame Module
//!
//! Wire format for every mesh message, on both the radio and the upstream
//! UDP transport.
//!
//! ## Frame Structure
//!
//! All frames start with a fixed 14-byte header:
//! - Byte 0: Frame type
//! - Bytes 1-6: Hardware address of the immediate sender
//! - Bytes 7-12: Hardware address of the immediate receiver, or broadcast
//! - Byte 13: Remaining hop budget (TTL)
//!
//! A variable-length payload follows. Multi-byte integers inside payloads are
//! big-endian. The total frame length is bounded by the radio MTU, so a frame
//! always fits a single transmission.
//!
//! ## Design Considerations
//!
//! - **Public Fields**: `data` and `length` are public for zero-copy hand-off
//!   to transport drivers
//! - **Header Rewrite on Forward**: relaying a frame rewrites only the sender
//!   address, receiver address, and TTL; the payload is carried verbatim
//! - **No TTL Arithmetic Here**: the forwarder decides decrements; the codec
//!   only stores what it is given

use crate::address_map::HwAddress;
use crate::payload::{AckPayload, DataPayload, PayloadError};
use crate::{MESH_FRAME_SIZE, MESH_HEADER_SIZE};

/// Frame types carried in byte 0 of the header.
///
/// The numeric values are part of the wire protocol and shared with the sink
/// collector, which demultiplexes on this byte alone.
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub enum FrameType {
    /// Periodic neighbor beacon, never forwarded (0)
    Hello = 0,
    /// Route request flood (1)
    Rreq = 1,
    /// Route reply, unicast along the reverse path (2)
    Rrep = 2,
    /// Application data (3)
    Data = 3,
    /// Route error, one-hop notice (4)
    Rerr = 4,
    /// End-to-end acknowledgement relayed toward the sink (7)
    Ack = 7,
}

impl TryFrom<u8> for FrameType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Hello),
            1 => Ok(FrameType::Rreq),
            2 => Ok(FrameType::Rrep),
            3 => Ok(FrameType::Data),
            4 => Ok(FrameType::Rerr),
            7 => Ok(FrameType::Ack),
            _ => Err(()),
        }
    }
}

/// Error type for frame validation.
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub enum FrameError {
    /// Fewer than the 14 header bytes were received.
    TooShort,
    /// The frame exceeds the radio MTU.
    TooLong,
}

/// HELLO payload fields.
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct HelloView {
    pub node_id: u8,
    pub seq: u32,
}

/// RREQ payload fields. The request identifier doubles as the originator's
/// sequence number.
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct RreqView {
    pub source: u8,
    pub dest: u8,
    pub rreq_id: u32,
}

/// RREP payload fields.
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct RrepView {
    pub requester: u8,
    pub dest: u8,
    pub rreq_id: u32,
    pub dest_seq: u32,
    pub hop_count: u8,
}

const HELLO_PAYLOAD_LEN: usize = 5;
const RREQ_PAYLOAD_LEN: usize = 6;
const RREP_PAYLOAD_LEN: usize = 11;
const RERR_PAYLOAD_LEN: usize = 1;

/// A single mesh frame: fixed buffer plus the number of valid bytes.
#[derive(Clone)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct MeshFrame {
    /// Raw frame bytes, header first.
    pub data: [u8; MESH_FRAME_SIZE],
    /// Actual number of valid bytes in the buffer.
    pub length: usize,
}

impl MeshFrame {
    fn with_header(frame_type: FrameType, src_mac: HwAddress, dst_mac: HwAddress, ttl: u8) -> Self {
        let mut data = [0u8; MESH_FRAME_SIZE];
        data[0] = frame_type as u8;
        data[1..7].copy_from_slice(&src_mac.0);
        data[7..13].copy_from_slice(&dst_mac.0);
        data[13] = ttl;
        MeshFrame {
            data,
            length: MESH_HEADER_SIZE,
        }
    }

    /// Validates a received byte buffer and copies it into a frame.
    pub fn from_bytes(bytes: &[u8]) -> Result<MeshFrame, FrameError> {
        if bytes.len() < MESH_HEADER_SIZE {
            return Err(FrameError::TooShort);
        }
        if bytes.len() > MESH_FRAME_SIZE {
            return Err(FrameError::TooLong);
        }
        let mut data = [0u8; MESH_FRAME_SIZE];
        data[..bytes.len()].copy_from_slice(bytes);
        Ok(MeshFrame {
            data,
            length: bytes.len(),
        })
    }

    /// Raw frame type byte; compare against `FrameType` values.
    pub fn frame_type(&self) -> u8 {
        self.data[0]
    }

    /// Hardware address of the immediate sender.
    pub fn src_mac(&self) -> HwAddress {
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&self.data[1..7]);
        HwAddress(mac)
    }

    /// Hardware address of the immediate receiver.
    pub fn dst_mac(&self) -> HwAddress {
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&self.data[7..13]);
        HwAddress(mac)
    }

    /// Remaining hop budget.
    pub fn ttl(&self) -> u8 {
        self.data[13]
    }

    /// Payload bytes following the header.
    pub fn payload(&self) -> &[u8] {
        &self.data[MESH_HEADER_SIZE..self.length]
    }

    /// Valid bytes of the whole frame, for transport hand-off.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.length]
    }

    /// Copy of this frame with the sender, receiver, and TTL rewritten.
    ///
    /// The payload is carried byte-for-byte; relays rewrite only the one-hop
    /// addressing.
    pub fn forwarded(&self, src_mac: HwAddress, dst_mac: HwAddress, ttl: u8) -> MeshFrame {
        let mut out = self.clone();
        out.data[1..7].copy_from_slice(&src_mac.0);
        out.data[7..13].copy_from_slice(&dst_mac.0);
        out.data[13] = ttl;
        out
    }

    pub fn new_hello(src_mac: HwAddress, node_id: u8, seq: u32, ttl: u8) -> MeshFrame {
        let mut frame = Self::with_header(FrameType::Hello, src_mac, HwAddress::BROADCAST, ttl);
        let p = MESH_HEADER_SIZE;
        frame.data[p] = node_id;
        frame.data[p + 1..p + 5].copy_from_slice(&seq.to_be_bytes());
        frame.length = p + HELLO_PAYLOAD_LEN;
        frame
    }

    pub fn new_rreq(src_mac: HwAddress, source: u8, dest: u8, rreq_id: u32, ttl: u8) -> MeshFrame {
        let mut frame = Self::with_header(FrameType::Rreq, src_mac, HwAddress::BROADCAST, ttl);
        let p = MESH_HEADER_SIZE;
        frame.data[p] = source;
        frame.data[p + 1] = dest;
        frame.data[p + 2..p + 6].copy_from_slice(&rreq_id.to_be_bytes());
        frame.length = p + RREQ_PAYLOAD_LEN;
        frame
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new_rrep(
        src_mac: HwAddress,
        dst_mac: HwAddress,
        requester: u8,
        dest: u8,
        rreq_id: u32,
        dest_seq: u32,
        hop_count: u8,
        ttl: u8,
    ) -> MeshFrame {
        let mut frame = Self::with_header(FrameType::Rrep, src_mac, dst_mac, ttl);
        let p = MESH_HEADER_SIZE;
        frame.data[p] = requester;
        frame.data[p + 1] = dest;
        frame.data[p + 2..p + 6].copy_from_slice(&rreq_id.to_be_bytes());
        frame.data[p + 6..p + 10].copy_from_slice(&dest_seq.to_be_bytes());
        frame.data[p + 10] = hop_count;
        frame.length = p + RREP_PAYLOAD_LEN;
        frame
    }

    pub fn new_rerr(src_mac: HwAddress, unreachable_node: u8, ttl: u8) -> MeshFrame {
        let mut frame = Self::with_header(FrameType::Rerr, src_mac, HwAddress::BROADCAST, ttl);
        frame.data[MESH_HEADER_SIZE] = unreachable_node;
        frame.length = MESH_HEADER_SIZE + RERR_PAYLOAD_LEN;
        frame
    }

    /// Encodes a DATA frame around the given payload.
    pub fn new_data(
        src_mac: HwAddress,
        dst_mac: HwAddress,
        ttl: u8,
        payload: &DataPayload,
    ) -> Result<MeshFrame, PayloadError> {
        let mut frame = Self::with_header(FrameType::Data, src_mac, dst_mac, ttl);
        let written = payload.encode(&mut frame.data[MESH_HEADER_SIZE..])?;
        frame.length = MESH_HEADER_SIZE + written;
        Ok(frame)
    }

    /// Encodes an ACK frame around the given payload.
    pub fn new_ack(src_mac: HwAddress, dst_mac: HwAddress, ttl: u8, payload: &AckPayload) -> MeshFrame {
        let mut frame = Self::with_header(FrameType::Ack, src_mac, dst_mac, ttl);
        let written = payload.encode(&mut frame.data[MESH_HEADER_SIZE..]);
        frame.length = MESH_HEADER_SIZE + written;
        frame
    }

    /// Typed view of a HELLO payload, if this frame is a well-formed HELLO.
    pub fn hello(&self) -> Option<HelloView> {
        if self.frame_type() != FrameType::Hello as u8 || self.payload().len() < HELLO_PAYLOAD_LEN {
            return None;
        }
        let p = self.payload();
        Some(HelloView {
            node_id: p[0],
            seq: u32::from_be_bytes([p[1], p[2], p[3], p[4]]),
        })
    }

    /// Typed view of an RREQ payload.
    pub fn rreq(&self) -> Option<RreqView> {
        if self.frame_type() != FrameType::Rreq as u8 || self.payload().len() < RREQ_PAYLOAD_LEN {
            return None;
        }
        let p = self.payload();
        Some(RreqView {
            source: p[0],
            dest: p[1],
            rreq_id: u32::from_be_bytes([p[2], p[3], p[4], p[5]]),
        })
    }

    /// Typed view of an RREP payload.
    pub fn rrep(&self) -> Option<RrepView> {
        if self.frame_type() != FrameType::Rrep as u8 || self.payload().len() < RREP_PAYLOAD_LEN {
            return None;
        }
        let p = self.payload();
        Some(RrepView {
            requester: p[0],
            dest: p[1],
            rreq_id: u32::from_be_bytes([p[2], p[3], p[4], p[5]]),
            dest_seq: u32::from_be_bytes([p[6], p[7], p[8], p[9]]),
            hop_count: p[10],
        })
    }

    /// Unreachable-node id carried by an RERR frame.
    pub fn rerr(&self) -> Option<u8> {
        if self.frame_type() != FrameType::Rerr as u8 || self.payload().is_empty() {
            return None;
        }
        Some(self.payload()[0])
    }

    /// Typed view of an ACK payload, if this frame is a well-formed ACK.
    pub fn ack(&self) -> Option<AckPayload> {
        if self.frame_type() != FrameType::Ack as u8 {
            return None;
        }
        AckPayload::parse(self.payload()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: HwAddress = HwAddress([0xAA, 0, 0, 0, 0, 1]);
    const DST: HwAddress = HwAddress([0xBB, 0, 0, 0, 0, 2]);

    #[test]
    fn header_roundtrip() {
        let frame = MeshFrame::new_rreq(SRC, 0, 2, 77, 10);
        assert_eq!(frame.frame_type(), FrameType::Rreq as u8);
        assert_eq!(frame.src_mac(), SRC);
        assert!(frame.dst_mac().is_broadcast());
        assert_eq!(frame.ttl(), 10);

        let parsed = MeshFrame::from_bytes(frame.as_bytes()).unwrap();
        let view = parsed.rreq().unwrap();
        assert_eq!(view.source, 0);
        assert_eq!(view.dest, 2);
        assert_eq!(view.rreq_id, 77);
    }

    #[test]
    fn thirteen_bytes_is_malformed() {
        assert!(matches!(MeshFrame::from_bytes(&[0u8; 13]), Err(FrameError::TooShort)));
    }

    #[test]
    fn exactly_header_sized_frame_parses() {
        let frame = MeshFrame::from_bytes(&[0u8; 14]).unwrap();
        assert_eq!(frame.length, 14);
        assert!(frame.payload().is_empty());
    }

    #[test]
    fn oversized_frame_rejected() {
        assert!(matches!(MeshFrame::from_bytes(&[0u8; 251]), Err(FrameError::TooLong)));
    }

    #[test]
    fn forwarding_rewrites_header_only() {
        let frame = MeshFrame::new_rreq(SRC, 0, 2, 5, 10);
        let relayed = frame.forwarded(DST, HwAddress::BROADCAST, 9);
        assert_eq!(relayed.src_mac(), DST);
        assert_eq!(relayed.ttl(), 9);
        assert_eq!(relayed.payload(), frame.payload());
    }

    #[test]
    fn hello_view() {
        let frame = MeshFrame::new_hello(SRC, 3, 41, 10);
        let view = frame.hello().unwrap();
        assert_eq!(view.node_id, 3);
        assert_eq!(view.seq, 41);
        // Wrong accessor for the type yields nothing.
        assert!(frame.rreq().is_none());
    }

    #[test]
    fn rrep_view_roundtrip() {
        let frame = MeshFrame::new_rrep(SRC, DST, 0, 2, 9, 9, 1, 10);
        let view = frame.rrep().unwrap();
        assert_eq!(view.requester, 0);
        assert_eq!(view.dest, 2);
        assert_eq!(view.rreq_id, 9);
        assert_eq!(view.dest_seq, 9);
        assert_eq!(view.hop_count, 1);
        assert_eq!(frame.dst_mac(), DST);
    }

    #[test]
    fn rerr_view() {
        let frame = MeshFrame::new_rerr(SRC, 3, 1);
        assert_eq!(frame.rerr(), Some(3));
    }

    #[test]
    fn truncated_payload_yields_no_view() {
        let mut frame = MeshFrame::new_rrep(SRC, DST, 0, 2, 9, 9, 1, 10);
        frame.length -= 4;
        assert!(frame.rrep().is_none());
    }

    #[test]
    fn ack_view_roundtrip() {
        let payload = AckPayload {
            packet_id: 41,
            ack_from: 1,
            destination: 4,
            orig_source: 0,
            orig_destination: 1,
            sent_ts_ms: 100,
            ack_ts_ms: 130,
        };
        let frame = MeshFrame::new_ack(SRC, HwAddress::BROADCAST, 10, &payload);
        assert_eq!(frame.ack().unwrap(), payload);
        // Wrong accessor for the type yields nothing.
        assert!(MeshFrame::new_rerr(SRC, 3, 1).ack().is_none());

        let mut truncated = frame.clone();
        truncated.length -= 1;
        assert!(truncated.ack().is_none());
    }
}
