//! Wire format parsing and serialization for the five message kinds.
//!
//! ## Common Prefix (18 bytes)
//!
//! ```text
//! [kind:1][version:1][bundle_id:16]
//! ```
//!
//! All integers are big-endian. Decode is strict: trailing or missing
//! bytes relative to a declared length fail as malformed rather than
//! being ignored.
//!
//! | Kind | Byte | Body after prefix |
//! |-------------|------|---------------------------------------------------------------|
//! | DATA        | 0x01 | chunk_id:4, total_chunks:4, block_id:4, k:1, r:1, flags:1, checksum:4, payload_len:2, payload |
//! | SACK        | 0x02 | recv_watermark:4, bitmap_len:4, bitmap                        |
//! | CUSTODY_REQ | 0x03 | ttl_remaining:4, range_count:2, (start:4, end:4) * n          |
//! | CUSTODY_ACK | 0x04 | ack_nonce:8, range_count:2, (start:4, end:4) * n              |
//! | DELIVERED   | 0x05 | -                                                             |

use super::{ProtocolError, MAX_DATAGRAM, PROTOCOL_VERSION};
use crate::bundle::{BundleId, ChunkRanges};
use std::fmt;

// ============================================================================
// Constants
// ============================================================================

/// Size of the common prefix: kind + version + bundle_id.
pub const COMMON_PREFIX_SIZE: usize = 18;

/// Size of the full DATA header (prefix + fixed fields).
pub const DATA_HEADER_SIZE: usize = COMMON_PREFIX_SIZE + 21; // 39

/// Maximum payload of a data chunk.
pub const MAX_DATA_PAYLOAD: usize = 1150;

/// Maximum payload of a parity chunk (length-prefixed XOR buffer).
pub const MAX_PARITY_PAYLOAD: usize = MAX_DATA_PAYLOAD + 2;

/// Cap on the SACK bitmap so the datagram stays far below the MTU.
pub const MAX_SACK_BITMAP_BYTES: usize = 256; // 2048 chunk ids

/// DATA flags bit 0: chunk is FEC parity, not file data.
pub const FLAG_PARITY: u8 = 0x01;

// Compile-time guard: a max-size DATA datagram fits the MTU.
const _: () = assert!(DATA_HEADER_SIZE + MAX_PARITY_PAYLOAD <= MAX_DATAGRAM);

// ============================================================================
// Message Kinds
// ============================================================================

/// Message kind identifiers (first byte of every datagram).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    /// One chunk of a bundle.
    Data = 0x01,
    /// Selective acknowledgment bitmap.
    Sack = 0x02,
    /// Request that the peer take custody of chunk ranges.
    CustodyReq = 0x03,
    /// Confirmation that custody was accepted.
    CustodyAck = 0x04,
    /// End-to-end delivery confirmation.
    Delivered = 0x05,
}

impl MessageKind {
    /// Try to convert from a byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(MessageKind::Data),
            0x02 => Some(MessageKind::Sack),
            0x03 => Some(MessageKind::CustodyReq),
            0x04 => Some(MessageKind::CustodyAck),
            0x05 => Some(MessageKind::Delivered),
            _ => None,
        }
    }

    /// Convert to a byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Data => "DATA",
            MessageKind::Sack => "SACK",
            MessageKind::CustodyReq => "CUSTODY_REQ",
            MessageKind::CustodyAck => "CUSTODY_ACK",
            MessageKind::Delivered => "DELIVERED",
        };
        write!(f, "{}", name)
    }
}

// ============================================================================
// Messages
// ============================================================================

/// One chunk of a bundle, data or parity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Data {
    pub bundle_id: BundleId,
    pub chunk_id: u32,
    pub total_chunks: u32,
    /// FEC block group index; 0 when FEC is disabled.
    pub block_id: u32,
    pub k: u8,
    pub r: u8,
    pub flags: u8,
    /// CRC-32 of the payload bytes.
    pub checksum: u32,
    pub payload: Vec<u8>,
}

impl Data {
    /// Whether this chunk is FEC parity.
    pub fn is_parity(&self) -> bool {
        self.flags & FLAG_PARITY != 0
    }
}

/// Selective acknowledgment.
///
/// `recv_watermark` is the lowest chunk id not yet received or
/// reconstructed; bitmap bit i (MSB-first within each byte) is set when
/// chunk `recv_watermark + i` is held. Everything below the watermark is
/// implicitly acknowledged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sack {
    pub bundle_id: BundleId,
    pub recv_watermark: u32,
    pub bitmap: Vec<u8>,
}

impl Sack {
    /// Build a SACK from the watermark and the ids held above it.
    ///
    /// Ids at or below the watermark are ignored; ids beyond the bitmap
    /// window are left for a later SACK once the watermark advances.
    pub fn from_ids<I: IntoIterator<Item = u32>>(
        bundle_id: BundleId,
        recv_watermark: u32,
        ids_above: I,
    ) -> Self {
        let max_bits = (MAX_SACK_BITMAP_BYTES * 8) as u32;
        let mut bitmap = Vec::new();
        for id in ids_above {
            if id <= recv_watermark {
                continue;
            }
            let bit = id - recv_watermark;
            if bit >= max_bits {
                continue;
            }
            let byte = (bit / 8) as usize;
            if bitmap.len() <= byte {
                bitmap.resize(byte + 1, 0);
            }
            bitmap[byte] |= 1 << (7 - (bit % 8));
        }
        Self {
            bundle_id,
            recv_watermark,
            bitmap,
        }
    }
}

/// Expand a SACK into the full set of acknowledged chunk ids:
/// everything below the watermark plus every set bitmap bit.
pub fn expand_sack(sack: &Sack) -> Vec<u32> {
    let mut acked: Vec<u32> = (0..sack.recv_watermark).collect();
    for (byte_index, byte) in sack.bitmap.iter().enumerate() {
        for bit_pos in 0..8u32 {
            if byte & (1 << (7 - bit_pos)) != 0 {
                acked.push(sack.recv_watermark + byte_index as u32 * 8 + bit_pos);
            }
        }
    }
    acked
}

/// Request that the receiver take custody of chunk ranges.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CustodyReq {
    pub bundle_id: BundleId,
    /// Seconds until the bundle's TTL elapses.
    pub ttl_remaining: u32,
    pub ranges: ChunkRanges,
}

/// Confirmation that custody was accepted for the given ranges.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CustodyAck {
    pub bundle_id: BundleId,
    /// Opaque token identifying the accepting record.
    pub ack_nonce: u64,
    pub ranges: ChunkRanges,
}

/// End-to-end delivery confirmation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivered {
    pub bundle_id: BundleId,
}

/// Any protocol message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Data(Data),
    Sack(Sack),
    CustodyReq(CustodyReq),
    CustodyAck(CustodyAck),
    Delivered(Delivered),
}

impl Message {
    /// The message kind byte.
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Data(_) => MessageKind::Data,
            Message::Sack(_) => MessageKind::Sack,
            Message::CustodyReq(_) => MessageKind::CustodyReq,
            Message::CustodyAck(_) => MessageKind::CustodyAck,
            Message::Delivered(_) => MessageKind::Delivered,
        }
    }

    /// The bundle this message belongs to.
    pub fn bundle_id(&self) -> BundleId {
        match self {
            Message::Data(m) => m.bundle_id,
            Message::Sack(m) => m.bundle_id,
            Message::CustodyReq(m) => m.bundle_id,
            Message::CustodyAck(m) => m.bundle_id,
            Message::Delivered(m) => m.bundle_id,
        }
    }

    /// Encode to wire bytes, enforcing the datagram ceiling.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = Vec::with_capacity(MAX_DATAGRAM);
        buf.push(self.kind().to_byte());
        buf.push(PROTOCOL_VERSION);
        buf.extend_from_slice(self.bundle_id().as_bytes());

        match self {
            Message::Data(m) => {
                if m.payload.len() > MAX_PARITY_PAYLOAD {
                    return Err(ProtocolError::MessageTooLong {
                        max: MAX_PARITY_PAYLOAD,
                        got: m.payload.len(),
                    });
                }
                buf.extend_from_slice(&m.chunk_id.to_be_bytes());
                buf.extend_from_slice(&m.total_chunks.to_be_bytes());
                buf.extend_from_slice(&m.block_id.to_be_bytes());
                buf.push(m.k);
                buf.push(m.r);
                buf.push(m.flags);
                buf.extend_from_slice(&m.checksum.to_be_bytes());
                buf.extend_from_slice(&(m.payload.len() as u16).to_be_bytes());
                buf.extend_from_slice(&m.payload);
            }
            Message::Sack(m) => {
                if m.bitmap.len() > MAX_SACK_BITMAP_BYTES {
                    return Err(ProtocolError::MessageTooLong {
                        max: MAX_SACK_BITMAP_BYTES,
                        got: m.bitmap.len(),
                    });
                }
                buf.extend_from_slice(&m.recv_watermark.to_be_bytes());
                buf.extend_from_slice(&(m.bitmap.len() as u32).to_be_bytes());
                buf.extend_from_slice(&m.bitmap);
            }
            Message::CustodyReq(m) => {
                buf.extend_from_slice(&m.ttl_remaining.to_be_bytes());
                encode_ranges(&mut buf, &m.ranges)?;
            }
            Message::CustodyAck(m) => {
                buf.extend_from_slice(&m.ack_nonce.to_be_bytes());
                encode_ranges(&mut buf, &m.ranges)?;
            }
            Message::Delivered(_) => {}
        }

        if buf.len() > MAX_DATAGRAM {
            return Err(ProtocolError::MessageTooLong {
                max: MAX_DATAGRAM,
                got: buf.len(),
            });
        }
        Ok(buf)
    }

    /// Decode a datagram.
    ///
    /// Fails malformed for short, unknown-kind, or length-inconsistent
    /// input; BAD_CHECKSUM for a DATA payload whose CRC-32 disagrees
    /// with its header; UNSUPPORTED_VERSION for any other version byte.
    pub fn decode(data: &[u8]) -> Result<Message, ProtocolError> {
        if data.len() < COMMON_PREFIX_SIZE {
            return Err(ProtocolError::MessageTooShort {
                expected: COMMON_PREFIX_SIZE,
                got: data.len(),
            });
        }
        if data.len() > MAX_DATAGRAM {
            return Err(ProtocolError::MessageTooLong {
                max: MAX_DATAGRAM,
                got: data.len(),
            });
        }

        let kind = MessageKind::from_byte(data[0]).ok_or(ProtocolError::UnknownKind(data[0]))?;
        if data[1] != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(data[1]));
        }

        let mut id_bytes = [0u8; 16];
        id_bytes.copy_from_slice(&data[2..18]);
        let bundle_id = BundleId::from_bytes(id_bytes);
        let body = &data[COMMON_PREFIX_SIZE..];

        match kind {
            MessageKind::Data => decode_data(bundle_id, body),
            MessageKind::Sack => decode_sack(bundle_id, body),
            MessageKind::CustodyReq => {
                require(body, 6)?;
                let ttl_remaining = be_u32(&body[0..4]);
                let ranges = decode_ranges(&body[4..])?;
                Ok(Message::CustodyReq(CustodyReq {
                    bundle_id,
                    ttl_remaining,
                    ranges,
                }))
            }
            MessageKind::CustodyAck => {
                require(body, 10)?;
                let ack_nonce = be_u64(&body[0..8]);
                let ranges = decode_ranges(&body[8..])?;
                Ok(Message::CustodyAck(CustodyAck {
                    bundle_id,
                    ack_nonce,
                    ranges,
                }))
            }
            MessageKind::Delivered => {
                if !body.is_empty() {
                    return Err(ProtocolError::LengthMismatch {
                        declared: 0,
                        available: body.len(),
                    });
                }
                Ok(Message::Delivered(Delivered { bundle_id }))
            }
        }
    }
}

fn decode_data(bundle_id: BundleId, body: &[u8]) -> Result<Message, ProtocolError> {
    require(body, 21)?;
    let chunk_id = be_u32(&body[0..4]);
    let total_chunks = be_u32(&body[4..8]);
    let block_id = be_u32(&body[8..12]);
    let k = body[12];
    let r = body[13];
    let flags = body[14];
    let checksum = be_u32(&body[15..19]);
    let payload_len = u16::from_be_bytes([body[19], body[20]]) as usize;

    let available = body.len() - 21;
    if payload_len != available {
        return Err(ProtocolError::LengthMismatch {
            declared: payload_len,
            available,
        });
    }
    if payload_len > MAX_PARITY_PAYLOAD {
        return Err(ProtocolError::MessageTooLong {
            max: MAX_PARITY_PAYLOAD,
            got: payload_len,
        });
    }

    let payload = body[21..].to_vec();
    let actual = crc32fast::hash(&payload);
    if actual != checksum {
        return Err(ProtocolError::BadChecksum {
            expected: checksum,
            actual,
        });
    }

    Ok(Message::Data(Data {
        bundle_id,
        chunk_id,
        total_chunks,
        block_id,
        k,
        r,
        flags,
        checksum,
        payload,
    }))
}

fn decode_sack(bundle_id: BundleId, body: &[u8]) -> Result<Message, ProtocolError> {
    require(body, 8)?;
    let recv_watermark = be_u32(&body[0..4]);
    let bitmap_len = be_u32(&body[4..8]) as usize;

    let available = body.len() - 8;
    if bitmap_len != available {
        return Err(ProtocolError::LengthMismatch {
            declared: bitmap_len,
            available,
        });
    }
    if bitmap_len > MAX_SACK_BITMAP_BYTES {
        return Err(ProtocolError::MessageTooLong {
            max: MAX_SACK_BITMAP_BYTES,
            got: bitmap_len,
        });
    }

    Ok(Message::Sack(Sack {
        bundle_id,
        recv_watermark,
        bitmap: body[8..].to_vec(),
    }))
}

fn encode_ranges(buf: &mut Vec<u8>, ranges: &ChunkRanges) -> Result<(), ProtocolError> {
    if ranges.len() > u16::MAX as usize {
        return Err(ProtocolError::MessageTooLong {
            max: u16::MAX as usize,
            got: ranges.len(),
        });
    }
    buf.extend_from_slice(&(ranges.len() as u16).to_be_bytes());
    for (start, end) in ranges {
        buf.extend_from_slice(&start.to_be_bytes());
        buf.extend_from_slice(&end.to_be_bytes());
    }
    Ok(())
}

/// Decode a `range_count`-prefixed list of inclusive (start, end) pairs.
fn decode_ranges(body: &[u8]) -> Result<ChunkRanges, ProtocolError> {
    require(body, 2)?;
    let count = u16::from_be_bytes([body[0], body[1]]) as usize;
    let available = body.len() - 2;
    if count * 8 != available {
        return Err(ProtocolError::LengthMismatch {
            declared: count * 8,
            available,
        });
    }

    let mut ranges = Vec::with_capacity(count);
    for i in 0..count {
        let at = 2 + i * 8;
        ranges.push((be_u32(&body[at..at + 4]), be_u32(&body[at + 4..at + 8])));
    }
    Ok(ranges)
}

fn require(body: &[u8], len: usize) -> Result<(), ProtocolError> {
    if body.len() < len {
        return Err(ProtocolError::MessageTooShort {
            expected: COMMON_PREFIX_SIZE + len,
            got: COMMON_PREFIX_SIZE + body.len(),
        });
    }
    Ok(())
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn be_u64(bytes: &[u8]) -> u64 {
    u64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_id(val: u8) -> BundleId {
        let mut bytes = [0u8; 16];
        bytes[0] = val;
        BundleId::from_bytes(bytes)
    }

    fn make_data(payload: Vec<u8>) -> Data {
        let checksum = crc32fast::hash(&payload);
        Data {
            bundle_id: test_id(0xAA),
            chunk_id: 7,
            total_chunks: 100,
            block_id: 1,
            k: 4,
            r: 2,
            flags: 0,
            checksum,
            payload,
        }
    }

    #[test]
    fn test_message_kind_roundtrip() {
        let kinds = [
            MessageKind::Data,
            MessageKind::Sack,
            MessageKind::CustodyReq,
            MessageKind::CustodyAck,
            MessageKind::Delivered,
        ];
        for kind in kinds {
            assert_eq!(MessageKind::from_byte(kind.to_byte()), Some(kind));
        }
    }

    #[test]
    fn test_message_kind_invalid() {
        assert!(MessageKind::from_byte(0x00).is_none());
        assert!(MessageKind::from_byte(0x06).is_none());
        assert!(MessageKind::from_byte(0xFF).is_none());
    }

    #[test]
    fn test_data_encode_decode() {
        let msg = make_data(vec![1, 2, 3, 4, 5]);
        let encoded = Message::Data(msg.clone()).encode().unwrap();

        assert_eq!(encoded[0], 0x01);
        assert_eq!(encoded[1], PROTOCOL_VERSION);
        assert_eq!(encoded.len(), DATA_HEADER_SIZE + 5);

        match Message::decode(&encoded).unwrap() {
            Message::Data(decoded) => assert_eq!(decoded, msg),
            other => panic!("wrong kind: {:?}", other),
        }
    }

    #[test]
    fn test_data_empty_payload() {
        let msg = make_data(Vec::new());
        let encoded = Message::Data(msg.clone()).encode().unwrap();
        assert_eq!(encoded.len(), DATA_HEADER_SIZE);
        match Message::decode(&encoded).unwrap() {
            Message::Data(decoded) => assert!(decoded.payload.is_empty()),
            other => panic!("wrong kind: {:?}", other),
        }
    }

    #[test]
    fn test_data_max_payload_fits_mtu() {
        let msg = make_data(vec![0xCC; MAX_PARITY_PAYLOAD]);
        let encoded = Message::Data(msg).encode().unwrap();
        assert!(encoded.len() <= MAX_DATAGRAM);
    }

    #[test]
    fn test_data_oversize_payload_rejected() {
        let msg = make_data(vec![0; MAX_PARITY_PAYLOAD + 1]);
        assert!(matches!(
            Message::Data(msg).encode(),
            Err(ProtocolError::MessageTooLong { .. })
        ));
    }

    #[test]
    fn test_data_bad_checksum() {
        let mut msg = make_data(vec![9, 9, 9]);
        msg.checksum ^= 0xDEAD_BEEF;
        let encoded = Message::Data(msg).encode().unwrap();
        let err = Message::decode(&encoded).unwrap_err();
        assert!(matches!(err, ProtocolError::BadChecksum { .. }));
        assert!(!err.is_malformed());
    }

    #[test]
    fn test_data_corrupt_payload_detected() {
        let msg = make_data(vec![1, 2, 3, 4, 5, 6, 7, 8]);
        let mut encoded = Message::Data(msg).encode().unwrap();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;
        assert!(matches!(
            Message::decode(&encoded),
            Err(ProtocolError::BadChecksum { .. })
        ));
    }

    #[test]
    fn test_data_length_mismatch() {
        let msg = make_data(vec![1, 2, 3]);
        let mut encoded = Message::Data(msg).encode().unwrap();
        // Declare a longer payload than is present
        encoded[DATA_HEADER_SIZE - 2..DATA_HEADER_SIZE].copy_from_slice(&10u16.to_be_bytes());
        let err = Message::decode(&encoded).unwrap_err();
        assert!(matches!(err, ProtocolError::LengthMismatch { .. }));
        assert!(err.is_malformed());
    }

    #[test]
    fn test_parity_flag() {
        let mut msg = make_data(vec![1]);
        msg.flags = FLAG_PARITY;
        assert!(msg.is_parity());
        let encoded = Message::Data(msg).encode().unwrap();
        match Message::decode(&encoded).unwrap() {
            Message::Data(d) => assert!(d.is_parity()),
            other => panic!("wrong kind: {:?}", other),
        }
    }

    #[test]
    fn test_decode_too_short() {
        assert!(matches!(
            Message::decode(&[0x01, 0x01]),
            Err(ProtocolError::MessageTooShort { .. })
        ));
        assert!(matches!(
            Message::decode(&[]),
            Err(ProtocolError::MessageTooShort { .. })
        ));
    }

    #[test]
    fn test_decode_unknown_kind() {
        let mut data = vec![0u8; COMMON_PREFIX_SIZE];
        data[0] = 0x77;
        data[1] = PROTOCOL_VERSION;
        let err = Message::decode(&data).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownKind(0x77));
        assert!(err.is_malformed());
    }

    #[test]
    fn test_decode_unsupported_version() {
        let msg = make_data(vec![1, 2]);
        let mut encoded = Message::Data(msg).encode().unwrap();
        encoded[1] = 2;
        assert_eq!(
            Message::decode(&encoded),
            Err(ProtocolError::UnsupportedVersion(2))
        );
    }

    #[test]
    fn test_decode_oversize_datagram() {
        let data = vec![0x01; MAX_DATAGRAM + 1];
        assert!(matches!(
            Message::decode(&data),
            Err(ProtocolError::MessageTooLong { .. })
        ));
    }

    #[test]
    fn test_sack_encode_decode() {
        let msg = Sack {
            bundle_id: test_id(0xBB),
            recv_watermark: 42,
            bitmap: vec![0b1010_0000, 0x01],
        };
        let encoded = Message::Sack(msg.clone()).encode().unwrap();
        assert_eq!(encoded[0], 0x02);
        match Message::decode(&encoded).unwrap() {
            Message::Sack(decoded) => assert_eq!(decoded, msg),
            other => panic!("wrong kind: {:?}", other),
        }
    }

    #[test]
    fn test_sack_from_ids_bit_layout() {
        // Watermark 10; held ids 11 and 13 -> bits 1 and 3 (MSB-first)
        let sack = Sack::from_ids(test_id(1), 10, vec![11, 13]);
        assert_eq!(sack.bitmap, vec![0b0101_0000]);
    }

    #[test]
    fn test_sack_from_ids_ignores_below_watermark() {
        let sack = Sack::from_ids(test_id(1), 10, vec![3, 10, 12]);
        assert_eq!(sack.bitmap, vec![0b0010_0000]);
    }

    #[test]
    fn test_sack_from_ids_caps_window() {
        let far = 10 + (MAX_SACK_BITMAP_BYTES as u32 * 8) + 5;
        let sack = Sack::from_ids(test_id(1), 10, vec![far]);
        assert!(sack.bitmap.is_empty());
    }

    #[test]
    fn test_expand_sack() {
        let sack = Sack::from_ids(test_id(1), 3, vec![5, 8]);
        let acked = expand_sack(&sack);
        assert_eq!(acked, vec![0, 1, 2, 5, 8]);
    }

    #[test]
    fn test_expand_sack_empty() {
        let sack = Sack {
            bundle_id: test_id(1),
            recv_watermark: 0,
            bitmap: Vec::new(),
        };
        assert!(expand_sack(&sack).is_empty());
    }

    #[test]
    fn test_sack_roundtrip_through_expand() {
        let held: Vec<u32> = vec![21, 22, 25, 40];
        let sack = Sack::from_ids(test_id(2), 20, held.clone());
        let encoded = Message::Sack(sack).encode().unwrap();
        let decoded = match Message::decode(&encoded).unwrap() {
            Message::Sack(s) => s,
            other => panic!("wrong kind: {:?}", other),
        };
        let acked = expand_sack(&decoded);
        let expected: Vec<u32> = (0..20).chain(held).collect();
        assert_eq!(acked, expected);
    }

    #[test]
    fn test_custody_req_encode_decode() {
        let msg = CustodyReq {
            bundle_id: test_id(0xCC),
            ttl_remaining: 120,
            ranges: vec![(0, 63), (100, 150)],
        };
        let encoded = Message::CustodyReq(msg.clone()).encode().unwrap();
        assert_eq!(encoded[0], 0x03);
        match Message::decode(&encoded).unwrap() {
            Message::CustodyReq(decoded) => assert_eq!(decoded, msg),
            other => panic!("wrong kind: {:?}", other),
        }
    }

    #[test]
    fn test_custody_req_empty_ranges() {
        let msg = CustodyReq {
            bundle_id: test_id(1),
            ttl_remaining: 0,
            ranges: Vec::new(),
        };
        let encoded = Message::CustodyReq(msg.clone()).encode().unwrap();
        match Message::decode(&encoded).unwrap() {
            Message::CustodyReq(decoded) => assert!(decoded.ranges.is_empty()),
            other => panic!("wrong kind: {:?}", other),
        }
    }

    #[test]
    fn test_custody_ack_encode_decode() {
        let msg = CustodyAck {
            bundle_id: test_id(0xDD),
            ack_nonce: 0xDEAD_BEEF_CAFE_F00D,
            ranges: vec![(0, 999)],
        };
        let encoded = Message::CustodyAck(msg.clone()).encode().unwrap();
        assert_eq!(encoded[0], 0x04);
        match Message::decode(&encoded).unwrap() {
            Message::CustodyAck(decoded) => assert_eq!(decoded, msg),
            other => panic!("wrong kind: {:?}", other),
        }
    }

    #[test]
    fn test_custody_range_count_mismatch() {
        let msg = CustodyAck {
            bundle_id: test_id(1),
            ack_nonce: 1,
            ranges: vec![(0, 10)],
        };
        let mut encoded = Message::CustodyAck(msg).encode().unwrap();
        // Claim two ranges while only one is present
        let at = COMMON_PREFIX_SIZE + 8;
        encoded[at..at + 2].copy_from_slice(&2u16.to_be_bytes());
        assert!(matches!(
            Message::decode(&encoded),
            Err(ProtocolError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_delivered_encode_decode() {
        let msg = Delivered {
            bundle_id: test_id(0xEE),
        };
        let encoded = Message::Delivered(msg.clone()).encode().unwrap();
        assert_eq!(encoded.len(), COMMON_PREFIX_SIZE);
        assert_eq!(encoded[0], 0x05);
        match Message::decode(&encoded).unwrap() {
            Message::Delivered(decoded) => assert_eq!(decoded, msg),
            other => panic!("wrong kind: {:?}", other),
        }
    }

    #[test]
    fn test_delivered_trailing_bytes_rejected() {
        let msg = Delivered {
            bundle_id: test_id(1),
        };
        let mut encoded = Message::Delivered(msg).encode().unwrap();
        encoded.push(0x00);
        assert!(matches!(
            Message::decode(&encoded),
            Err(ProtocolError::LengthMismatch { .. })
        ));
    }
}
