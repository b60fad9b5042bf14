//! Courier wire protocol.
//!
//! Five datagram message kinds carry the whole transfer protocol:
//!
//! - `DATA`: one chunk of a bundle (data or parity).
//! - `SACK`: selective acknowledgment bitmap anchored at the receive
//!   watermark.
//! - `CUSTODY_REQ` / `CUSTODY_ACK`: store-and-forward custody handoff
//!   between an upstream holder and a relay.
//! - `DELIVERED`: end-to-end delivery confirmation, cascaded upstream.
//!
//! All messages share an 18-byte prefix `[kind][version][bundle_id:16]`
//! and all integers are big-endian. No encoded datagram may exceed
//! [`MAX_DATAGRAM`] bytes.

mod error;
mod wire;

pub use error::ProtocolError;
pub use wire::{
    expand_sack, CustodyAck, CustodyReq, Data, Delivered, Message, MessageKind, Sack,
    COMMON_PREFIX_SIZE, DATA_HEADER_SIZE, FLAG_PARITY, MAX_DATA_PAYLOAD, MAX_PARITY_PAYLOAD,
    MAX_SACK_BITMAP_BYTES,
};

/// Protocol version carried in every message. Currently 1.
pub const PROTOCOL_VERSION: u8 = 1;

/// Hard ceiling on any encoded datagram, headers included.
pub const MAX_DATAGRAM: usize = 1200;
