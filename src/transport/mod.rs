//! Datagram transport abstractions.
//!
//! One UDP endpoint per node. A background receive task moves incoming
//! datagrams onto a bounded channel; the node loop drains that channel.
//! The channel is the single concurrency boundary between socket I/O
//! and engine state.

pub mod udp;

use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// A datagram received from the network.
#[derive(Clone, Debug)]
pub struct ReceivedDatagram {
    /// Remote peer address.
    pub remote_addr: SocketAddr,
    /// Datagram bytes.
    pub data: Vec<u8>,
    /// Receipt timestamp (Unix milliseconds).
    pub timestamp_ms: u64,
}

impl ReceivedDatagram {
    /// Create a received datagram stamped with the current time.
    pub fn new(remote_addr: SocketAddr, data: Vec<u8>) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            remote_addr,
            data,
            timestamp_ms,
        }
    }
}

/// Channel sender for received datagrams.
pub type DatagramTx = tokio::sync::mpsc::Sender<ReceivedDatagram>;

/// Channel receiver for received datagrams.
pub type DatagramRx = tokio::sync::mpsc::Receiver<ReceivedDatagram>;

/// Create a datagram channel with the given buffer size.
pub fn datagram_channel(buffer: usize) -> (DatagramTx, DatagramRx) {
    tokio::sync::mpsc::channel(buffer)
}

/// Errors related to datagram transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("endpoint not started")]
    NotStarted,

    #[error("bind failed on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("send failed to {addr}: {source}")]
    SendFailed {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("mtu exceeded: datagram {datagram_size} > mtu {mtu}")]
    MtuExceeded { datagram_size: usize, mtu: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
