//! Courier: delay/disruption-tolerant reliable file transfer over UDP.
//!
//! Courier fragments a file into checksummed chunks, transmits them
//! over datagrams with a sliding window and selective acknowledgment,
//! retransmits under an adaptive timer, optionally masks losses with
//! block-XOR forward error correction, and can hand custody of a
//! bundle to intermediate relays so transfers survive long
//! disconnections of the origin. The destination reassembles a
//! byte-identical copy.

pub mod bundle;
pub mod config;
pub mod engine;
pub mod node;
pub mod protocol;
pub mod store;
pub mod transport;

// Re-export bundle types
pub use bundle::{BundleId, BundleState, ChunkRanges};

// Re-export config types
pub use config::{
    Config, ConfigError, CustodyConfig, FecConfig, NodeConfig, ReleasePolicy, StorageConfig,
    TransferConfig,
};

// Re-export protocol types
pub use protocol::{
    CustodyAck, CustodyReq, Data, Delivered, Message, MessageKind, ProtocolError, Sack,
    MAX_DATAGRAM, PROTOCOL_VERSION,
};

// Re-export store types
pub use store::{BundleRecord, ChunkRecord, CustodyRow, CustodyState, Store, StoreError};

// Re-export transport types
pub use transport::{
    datagram_channel, DatagramRx, DatagramTx, ReceivedDatagram, TransportError,
};
pub use transport::udp::UdpEndpoint;

// Re-export engine types
pub use engine::custody::CustodyManager;
pub use engine::recv::ReceiveEngine;
pub use engine::send::{SendEngine, SendError};

// Re-export node types
pub use node::{Node, NodeError, NodeState, TransferOutcome};
