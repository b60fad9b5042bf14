//! Configuration subsections.
//!
//! The `transfer.*`, `fec.*`, `custody.*`, and `storage.*` parameter
//! groups that govern chunking, retransmission, forward error
//! correction, custody handoff, and the persistent store.

use serde::{Deserialize, Serialize};

// ============================================================================
// Node Section
// ============================================================================

/// Node identity and endpoint (`node.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// UDP port to bind (`node.port`).
    #[serde(default = "NodeConfig::default_port")]
    pub port: u16,
    /// Node identifier used in bundle and custody records (`node.node_id`).
    /// Defaults to the hostname when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            port: 5000,
            node_id: None,
        }
    }
}

impl NodeConfig {
    fn default_port() -> u16 {
        5000
    }
}

// ============================================================================
// Transfer Section
// ============================================================================

/// Transfer parameters (`transfer.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Payload bytes per chunk, at most 1150 (`transfer.chunk_size`).
    #[serde(default = "TransferConfig::default_chunk_size")]
    pub chunk_size: usize,
    /// Fixed sliding-window size in chunks (`transfer.window_size`).
    #[serde(default = "TransferConfig::default_window_size")]
    pub window_size: u32,
    /// Lower bound on the retransmission timeout in ms (`transfer.base_rto_ms`).
    #[serde(default = "TransferConfig::default_base_rto_ms")]
    pub base_rto_ms: u64,
    /// Upper bound on the retransmission timeout in ms (`transfer.max_rto_ms`).
    #[serde(default = "TransferConfig::default_max_rto_ms")]
    pub max_rto_ms: u64,
    /// Bundle time-to-live in seconds (`transfer.ttl_sec`).
    #[serde(default = "TransferConfig::default_ttl_sec")]
    pub ttl_sec: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1150,
            window_size: 64,
            base_rto_ms: 50,
            max_rto_ms: 5000,
            ttl_sec: 300,
        }
    }
}

impl TransferConfig {
    fn default_chunk_size() -> usize { 1150 }
    fn default_window_size() -> u32 { 64 }
    fn default_base_rto_ms() -> u64 { 50 }
    fn default_max_rto_ms() -> u64 { 5000 }
    fn default_ttl_sec() -> u64 { 300 }
}

// ============================================================================
// FEC Section
// ============================================================================

/// Forward error correction (`fec.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FecConfig {
    /// Enable XOR parity generation (`fec.enabled`).
    #[serde(default)]
    pub enabled: bool,
    /// Data chunks per block (`fec.k`).
    #[serde(default = "FecConfig::default_k")]
    pub k: u8,
    /// Parity chunks per block (`fec.r`).
    #[serde(default = "FecConfig::default_r")]
    pub r: u8,
}

impl Default for FecConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            k: 4,
            r: 2,
        }
    }
}

impl FecConfig {
    fn default_k() -> u8 { 4 }
    fn default_r() -> u8 { 2 }
}

// ============================================================================
// Custody Section
// ============================================================================

/// When a custody holder may release locally retained chunk payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleasePolicy {
    /// Release as soon as a covering CUSTODY_ACK arrives.
    Eager,
    /// Hold until the DELIVERED cascade reaches this node.
    Deferred,
}

impl Default for ReleasePolicy {
    fn default() -> Self {
        ReleasePolicy::Eager
    }
}

/// Custody handoff behavior (`custody.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustodyConfig {
    /// Forwarding retries before a record fails (`custody.max_retries`).
    #[serde(default = "CustodyConfig::default_max_retries")]
    pub max_retries: u32,
    /// Base backoff in seconds (`custody.backoff_base_sec`).
    #[serde(default = "CustodyConfig::default_backoff_base_sec")]
    pub backoff_base_sec: u64,
    /// Backoff ceiling in seconds (`custody.backoff_cap_sec`).
    #[serde(default = "CustodyConfig::default_backoff_cap_sec")]
    pub backoff_cap_sec: u64,
    /// Release timing for the upstream holder (`custody.release_policy`).
    #[serde(default)]
    pub release_policy: ReleasePolicy,
    /// Next hop for relayed bundles (`custody.next_hop`, "host:port").
    /// A node with a next hop acts as a relay and never claims delivery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_hop: Option<String>,
}

impl Default for CustodyConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            backoff_base_sec: 2,
            backoff_cap_sec: 64,
            release_policy: ReleasePolicy::default(),
            next_hop: None,
        }
    }
}

impl CustodyConfig {
    fn default_max_retries() -> u32 { 10 }
    fn default_backoff_base_sec() -> u64 { 2 }
    fn default_backoff_cap_sec() -> u64 { 64 }
}

// ============================================================================
// Storage Section
// ============================================================================

/// Persistent store parameters (`storage.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database directory (`storage.db_path`). Defaults to
    /// `courier_<node_id>_<port>.db` in the working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,
    /// Ceiling on stored chunk payload bytes (`storage.cap_bytes`).
    /// Unset means unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cap_bytes: Option<u64>,
    /// Seconds to retain terminal bundles before purge (`storage.retain_sec`).
    #[serde(default = "StorageConfig::default_retain_sec")]
    pub retain_sec: u64,
    /// Directory where delivered files are written (`storage.inbox_dir`).
    #[serde(default = "StorageConfig::default_inbox_dir")]
    pub inbox_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            cap_bytes: None,
            retain_sec: 3600,
            inbox_dir: Self::default_inbox_dir(),
        }
    }
}

impl StorageConfig {
    fn default_retain_sec() -> u64 { 3600 }
    fn default_inbox_dir() -> String { "received".to_string() }
}
