//! Persistent store for bundles, chunks, and custody records.
//!
//! Three sled trees back the three durable tables:
//!
//! - `bundles`: key = bundle_id, one [`BundleRecord`] per bundle.
//! - `chunks`: key = bundle_id || chunk_id (big-endian), one
//!   [`ChunkRecord`] per chunk. The BE chunk id keeps per-bundle scans
//!   ordered.
//! - `custody`: key = bundle_id || owner_node, one [`CustodyRow`] per
//!   accepted custody.
//!
//! Every record is written before the corresponding message is
//! transmitted or acknowledged, so a crash-restart loses no
//! externally-observable commitment. The store is the single source of
//! truth; engine state is rebuilt from it on startup.

use crate::bundle::{BundleId, BundleState, ChunkRanges};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Errors related to store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("bundle not found: {0}")]
    BundleNotFound(BundleId),

    #[error("storage cap exceeded: need {needed} bytes, {available} available")]
    CapExceeded { needed: u64, available: u64 },
}

/// Persisted bundle row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BundleRecord {
    pub bundle_id: BundleId,
    /// Originating node id.
    pub src_node: String,
    /// Destination node endpoint ("host:port") or node id.
    pub dst_node: String,
    /// Socket address sends are directed at; set for outbound bundles so
    /// a restart can resume the transfer.
    pub dest_addr: Option<String>,
    /// Absolute expiry, Unix milliseconds.
    pub expires_at_ms: u64,
    /// Exact file length in bytes.
    pub length: u64,
    /// Data plus parity chunk count.
    pub total_chunks: u32,
    /// Data chunk count (equals total_chunks without FEC).
    pub num_data_chunks: u32,
    pub fec_enabled: bool,
    pub k: u8,
    pub r: u8,
    pub state: BundleState,
    pub bytes_sent: u64,
    pub chunks_retransmitted: u64,
    pub created_at_ms: u64,
    /// Source path (outbound) or assembled destination path (inbound).
    pub file_path: Option<String>,
}

/// Persisted chunk row. Chunks are immutable once generated.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub bundle_id: BundleId,
    pub chunk_id: u32,
    pub is_parity: bool,
    /// FEC block group; 0 when FEC is disabled.
    pub block_id: u32,
    pub k: u8,
    pub r: u8,
    /// CRC-32 of the payload bytes.
    pub checksum: u32,
    pub payload: Vec<u8>,
}

/// Custody record lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CustodyState {
    /// Accepted and persisted; forwarding not yet under way.
    Held,
    /// Actively forwarding toward the next hop.
    Forwarding,
    /// Obligation discharged by DELIVERED or a covering downstream ack.
    Released,
    /// Retries exhausted or TTL elapsed.
    Failed,
}

impl CustodyState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Released | Self::Failed)
    }
}

/// Persisted custody row: a relay's promise to keep forwarding the
/// listed chunk ranges until delivered or expired.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CustodyRow {
    pub bundle_id: BundleId,
    pub owner_node: String,
    pub ranges: ChunkRanges,
    /// Upstream holder to notify when the bundle completes.
    pub upstream_addr: String,
    /// Token echoed in our CUSTODY_ACK.
    pub ack_nonce: u64,
    pub acquired_at_ms: u64,
    /// Next retry fire instant, Unix milliseconds.
    pub retry_at_ms: u64,
    pub retry_count: u32,
    pub state: CustodyState,
}

/// Key for chunk usage accounting in the meta tree.
const META_PAYLOAD_USAGE: &[u8] = b"payload_usage_bytes";

/// sled-backed persistent store.
///
/// Cheap to clone: sled handles are reference-counted.
#[derive(Clone)]
pub struct Store {
    bundles: sled::Tree,
    chunks: sled::Tree,
    custody: sled::Tree,
    meta: sled::Tree,
}

impl Store {
    /// Open (or create) the store at the given directory.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Ok(Self {
            bundles: db.open_tree("bundles")?,
            chunks: db.open_tree("chunks")?,
            custody: db.open_tree("custody")?,
            meta: db.open_tree("meta")?,
        })
    }

    // =======================================================================
    // Bundles
    // =======================================================================

    /// Insert or replace a bundle row.
    pub fn save_bundle(&self, record: &BundleRecord) -> Result<(), StoreError> {
        let bytes = encode(record)?;
        self.bundles.insert(record.bundle_id.as_bytes(), bytes)?;
        self.bundles.flush()?;
        Ok(())
    }

    /// Load a bundle row, or None.
    pub fn load_bundle(&self, bundle_id: &BundleId) -> Result<Option<BundleRecord>, StoreError> {
        match self.bundles.get(bundle_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Update only the state of a bundle.
    pub fn update_bundle_state(
        &self,
        bundle_id: &BundleId,
        state: BundleState,
    ) -> Result<(), StoreError> {
        let mut record = self
            .load_bundle(bundle_id)?
            .ok_or(StoreError::BundleNotFound(*bundle_id))?;
        record.state = state;
        self.save_bundle(&record)
    }

    /// Update transfer counters for a bundle.
    pub fn update_bundle_stats(
        &self,
        bundle_id: &BundleId,
        bytes_sent: u64,
        chunks_retransmitted: u64,
    ) -> Result<(), StoreError> {
        let mut record = self
            .load_bundle(bundle_id)?
            .ok_or(StoreError::BundleNotFound(*bundle_id))?;
        record.bytes_sent = bytes_sent;
        record.chunks_retransmitted = chunks_retransmitted;
        self.save_bundle(&record)
    }

    /// All bundles, ordered by id.
    pub fn list_bundles(&self) -> Result<Vec<BundleRecord>, StoreError> {
        let mut records = Vec::new();
        for entry in self.bundles.iter() {
            let (_, bytes) = entry?;
            records.push(decode(&bytes)?);
        }
        Ok(records)
    }

    /// Bundles whose transfer had not reached a terminal state.
    ///
    /// Recovery entry point: the node rebuilds send/receive state from
    /// these rows after a restart.
    pub fn load_in_flight_bundles(&self) -> Result<Vec<BundleRecord>, StoreError> {
        Ok(self
            .list_bundles()?
            .into_iter()
            .filter(|b| !b.state.is_terminal())
            .collect())
    }

    // =======================================================================
    // Chunks
    // =======================================================================

    fn chunk_key(bundle_id: &BundleId, chunk_id: u32) -> [u8; 20] {
        let mut key = [0u8; 20];
        key[..16].copy_from_slice(bundle_id.as_bytes());
        key[16..].copy_from_slice(&chunk_id.to_be_bytes());
        key
    }

    /// Insert a chunk row, enforcing the storage cap and maintaining the
    /// payload-usage counter.
    pub fn save_chunk(&self, record: &ChunkRecord, cap_bytes: Option<u64>) -> Result<(), StoreError> {
        self.save_chunks(std::slice::from_ref(record), cap_bytes)
    }

    /// Insert a batch of chunk rows in one pass.
    pub fn save_chunks(
        &self,
        records: &[ChunkRecord],
        cap_bytes: Option<u64>,
    ) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }

        let added: u64 = records.iter().map(|c| c.payload.len() as u64).sum();
        let usage = self.payload_usage()?;
        if let Some(cap) = cap_bytes {
            let available = cap.saturating_sub(usage);
            if added > available {
                return Err(StoreError::CapExceeded {
                    needed: added,
                    available,
                });
            }
        }

        let mut new_usage = usage;
        for record in records {
            let key = Self::chunk_key(&record.bundle_id, record.chunk_id);
            // Replacing an existing chunk must not double-count its bytes
            if let Some(old) = self.chunks.insert(key, encode(record)?)? {
                let old: ChunkRecord = decode(&old)?;
                new_usage = new_usage.saturating_sub(old.payload.len() as u64);
            }
            new_usage += record.payload.len() as u64;
        }
        self.set_payload_usage(new_usage)?;
        self.chunks.flush()?;
        Ok(())
    }

    /// Load one chunk, or None.
    pub fn load_chunk(
        &self,
        bundle_id: &BundleId,
        chunk_id: u32,
    ) -> Result<Option<ChunkRecord>, StoreError> {
        match self.chunks.get(Self::chunk_key(bundle_id, chunk_id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All chunks of a bundle ordered by chunk id.
    pub fn load_chunks(&self, bundle_id: &BundleId) -> Result<Vec<ChunkRecord>, StoreError> {
        let mut records = Vec::new();
        for entry in self.chunks.scan_prefix(bundle_id.as_bytes()) {
            let (_, bytes) = entry?;
            records.push(decode(&bytes)?);
        }
        Ok(records)
    }

    /// Chunk ids held for a bundle (no payload decode of the full rows).
    pub fn chunk_ids(&self, bundle_id: &BundleId) -> Result<Vec<u32>, StoreError> {
        let mut ids = Vec::new();
        for entry in self.chunks.scan_prefix(bundle_id.as_bytes()) {
            let (key, _) = entry?;
            let mut id_bytes = [0u8; 4];
            id_bytes.copy_from_slice(&key[16..20]);
            ids.push(u32::from_be_bytes(id_bytes));
        }
        Ok(ids)
    }

    /// Delete all chunk payloads of a bundle, keeping the bundle row.
    /// Used when a covering CUSTODY_ACK releases local copies.
    pub fn delete_chunks(&self, bundle_id: &BundleId) -> Result<(), StoreError> {
        let mut freed = 0u64;
        let keys: Vec<_> = self
            .chunks
            .scan_prefix(bundle_id.as_bytes())
            .keys()
            .collect::<Result<_, _>>()?;
        for key in keys {
            if let Some(old) = self.chunks.remove(&key)? {
                let old: ChunkRecord = decode(&old)?;
                freed += old.payload.len() as u64;
            }
        }
        let usage = self.payload_usage()?;
        self.set_payload_usage(usage.saturating_sub(freed))?;
        self.chunks.flush()?;
        Ok(())
    }

    /// Total stored chunk payload bytes (for the storage cap check).
    pub fn payload_usage(&self) -> Result<u64, StoreError> {
        match self.meta.get(META_PAYLOAD_USAGE)? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes.as_ref().try_into().unwrap_or([0u8; 8]);
                Ok(u64::from_be_bytes(arr))
            }
            None => Ok(0),
        }
    }

    fn set_payload_usage(&self, usage: u64) -> Result<(), StoreError> {
        self.meta.insert(META_PAYLOAD_USAGE, &usage.to_be_bytes())?;
        Ok(())
    }

    // =======================================================================
    // Custody
    // =======================================================================

    fn custody_key(bundle_id: &BundleId, owner_node: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(16 + owner_node.len());
        key.extend_from_slice(bundle_id.as_bytes());
        key.extend_from_slice(owner_node.as_bytes());
        key
    }

    /// Insert or replace a custody row.
    pub fn save_custody_record(&self, row: &CustodyRow) -> Result<(), StoreError> {
        let key = Self::custody_key(&row.bundle_id, &row.owner_node);
        self.custody.insert(key, encode(row)?)?;
        self.custody.flush()?;
        Ok(())
    }

    /// Load a custody row for (bundle, owner), or None.
    pub fn load_custody_record(
        &self,
        bundle_id: &BundleId,
        owner_node: &str,
    ) -> Result<Option<CustodyRow>, StoreError> {
        match self.custody.get(Self::custody_key(bundle_id, owner_node))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All custody rows. Recovery entry point for restart.
    pub fn load_custody_records(&self) -> Result<Vec<CustodyRow>, StoreError> {
        let mut rows = Vec::new();
        for entry in self.custody.iter() {
            let (_, bytes) = entry?;
            rows.push(decode(&bytes)?);
        }
        Ok(rows)
    }

    // =======================================================================
    // Cleanup
    // =======================================================================

    /// Delete a bundle with all its chunks and custody rows.
    pub fn delete_bundle(&self, bundle_id: &BundleId) -> Result<(), StoreError> {
        self.delete_chunks(bundle_id)?;

        let custody_keys: Vec<_> = self
            .custody
            .scan_prefix(bundle_id.as_bytes())
            .keys()
            .collect::<Result<_, _>>()?;
        for key in custody_keys {
            self.custody.remove(key)?;
        }

        self.bundles.remove(bundle_id.as_bytes())?;
        self.bundles.flush()?;
        Ok(())
    }

    /// Purge bundles past their retention horizon: terminal bundles are
    /// removed `retain_ms` after expiry/creation, and non-terminal
    /// bundles whose TTL elapsed are first marked EXPIRED.
    ///
    /// Returns the purged bundle ids.
    pub fn purge_expired(&self, now_ms: u64, retain_ms: u64) -> Result<Vec<BundleId>, StoreError> {
        let mut purged = Vec::new();
        for record in self.list_bundles()? {
            if !record.state.is_terminal() && now_ms >= record.expires_at_ms {
                let mut expired = record.clone();
                expired.state = BundleState::Expired;
                self.save_bundle(&expired)?;
            }

            let horizon = record.expires_at_ms.saturating_add(retain_ms);
            let terminal = record.state.is_terminal() || now_ms >= record.expires_at_ms;
            if terminal && now_ms >= horizon {
                self.delete_bundle(&record.bundle_id)?;
                purged.push(record.bundle_id);
            }
        }
        Ok(purged)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serialize(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, StoreError> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}
