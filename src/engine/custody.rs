//! Custody manager: store-and-forward handoff between relays.
//!
//! A relay accepts custody of chunk ranges it already holds, persists
//! the promise, acknowledges upstream with a fresh nonce, and drives
//! the remaining transmission toward its next hop. The record is
//! released only by a DELIVERED cascade or a covering downstream
//! CUSTODY_ACK; retries back off exponentially and exhaust internally.

use super::Outbound;
use crate::bundle::{
    normalize_ranges, ranges_cover, subtract_ranges, BundleId, BundleState,
};
use crate::config::CustodyConfig;
use crate::protocol::{CustodyAck, CustodyReq, Delivered, Message};
use crate::store::{CustodyRow, CustodyState, Store};
use std::collections::HashMap;
use std::net::SocketAddr;
use tracing::{debug, info, warn};

/// A bundle the node must start (or keep) forwarding to the next hop.
#[derive(Clone, Debug)]
pub struct ForwardRequest {
    pub bundle_id: BundleId,
    pub next_hop: SocketAddr,
}

/// Manages custody records for bundles this node has promised to carry.
pub struct CustodyManager {
    config: CustodyConfig,
    store: Store,
    node_id: String,
    /// Downstream target for accepted bundles. Without one, custody
    /// requests are silently refused: a promise we cannot act on is
    /// worse than letting the upstream keep retrying.
    next_hop: Option<SocketAddr>,
    /// `storage.cap_bytes`: acceptance is refused once usage exceeds it.
    storage_cap: Option<u64>,
    records: HashMap<BundleId, CustodyRow>,
    outbound: Vec<Outbound>,
    forward_requests: Vec<ForwardRequest>,
}

impl CustodyManager {
    pub fn new(
        config: CustodyConfig,
        store: Store,
        node_id: String,
        next_hop: Option<SocketAddr>,
        storage_cap: Option<u64>,
    ) -> Self {
        Self {
            config,
            store,
            node_id,
            next_hop,
            storage_cap,
            records: HashMap::new(),
            outbound: Vec::new(),
            forward_requests: Vec::new(),
        }
    }

    /// Drain messages queued for transmission.
    pub fn take_outbound(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbound)
    }

    /// Drain bundles whose forwarding should start or resume.
    pub fn take_forward_requests(&mut self) -> Vec<ForwardRequest> {
        std::mem::take(&mut self.forward_requests)
    }

    /// Custody record for a bundle, if any.
    pub fn record(&self, bundle_id: &BundleId) -> Option<&CustodyRow> {
        self.records.get(bundle_id)
    }

    /// Restore custody records after a restart and re-kick forwarding
    /// for every record still held.
    pub fn load_records(&mut self) -> Result<usize, crate::store::StoreError> {
        let rows = self.store.load_custody_records()?;
        let mut restored = 0;
        for row in rows {
            if row.owner_node != self.node_id {
                continue;
            }
            if !row.state.is_terminal() {
                if let Some(next_hop) = self.next_hop {
                    self.forward_requests.push(ForwardRequest {
                        bundle_id: row.bundle_id,
                        next_hop,
                    });
                }
                restored += 1;
            }
            self.records.insert(row.bundle_id, row);
        }
        Ok(restored)
    }

    // =======================================================================
    // Message handlers
    // =======================================================================

    /// Handle a CUSTODY_REQ from an upstream holder.
    ///
    /// Acceptance requires: the bundle's TTL has not elapsed, storage
    /// capacity permits, every requested chunk is actually held here,
    /// and the request is not already covered by an existing record
    /// (an identical request re-sends its ack — a silent drop would
    /// strand an upstream that lost the first ack). All other
    /// rejections are silent; the upstream retries on its own.
    pub fn on_custody_req(&mut self, req: &CustodyReq, src: SocketAddr, now_ms: u64) {
        let bundle = match self.store.load_bundle(&req.bundle_id) {
            Ok(Some(bundle)) => bundle,
            Ok(None) => {
                debug!(bundle = %req.bundle_id, "Custody request for unknown bundle");
                return;
            }
            Err(e) => {
                warn!(bundle = %req.bundle_id, error = %e, "Bundle load failed");
                return;
            }
        };

        // A delivered bundle needs no custodian: the upstream only
        // missed the DELIVERED notice, so repeat it.
        if bundle.state == BundleState::Delivered {
            self.outbound.push(Outbound::new(
                src,
                Message::Delivered(Delivered {
                    bundle_id: req.bundle_id,
                }),
            ));
            return;
        }

        if req.ttl_remaining == 0 || now_ms >= bundle.expires_at_ms {
            debug!(bundle = %req.bundle_id, "Custody refused: ttl elapsed");
            return;
        }

        let requested = normalize_ranges(&req.ranges);
        if requested.is_empty() {
            return;
        }

        if let Some(existing) = self.records.get(&req.bundle_id) {
            if !existing.state.is_terminal() && ranges_cover(&existing.ranges, &requested) {
                // Already promised: repeat the ack with its original nonce
                let ack = CustodyAck {
                    bundle_id: req.bundle_id,
                    ack_nonce: existing.ack_nonce,
                    ranges: existing.ranges.clone(),
                };
                self.outbound.push(Outbound::new(src, Message::CustodyAck(ack)));
                return;
            }
            debug!(bundle = %req.bundle_id, "Custody refused: conflicting record");
            return;
        }

        let Some(next_hop) = self.next_hop else {
            debug!(bundle = %req.bundle_id, "Custody refused: no next hop");
            return;
        };

        // The promise only covers chunks we actually hold
        let held = match self.store.chunk_ids(&req.bundle_id) {
            Ok(ids) => ids,
            Err(e) => {
                warn!(bundle = %req.bundle_id, error = %e, "Chunk scan failed");
                return;
            }
        };
        let covered = requested.iter().all(|&(start, end)| {
            (start..=end).all(|id| held.binary_search(&id).is_ok())
        });
        if !covered {
            debug!(bundle = %req.bundle_id, "Custody refused: ranges not held");
            return;
        }

        if let Some(cap) = self.storage_cap {
            match self.store.payload_usage() {
                Ok(usage) if usage > cap => {
                    debug!(bundle = %req.bundle_id, "Custody refused: storage over cap");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "Usage check failed");
                    return;
                }
                _ => {}
            }
        }

        let row = CustodyRow {
            bundle_id: req.bundle_id,
            owner_node: self.node_id.clone(),
            ranges: requested.clone(),
            upstream_addr: src.to_string(),
            ack_nonce: rand::random::<u64>(),
            acquired_at_ms: now_ms,
            retry_at_ms: now_ms + self.config.backoff_base_sec * 1000,
            retry_count: 0,
            state: CustodyState::Forwarding,
        };

        // Persist the promise before acknowledging it
        if let Err(e) = self.store.save_custody_record(&row) {
            warn!(bundle = %req.bundle_id, error = %e, "Custody persist failed");
            return;
        }

        info!(
            bundle = %req.bundle_id,
            upstream = %src,
            ranges = ?requested,
            ttl_remaining = req.ttl_remaining,
            "Custody accepted"
        );

        self.outbound.push(Outbound::new(
            src,
            Message::CustodyAck(CustodyAck {
                bundle_id: req.bundle_id,
                ack_nonce: row.ack_nonce,
                ranges: requested,
            }),
        ));
        self.forward_requests.push(ForwardRequest {
            bundle_id: req.bundle_id,
            next_hop,
        });
        self.records.insert(req.bundle_id, row);
    }

    /// Handle a CUSTODY_ACK from our own downstream: its coverage is
    /// subtracted from the record, which releases when nothing remains.
    pub fn on_custody_ack(&mut self, ack: &CustodyAck, _src: SocketAddr) {
        let Some(record) = self.records.get_mut(&ack.bundle_id) else {
            return;
        };
        if record.state.is_terminal() {
            return;
        }

        let remaining = subtract_ranges(&record.ranges, &ack.ranges);
        if remaining.is_empty() {
            record.state = CustodyState::Released;
            info!(bundle = %ack.bundle_id, "Custody released by downstream ack");
        } else {
            record.ranges = remaining;
            debug!(
                bundle = %ack.bundle_id,
                remaining = ?record.ranges,
                "Custody partially covered downstream"
            );
        }
        if let Err(e) = self.store.save_custody_record(record) {
            warn!(bundle = %ack.bundle_id, error = %e, "Custody persist failed");
        }
    }

    /// Handle DELIVERED: release every record for the bundle and cascade
    /// the notice to the recorded upstream holder.
    pub fn on_delivered(&mut self, bundle_id: &BundleId) {
        let Some(record) = self.records.get_mut(bundle_id) else {
            return;
        };

        let released_now = !record.state.is_terminal();
        if released_now {
            record.state = CustodyState::Released;
            if let Err(e) = self.store.save_custody_record(record) {
                warn!(bundle = %bundle_id, error = %e, "Custody persist failed");
            }
            info!(bundle = %bundle_id, "Custody released by delivery");
        }

        // Cascade upstream regardless: the notice may have been lost
        match record.upstream_addr.parse::<SocketAddr>() {
            Ok(upstream) => {
                self.outbound.push(Outbound::new(
                    upstream,
                    Message::Delivered(Delivered {
                        bundle_id: *bundle_id,
                    }),
                ));
            }
            Err(e) => {
                warn!(bundle = %bundle_id, error = %e, "Bad upstream address in record");
            }
        }

        if released_now {
            // The forwarding obligation is discharged; reclaim payloads
            if let Err(e) = self.store.delete_chunks(bundle_id) {
                debug!(bundle = %bundle_id, error = %e, "Chunk release failed");
            }
        }
    }

    // =======================================================================
    // Tick
    // =======================================================================

    /// Fire per-record retry timers: re-kick forwarding with
    /// exponential backoff until released, exhausted, or expired.
    pub fn tick(&mut self, now_ms: u64) {
        let bundle_ids: Vec<BundleId> = self.records.keys().copied().collect();

        for bundle_id in bundle_ids {
            let Some(record) = self.records.get_mut(&bundle_id) else {
                continue;
            };
            if record.state.is_terminal() {
                continue;
            }

            // TTL overrides the retry schedule
            let expired = match self.store.load_bundle(&bundle_id) {
                Ok(Some(bundle)) => now_ms >= bundle.expires_at_ms,
                Ok(None) => true,
                Err(_) => false,
            };
            if expired {
                record.state = CustodyState::Failed;
                if let Err(e) = self.store.save_custody_record(record) {
                    warn!(bundle = %bundle_id, error = %e, "Custody persist failed");
                }
                warn!(bundle = %bundle_id, "Custody failed: bundle expired");
                continue;
            }

            if now_ms < record.retry_at_ms {
                continue;
            }

            record.retry_count += 1;
            if record.retry_count > self.config.max_retries {
                // Internal failure only: the upstream holder retries
                // through its own mechanism.
                record.state = CustodyState::Failed;
                if let Err(e) = self.store.save_custody_record(record) {
                    warn!(bundle = %bundle_id, error = %e, "Custody persist failed");
                }
                warn!(
                    bundle = %bundle_id,
                    retries = record.retry_count - 1,
                    "Custody retries exhausted"
                );
                continue;
            }

            let backoff_sec = (1u64 << record.retry_count.min(32))
                .min(self.config.backoff_cap_sec);
            record.retry_at_ms = now_ms + backoff_sec * 1000;
            if let Err(e) = self.store.save_custody_record(record) {
                warn!(bundle = %bundle_id, error = %e, "Custody persist failed");
            }

            debug!(
                bundle = %bundle_id,
                attempt = record.retry_count,
                next_in_sec = backoff_sec,
                "Custody forward retry"
            );
            if let Some(next_hop) = self.next_hop {
                self.forward_requests.push(ForwardRequest {
                    bundle_id,
                    next_hop,
                });
            }
        }
    }

}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{BundleRecord, ChunkRecord};
    use tempfile::TempDir;

    const NOW: u64 = 3_000_000;

    fn setup(next_hop: Option<&str>) -> (TempDir, CustodyManager, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("db")).unwrap();
        let manager = CustodyManager::new(
            CustodyConfig::default(),
            store.clone(),
            "relay-b".into(),
            next_hop.map(|s| s.parse().unwrap()),
            None,
        );
        (dir, manager, store)
    }

    fn upstream() -> SocketAddr {
        "127.0.0.1:5000".parse().unwrap()
    }

    fn seed_bundle(store: &Store, total_chunks: u32, state: BundleState) -> BundleId {
        let bundle_id = BundleId::generate();
        store
            .save_bundle(&BundleRecord {
                bundle_id,
                src_node: "127.0.0.1:5000".into(),
                dst_node: "relay-b".into(),
                dest_addr: None,
                expires_at_ms: NOW + 300_000,
                length: total_chunks as u64 * 10,
                total_chunks,
                num_data_chunks: total_chunks,
                fec_enabled: false,
                k: 0,
                r: 0,
                state,
                bytes_sent: 0,
                chunks_retransmitted: 0,
                created_at_ms: NOW,
                file_path: None,
            })
            .unwrap();

        let chunks: Vec<ChunkRecord> = (0..total_chunks)
            .map(|chunk_id| {
                let payload = vec![chunk_id as u8; 10];
                ChunkRecord {
                    bundle_id,
                    chunk_id,
                    is_parity: false,
                    block_id: 0,
                    k: 0,
                    r: 0,
                    checksum: crc32fast::hash(&payload),
                    payload,
                }
            })
            .collect();
        store.save_chunks(&chunks, None).unwrap();
        bundle_id
    }

    fn req_for(bundle_id: BundleId, total: u32) -> CustodyReq {
        CustodyReq {
            bundle_id,
            ttl_remaining: 120,
            ranges: vec![(0, total - 1)],
        }
    }

    fn acks(out: &[Outbound]) -> Vec<&CustodyAck> {
        out.iter()
            .filter_map(|o| match &o.message {
                Message::CustodyAck(a) => Some(a),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_accept_creates_record_and_acks() {
        let (_dir, mut manager, store) = setup(Some("127.0.0.1:7000"));
        let bundle_id = seed_bundle(&store, 4, BundleState::InFlight);

        manager.on_custody_req(&req_for(bundle_id, 4), upstream(), NOW);

        let out = manager.take_outbound();
        let ack_list = acks(&out);
        assert_eq!(ack_list.len(), 1);
        assert_eq!(ack_list[0].ranges, vec![(0, 3)]);
        assert_ne!(ack_list[0].ack_nonce, 0);
        assert_eq!(out[0].dest, upstream());

        let record = manager.record(&bundle_id).unwrap();
        assert_eq!(record.state, CustodyState::Forwarding);
        assert_eq!(record.upstream_addr, upstream().to_string());

        // Persisted before acknowledged
        let stored = store.load_custody_record(&bundle_id, "relay-b").unwrap();
        assert!(stored.is_some());

        let forwards = manager.take_forward_requests();
        assert_eq!(forwards.len(), 1);
        assert_eq!(forwards[0].bundle_id, bundle_id);
        assert_eq!(forwards[0].next_hop, "127.0.0.1:7000".parse().unwrap());
    }

    #[test]
    fn test_unknown_bundle_silent_drop() {
        let (_dir, mut manager, _store) = setup(Some("127.0.0.1:7000"));
        manager.on_custody_req(&req_for(BundleId::generate(), 4), upstream(), NOW);
        assert!(manager.take_outbound().is_empty());
    }

    #[test]
    fn test_delivered_bundle_resends_delivered() {
        let (_dir, mut manager, store) = setup(Some("127.0.0.1:7000"));
        let bundle_id = seed_bundle(&store, 4, BundleState::Delivered);

        manager.on_custody_req(&req_for(bundle_id, 4), upstream(), NOW);
        let out = manager.take_outbound();
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0].message, Message::Delivered(_)));
        assert!(manager.record(&bundle_id).is_none());
    }

    #[test]
    fn test_missing_chunks_silent_drop() {
        let (_dir, mut manager, store) = setup(Some("127.0.0.1:7000"));
        let bundle_id = seed_bundle(&store, 4, BundleState::InFlight);
        store.delete_chunks(&bundle_id).unwrap();

        manager.on_custody_req(&req_for(bundle_id, 4), upstream(), NOW);
        assert!(manager.take_outbound().is_empty());
        assert!(manager.record(&bundle_id).is_none());
    }

    #[test]
    fn test_elapsed_ttl_silent_drop() {
        let (_dir, mut manager, store) = setup(Some("127.0.0.1:7000"));
        let bundle_id = seed_bundle(&store, 4, BundleState::InFlight);

        let mut req = req_for(bundle_id, 4);
        req.ttl_remaining = 0;
        manager.on_custody_req(&req, upstream(), NOW);
        assert!(manager.take_outbound().is_empty());

        // Local expiry wins even when the peer claims time remains
        manager.on_custody_req(&req_for(bundle_id, 4), upstream(), NOW + 400_000);
        assert!(manager.take_outbound().is_empty());
    }

    #[test]
    fn test_no_next_hop_silent_drop() {
        let (_dir, mut manager, store) = setup(None);
        let bundle_id = seed_bundle(&store, 4, BundleState::InFlight);

        manager.on_custody_req(&req_for(bundle_id, 4), upstream(), NOW);
        assert!(manager.take_outbound().is_empty());
    }

    #[test]
    fn test_duplicate_request_reacks_same_nonce() {
        let (_dir, mut manager, store) = setup(Some("127.0.0.1:7000"));
        let bundle_id = seed_bundle(&store, 4, BundleState::InFlight);

        manager.on_custody_req(&req_for(bundle_id, 4), upstream(), NOW);
        let first = acks(&manager.take_outbound())[0].ack_nonce;

        manager.on_custody_req(&req_for(bundle_id, 4), upstream(), NOW + 1000);
        let out = manager.take_outbound();
        let again = acks(&out);
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].ack_nonce, first);

        // The duplicate does not restart forwarding
        manager.take_forward_requests();
        assert!(manager.take_forward_requests().is_empty());
    }

    #[test]
    fn test_downstream_ack_partial_then_release() {
        let (_dir, mut manager, store) = setup(Some("127.0.0.1:7000"));
        let bundle_id = seed_bundle(&store, 10, BundleState::InFlight);

        manager.on_custody_req(&req_for(bundle_id, 10), upstream(), NOW);
        manager.take_outbound();

        let partial = CustodyAck {
            bundle_id,
            ack_nonce: 7,
            ranges: vec![(0, 4)],
        };
        manager.on_custody_ack(&partial, "127.0.0.1:7000".parse().unwrap());
        let record = manager.record(&bundle_id).unwrap();
        assert_eq!(record.state, CustodyState::Forwarding);
        assert_eq!(record.ranges, vec![(5, 9)]);

        let rest = CustodyAck {
            bundle_id,
            ack_nonce: 7,
            ranges: vec![(5, 9)],
        };
        manager.on_custody_ack(&rest, "127.0.0.1:7000".parse().unwrap());
        assert_eq!(
            manager.record(&bundle_id).unwrap().state,
            CustodyState::Released
        );
    }

    #[test]
    fn test_delivered_releases_and_cascades() {
        let (_dir, mut manager, store) = setup(Some("127.0.0.1:7000"));
        let bundle_id = seed_bundle(&store, 4, BundleState::InFlight);

        manager.on_custody_req(&req_for(bundle_id, 4), upstream(), NOW);
        manager.take_outbound();

        manager.on_delivered(&bundle_id);
        let record = manager.record(&bundle_id).unwrap();
        assert_eq!(record.state, CustodyState::Released);

        // DELIVERED cascaded to the upstream holder
        let out = manager.take_outbound();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].dest, upstream());
        assert!(matches!(out[0].message, Message::Delivered(_)));

        // Payloads reclaimed
        assert!(store.load_chunks(&bundle_id).unwrap().is_empty());

        // Release persisted
        let stored = store
            .load_custody_record(&bundle_id, "relay-b")
            .unwrap()
            .unwrap();
        assert_eq!(stored.state, CustodyState::Released);
    }

    #[test]
    fn test_retry_backoff_and_rekick() {
        let (_dir, mut manager, store) = setup(Some("127.0.0.1:7000"));
        let bundle_id = seed_bundle(&store, 4, BundleState::InFlight);

        manager.on_custody_req(&req_for(bundle_id, 4), upstream(), NOW);
        manager.take_outbound();
        manager.take_forward_requests();

        // First retry fires at acquired + base backoff (2 s)
        manager.tick(NOW + 1_000);
        assert!(manager.take_forward_requests().is_empty());

        manager.tick(NOW + 2_500);
        assert_eq!(manager.take_forward_requests().len(), 1);
        let record = manager.record(&bundle_id).unwrap();
        assert_eq!(record.retry_count, 1);
        // Next fire at now + 2^1 seconds
        assert_eq!(record.retry_at_ms, NOW + 2_500 + 2_000);
    }

    #[test]
    fn test_retry_exhaustion_fails_record() {
        let (_dir, mut manager, store) = setup(Some("127.0.0.1:7000"));
        let bundle_id = seed_bundle(&store, 4, BundleState::InFlight);

        manager.on_custody_req(&req_for(bundle_id, 4), upstream(), NOW);
        manager.take_outbound();

        // Drive every retry; the schedule is capped at backoff_cap_sec
        let mut now = NOW;
        for _ in 0..=manager.config.max_retries {
            now += manager.config.backoff_cap_sec * 1000 + 1000;
            manager.tick(now);
        }

        let record = manager.record(&bundle_id).unwrap();
        assert_eq!(record.state, CustodyState::Failed);
        // No upstream notification on failure
        assert!(manager.take_outbound().is_empty());
    }

    #[test]
    fn test_bundle_expiry_fails_record() {
        let (_dir, mut manager, store) = setup(Some("127.0.0.1:7000"));
        let bundle_id = seed_bundle(&store, 4, BundleState::InFlight);

        manager.on_custody_req(&req_for(bundle_id, 4), upstream(), NOW);
        manager.take_outbound();

        manager.tick(NOW + 400_000); // past the bundle's expiry
        assert_eq!(
            manager.record(&bundle_id).unwrap().state,
            CustodyState::Failed
        );
    }

    #[test]
    fn test_restart_restores_records() {
        let (_dir, mut manager, store) = setup(Some("127.0.0.1:7000"));
        let bundle_id = seed_bundle(&store, 4, BundleState::InFlight);
        manager.on_custody_req(&req_for(bundle_id, 4), upstream(), NOW);
        manager.take_outbound();
        manager.take_forward_requests();

        // Fresh manager over the same store, as after a restart
        let mut restored = CustodyManager::new(
            CustodyConfig::default(),
            store.clone(),
            "relay-b".into(),
            Some("127.0.0.1:7000".parse().unwrap()),
            None,
        );
        let count = restored.load_records().unwrap();
        assert_eq!(count, 1);
        assert!(restored.record(&bundle_id).is_some());

        // Forwarding re-kicked for the held bundle
        let forwards = restored.take_forward_requests();
        assert_eq!(forwards.len(), 1);
        assert_eq!(forwards[0].bundle_id, bundle_id);
    }
}
