//! Receive engine: validation, deduplication, FEC reconstruction, SACK
//! generation, and ordered file assembly.
//!
//! Like the send engine this is a state machine: `on_data` and
//! `tick(now)` mutate per-bundle state and queue outbound SACK and
//! DELIVERED messages for the node to flush.

use super::{fec, Outbound};
use crate::bundle::{BundleId, BundleState};
use crate::config::{StorageConfig, TransferConfig};
use crate::protocol::{Data, Delivered, Message, Sack};
use crate::store::{BundleRecord, ChunkRecord, Store};
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Flush the chunk write buffer to the store at this many records.
const WRITE_BUFFER_FLUSH: usize = 256;

/// Emit a SACK after this many newly received chunks.
const SACK_EVERY_NEW: u32 = 32;

/// Periodic SACK cadence while chunks are outstanding, in ms.
const SACK_TICK_MS: u64 = 100;

/// Per-bundle inbound transfer state.
#[derive(Debug)]
pub struct ReceiveState {
    pub bundle_id: BundleId,
    /// Peer the chunks arrive from; SACKs and DELIVERED go back here.
    src_addr: SocketAddr,
    pub total_chunks: u32,
    /// Data chunk count; parity ids start here.
    pub num_data: u32,
    fec_enabled: bool,
    k: u8,
    r: u8,
    /// Chunk ids received off the wire.
    pub received: HashSet<u32>,
    /// Chunk ids recovered or recomputed locally.
    pub reconstructed: HashSet<u32>,
    data_payloads: HashMap<u32, Vec<u8>>,
    /// Parity payloads keyed by chunk id.
    parity_payloads: HashMap<u32, Vec<u8>>,
    /// Lowest chunk id not yet received or reconstructed.
    pub recv_watermark: u32,
    newly_since_sack: u32,
    last_sack_ms: u64,
    pub delivered: bool,
    /// All data chunks present on a relay, awaiting custody handoff.
    pub complete_held: bool,
    expires_at_ms: u64,
    write_buffer: Vec<ChunkRecord>,
    output_path: PathBuf,
}

impl ReceiveState {
    fn holds(&self, chunk_id: u32) -> bool {
        self.received.contains(&chunk_id) || self.reconstructed.contains(&chunk_id)
    }

    fn advance_watermark(&mut self) {
        while self.recv_watermark < self.total_chunks && self.holds(self.recv_watermark) {
            self.recv_watermark += 1;
        }
    }

    fn all_data_present(&self) -> bool {
        (0..self.num_data).all(|id| self.data_payloads.contains_key(&id))
    }
}

/// Receive path: validates and stores chunks, reconstructs FEC blocks,
/// acknowledges selectively, and assembles delivered files.
pub struct ReceiveEngine {
    transfer: TransferConfig,
    store: Store,
    node_id: String,
    inbox_dir: PathBuf,
    /// Relay mode: hold completed bundles for custody instead of
    /// claiming delivery.
    relay: bool,
    cap_bytes: Option<u64>,
    active: HashMap<BundleId, ReceiveState>,
    outbound: Vec<Outbound>,
    /// Duplicate DATA dropped (idempotently acknowledged).
    pub duplicate_drops: u64,
    /// DATA with out-of-range ids dropped.
    pub malformed_drops: u64,
}

impl ReceiveEngine {
    pub fn new(
        transfer: TransferConfig,
        storage: &StorageConfig,
        store: Store,
        node_id: String,
        relay: bool,
    ) -> Self {
        Self {
            transfer,
            store,
            node_id,
            inbox_dir: PathBuf::from(&storage.inbox_dir),
            relay,
            cap_bytes: storage.cap_bytes,
            active: HashMap::new(),
            outbound: Vec::new(),
            duplicate_drops: 0,
            malformed_drops: 0,
        }
    }

    /// Drain messages queued for transmission.
    pub fn take_outbound(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbound)
    }

    /// Active receive state for a bundle.
    pub fn state(&self, bundle_id: &BundleId) -> Option<&ReceiveState> {
        self.active.get(bundle_id)
    }

    // =======================================================================
    // DATA handling
    // =======================================================================

    /// Handle a validated DATA message (checksum already verified at
    /// decode). Stores the chunk, reconstructs what FEC allows, emits
    /// SACKs per cadence, and assembles on completion.
    pub fn on_data(&mut self, msg: &Data, src: SocketAddr, now_ms: u64) {
        if msg.chunk_id >= msg.total_chunks || msg.total_chunks == 0 {
            self.malformed_drops += 1;
            debug!(
                bundle = %msg.bundle_id,
                chunk = msg.chunk_id,
                total = msg.total_chunks,
                "Out-of-range chunk id dropped"
            );
            return;
        }

        if !self.active.contains_key(&msg.bundle_id) {
            match self.create_state(msg, src, now_ms) {
                Ok(state) => {
                    self.active.insert(msg.bundle_id, state);
                }
                Err(e) => {
                    warn!(bundle = %msg.bundle_id, error = %e, "Receive state creation failed");
                    return;
                }
            }
        }
        let Some(state) = self.active.get_mut(&msg.bundle_id) else {
            return;
        };
        state.src_addr = src;

        if state.delivered {
            // Lost-DELIVERED recovery: the sender is still retransmitting
            self.duplicate_drops += 1;
            self.outbound.push(Outbound::new(
                src,
                Message::Delivered(Delivered {
                    bundle_id: msg.bundle_id,
                }),
            ));
            return;
        }

        if state.holds(msg.chunk_id) {
            // Duplicates are acknowledged but never re-stored
            self.duplicate_drops += 1;
            let bundle_id = msg.bundle_id;
            self.emit_sack(&bundle_id, now_ms);
            return;
        }

        let watermark_before = state.recv_watermark;
        state.received.insert(msg.chunk_id);
        state.newly_since_sack += 1;

        let is_parity = state.fec_enabled && msg.chunk_id >= state.num_data;
        if is_parity {
            state
                .parity_payloads
                .insert(msg.chunk_id, msg.payload.clone());
        } else {
            state.data_payloads.insert(msg.chunk_id, msg.payload.clone());
        }

        state.write_buffer.push(ChunkRecord {
            bundle_id: msg.bundle_id,
            chunk_id: msg.chunk_id,
            is_parity,
            block_id: msg.block_id,
            k: msg.k,
            r: msg.r,
            checksum: msg.checksum,
            payload: msg.payload.clone(),
        });

        if state.fec_enabled {
            let block_id = if is_parity {
                fec::parity_position(msg.chunk_id, state.num_data, state.r)
                    .map(|(block, _)| block)
                    .unwrap_or(msg.block_id)
            } else {
                fec::block_of(msg.chunk_id, state.k)
            };
            Self::reconstruct_block(state, block_id);
        }

        state.advance_watermark();
        // A direct arrival or a reconstruction at the lowest gap both
        // advance the watermark; either way the gap was filled.
        let fills_gap = state.recv_watermark > watermark_before;
        let sack_due = fills_gap || state.newly_since_sack >= SACK_EVERY_NEW;

        let complete = (state.received.len() + state.reconstructed.len()) as u32
            >= state.total_chunks;
        if state.write_buffer.len() >= WRITE_BUFFER_FLUSH || complete {
            self.flush_write_buffer(&msg.bundle_id);
        }

        let bundle_id = msg.bundle_id;
        if sack_due {
            self.emit_sack(&bundle_id, now_ms);
        }

        self.maybe_assemble(&bundle_id, now_ms);
    }

    fn create_state(
        &self,
        msg: &Data,
        src: SocketAddr,
        now_ms: u64,
    ) -> Result<ReceiveState, crate::store::StoreError> {
        let mut fec_enabled = msg.k > 0 && msg.r > 0;
        let mut k = msg.k;
        let mut r = msg.r;

        let num_data = if fec_enabled {
            match fec::infer_num_data(msg.total_chunks, k, r) {
                Some(n) => n,
                None => {
                    warn!(
                        bundle = %msg.bundle_id,
                        total = msg.total_chunks,
                        k,
                        r,
                        "No consistent FEC layout, disabling FEC for bundle"
                    );
                    fec_enabled = false;
                    k = 0;
                    r = 0;
                    msg.total_chunks
                }
            }
        } else {
            msg.total_chunks
        };

        let output_path = self
            .inbox_dir
            .join(format!("bundle_{}.bin", msg.bundle_id.to_hex()));
        let expires_at_ms = now_ms + self.transfer.ttl_sec * 1000;

        let record = BundleRecord {
            bundle_id: msg.bundle_id,
            src_node: src.to_string(),
            dst_node: self.node_id.clone(),
            dest_addr: None,
            expires_at_ms,
            length: 0,
            total_chunks: msg.total_chunks,
            num_data_chunks: num_data,
            fec_enabled,
            k,
            r,
            state: BundleState::InFlight,
            bytes_sent: 0,
            chunks_retransmitted: 0,
            created_at_ms: now_ms,
            file_path: Some(output_path.display().to_string()),
        };
        self.store.save_bundle(&record)?;

        info!(
            bundle = %msg.bundle_id,
            total = msg.total_chunks,
            num_data,
            fec = fec_enabled,
            "Receive started"
        );

        Ok(ReceiveState {
            bundle_id: msg.bundle_id,
            src_addr: src,
            total_chunks: msg.total_chunks,
            num_data,
            fec_enabled,
            k,
            r,
            received: HashSet::new(),
            reconstructed: HashSet::new(),
            data_payloads: HashMap::new(),
            parity_payloads: HashMap::new(),
            recv_watermark: 0,
            newly_since_sack: 0,
            last_sack_ms: now_ms,
            delivered: false,
            complete_held: false,
            expires_at_ms,
            write_buffer: Vec::new(),
            output_path,
        })
    }

    // =======================================================================
    // FEC reconstruction
    // =======================================================================

    /// Recover whatever the block's parities allow, then backfill parity
    /// chunks once the block's data is complete (they become derivable
    /// and count as reconstructed in the next SACK).
    fn reconstruct_block(state: &mut ReceiveState, block_id: u32) {
        let (start, end) = fec::block_data_range(block_id, state.k, state.num_data);
        if start >= end {
            return;
        }
        let block_size = (end - start) as usize;

        loop {
            let missing: Vec<u32> = (start..end)
                .filter(|id| !state.data_payloads.contains_key(id))
                .collect();
            if missing.is_empty() {
                break;
            }

            let mut progressed = false;
            for ordinal in 0..state.r {
                let parity_id =
                    fec::parity_chunk_id(state.num_data, block_id, state.r, ordinal);
                let Some(parity_payload) = state.parity_payloads.get(&parity_id) else {
                    continue;
                };
                let mask = fec::parity_mask(ordinal, block_size, state.r);

                let missing_in_mask: Vec<usize> = mask
                    .iter()
                    .copied()
                    .filter(|idx| !state.data_payloads.contains_key(&(start + *idx as u32)))
                    .collect();
                if missing_in_mask.len() != 1 {
                    continue;
                }
                let missing_idx = missing_in_mask[0];

                let data_payloads = &state.data_payloads;
                let recovered = fec::recover_member(
                    parity_payload,
                    |idx| data_payloads.get(&(start + idx as u32)).cloned(),
                    &mask,
                    missing_idx,
                );
                if let Some(payload) = recovered {
                    let chunk_id = start + missing_idx as u32;
                    info!(
                        bundle = %state.bundle_id,
                        chunk = chunk_id,
                        block = block_id,
                        "Reconstructed data chunk"
                    );
                    state.write_buffer.push(ChunkRecord {
                        bundle_id: state.bundle_id,
                        chunk_id,
                        is_parity: false,
                        block_id,
                        k: state.k,
                        r: state.r,
                        checksum: crc32fast::hash(&payload),
                        payload: payload.clone(),
                    });
                    state.data_payloads.insert(chunk_id, payload);
                    state.reconstructed.insert(chunk_id);
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }

        // Block data complete: every parity is now derivable
        let data_complete = (start..end).all(|id| state.data_payloads.contains_key(&id));
        if data_complete {
            let members: Vec<&[u8]> = (start..end)
                .map(|id| state.data_payloads[&id].as_slice())
                .collect();
            let parities = fec::generate_block_parity(&members, state.r);
            for (ordinal, payload) in parities.into_iter().enumerate() {
                let parity_id =
                    fec::parity_chunk_id(state.num_data, block_id, state.r, ordinal as u8);
                if state.holds(parity_id) {
                    continue;
                }
                state.write_buffer.push(ChunkRecord {
                    bundle_id: state.bundle_id,
                    chunk_id: parity_id,
                    is_parity: true,
                    block_id,
                    k: state.k,
                    r: state.r,
                    checksum: crc32fast::hash(&payload),
                    payload: payload.clone(),
                });
                state.parity_payloads.insert(parity_id, payload);
                state.reconstructed.insert(parity_id);
            }
        }
    }

    // =======================================================================
    // SACK
    // =======================================================================

    fn emit_sack(&mut self, bundle_id: &BundleId, now_ms: u64) {
        let Some(state) = self.active.get_mut(bundle_id) else {
            return;
        };
        state.advance_watermark();

        let above: Vec<u32> = state
            .received
            .iter()
            .chain(state.reconstructed.iter())
            .copied()
            .filter(|id| *id > state.recv_watermark)
            .collect();
        let sack = Sack::from_ids(*bundle_id, state.recv_watermark, above);

        state.newly_since_sack = 0;
        state.last_sack_ms = now_ms;
        self.outbound
            .push(Outbound::new(state.src_addr, Message::Sack(sack)));
    }

    // =======================================================================
    // Assembly
    // =======================================================================

    fn maybe_assemble(&mut self, bundle_id: &BundleId, now_ms: u64) {
        let Some(state) = self.active.get_mut(bundle_id) else {
            return;
        };
        if state.delivered || state.complete_held || !state.all_data_present() {
            return;
        }

        if self.relay {
            // A relay holds the chunks and waits for the custody offer
            state.complete_held = true;
            self.flush_write_buffer(bundle_id);
            info!(bundle = %bundle_id, "Bundle complete, held for custody handoff");
            return;
        }

        let length: u64 = (0..state.num_data)
            .map(|id| state.data_payloads[&id].len() as u64)
            .sum();

        if let Err(e) = Self::write_output(state, length) {
            warn!(bundle = %bundle_id, error = %e, "Assembly write failed");
            return;
        }

        state.delivered = true;
        state.data_payloads.clear();
        state.parity_payloads.clear();

        let src_addr = state.src_addr;
        let output_path = state.output_path.clone();
        self.flush_write_buffer(bundle_id);

        match self.store.load_bundle(bundle_id) {
            Ok(Some(mut record)) => {
                record.state = BundleState::Delivered;
                record.length = length;
                if let Err(e) = self.store.save_bundle(&record) {
                    warn!(bundle = %bundle_id, error = %e, "State persist failed");
                }
            }
            Ok(None) => warn!(bundle = %bundle_id, "Bundle row missing at assembly"),
            Err(e) => warn!(bundle = %bundle_id, error = %e, "Bundle load failed"),
        }

        self.outbound.push(Outbound::new(
            src_addr,
            Message::Delivered(Delivered {
                bundle_id: *bundle_id,
            }),
        ));

        info!(
            bundle = %bundle_id,
            bytes = length,
            path = %output_path.display(),
            at_ms = now_ms,
            "Bundle delivered"
        );
    }

    fn write_output(state: &ReceiveState, length: u64) -> std::io::Result<()> {
        if let Some(parent) = state.output_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::File::create(&state.output_path)?;
        for id in 0..state.num_data {
            file.write_all(&state.data_payloads[&id])?;
        }
        file.set_len(length)?;
        file.sync_all()
    }

    fn flush_write_buffer(&mut self, bundle_id: &BundleId) {
        let Some(state) = self.active.get_mut(bundle_id) else {
            return;
        };
        if state.write_buffer.is_empty() {
            return;
        }
        let records = std::mem::take(&mut state.write_buffer);
        if let Err(e) = self.store.save_chunks(&records, self.cap_bytes) {
            warn!(bundle = %bundle_id, error = %e, "Chunk persist failed");
        }
    }

    // =======================================================================
    // Tick
    // =======================================================================

    /// Periodic work: SACK cadence while chunks are outstanding and
    /// expiry of stale partial receives.
    pub fn tick(&mut self, now_ms: u64) {
        let bundle_ids: Vec<BundleId> = self.active.keys().copied().collect();

        for bundle_id in bundle_ids {
            let Some(state) = self.active.get_mut(&bundle_id) else {
                continue;
            };

            if !state.delivered && now_ms >= state.expires_at_ms {
                // Discard partial state a grace window after TTL
                if !state.complete_held {
                    if let Err(e) = self
                        .store
                        .update_bundle_state(&bundle_id, BundleState::Expired)
                    {
                        debug!(bundle = %bundle_id, error = %e, "State persist failed");
                    }
                    warn!(bundle = %bundle_id, "Partial receive expired");
                }
                self.active.remove(&bundle_id);
                continue;
            }

            let outstanding = !state.delivered
                && (state.received.len() + state.reconstructed.len()) < state.total_chunks as usize
                && !state.received.is_empty();
            if outstanding && now_ms.saturating_sub(state.last_sack_ms) >= SACK_TICK_MS {
                self.emit_sack(&bundle_id, now_ms);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
