//! Send engine: chunking, sliding-window selective repeat, adaptive
//! retransmission, FEC parity generation, and custody offers.
//!
//! The engine is a state machine over `(messages in, now)` — it owns no
//! sockets and no clock. `tick(now)` drives per-chunk timers; SACK and
//! DELIVERED handlers advance the window and terminate transfers.

use super::{fec, Outbound};
use crate::bundle::{BundleId, BundleState};
use crate::config::{CustodyConfig, FecConfig, ReleasePolicy, TransferConfig};
use crate::protocol::{CustodyReq, Data, Message, Sack, expand_sack, FLAG_PARITY};
use crate::store::{BundleRecord, ChunkRecord, Store, StoreError};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors surfaced by the send path.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("submission rejected: {0}")]
    SubmitRejected(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Per-bundle outbound transfer state.
#[derive(Debug)]
pub struct SendState {
    pub bundle_id: BundleId,
    pub dest: SocketAddr,
    pub total_chunks: u32,
    /// Lowest unacked chunk id; the window is [window_start, window_start + window_size).
    pub window_start: u32,
    pub window_size: u32,
    /// Next chunk id that has never been transmitted.
    next_unsent: u32,
    pub acked: HashSet<u32>,
    /// Per-chunk retransmission deadline, Unix ms.
    chunk_timers: HashMap<u32, u64>,
    /// First-transmission times for RTT sampling.
    send_times: HashMap<u32, u64>,
    retransmit_queue: VecDeque<u32>,
    /// Chunks that have been retransmitted at least once (Karn's rule).
    retransmitted: HashSet<u32>,
    pub srtt: f64,
    pub rttvar: f64,
    /// Current retransmission timeout in ms.
    pub rto: f64,
    pub bytes_sent: u64,
    pub chunks_retransmitted: u64,
    pub expires_at_ms: u64,
    /// DELIVERED observed; transfer is done.
    pub completed: bool,
    pub expired: bool,
    /// A downstream holder accepted custody of every chunk.
    pub custody_transferred: bool,
    fully_acked_at_ms: Option<u64>,
    custody_offer_at_ms: Option<u64>,
    custody_offer_attempts: u32,
}

impl SendState {
    fn new(
        bundle_id: BundleId,
        dest: SocketAddr,
        total_chunks: u32,
        window_size: u32,
        base_rto_ms: u64,
        expires_at_ms: u64,
    ) -> Self {
        Self {
            bundle_id,
            dest,
            total_chunks,
            window_start: 0,
            window_size,
            next_unsent: 0,
            acked: HashSet::new(),
            chunk_timers: HashMap::new(),
            send_times: HashMap::new(),
            retransmit_queue: VecDeque::new(),
            retransmitted: HashSet::new(),
            srtt: 0.0,
            rttvar: 0.0,
            rto: base_rto_ms as f64,
            bytes_sent: 0,
            chunks_retransmitted: 0,
            expires_at_ms,
            completed: false,
            expired: false,
            custody_transferred: false,
            fully_acked_at_ms: None,
            custody_offer_at_ms: None,
            custody_offer_attempts: 0,
        }
    }

    fn window_end(&self) -> u32 {
        self.window_start
            .saturating_add(self.window_size)
            .min(self.total_chunks)
    }

    fn fully_acked(&self) -> bool {
        self.acked.len() as u32 >= self.total_chunks
    }

    /// True once no further work will be scheduled for this bundle.
    pub fn is_settled(&self) -> bool {
        self.completed || self.expired || self.custody_transferred
    }
}

/// Send path: splits files into checksummed chunks, persists them, and
/// drives the sliding window until DELIVERED, custody handoff, or TTL.
pub struct SendEngine {
    transfer: TransferConfig,
    fec: FecConfig,
    custody: CustodyConfig,
    store: Store,
    node_id: String,
    active: HashMap<BundleId, SendState>,
    chunk_cache: HashMap<BundleId, HashMap<u32, ChunkRecord>>,
    outbound: Vec<Outbound>,
}

impl SendEngine {
    pub fn new(
        transfer: TransferConfig,
        fec: FecConfig,
        custody: CustodyConfig,
        store: Store,
        node_id: String,
    ) -> Self {
        Self {
            transfer,
            fec,
            custody,
            store,
            node_id,
            active: HashMap::new(),
            chunk_cache: HashMap::new(),
            outbound: Vec::new(),
        }
    }

    /// Drain messages queued for transmission.
    pub fn take_outbound(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbound)
    }

    /// Active transfer state for a bundle.
    pub fn state(&self, bundle_id: &BundleId) -> Option<&SendState> {
        self.active.get(bundle_id)
    }

    /// Whether any transfer still needs the tick loop.
    pub fn has_unsettled(&self) -> bool {
        self.active.values().any(|s| !s.is_settled())
    }

    // =======================================================================
    // Submission
    // =======================================================================

    /// Submit a file for transfer. Chunks are generated, checksummed,
    /// and persisted before the first datagram goes out. `cap_bytes`
    /// is the node's `storage.cap_bytes` ceiling.
    pub fn submit(
        &mut self,
        path: &Path,
        dest: SocketAddr,
        fec_enabled: bool,
        cap_bytes: Option<u64>,
        now_ms: u64,
    ) -> Result<BundleId, SendError> {
        if self.transfer.ttl_sec == 0 {
            return Err(SendError::SubmitRejected("ttl must be non-zero".into()));
        }

        let file_data = std::fs::read(path)?;
        let bundle_id = BundleId::generate();
        let use_fec = fec_enabled && self.fec.enabled;

        let chunks = self.create_chunks(bundle_id, &file_data, use_fec);
        let num_data = chunks.iter().filter(|c| !c.is_parity).count() as u32;
        let total_chunks = chunks.len() as u32;
        let expires_at_ms = now_ms + self.transfer.ttl_sec * 1000;

        let record = BundleRecord {
            bundle_id,
            src_node: self.node_id.clone(),
            dst_node: dest.to_string(),
            dest_addr: Some(dest.to_string()),
            expires_at_ms,
            length: file_data.len() as u64,
            total_chunks,
            num_data_chunks: num_data,
            fec_enabled: use_fec,
            k: if use_fec { self.fec.k } else { 0 },
            r: if use_fec { self.fec.r } else { 0 },
            state: BundleState::New,
            bytes_sent: 0,
            chunks_retransmitted: 0,
            created_at_ms: now_ms,
            file_path: Some(path.display().to_string()),
        };
        self.store.save_bundle(&record)?;

        if let Err(e) = self.store.save_chunks(&chunks, cap_bytes) {
            // Roll the bundle row back so a rejected submit leaves no trace
            let _ = self.store.delete_bundle(&bundle_id);
            return match e {
                StoreError::CapExceeded { needed, available } => {
                    Err(SendError::SubmitRejected(format!(
                        "storage cap exceeded: need {} bytes, {} available",
                        needed, available
                    )))
                }
                other => Err(SendError::Store(other)),
            };
        }

        self.chunk_cache
            .insert(bundle_id, chunks.into_iter().map(|c| (c.chunk_id, c)).collect());

        let state = SendState::new(
            bundle_id,
            dest,
            total_chunks,
            self.transfer.window_size,
            self.transfer.base_rto_ms,
            expires_at_ms,
        );
        self.active.insert(bundle_id, state);
        self.store
            .update_bundle_state(&bundle_id, BundleState::InFlight)?;
        self.fill_flight(&bundle_id, now_ms);

        info!(
            bundle = %bundle_id,
            dest = %dest,
            chunks = total_chunks,
            fec = use_fec,
            "Transfer started"
        );
        Ok(bundle_id)
    }

    /// Re-activate a stored bundle toward a new destination. Used by the
    /// custody manager when forwarding, and by restart recovery.
    ///
    /// The window restarts from zero; the receiving side deduplicates.
    pub fn activate_stored(
        &mut self,
        bundle_id: BundleId,
        dest: SocketAddr,
        now_ms: u64,
    ) -> Result<(), SendError> {
        if self.active.contains_key(&bundle_id) {
            return Ok(());
        }

        let record = self
            .store
            .load_bundle(&bundle_id)?
            .ok_or_else(|| SendError::SubmitRejected(format!("unknown bundle {}", bundle_id)))?;

        let chunks = self.store.load_chunks(&bundle_id)?;
        self.chunk_cache
            .insert(bundle_id, chunks.into_iter().map(|c| (c.chunk_id, c)).collect());

        let mut state = SendState::new(
            bundle_id,
            dest,
            record.total_chunks,
            self.transfer.window_size,
            self.transfer.base_rto_ms,
            record.expires_at_ms,
        );
        state.bytes_sent = record.bytes_sent;
        state.chunks_retransmitted = record.chunks_retransmitted;
        self.active.insert(bundle_id, state);
        self.fill_flight(&bundle_id, now_ms);

        info!(bundle = %bundle_id, dest = %dest, "Transfer activated from store");
        Ok(())
    }

    /// Rebuild send state for in-flight outbound bundles after restart.
    pub fn resume_transfers(&mut self, now_ms: u64) -> Result<usize, SendError> {
        let mut resumed = 0;
        for record in self.store.load_in_flight_bundles()? {
            if record.src_node != self.node_id {
                continue;
            }
            let Some(dest_str) = record.dest_addr.as_deref() else {
                continue;
            };
            let Ok(dest) = dest_str.parse() else {
                warn!(bundle = %record.bundle_id, addr = dest_str, "Unparseable resume address");
                continue;
            };
            self.activate_stored(record.bundle_id, dest, now_ms)?;
            resumed += 1;
        }
        Ok(resumed)
    }

    // =======================================================================
    // Chunking and FEC
    // =======================================================================

    fn create_chunks(
        &self,
        bundle_id: BundleId,
        file_data: &[u8],
        use_fec: bool,
    ) -> Vec<ChunkRecord> {
        let chunk_size = self.transfer.chunk_size;
        let (k, r) = if use_fec { (self.fec.k, self.fec.r) } else { (0, 0) };

        let mut payloads: Vec<&[u8]> = file_data.chunks(chunk_size).collect();
        if payloads.is_empty() {
            // Zero-length file: one empty chunk keeps the transfer alive
            payloads.push(&[]);
        }
        let num_data = payloads.len() as u32;

        let mut chunks: Vec<ChunkRecord> = payloads
            .iter()
            .enumerate()
            .map(|(i, payload)| ChunkRecord {
                bundle_id,
                chunk_id: i as u32,
                is_parity: false,
                block_id: if use_fec { fec::block_of(i as u32, k) } else { 0 },
                k,
                r,
                checksum: crc32fast::hash(payload),
                payload: payload.to_vec(),
            })
            .collect();

        if use_fec {
            let mut parity_chunks = Vec::new();
            for block_id in 0..fec::num_blocks(num_data, k) {
                let (start, end) = fec::block_data_range(block_id, k, num_data);
                let members: Vec<&[u8]> = (start..end)
                    .map(|id| chunks[id as usize].payload.as_slice())
                    .collect();
                let parities = fec::generate_block_parity(&members, r);

                for (ordinal, payload) in parities.into_iter().enumerate() {
                    parity_chunks.push(ChunkRecord {
                        bundle_id,
                        chunk_id: fec::parity_chunk_id(num_data, block_id, r, ordinal as u8),
                        is_parity: true,
                        block_id,
                        k,
                        r,
                        checksum: crc32fast::hash(&payload),
                        payload,
                    });
                }
            }
            chunks.extend(parity_chunks);
        }

        chunks
    }

    // =======================================================================
    // Window
    // =======================================================================

    /// Queue transmissions: pending retransmissions first, then the next
    /// unsent ids inside the window.
    fn fill_flight(&mut self, bundle_id: &BundleId, now_ms: u64) {
        let Self {
            active,
            chunk_cache,
            store,
            outbound,
            ..
        } = self;

        let Some(state) = active.get_mut(bundle_id) else {
            return;
        };
        if state.is_settled() || state.expired {
            return;
        }

        let cache = match chunk_cache.entry(*bundle_id) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                let chunks = match store.load_chunks(bundle_id) {
                    Ok(chunks) => chunks,
                    Err(err) => {
                        warn!(bundle = %bundle_id, error = %err, "Chunk load failed");
                        return;
                    }
                };
                e.insert(chunks.into_iter().map(|c| (c.chunk_id, c)).collect())
            }
        };

        // Retransmissions queued by timeout take priority
        while let Some(chunk_id) = state.retransmit_queue.pop_front() {
            if state.acked.contains(&chunk_id) {
                continue;
            }
            let Some(chunk) = cache.get(&chunk_id) else {
                continue;
            };
            state.chunk_timers.insert(chunk_id, now_ms + state.rto as u64);
            state.retransmitted.insert(chunk_id);
            outbound.push(Outbound::new(
                state.dest,
                Message::Data(data_message(chunk, state.total_chunks)),
            ));
            debug!(bundle = %bundle_id, chunk = chunk_id, "Retransmitted chunk");
        }

        // First transmissions of the next unsent ids in the window
        let window_end = state.window_end();
        while state.next_unsent < window_end {
            let chunk_id = state.next_unsent;
            state.next_unsent += 1;
            if state.acked.contains(&chunk_id) {
                continue;
            }
            let Some(chunk) = cache.get(&chunk_id) else {
                continue;
            };
            state.chunk_timers.insert(chunk_id, now_ms + state.rto as u64);
            state.send_times.insert(chunk_id, now_ms);
            state.bytes_sent += chunk.payload.len() as u64;
            outbound.push(Outbound::new(
                state.dest,
                Message::Data(data_message(chunk, state.total_chunks)),
            ));
        }
    }

    // =======================================================================
    // Message handlers
    // =======================================================================

    /// Handle a SACK: mark acked chunks, sample RTT, slide the window.
    pub fn on_sack(&mut self, sack: &Sack, now_ms: u64) {
        let Some(state) = self.active.get_mut(&sack.bundle_id) else {
            debug!(bundle = %sack.bundle_id, "SACK for unknown bundle");
            return;
        };
        if state.completed || state.expired {
            return;
        }

        let acked = expand_sack(sack);
        let mut newly = Vec::new();
        for chunk_id in acked {
            if chunk_id < state.total_chunks && state.acked.insert(chunk_id) {
                newly.push(chunk_id);
            }
        }

        for &chunk_id in &newly {
            // Karn's rule: never sample a retransmitted chunk
            if let Some(sent_at) = state.send_times.remove(&chunk_id) {
                if !state.retransmitted.contains(&chunk_id) {
                    let sample = (now_ms.saturating_sub(sent_at)) as f64;
                    update_rtt(state, sample, &self.transfer);
                }
            }
            state.chunk_timers.remove(&chunk_id);
            state.retransmitted.remove(&chunk_id);
        }

        // Advance over the acked prefix; never past an unacked chunk
        while state.window_start < state.total_chunks
            && state.acked.contains(&state.window_start)
        {
            state.window_start += 1;
        }

        if state.fully_acked() && state.fully_acked_at_ms.is_none() {
            state.fully_acked_at_ms = Some(now_ms);
            state.custody_offer_at_ms =
                Some(now_ms + self.custody.backoff_base_sec * 1000);
            debug!(bundle = %sack.bundle_id, "All chunks acked, awaiting DELIVERED");
        }

        if !newly.is_empty() {
            self.fill_flight(&sack.bundle_id, now_ms);
        }
    }

    /// Handle DELIVERED: the transfer is complete.
    pub fn on_delivered(&mut self, bundle_id: &BundleId) {
        let Some(state) = self.active.get_mut(bundle_id) else {
            return;
        };
        if state.completed {
            return;
        }
        state.completed = true;
        state.chunk_timers.clear();
        state.retransmit_queue.clear();

        if let Err(e) = self
            .store
            .update_bundle_state(bundle_id, BundleState::Delivered)
        {
            warn!(bundle = %bundle_id, error = %e, "State persist failed");
        }
        if let Err(e) = self.store.update_bundle_stats(
            bundle_id,
            state.bytes_sent,
            state.chunks_retransmitted,
        ) {
            warn!(bundle = %bundle_id, error = %e, "Stats persist failed");
        }
        self.chunk_cache.remove(bundle_id);

        info!(bundle = %bundle_id, "Transfer delivered");
    }

    /// Handle a CUSTODY_ACK covering our offer: the downstream holder now
    /// owns the forwarding obligation.
    pub fn on_custody_ack(&mut self, bundle_id: &BundleId, ranges: &[(u32, u32)]) {
        let Some(state) = self.active.get_mut(bundle_id) else {
            return;
        };
        if state.completed || state.custody_transferred {
            return;
        }

        let full = [(0u32, state.total_chunks.saturating_sub(1))];
        if !crate::bundle::ranges_cover(ranges, &full) {
            debug!(bundle = %bundle_id, "Partial custody ack ignored");
            return;
        }

        state.custody_transferred = true;
        state.custody_offer_at_ms = None;
        state.chunk_timers.clear();
        state.retransmit_queue.clear();

        if self.custody.release_policy == ReleasePolicy::Eager {
            if let Err(e) = self.store.delete_chunks(bundle_id) {
                warn!(bundle = %bundle_id, error = %e, "Chunk release failed");
            }
            self.chunk_cache.remove(bundle_id);
        }

        info!(
            bundle = %bundle_id,
            policy = ?self.custody.release_policy,
            "Custody transferred downstream"
        );
    }

    // =======================================================================
    // Tick
    // =======================================================================

    /// Advance timers: expire bundles past TTL, requeue timed-out chunks
    /// with RTO backoff, and emit due transmissions and custody offers.
    pub fn tick(&mut self, now_ms: u64) {
        let bundle_ids: Vec<BundleId> = self.active.keys().copied().collect();

        for bundle_id in bundle_ids {
            let Some(state) = self.active.get_mut(&bundle_id) else {
                continue;
            };
            if state.completed || state.expired {
                continue;
            }

            // TTL expiry suppresses all further sends
            if now_ms >= state.expires_at_ms {
                state.expired = true;
                state.chunk_timers.clear();
                state.retransmit_queue.clear();
                if let Err(e) = self
                    .store
                    .update_bundle_state(&bundle_id, BundleState::Expired)
                {
                    warn!(bundle = %bundle_id, error = %e, "State persist failed");
                }
                self.chunk_cache.remove(&bundle_id);
                warn!(bundle = %bundle_id, "Bundle expired before delivery");
                continue;
            }

            if !state.custody_transferred {
                let timed_out: Vec<u32> = state
                    .chunk_timers
                    .iter()
                    .filter(|(id, expiry)| now_ms >= **expiry && !state.acked.contains(*id))
                    .map(|(id, _)| *id)
                    .collect();

                if !timed_out.is_empty() {
                    for chunk_id in &timed_out {
                        state.chunk_timers.remove(chunk_id);
                        state.retransmit_queue.push_back(*chunk_id);
                    }
                    state.chunks_retransmitted += timed_out.len() as u64;
                    state.rto = (state.rto * 1.5).min(self.transfer.max_rto_ms as f64);
                    debug!(
                        bundle = %bundle_id,
                        count = timed_out.len(),
                        rto_ms = state.rto as u64,
                        "Chunk timers fired"
                    );
                }
            }

            self.maybe_offer_custody(&bundle_id, now_ms);
            self.fill_flight(&bundle_id, now_ms);
        }
    }

    /// Offer custody of a fully-acked bundle that the peer has not
    /// claimed delivered — the peer is a relay holding our chunks.
    fn maybe_offer_custody(&mut self, bundle_id: &BundleId, now_ms: u64) {
        let Some(state) = self.active.get_mut(bundle_id) else {
            return;
        };
        if state.custody_transferred || !state.fully_acked() {
            return;
        }
        let Some(offer_at) = state.custody_offer_at_ms else {
            return;
        };
        if now_ms < offer_at {
            return;
        }

        if state.custody_offer_attempts >= self.custody.max_retries {
            // Internal only: the transfer stays in flight and the peer
            // may still send DELIVERED on its own.
            warn!(bundle = %bundle_id, attempts = state.custody_offer_attempts,
                "Custody offer retries exhausted");
            state.custody_offer_at_ms = None;
            return;
        }

        state.custody_offer_attempts += 1;
        let backoff_sec = (1u64 << state.custody_offer_attempts.min(32))
            .saturating_mul(self.custody.backoff_base_sec)
            .min(self.custody.backoff_cap_sec);
        state.custody_offer_at_ms = Some(now_ms + backoff_sec * 1000);

        let ttl_remaining = state.expires_at_ms.saturating_sub(now_ms) / 1000;
        let ranges = vec![(0u32, state.total_chunks.saturating_sub(1))];
        self.outbound.push(Outbound::new(
            state.dest,
            Message::CustodyReq(CustodyReq {
                bundle_id: *bundle_id,
                ttl_remaining: ttl_remaining.min(u32::MAX as u64) as u32,
                ranges,
            }),
        ));
        debug!(
            bundle = %bundle_id,
            attempt = state.custody_offer_attempts,
            "Custody offered"
        );
    }

    /// Persist transfer counters for dirty bundles. Called from the node
    /// at a coarse cadence.
    pub fn flush_stats(&self) {
        for (bundle_id, state) in &self.active {
            if state.expired {
                continue;
            }
            if let Err(e) = self.store.update_bundle_stats(
                bundle_id,
                state.bytes_sent,
                state.chunks_retransmitted,
            ) {
                debug!(bundle = %bundle_id, error = %e, "Stats persist failed");
            }
        }
    }

    /// Drop settled transfers from memory.
    pub fn cleanup_settled(&mut self) {
        self.active.retain(|bundle_id, state| {
            if state.completed || state.expired {
                self.chunk_cache.remove(bundle_id);
                false
            } else {
                true
            }
        });
    }
}

fn data_message(chunk: &ChunkRecord, total_chunks: u32) -> Data {
    Data {
        bundle_id: chunk.bundle_id,
        chunk_id: chunk.chunk_id,
        total_chunks,
        block_id: chunk.block_id,
        k: chunk.k,
        r: chunk.r,
        flags: if chunk.is_parity { FLAG_PARITY } else { 0 },
        checksum: chunk.checksum,
        payload: chunk.payload.clone(),
    }
}

/// RFC 6298 smoothing with the spec's bounds.
fn update_rtt(state: &mut SendState, sample_ms: f64, transfer: &TransferConfig) {
    if state.srtt == 0.0 {
        state.srtt = sample_ms;
        state.rttvar = sample_ms / 2.0;
    } else {
        const ALPHA: f64 = 1.0 / 8.0;
        const BETA: f64 = 1.0 / 4.0;
        state.rttvar = (1.0 - BETA) * state.rttvar + BETA * (state.srtt - sample_ms).abs();
        state.srtt = (1.0 - ALPHA) * state.srtt + ALPHA * sample_ms;
    }

    let rto = state.srtt + 4.0 * state.rttvar;
    state.rto = rto
        .max(transfer.base_rto_ms as f64)
        .min(transfer.max_rto_ms as f64);
}

// ============================================================================
// Tests
// ============================================================================
