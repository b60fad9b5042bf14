//! Courier node orchestrator.
//!
//! Owns the persistent store, the three transfer engines, and the UDP
//! endpoint. A single loop serializes everything: inbound datagrams are
//! decoded and dispatched by kind, and a 10 ms tick advances engine
//! timers and flushes their outbound queues. The socket receive task is
//! the only other thread of control and never touches engine state.

#[cfg(test)]
mod tests;

use crate::bundle::{BundleId, BundleState};
use crate::config::{Config, ConfigError};
use crate::engine::custody::CustodyManager;
use crate::engine::recv::ReceiveEngine;
use crate::engine::send::{SendEngine, SendError};
use crate::engine::Outbound;
use crate::protocol::{Message, ProtocolError};
use crate::store::{Store, StoreError};
use crate::transport::udp::UdpEndpoint;
use crate::transport::{datagram_channel, DatagramRx, ReceivedDatagram, TransportError};
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Loop tick period.
const TICK_MS: u64 = 10;

/// Counter persistence cadence.
const STATS_FLUSH_MS: u64 = 1000;

/// Expired-record purge cadence.
const PURGE_MS: u64 = 60_000;

/// Inbound datagram channel capacity.
const DATAGRAM_CHANNEL: usize = 1024;

/// Current Unix time in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Errors related to node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node not started")]
    NotStarted,

    #[error("node already started")]
    AlreadyStarted,

    #[error("invalid address '{addr}': {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("send error: {0}")]
    Send(#[from] SendError),
}

/// Node operational state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    /// Created but not started.
    Created,
    /// Binding the endpoint and rebuilding engine state.
    Starting,
    /// Fully operational.
    Running,
    /// Shutting down.
    Stopping,
    /// Stopped.
    Stopped,
}

impl NodeState {
    /// Check if the node is operational.
    pub fn is_operational(&self) -> bool {
        matches!(self, NodeState::Running)
    }

    /// Check if the node can be started.
    pub fn can_start(&self) -> bool {
        matches!(self, NodeState::Created | NodeState::Stopped)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Created => "created",
            NodeState::Starting => "starting",
            NodeState::Running => "running",
            NodeState::Stopping => "stopping",
            NodeState::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// Terminal observation of a watched transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferOutcome {
    /// The destination assembled the file.
    Delivered,
    /// TTL elapsed first.
    Expired,
    /// A downstream relay took over; delivery will be confirmed later.
    CustodyTransferred,
}

/// A running Courier node.
pub struct Node {
    config: Config,
    node_id: String,
    state: NodeState,
    store: Store,
    endpoint: Option<UdpEndpoint>,
    datagram_rx: Option<DatagramRx>,
    send_engine: SendEngine,
    recv_engine: ReceiveEngine,
    custody: CustodyManager,
    // Drop counters for datagrams that never reach an engine.
    malformed_drops: u64,
    checksum_drops: u64,
    version_drops: u64,
    last_stats_flush_ms: u64,
    last_purge_ms: u64,
}

impl Node {
    /// Create a node from configuration: opens the store and builds the
    /// engines. The endpoint is bound by [`Node::start`].
    pub fn new(config: Config) -> Result<Self, NodeError> {
        config.validate()?;
        let node_id = config.node_id();
        let store = Store::open(&config.db_path())?;

        let next_hop = match &config.custody.next_hop {
            Some(addr) => Some(addr.parse::<SocketAddr>().map_err(|e| {
                NodeError::InvalidAddress {
                    addr: addr.clone(),
                    reason: e.to_string(),
                }
            })?),
            None => None,
        };

        let send_engine = SendEngine::new(
            config.transfer.clone(),
            config.fec.clone(),
            config.custody.clone(),
            store.clone(),
            node_id.clone(),
        );
        let recv_engine = ReceiveEngine::new(
            config.transfer.clone(),
            &config.storage,
            store.clone(),
            node_id.clone(),
            next_hop.is_some(),
        );
        let custody = CustodyManager::new(
            config.custody.clone(),
            store.clone(),
            node_id.clone(),
            next_hop,
            config.storage.cap_bytes,
        );

        Ok(Self {
            config,
            node_id,
            state: NodeState::Created,
            store,
            endpoint: None,
            datagram_rx: None,
            send_engine,
            recv_engine,
            custody,
            malformed_drops: 0,
            checksum_drops: 0,
            version_drops: 0,
            last_stats_flush_ms: 0,
            last_purge_ms: 0,
        })
    }

    /// The node identifier.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// The node state.
    pub fn state(&self) -> NodeState {
        self.state
    }

    /// The persistent store.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Bound endpoint address (only valid after start).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.as_ref().map(|e| e.local_addr())
    }

    /// Start the node: bind the endpoint and rebuild engine state from
    /// the store.
    pub async fn start(&mut self) -> Result<(), NodeError> {
        if !self.state.can_start() {
            return Err(NodeError::AlreadyStarted);
        }
        self.state = NodeState::Starting;

        let bind_addr: SocketAddr = ([0, 0, 0, 0], self.config.node.port).into();
        let (datagram_tx, datagram_rx) = datagram_channel(DATAGRAM_CHANNEL);
        let endpoint = UdpEndpoint::bind(bind_addr, datagram_tx).await?;
        let local_addr = endpoint.local_addr();
        self.endpoint = Some(endpoint);
        self.datagram_rx = Some(datagram_rx);

        let now = now_ms();
        let resumed = self.send_engine.resume_transfers(now)?;
        let restored = self.custody.load_records()?;
        self.process_forwards(now);
        self.flush_outbound(now).await;

        self.state = NodeState::Running;
        info!(
            node_id = %self.node_id,
            local_addr = %local_addr,
            resumed_transfers = resumed,
            restored_custody = restored,
            "Node started"
        );
        Ok(())
    }

    /// Stop the node: flush pending persists and close the endpoint.
    pub fn stop(&mut self) {
        if self.state != NodeState::Running {
            return;
        }
        self.state = NodeState::Stopping;

        self.send_engine.flush_stats();
        if let Some(mut endpoint) = self.endpoint.take() {
            endpoint.shutdown();
        }
        self.datagram_rx = None;

        self.state = NodeState::Stopped;
        info!(node_id = %self.node_id, "Node stopped");
    }

    /// Submit a file for transfer to a destination endpoint.
    pub fn submit(&mut self, path: &Path, dest: SocketAddr) -> Result<BundleId, NodeError> {
        self.submit_with_fec(path, dest, false)
    }

    /// Submit a file with FEC explicitly requested.
    pub fn submit_with_fec(
        &mut self,
        path: &Path,
        dest: SocketAddr,
        fec: bool,
    ) -> Result<BundleId, NodeError> {
        let bundle_id = self.send_engine.submit(
            path,
            dest,
            fec,
            self.config.storage.cap_bytes,
            now_ms(),
        )?;
        Ok(bundle_id)
    }

    // =======================================================================
    // Event loop
    // =======================================================================

    /// Run until the datagram channel closes. Used by `recv` mode;
    /// shutdown happens by signal in the binary.
    pub async fn run(&mut self) -> Result<(), NodeError> {
        self.run_internal(None, false).await.map(|_| ())
    }

    /// Run until the watched bundle settles.
    ///
    /// With `wait_for_delivery`, only DELIVERED or TTL expiry terminate
    /// the loop; otherwise a custody handoff also counts as settled.
    pub async fn run_until_settled(
        &mut self,
        bundle_id: BundleId,
        wait_for_delivery: bool,
    ) -> Result<TransferOutcome, NodeError> {
        match self.run_internal(Some(bundle_id), wait_for_delivery).await? {
            Some(outcome) => Ok(outcome),
            // Channel closed without an outcome: report what the store has
            None => match self.store.load_bundle(&bundle_id)? {
                Some(record) if record.state == BundleState::Delivered => {
                    Ok(TransferOutcome::Delivered)
                }
                _ => Ok(TransferOutcome::Expired),
            },
        }
    }

    async fn run_internal(
        &mut self,
        watch: Option<BundleId>,
        wait_for_delivery: bool,
    ) -> Result<Option<TransferOutcome>, NodeError> {
        if !self.state.is_operational() {
            return Err(NodeError::NotStarted);
        }
        let mut datagram_rx = self.datagram_rx.take().ok_or(NodeError::NotStarted)?;
        let mut tick = tokio::time::interval(Duration::from_millis(TICK_MS));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        debug!("Event loop started");

        loop {
            tokio::select! {
                datagram = datagram_rx.recv() => {
                    match datagram {
                        Some(d) => {
                            let now = now_ms();
                            self.handle_datagram(d, now);
                            // Drain whatever else is queued before
                            // touching the socket again
                            while let Ok(d) = datagram_rx.try_recv() {
                                self.handle_datagram(d, now);
                            }
                            self.flush_outbound(now).await;
                        }
                        None => {
                            debug!("Datagram channel closed");
                            return Ok(None);
                        }
                    }
                }
                _ = tick.tick() => {
                    let now = now_ms();
                    self.tick_engines(now);
                    self.flush_outbound(now).await;
                    self.periodic_maintenance(now);
                }
            }

            if let Some(bundle_id) = watch {
                if let Some(outcome) = self.settled_outcome(&bundle_id, wait_for_delivery) {
                    self.datagram_rx = Some(datagram_rx);
                    return Ok(Some(outcome));
                }
            }
        }
    }

    fn settled_outcome(
        &self,
        bundle_id: &BundleId,
        wait_for_delivery: bool,
    ) -> Option<TransferOutcome> {
        match self.send_engine.state(bundle_id) {
            Some(state) => {
                if state.completed {
                    return Some(TransferOutcome::Delivered);
                }
                if state.expired {
                    return Some(TransferOutcome::Expired);
                }
                if !wait_for_delivery && state.custody_transferred {
                    return Some(TransferOutcome::CustodyTransferred);
                }
                None
            }
            // Engine state already cleaned up: the store has the verdict
            None => match self.store.load_bundle(bundle_id) {
                Ok(Some(record)) if record.state == BundleState::Delivered => {
                    Some(TransferOutcome::Delivered)
                }
                Ok(Some(record)) if record.state == BundleState::Expired => {
                    Some(TransferOutcome::Expired)
                }
                _ => None,
            },
        }
    }

    // =======================================================================
    // Dispatch
    // =======================================================================

    /// Decode and dispatch one datagram by message kind.
    fn handle_datagram(&mut self, datagram: ReceivedDatagram, now: u64) {
        let src = datagram.remote_addr;
        let message = match Message::decode(&datagram.data) {
            Ok(message) => message,
            Err(e) => {
                match e {
                    ProtocolError::BadChecksum { .. } => self.checksum_drops += 1,
                    ProtocolError::UnsupportedVersion(_) => self.version_drops += 1,
                    _ => self.malformed_drops += 1,
                }
                debug!(src = %src, error = %e, "Datagram dropped");
                return;
            }
        };

        match message {
            Message::Data(data) => {
                self.recv_engine.on_data(&data, src, now);
            }
            Message::Sack(sack) => {
                self.send_engine.on_sack(&sack, now);
            }
            Message::CustodyReq(req) => {
                self.custody.on_custody_req(&req, src, now);
                self.process_forwards(now);
            }
            Message::CustodyAck(ack) => {
                // As the origin: our offer was accepted. As a mid-chain
                // holder: our own downstream accepted.
                self.send_engine.on_custody_ack(&ack.bundle_id, &ack.ranges);
                self.custody.on_custody_ack(&ack, src);
            }
            Message::Delivered(delivered) => {
                self.send_engine.on_delivered(&delivered.bundle_id);
                self.custody.on_delivered(&delivered.bundle_id);
            }
        }
    }

    fn tick_engines(&mut self, now: u64) {
        self.send_engine.tick(now);
        self.recv_engine.tick(now);
        self.custody.tick(now);
        self.process_forwards(now);
    }

    /// Start (or resume) forwarding for bundles the custody manager
    /// accepted.
    fn process_forwards(&mut self, now: u64) {
        for request in self.custody.take_forward_requests() {
            if let Err(e) =
                self.send_engine
                    .activate_stored(request.bundle_id, request.next_hop, now)
            {
                warn!(
                    bundle = %request.bundle_id,
                    next_hop = %request.next_hop,
                    error = %e,
                    "Forward activation failed"
                );
            }
        }
    }

    /// Encode and transmit everything the engines queued.
    async fn flush_outbound(&mut self, _now: u64) {
        let Some(endpoint) = &self.endpoint else {
            return;
        };

        let mut queued: Vec<Outbound> = self.send_engine.take_outbound();
        queued.extend(self.recv_engine.take_outbound());
        queued.extend(self.custody.take_outbound());

        for outbound in queued {
            let bytes = match outbound.message.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(error = %e, "Outbound message encode failed");
                    continue;
                }
            };
            // The endpoint already retried once; a stubborn failure is
            // logged and left to the retransmission machinery.
            if let Err(e) = endpoint.send(outbound.dest, &bytes).await {
                warn!(dest = %outbound.dest, error = %e, "Datagram send failed");
            }
        }
    }

    fn periodic_maintenance(&mut self, now: u64) {
        if now.saturating_sub(self.last_stats_flush_ms) >= STATS_FLUSH_MS {
            self.last_stats_flush_ms = now;
            self.send_engine.flush_stats();
        }
        if now.saturating_sub(self.last_purge_ms) >= PURGE_MS {
            self.last_purge_ms = now;
            self.send_engine.cleanup_settled();
            let retain_ms = self.config.storage.retain_sec * 1000;
            match self.store.purge_expired(now, retain_ms) {
                Ok(purged) if !purged.is_empty() => {
                    info!(count = purged.len(), "Purged expired bundles");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Purge failed"),
            }
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("node_id", &self.node_id)
            .field("state", &self.state)
            .field("local_addr", &self.local_addr())
            .field("malformed_drops", &self.malformed_drops)
            .field("checksum_drops", &self.checksum_drops)
            .field("version_drops", &self.version_drops)
            .finish()
    }
}
