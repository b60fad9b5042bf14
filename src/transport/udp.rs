//! UDP datagram endpoint.
//!
//! Binds one socket and owns both directions: a spawned receive task
//! pushes inbound datagrams onto the bounded channel, and `send` writes
//! outbound datagrams after an MTU check. Datagram sends are atomic;
//! there are no partial writes.

use super::{DatagramTx, ReceivedDatagram, TransportError};
use crate::protocol::MAX_DATAGRAM;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A bound UDP endpoint.
pub struct UdpEndpoint {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    recv_task: Option<JoinHandle<()>>,
    /// Datagrams dropped because the inbound channel was full.
    inbound_dropped: Arc<AtomicU64>,
}

impl UdpEndpoint {
    /// Bind the endpoint and spawn the receive loop.
    pub async fn bind(bind_addr: SocketAddr, datagram_tx: DatagramTx) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| TransportError::BindFailed {
                addr: bind_addr,
                source: e,
            })?;
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);

        let inbound_dropped = Arc::new(AtomicU64::new(0));
        let recv_task = tokio::spawn(udp_receive_loop(
            socket.clone(),
            datagram_tx,
            inbound_dropped.clone(),
        ));

        info!(local_addr = %local_addr, "UDP endpoint bound");

        Ok(Self {
            socket,
            local_addr,
            recv_task: Some(recv_task),
            inbound_dropped,
        })
    }

    /// The bound local address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Datagrams dropped on inbound channel overflow.
    pub fn inbound_dropped(&self) -> u64 {
        self.inbound_dropped.load(Ordering::Relaxed)
    }

    /// Send one datagram.
    ///
    /// Enforces the MTU, never partial-writes (datagram atomicity), and
    /// retries once on a transient failure before surfacing the error.
    pub async fn send(&self, addr: SocketAddr, data: &[u8]) -> Result<usize, TransportError> {
        if data.len() > MAX_DATAGRAM {
            return Err(TransportError::MtuExceeded {
                datagram_size: data.len(),
                mtu: MAX_DATAGRAM,
            });
        }

        match self.socket.send_to(data, addr).await {
            Ok(bytes) => Ok(bytes),
            Err(first) if is_transient(&first) => {
                debug!(addr = %addr, error = %first, "Transient send failure, retrying once");
                self.socket
                    .send_to(data, addr)
                    .await
                    .map_err(|e| TransportError::SendFailed { addr, source: e })
            }
            Err(e) => Err(TransportError::SendFailed { addr, source: e }),
        }
    }

    /// Stop the receive loop and release the socket.
    pub fn shutdown(&mut self) {
        if let Some(task) = self.recv_task.take() {
            task.abort();
        }
        debug!(local_addr = %self.local_addr, "UDP endpoint shut down");
    }
}

impl Drop for UdpEndpoint {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
    )
}

/// Receive loop: moves datagrams from the socket to the bounded channel.
///
/// Never touches engine state. On channel overflow the datagram is
/// dropped and counted; the protocol already tolerates datagram loss.
async fn udp_receive_loop(
    socket: Arc<UdpSocket>,
    datagram_tx: DatagramTx,
    inbound_dropped: Arc<AtomicU64>,
) {
    // Headroom beyond the MTU so oversized datagrams are observed whole
    // and rejected by decode rather than silently truncated.
    let mut buf = vec![0u8; MAX_DATAGRAM + 100];

    debug!("UDP receive loop starting");

    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, remote_addr)) => {
                let datagram = ReceivedDatagram::new(remote_addr, buf[..len].to_vec());
                match datagram_tx.try_send(datagram) {
                    Ok(()) => {}
                    Err(tokio::sync::mpsc::error::TrySendError::Full(_)) => {
                        inbound_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => {
                        info!("Datagram channel closed, stopping receive loop");
                        break;
                    }
                }
            }
            Err(e) => {
                // Transient receive errors are expected on a lossy path
                warn!(error = %e, "UDP receive error");
            }
        }
    }

    debug!("UDP receive loop stopped");
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::datagram_channel;
    use tokio::time::{timeout, Duration};

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_bind_ephemeral() {
        let (tx, _rx) = datagram_channel(16);
        let endpoint = UdpEndpoint::bind(loopback(), tx).await.unwrap();
        assert_ne!(endpoint.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn test_send_recv() {
        let (tx1, _rx1) = datagram_channel(16);
        let (tx2, mut rx2) = datagram_channel(16);

        let a = UdpEndpoint::bind(loopback(), tx1).await.unwrap();
        let b = UdpEndpoint::bind(loopback(), tx2).await.unwrap();

        let sent = a.send(b.local_addr(), b"hello courier").await.unwrap();
        assert_eq!(sent, 13);

        let datagram = timeout(Duration::from_secs(1), rx2.recv())
            .await
            .expect("timeout")
            .expect("channel closed");
        assert_eq!(datagram.data, b"hello courier");
        assert_eq!(datagram.remote_addr, a.local_addr());
    }

    #[tokio::test]
    async fn test_bidirectional() {
        let (tx1, mut rx1) = datagram_channel(16);
        let (tx2, mut rx2) = datagram_channel(16);

        let a = UdpEndpoint::bind(loopback(), tx1).await.unwrap();
        let b = UdpEndpoint::bind(loopback(), tx2).await.unwrap();

        a.send(b.local_addr(), b"ping").await.unwrap();
        let got = timeout(Duration::from_secs(1), rx2.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.data, b"ping");

        b.send(a.local_addr(), b"pong").await.unwrap();
        let got = timeout(Duration::from_secs(1), rx1.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.data, b"pong");
    }

    #[tokio::test]
    async fn test_mtu_enforced() {
        let (tx, _rx) = datagram_channel(16);
        let endpoint = UdpEndpoint::bind(loopback(), tx).await.unwrap();

        let oversized = vec![0u8; MAX_DATAGRAM + 1];
        let result = endpoint
            .send("127.0.0.1:9999".parse().unwrap(), &oversized)
            .await;
        assert!(matches!(result, Err(TransportError::MtuExceeded { .. })));
    }

    #[tokio::test]
    async fn test_max_datagram_allowed() {
        let (tx1, _rx1) = datagram_channel(16);
        let (tx2, mut rx2) = datagram_channel(16);

        let a = UdpEndpoint::bind(loopback(), tx1).await.unwrap();
        let b = UdpEndpoint::bind(loopback(), tx2).await.unwrap();

        let exact = vec![0xAB; MAX_DATAGRAM];
        a.send(b.local_addr(), &exact).await.unwrap();

        let got = timeout(Duration::from_secs(1), rx2.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.data.len(), MAX_DATAGRAM);
    }

    #[tokio::test]
    async fn test_overflow_drops_and_counts() {
        let (tx1, _rx1) = datagram_channel(16);
        // Capacity 1 and an unread receiver: the second datagram must drop
        let (tx2, _rx2) = datagram_channel(1);

        let a = UdpEndpoint::bind(loopback(), tx1).await.unwrap();
        let b = UdpEndpoint::bind(loopback(), tx2).await.unwrap();

        for i in 0..20u8 {
            a.send(b.local_addr(), &[i]).await.unwrap();
        }

        // Give the receive loop time to drain the socket
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(b.inbound_dropped() > 0);
    }

    #[tokio::test]
    async fn test_bind_port_in_use() {
        let (tx1, _rx1) = datagram_channel(16);
        let a = UdpEndpoint::bind(loopback(), tx1).await.unwrap();

        let (tx2, _rx2) = datagram_channel(16);
        let result = UdpEndpoint::bind(a.local_addr(), tx2).await;
        assert!(matches!(result, Err(TransportError::BindFailed { .. })));
    }
}
