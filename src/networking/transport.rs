//! UDP transport shared by every circuit on one port
//!
//! One socket, one sender task draining the outbound channel, and a small
//! fixed set of receive tasks so a datagram is always being awaited while
//! another is being handled.

use crate::networking::serialization::MAX_PACKET_SIZE;
use crate::networking::NetworkResult;
use bytes::Bytes;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Concurrent receives kept outstanding on the socket
pub const DEFAULT_RECEIVERS: usize = 5;

/// Callback for every datagram that arrives on the socket
pub type DatagramHandler = Arc<dyn Fn(Bytes, SocketAddr) + Send + Sync>;

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,

    /// Channel for sending packets
    send_tx: mpsc::UnboundedSender<(Bytes, SocketAddr)>,
    send_rx: Mutex<Option<mpsc::UnboundedReceiver<(Bytes, SocketAddr)>>>,

    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpTransport")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> NetworkResult<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        info!("UDP transport bound to {}", local_addr);

        let (send_tx, send_rx) = mpsc::unbounded_channel();
        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            send_tx,
            send_rx: Mutex::new(Some(send_rx)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Sender for outgoing datagrams
    pub fn sender(&self) -> mpsc::UnboundedSender<(Bytes, SocketAddr)> {
        self.send_tx.clone()
    }

    /// Spawn the sender task and `receivers` receive tasks. A second call does nothing.
    pub fn start(&self, receivers: usize, handler: DatagramHandler) {
        let Some(send_rx) = self.send_rx.lock().take() else {
            return;
        };

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(Self::send_loop(Arc::clone(&self.socket), send_rx)));
        for index in 0..receivers.max(1) {
            tasks.push(tokio::spawn(Self::receive_loop(
                index,
                Arc::clone(&self.socket),
                Arc::clone(&handler),
            )));
        }
        info!("UDP transport started on {} with {} receivers", self.local_addr, receivers.max(1));
    }

    /// Abort every transport task
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        debug!("UDP transport on {} shut down", self.local_addr);
    }

    async fn send_loop(socket: Arc<UdpSocket>, mut send_rx: mpsc::UnboundedReceiver<(Bytes, SocketAddr)>) {
        while let Some((data, dest)) = send_rx.recv().await {
            match socket.send_to(&data, dest).await {
                Ok(sent) if sent != data.len() => {
                    warn!("Partial send: {} bytes of {} to {}", sent, data.len(), dest);
                }
                Ok(_) => {}
                Err(e) => error!("Failed to send packet to {}: {}", dest, e),
            }
        }
        debug!("Outbound channel closed");
    }

    async fn receive_loop(index: usize, socket: Arc<UdpSocket>, handler: DatagramHandler) {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, source)) => {
                    let data = Bytes::copy_from_slice(&buf[..len]);
                    handler(data, source);
                }
                Err(e) => {
                    // ICMP port-unreachable surfaces here on some platforms
                    warn!("Receiver {} failed: {}", index, e);
                }
            }
        }
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_datagrams_reach_handler_and_peer() {
        let transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        transport.start(
            DEFAULT_RECEIVERS,
            Arc::new(move |data, source| {
                let _ = seen_tx.send((data, source));
            }),
        );

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(b"hello", transport.local_addr()).await.unwrap();
        let (data, source) = tokio::time::timeout(Duration::from_secs(2), seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&data[..], b"hello");
        assert_eq!(source, peer.local_addr().unwrap());

        transport.sender().send((Bytes::from_static(b"back"), source)).unwrap();
        let mut buf = [0u8; 16];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"back");
    }
}
