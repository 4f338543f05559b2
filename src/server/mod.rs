//! The conferencing server: two listeners, shared registries, and the
//! background relay and transfer-sweep tasks.

mod config;
mod conn;
mod registry;
mod relay;
mod transfer;

pub use config::ServerConfig;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, UdpSocket};

use crate::error::HuddleError;
use registry::{AddressRegistry, Registry};
use transfer::{TransferConfig, TransferCoordinator};

/// State shared by every task: configuration and the three registries.
pub(crate) struct Shared {
    pub cfg: ServerConfig,
    pub registry: Registry,
    pub addrs: AddressRegistry,
    pub transfers: Arc<TransferCoordinator>,
}

/// Server entry point.
pub struct Server {
    shared: Arc<Shared>,
}

impl Server {
    pub fn new(cfg: ServerConfig) -> Self {
        let transfers = Arc::new(TransferCoordinator::new(TransferConfig {
            initial_ssthresh: cfg.initial_ssthresh.max(1),
            base_chunk_bytes: cfg.base_chunk_bytes,
            ack_timeout: Duration::from_millis(cfg.ack_timeout_ms),
            max_retries: cfg.max_retries,
            session_queue_bytes: cfg.session_queue_bytes,
        }));
        Self {
            shared: Arc::new(Shared {
                registry: Registry::new(cfg.max_meetings),
                addrs: AddressRegistry::new(),
                transfers,
                cfg,
            }),
        }
    }

    /// Bind both listeners. A failure here is fatal for the process.
    pub async fn bind(self) -> Result<BoundServer, HuddleError> {
        let cfg = &self.shared.cfg;
        let tcp = TcpListener::bind((cfg.host.as_str(), cfg.tcp_port)).await?;
        let udp = UdpSocket::bind((cfg.host.as_str(), cfg.udp_port)).await?;
        tracing::info!(
            tcp = %tcp.local_addr()?,
            udp = %udp.local_addr()?,
            "server listening"
        );
        Ok(BoundServer {
            shared: self.shared,
            tcp,
            udp,
        })
    }

    /// Bind and run until a listener fails.
    pub async fn serve(self) -> Result<(), HuddleError> {
        self.bind().await?.run().await
    }
}

/// A server with live listeners; exposes the bound addresses for callers
/// that configured port 0.
pub struct BoundServer {
    shared: Arc<Shared>,
    tcp: TcpListener,
    udp: UdpSocket,
}

impl BoundServer {
    pub fn tcp_addr(&self) -> Result<SocketAddr, HuddleError> {
        Ok(self.tcp.local_addr()?)
    }

    pub fn udp_addr(&self) -> Result<SocketAddr, HuddleError> {
        Ok(self.udp.local_addr()?)
    }

    /// Accept control connections forever, with the relay and the transfer
    /// timeout sweep running alongside.
    pub async fn run(self) -> Result<(), HuddleError> {
        let relay = relay::MediaRelay::new(Arc::new(self.udp), self.shared.clone());
        tokio::spawn(relay.run());
        tokio::spawn(self.shared.transfers.clone().run_sweeper());

        loop {
            let (sock, peer) = self.tcp.accept().await?;
            tracing::debug!(%peer, "control connection accepted");
            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(err) = conn::handle_connection(shared, sock, peer).await {
                    tracing::warn!(%peer, error = %err, "connection ended with error");
                }
            });
        }
    }
}
