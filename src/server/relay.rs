//! Datagram media relay.
//!
//! One task reads the media socket in a tight loop. A valid datagram names
//! its originating participant in the header; the source address doubles as
//! that participant's return address and is refreshed on every datagram.
//! The payload is fanned out unchanged to every admitted co-member with a
//! known return address, never back to the sender. Nothing is buffered
//! beyond the single outbound write per target.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;

use super::Shared;
use crate::media::MediaHeader;

const DATAGRAM_BUFFER_SIZE: usize = 65_536;

pub(crate) struct MediaRelay {
    socket: Arc<UdpSocket>,
    shared: Arc<Shared>,
    malformed: AtomicU64,
    unknown_sender: AtomicU64,
    send_failures: AtomicU64,
}

impl MediaRelay {
    pub fn new(socket: Arc<UdpSocket>, shared: Arc<Shared>) -> Self {
        Self {
            socket,
            shared,
            malformed: AtomicU64::new(0),
            unknown_sender: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
        }
    }

    /// Receive loop; survives arbitrary per-datagram failures.
    pub async fn run(self) {
        let mut buf = vec![0u8; DATAGRAM_BUFFER_SIZE];
        tracing::info!("media relay started");
        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, src)) => self.handle_datagram(&buf[..len], src).await,
                Err(err) => {
                    tracing::warn!(error = %err, "datagram receive error");
                }
            }
        }
    }

    async fn handle_datagram(&self, datagram: &[u8], src: SocketAddr) {
        let header = match MediaHeader::parse(datagram) {
            Ok(header) => header,
            Err(err) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(%src, error = %err, "malformed datagram dropped");
                return;
            }
        };
        let sender = header.participant();

        // Unknown or not-yet-admitted senders are dropped before anything
        // else, address learning included.
        let Some(peers) = self.shared.registry.co_members(sender).await else {
            self.unknown_sender.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(participant = sender, %src, "datagram from unknown participant dropped");
            return;
        };

        self.shared.addrs.refresh(sender, src).await;

        for peer in peers {
            // A co-member we have not heard from on the media socket yet has
            // no return address; skip it silently.
            let Some(addr) = self.shared.addrs.get(peer).await else {
                continue;
            };
            if let Err(err) = self.socket.send_to(datagram, addr).await {
                self.send_failures.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(participant = peer, %addr, error = %err, "datagram send failed");
            }
        }
    }
}
