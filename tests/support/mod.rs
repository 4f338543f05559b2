//! Shared helpers for the integration suites: an in-process server on
//! ephemeral ports and a minimal framed control client.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use huddle::messages::{encode_frame, ControlMessage, Decoded, FrameDecoder};
use huddle::server::{Server, ServerConfig};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub fn local_config() -> ServerConfig {
    let mut cfg = ServerConfig::default();
    cfg.host = "127.0.0.1".to_string();
    cfg.tcp_port = 0;
    cfg.udp_port = 0;
    cfg
}

/// Bind a server on ephemeral ports and run it in the background.
pub async fn start_server() -> (SocketAddr, SocketAddr) {
    start_server_with(local_config()).await
}

pub async fn start_server_with(cfg: ServerConfig) -> (SocketAddr, SocketAddr) {
    let bound = Server::new(cfg).bind().await.expect("server bind");
    let tcp = bound.tcp_addr().expect("tcp addr");
    let udp = bound.udp_addr().expect("udp addr");
    tokio::spawn(async move {
        let _ = bound.run().await;
    });
    (tcp, udp)
}

/// A control-channel client speaking raw length-prefixed JSON frames.
pub struct TestClient {
    stream: TcpStream,
    decoder: FrameDecoder,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        Self {
            stream,
            decoder: FrameDecoder::default(),
        }
    }

    pub async fn send(&mut self, msg: &ControlMessage) {
        let frame = encode_frame(msg).expect("encode");
        self.stream.write_all(&frame).await.expect("send frame");
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("send raw");
    }

    /// Next message, panicking on timeout or connection close.
    pub async fn recv(&mut self) -> ControlMessage {
        match self.try_recv(RECV_TIMEOUT).await {
            Some(msg) => msg,
            None => panic!("expected a message, connection closed or timed out"),
        }
    }

    /// Next message within `window`, or `None` on timeout/close.
    pub async fn try_recv(&mut self, window: Duration) -> Option<ControlMessage> {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let read = tokio::time::timeout_at(deadline, self.decoder.read_next(&mut self.stream))
                .await
                .ok()?;
            match read.ok()? {
                Some(Decoded::Message(msg)) => return Some(msg),
                Some(Decoded::Unknown { .. }) => continue,
                None => return None,
            }
        }
    }

    /// Assert nothing arrives for a short window.
    pub async fn expect_silence(&mut self) {
        if let Some(msg) = self.try_recv(Duration::from_millis(300)).await {
            panic!("expected silence, got {msg:?}");
        }
    }

    /// True once the server has closed this connection.
    pub async fn closed(&mut self, window: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let Ok(read) =
                tokio::time::timeout_at(deadline, self.decoder.read_next(&mut self.stream)).await
            else {
                return false;
            };
            match read {
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => return true,
            }
        }
    }
}

/// Create a meeting and return (host client, code).
pub async fn create_meeting(addr: SocketAddr, name: &str) -> (TestClient, String) {
    let mut host = TestClient::connect(addr).await;
    host.send(&ControlMessage::CreateMeeting { name: name.into() })
        .await;
    let code = match host.recv().await {
        ControlMessage::MeetingCreated { code } => code,
        other => panic!("expected MEETING_CREATED, got {other:?}"),
    };
    (host, code)
}

/// Join `code` through the full approval flow; returns the admitted client
/// and its participant id.
pub async fn join_meeting(
    addr: SocketAddr,
    host: &mut TestClient,
    code: &str,
    name: &str,
) -> (TestClient, u32) {
    let mut member = TestClient::connect(addr).await;
    member
        .send(&ControlMessage::RequestJoin {
            code: code.into(),
            name: name.into(),
        })
        .await;
    assert!(matches!(member.recv().await, ControlMessage::JoinPending));
    let waiter_id = match host.recv().await {
        ControlMessage::JoinRequest {
            participant_id,
            name: n,
        } => {
            assert_eq!(n, name);
            participant_id
        }
        other => panic!("expected JOIN_REQUEST, got {other:?}"),
    };
    host.send(&ControlMessage::AllowJoin {
        participant_id: waiter_id,
    })
    .await;
    match member.recv().await {
        ControlMessage::JoinAccepted { code: c } => assert_eq!(c, code),
        other => panic!("expected JOIN_ACCEPTED, got {other:?}"),
    }
    match host.recv().await {
        ControlMessage::MemberJoined { participant_id, .. } => {
            assert_eq!(participant_id, waiter_id)
        }
        other => panic!("expected MEMBER_JOINED, got {other:?}"),
    }
    (member, waiter_id)
}
