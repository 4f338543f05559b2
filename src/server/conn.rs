//! Per-connection control dispatcher.
//!
//! Each accepted connection runs two tasks: this read loop, which decodes
//! frames and advances the connection's state machine, and a writer task
//! draining a bounded outbound queue. Producers enqueue instead of writing
//! directly, so a slow peer can only stall itself.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use super::registry::{ClientHandle, ParticipantId, RegistryError, Role};
use super::transfer::TransferError;
use super::Shared;
use crate::error::HuddleError;
use crate::messages::{
    write_message, ControlMessage, Decoded, ErrorKind, FrameDecoder,
};

/// Frames a peer may have queued before it is considered too slow to live.
const OUTBOUND_QUEUE_FRAMES: usize = 256;

/// Whether the read loop keeps going after a message.
enum Next {
    Continue,
    Close,
}

pub(crate) async fn handle_connection(
    shared: Arc<Shared>,
    sock: TcpStream,
    peer: SocketAddr,
) -> Result<(), HuddleError> {
    let (mut reader, mut writer) = sock.into_split();

    let (msg_tx, mut msg_rx) = mpsc::channel::<ControlMessage>(OUTBOUND_QUEUE_FRAMES);
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let handle = ClientHandle::new(msg_tx, shutdown_tx.clone());

    let writer_shutdown = shutdown_tx.clone();
    let writer_task = tokio::spawn(async move {
        while let Some(msg) = msg_rx.recv().await {
            if let Err(err) = write_message(&mut writer, &msg).await {
                tracing::debug!(error = %err, "outbound write failed");
                let _ = writer_shutdown.send(true);
                break;
            }
        }
    });

    let mut conn = Conn {
        shared: shared.clone(),
        handle,
        participant: None,
        peer,
    };
    let mut decoder = FrameDecoder::new(shared.cfg.max_frame_bytes);
    let idle = Duration::from_millis(shared.cfg.idle_timeout_ms);

    let result = loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break Ok(());
                }
            }
            next = tokio::time::timeout(idle, decoder.read_next(&mut reader)) => {
                match next {
                    Err(_) => {
                        tracing::info!(%peer, "idle timeout, closing connection");
                        break Ok(());
                    }
                    Ok(Ok(None)) => break Ok(()),
                    Ok(Ok(Some(Decoded::Unknown { kind }))) => {
                        tracing::warn!(%peer, %kind, "unknown message type discarded");
                    }
                    Ok(Ok(Some(Decoded::Message(msg)))) => {
                        tracing::debug!(%peer, kind = msg.kind(), "control message");
                        match conn.dispatch(msg).await {
                            Next::Continue => {}
                            Next::Close => break Ok(()),
                        }
                    }
                    Ok(Err(err)) => {
                        // Best-effort ERROR frame before the terminal close.
                        conn.reply(ControlMessage::Error {
                            kind: ErrorKind::Protocol,
                            reason: err.to_string(),
                        });
                        break Err(HuddleError::Frame(err));
                    }
                }
            }
        }
    };

    conn.cleanup().await;
    drop(conn);
    // All handle clones are gone after cleanup; the writer drains whatever
    // is still queued and exits.
    let _ = tokio::time::timeout(Duration::from_secs(1), writer_task).await;
    result
}

struct Conn {
    shared: Arc<Shared>,
    handle: ClientHandle,
    /// Participant this connection is bound to, if any. The registry is the
    /// authority; this id can go stale when the host denies us or the
    /// meeting dissolves, and is then lazily cleared.
    participant: Option<ParticipantId>,
    peer: SocketAddr,
}

impl Conn {
    fn reply(&self, msg: ControlMessage) {
        self.handle.push(msg);
    }

    fn state_error(&self, reason: &str) {
        self.reply(ControlMessage::Error {
            kind: ErrorKind::State,
            reason: reason.to_string(),
        });
    }

    fn resource_error(&self, reason: &str) {
        self.reply(ControlMessage::Error {
            kind: ErrorKind::Resource,
            reason: reason.to_string(),
        });
    }

    /// The live participant this connection is bound to, dropping a stale id.
    async fn bound(&mut self) -> Option<(ParticipantId, Role)> {
        let id = self.participant?;
        match self.shared.registry.role_of(id).await {
            Some(role) => Some((id, role)),
            None => {
                self.participant = None;
                None
            }
        }
    }

    /// Bound and admitted (host or member), the precondition of every
    /// in-meeting command.
    async fn admitted(&mut self) -> Option<ParticipantId> {
        match self.bound().await {
            Some((id, Role::Host)) | Some((id, Role::Member)) => Some(id),
            _ => None,
        }
    }

    async fn dispatch(&mut self, msg: ControlMessage) -> Next {
        match msg {
            ControlMessage::CreateMeeting { name } => self.on_create(name).await,
            ControlMessage::RequestJoin { code, name } => self.on_request_join(code, name).await,
            ControlMessage::AllowJoin { participant_id } => {
                self.on_admission(participant_id, true).await
            }
            ControlMessage::DenyJoin { participant_id } => {
                self.on_admission(participant_id, false).await
            }
            ControlMessage::Chat { to, text } => self.on_chat(to, text).await,
            ControlMessage::FileStart {
                transfer_id,
                to,
                name,
                size,
            } => self.on_file_start(transfer_id, to, name, size).await,
            ControlMessage::FileChunk {
                transfer_id,
                seq,
                data,
            } => self.on_file_chunk(transfer_id, seq, data).await,
            ControlMessage::FileAck { transfer_id, seq } => {
                self.on_file_ack(transfer_id, seq).await
            }
            ControlMessage::FileEnd { transfer_id } => self.on_file_end(transfer_id).await,
            ControlMessage::VideoStats {
                from_media_sender,
                loss,
                rtt_ms,
                fps,
                bitrate_kbps,
            } => {
                self.on_video_stats(from_media_sender, loss, rtt_ms, fps, bitrate_kbps)
                    .await
            }
            ControlMessage::Leave => self.on_leave().await,
            ControlMessage::Heartbeat => {
                self.reply(ControlMessage::HeartbeatAck);
                Next::Continue
            }
            ControlMessage::CameraStatus { camera_on, mic_on } => {
                self.on_camera_status(camera_on, mic_on).await
            }
            // Server-originated messages are never valid inbound.
            other => {
                self.state_error(&format!("unexpected message {}", other.kind()));
                Next::Continue
            }
        }
    }

    async fn on_create(&mut self, name: String) -> Next {
        if self.bound().await.is_some() {
            self.state_error("already bound to a meeting");
            return Next::Continue;
        }
        if !valid_name(&name) {
            self.state_error("display name must be 1-64 bytes");
            return Next::Continue;
        }
        match self
            .shared
            .registry
            .create_meeting(&name, self.handle.clone())
            .await
        {
            Ok((id, code)) => {
                self.participant = Some(id);
                self.reply(ControlMessage::MeetingCreated { code });
            }
            Err(err @ (RegistryError::MeetingLimit | RegistryError::CodesExhausted)) => {
                self.resource_error(&err.to_string());
            }
            Err(err) => self.state_error(&err.to_string()),
        }
        Next::Continue
    }

    async fn on_request_join(&mut self, code: String, name: String) -> Next {
        if self.bound().await.is_some() {
            self.state_error("already bound to a meeting");
            return Next::Continue;
        }
        if !valid_name(&name) {
            self.state_error("display name must be 1-64 bytes");
            return Next::Continue;
        }
        match self
            .shared
            .registry
            .request_join(&code, &name, self.handle.clone())
            .await
        {
            Ok(id) => {
                self.participant = Some(id);
                self.reply(ControlMessage::JoinPending);
            }
            Err(err) => self.state_error(&err.to_string()),
        }
        Next::Continue
    }

    async fn on_admission(&mut self, waiter: ParticipantId, allow: bool) -> Next {
        let Some((id, Role::Host)) = self.bound().await else {
            self.state_error("only the meeting host may decide admissions");
            return Next::Continue;
        };
        let result = if allow {
            self.shared.registry.admit(id, waiter).await
        } else {
            self.shared.registry.deny(id, waiter).await
        };
        if let Err(err) = result {
            self.state_error(&err.to_string());
        }
        Next::Continue
    }

    async fn on_chat(&mut self, to: Option<ParticipantId>, text: String) -> Next {
        let Some(id) = self.admitted().await else {
            self.state_error("not in a meeting");
            return Next::Continue;
        };
        if let Err(err) = self
            .shared
            .registry
            .chat(id, to, text, epoch_millis())
            .await
        {
            self.state_error(&err.to_string());
        }
        Next::Continue
    }

    async fn on_file_start(
        &mut self,
        transfer_id: u64,
        to: Option<ParticipantId>,
        name: String,
        size: u64,
    ) -> Next {
        let Some(id) = self.admitted().await else {
            self.state_error("not in a meeting");
            return Next::Continue;
        };
        let targets = match self.shared.registry.transfer_targets(id, to).await {
            Ok(targets) => targets,
            Err(err) => {
                self.state_error(&err.to_string());
                return Next::Continue;
            }
        };
        match self
            .shared
            .transfers
            .start(id, self.handle.clone(), transfer_id, targets, &name, size)
            .await
        {
            Ok(()) => {}
            Err(err) => self.state_error(&err.to_string()),
        }
        Next::Continue
    }

    async fn on_file_chunk(&mut self, transfer_id: u64, seq: u32, data: String) -> Next {
        let Some(id) = self.admitted().await else {
            self.state_error("not in a meeting");
            return Next::Continue;
        };
        match self.shared.transfers.chunk(id, transfer_id, seq, data).await {
            Ok(()) => Next::Continue,
            Err(err @ (TransferError::OutOfOrder { .. } | TransferError::InvalidChunk)) => {
                // The coordinator already aborted the session; the violation
                // is terminal for this connection too.
                self.reply(ControlMessage::Error {
                    kind: ErrorKind::Protocol,
                    reason: err.to_string(),
                });
                Next::Close
            }
            Err(err @ TransferError::QueueOverflow) => {
                self.resource_error(&err.to_string());
                Next::Continue
            }
            Err(err) => {
                self.state_error(&err.to_string());
                Next::Continue
            }
        }
    }

    async fn on_file_ack(&mut self, transfer_id: u64, seq: u32) -> Next {
        let Some(id) = self.admitted().await else {
            self.state_error("not in a meeting");
            return Next::Continue;
        };
        if let Err(err) = self.shared.transfers.ack(id, transfer_id, seq).await {
            self.state_error(&err.to_string());
        }
        Next::Continue
    }

    async fn on_file_end(&mut self, transfer_id: u64) -> Next {
        let Some(id) = self.admitted().await else {
            self.state_error("not in a meeting");
            return Next::Continue;
        };
        if let Err(err) = self.shared.transfers.end(id, transfer_id).await {
            self.state_error(&err.to_string());
        }
        Next::Continue
    }

    async fn on_video_stats(
        &mut self,
        from_media_sender: ParticipantId,
        loss: f64,
        rtt_ms: f64,
        fps: u32,
        bitrate_kbps: u32,
    ) -> Next {
        let Some(id) = self.admitted().await else {
            self.state_error("not in a meeting");
            return Next::Continue;
        };
        if let Err(err) = self
            .shared
            .registry
            .forward_stats(id, from_media_sender, loss, rtt_ms, fps, bitrate_kbps)
            .await
        {
            self.state_error(&err.to_string());
        }
        Next::Continue
    }

    async fn on_leave(&mut self) -> Next {
        if self.bound().await.is_none() {
            self.state_error("not in a meeting");
            return Next::Continue;
        }
        self.cleanup().await;
        Next::Continue
    }

    async fn on_camera_status(&mut self, camera_on: bool, mic_on: bool) -> Next {
        let Some(id) = self.admitted().await else {
            self.state_error("not in a meeting");
            return Next::Continue;
        };
        if let Err(err) = self
            .shared
            .registry
            .set_camera_status(id, camera_on, mic_on)
            .await
        {
            self.state_error(&err.to_string());
        }
        Next::Continue
    }

    /// Scrub every registry this connection's participant touches.
    /// Idempotent; runs on LEAVE and again when the connection dies.
    async fn cleanup(&mut self) {
        let Some(id) = self.participant.take() else {
            return;
        };
        if let Some(departure) = self.shared.registry.leave(id).await {
            self.shared
                .transfers
                .abort_for_participant(&departure.removed)
                .await;
            self.shared.addrs.remove_all(&departure.removed).await;
            tracing::debug!(
                peer = %self.peer,
                code = %departure.code,
                dissolved = departure.dissolved,
                "connection cleanup complete"
            );
        }
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= 64
}

fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
