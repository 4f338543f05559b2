//! File-transfer coordinator: paced, acknowledgement-driven chunk
//! forwarding between meeting members.
//!
//! Each session runs an application-layer Reno loop. Chunks from the sender
//! are forwarded while `in_flight < cwnd` and queued otherwise; receiver
//! acks free credit and grow the window; a silent chunk triggers
//! multiplicative decrease and a retransmit of the oldest outstanding chunk.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use thiserror::Error;
use tokio::sync::Mutex;

use super::registry::{ClientHandle, ParticipantId};
use crate::messages::{AbortReason, ControlMessage};

/// Ceiling on the congestion window, in chunks.
pub const MAX_CWND: u32 = 64;
/// Largest declared file size a session will be opened for.
pub const MAX_FILE_BYTES: u64 = 4 * 1024 * 1024 * 1024;
/// A session with no acknowledgement progress for this long is timed out
/// regardless of per-chunk retries.
const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Pacing knobs, lifted from the server configuration.
#[derive(Debug, Clone)]
pub(crate) struct TransferConfig {
    pub initial_ssthresh: u32,
    pub base_chunk_bytes: usize,
    pub ack_timeout: Duration,
    pub max_retries: u32,
    pub session_queue_bytes: usize,
}

/// Errors surfaced to the dispatcher; most map to a session abort.
#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum TransferError {
    #[error("no open session for this transfer")]
    NoSession,
    #[error("a session with this id is already open")]
    DuplicateStart,
    #[error("declared size exceeds the file limit")]
    TooLarge,
    #[error("chunk {got} arrived, expected {expected}")]
    OutOfOrder { expected: u32, got: u32 },
    #[error("chunk payload is not valid base64 of at most the base chunk size")]
    InvalidChunk,
    #[error("session queue overflow")]
    QueueOverflow,
}

#[derive(Debug)]
struct OutstandingChunk {
    data: String,
    sent_at: Instant,
    retries: u32,
}

#[derive(Debug)]
struct Target {
    id: ParticipantId,
    handle: ClientHandle,
}

#[derive(Debug)]
struct Session {
    transfer_id: u64,
    sender: ParticipantId,
    sender_handle: ClientHandle,
    targets: Vec<Target>,
    cwnd: u32,
    ssthresh: u32,
    in_flight: u32,
    /// Next sequence expected from the sender; sequences start at 0 and are
    /// strictly ascending.
    next_seq: u32,
    /// Forwarded-but-unacked chunks, keyed by sequence. The coordinator
    /// holds each copy until it is acknowledged.
    outstanding: BTreeMap<u32, OutstandingChunk>,
    /// Chunks admitted from the sender but awaiting window credit.
    queued: VecDeque<(u32, String)>,
    queued_bytes: usize,
    end_pending: bool,
    last_progress: Instant,
}

impl Session {
    fn forward_chunk(&mut self, seq: u32, data: String, now: Instant) {
        for target in &self.targets {
            target.handle.push(ControlMessage::FileChunkForward {
                transfer_id: self.transfer_id,
                seq,
                data: data.clone(),
            });
        }
        self.outstanding.insert(
            seq,
            OutstandingChunk {
                data,
                sent_at: now,
                retries: 0,
            },
        );
        self.in_flight += 1;
    }

    /// Drain the pending queue into the window.
    fn flush(&mut self, now: Instant) {
        while self.in_flight < self.cwnd {
            let Some((seq, data)) = self.queued.pop_front() else {
                break;
            };
            self.queued_bytes -= data.len();
            self.forward_chunk(seq, data, now);
        }
    }

    fn drained(&self) -> bool {
        self.outstanding.is_empty() && self.queued.is_empty()
    }

    fn complete(&self) {
        for target in &self.targets {
            target.handle.push(ControlMessage::FileEndForward {
                transfer_id: self.transfer_id,
            });
        }
    }

    fn abort(&self, reason: AbortReason) {
        let msg = ControlMessage::FileAbort {
            transfer_id: self.transfer_id,
            reason,
        };
        self.sender_handle.push(msg.clone());
        for target in &self.targets {
            target.handle.push(msg.clone());
        }
    }
}

/// Owns every open transfer session.
///
/// The table lock is held only for insertion, removal, and lookup; each
/// session carries its own lock.
#[derive(Debug)]
pub(crate) struct TransferCoordinator {
    cfg: TransferConfig,
    sessions: Mutex<HashMap<u64, Vec<Arc<Mutex<Session>>>>>,
}

impl TransferCoordinator {
    pub fn new(cfg: TransferConfig) -> Self {
        Self {
            cfg,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Open a session and announce it to the targets.
    pub async fn start(
        &self,
        sender: ParticipantId,
        sender_handle: ClientHandle,
        transfer_id: u64,
        targets: Vec<(ParticipantId, ClientHandle)>,
        file_name: &str,
        size: u64,
    ) -> Result<(), TransferError> {
        if size > MAX_FILE_BYTES {
            return Err(TransferError::TooLarge);
        }
        let mut table = self.sessions.lock().await;
        let bucket = table.entry(transfer_id).or_default();
        for existing in bucket.iter() {
            if existing.lock().await.sender == sender {
                return Err(TransferError::DuplicateStart);
            }
        }
        let session = Session {
            transfer_id,
            sender,
            sender_handle,
            targets: targets
                .into_iter()
                .map(|(id, handle)| Target { id, handle })
                .collect(),
            cwnd: 1,
            ssthresh: self.cfg.initial_ssthresh,
            in_flight: 0,
            next_seq: 0,
            outstanding: BTreeMap::new(),
            queued: VecDeque::new(),
            queued_bytes: 0,
            end_pending: false,
            last_progress: Instant::now(),
        };
        for target in &session.targets {
            target.handle.push(ControlMessage::FileStartForward {
                transfer_id,
                from: sender,
                name: file_name.to_string(),
                size,
            });
        }
        tracing::info!(
            transfer = transfer_id,
            sender,
            file = file_name,
            size,
            "transfer session opened"
        );
        bucket.push(Arc::new(Mutex::new(session)));
        Ok(())
    }

    /// Admit one chunk from the sender: forward it within the window, queue
    /// it otherwise.
    pub async fn chunk(
        &self,
        sender: ParticipantId,
        transfer_id: u64,
        seq: u32,
        data: String,
    ) -> Result<(), TransferError> {
        let session = self
            .find_by_sender(transfer_id, sender)
            .await
            .ok_or(TransferError::NoSession)?;
        let mut s = session.lock().await;

        if seq != s.next_seq {
            let err = TransferError::OutOfOrder {
                expected: s.next_seq,
                got: seq,
            };
            s.abort(AbortReason::Protocol);
            drop(s);
            self.remove(transfer_id, sender).await;
            return Err(err);
        }
        match BASE64.decode(&data) {
            Ok(raw) if raw.len() <= self.cfg.base_chunk_bytes => {}
            _ => {
                s.abort(AbortReason::Protocol);
                drop(s);
                self.remove(transfer_id, sender).await;
                return Err(TransferError::InvalidChunk);
            }
        }
        s.next_seq += 1;

        if s.in_flight < s.cwnd {
            s.forward_chunk(seq, data, Instant::now());
        } else {
            if s.queued_bytes + data.len() > self.cfg.session_queue_bytes {
                s.abort(AbortReason::Overflow);
                drop(s);
                self.remove(transfer_id, sender).await;
                return Err(TransferError::QueueOverflow);
            }
            s.queued_bytes += data.len();
            s.queued.push_back((seq, data));
        }
        Ok(())
    }

    /// Credit an acknowledgement from a receiver, grow the window, forward
    /// the ack to the sender, and flush freed credit.
    ///
    /// Acks for unknown or already-credited sequences are dropped so a
    /// broadcast session is credited exactly once per chunk.
    pub async fn ack(
        &self,
        acker: ParticipantId,
        transfer_id: u64,
        seq: u32,
    ) -> Result<(), TransferError> {
        let session = self
            .find_by_target(transfer_id, acker)
            .await
            .ok_or(TransferError::NoSession)?;
        let mut s = session.lock().await;

        if s.outstanding.remove(&seq).is_none() {
            tracing::debug!(transfer = transfer_id, seq, "duplicate ack dropped");
            return Ok(());
        }
        s.in_flight -= 1;
        s.last_progress = Instant::now();
        if s.cwnd < s.ssthresh {
            s.cwnd = (s.cwnd * 2).min(MAX_CWND);
        } else {
            s.cwnd = (s.cwnd + 1).min(MAX_CWND);
        }
        s.sender_handle
            .push(ControlMessage::FileAckForward { transfer_id, seq });
        s.flush(Instant::now());

        if s.end_pending && s.drained() {
            s.complete();
            let sender = s.sender;
            drop(s);
            self.remove(transfer_id, sender).await;
            tracing::info!(transfer = transfer_id, "transfer session completed");
        }
        Ok(())
    }

    /// Sender signals the last chunk was submitted. Completion is forwarded
    /// once every chunk is acknowledged.
    pub async fn end(&self, sender: ParticipantId, transfer_id: u64) -> Result<(), TransferError> {
        let session = self
            .find_by_sender(transfer_id, sender)
            .await
            .ok_or(TransferError::NoSession)?;
        let mut s = session.lock().await;
        if s.drained() {
            s.complete();
            drop(s);
            self.remove(transfer_id, sender).await;
            tracing::info!(transfer = transfer_id, "transfer session completed");
        } else {
            s.end_pending = true;
        }
        Ok(())
    }

    /// Abort every session the departing participant is part of.
    pub async fn abort_for_participant(&self, ids: &[ParticipantId]) {
        let mut table = self.sessions.lock().await;
        let mut doomed = Vec::new();
        for bucket in table.values() {
            for session in bucket {
                let s = session.lock().await;
                if ids.contains(&s.sender) || s.targets.iter().any(|t| ids.contains(&t.id)) {
                    s.abort(AbortReason::Departed);
                    doomed.push((s.transfer_id, s.sender));
                }
            }
        }
        for (transfer_id, sender) in doomed {
            remove_locked(&mut table, transfer_id, sender).await;
        }
    }

    /// One pass of the periodic timeout sweep.
    ///
    /// For each session whose oldest outstanding chunk has been silent past
    /// the ack timeout: halve `ssthresh`, collapse the window, and
    /// retransmit that chunk, aborting once its retry budget is spent.
    pub async fn sweep_once(&self, now: Instant) {
        let snapshot: Vec<Arc<Mutex<Session>>> = {
            let table = self.sessions.lock().await;
            table.values().flatten().cloned().collect()
        };

        for session in snapshot {
            let mut s = session.lock().await;
            let mut doom = None;

            let oldest = s
                .outstanding
                .iter()
                .next()
                .map(|(&seq, chunk)| (seq, chunk.sent_at, chunk.retries));
            if now.duration_since(s.last_progress) > SESSION_IDLE_TIMEOUT {
                doom = Some("idle");
            } else if let Some((seq, sent_at, retries)) = oldest {
                if now.duration_since(sent_at) > self.cfg.ack_timeout {
                    if retries >= self.cfg.max_retries {
                        doom = Some("retries exhausted");
                    } else {
                        // Multiplicative decrease, then retransmit the
                        // oldest unacked chunk.
                        s.ssthresh = s.ssthresh.min((s.cwnd / 2).max(1));
                        s.cwnd = 1;
                        let data = {
                            let chunk = s.outstanding.get_mut(&seq).expect("present above");
                            chunk.retries += 1;
                            chunk.sent_at = now;
                            chunk.data.clone()
                        };
                        tracing::debug!(
                            transfer = s.transfer_id,
                            seq,
                            retries = retries + 1,
                            "retransmitting chunk"
                        );
                        for target in &s.targets {
                            target.handle.push(ControlMessage::FileChunkForward {
                                transfer_id: s.transfer_id,
                                seq,
                                data: data.clone(),
                            });
                        }
                    }
                }
            }

            if let Some(cause) = doom {
                tracing::warn!(transfer = s.transfer_id, cause, "transfer session timed out");
                s.abort(AbortReason::Timeout);
                let (transfer_id, sender) = (s.transfer_id, s.sender);
                drop(s);
                let mut table = self.sessions.lock().await;
                remove_locked(&mut table, transfer_id, sender).await;
            }
        }
    }

    /// Run the sweep on its fixed cadence. Spawned once per server.
    pub async fn run_sweeper(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(100));
        loop {
            ticker.tick().await;
            self.sweep_once(Instant::now()).await;
        }
    }

    async fn find_by_sender(
        &self,
        transfer_id: u64,
        sender: ParticipantId,
    ) -> Option<Arc<Mutex<Session>>> {
        let table = self.sessions.lock().await;
        let bucket = table.get(&transfer_id)?;
        for session in bucket {
            if session.lock().await.sender == sender {
                return Some(session.clone());
            }
        }
        None
    }

    async fn find_by_target(
        &self,
        transfer_id: u64,
        target: ParticipantId,
    ) -> Option<Arc<Mutex<Session>>> {
        let table = self.sessions.lock().await;
        let bucket = table.get(&transfer_id)?;
        for session in bucket {
            if session
                .lock()
                .await
                .targets
                .iter()
                .any(|t| t.id == target)
            {
                return Some(session.clone());
            }
        }
        None
    }

    async fn remove(&self, transfer_id: u64, sender: ParticipantId) {
        let mut table = self.sessions.lock().await;
        remove_locked(&mut table, transfer_id, sender).await;
    }

    #[cfg(test)]
    pub async fn open_sessions(&self) -> usize {
        self.sessions.lock().await.values().map(Vec::len).sum()
    }

    #[cfg(test)]
    async fn window_of(&self, transfer_id: u64, sender: ParticipantId) -> Option<(u32, u32, u32)> {
        let session = self.find_by_sender(transfer_id, sender).await?;
        let s = session.lock().await;
        Some((s.cwnd, s.ssthresh, s.in_flight))
    }
}

async fn remove_locked(
    table: &mut HashMap<u64, Vec<Arc<Mutex<Session>>>>,
    transfer_id: u64,
    sender: ParticipantId,
) {
    if let Some(bucket) = table.get_mut(&transfer_id) {
        let mut keep = Vec::with_capacity(bucket.len());
        for session in bucket.drain(..) {
            if session.lock().await.sender != sender {
                keep.push(session);
            }
        }
        if keep.is_empty() {
            table.remove(&transfer_id);
        } else {
            table.insert(transfer_id, keep);
        }
    }
}
