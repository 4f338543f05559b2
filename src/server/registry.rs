//! Meeting, participant, and datagram-address registries.
//!
//! The meeting registry is the single synchronization point for membership:
//! every mutation and every membership-iterating broadcast happens under its
//! lock, so a freshly-admitted member can never miss or double-receive a
//! broadcast. Outbound delivery is an enqueue onto each recipient's bounded
//! writer queue and never blocks under the lock.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use rand::Rng;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, RwLock};

use crate::messages::ControlMessage;

pub type ParticipantId = u32;
pub type MeetingCode = String;

/// Attempts at sampling an unused meeting code before giving up.
const CODE_SAMPLE_RETRIES: u32 = 64;

/// Sending side of one connection's outbound queue, plus its kill switch.
///
/// `push` never blocks; a full queue means the peer is too slow to keep up
/// and the connection is closed instead of stalling producers.
#[derive(Debug, Clone)]
pub(crate) struct ClientHandle {
    msg_tx: mpsc::Sender<ControlMessage>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl ClientHandle {
    pub(crate) fn new(
        msg_tx: mpsc::Sender<ControlMessage>,
        shutdown: Arc<watch::Sender<bool>>,
    ) -> Self {
        Self { msg_tx, shutdown }
    }

    pub(crate) fn push(&self, msg: ControlMessage) {
        use mpsc::error::TrySendError;
        match self.msg_tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                tracing::warn!(kind = msg.kind(), "outbound queue overflow, closing peer");
                let _ = self.shutdown.send(true);
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

/// Where a participant currently sits within its meeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Host,
    Member,
    Waiting,
}

#[derive(Debug)]
struct ParticipantEntry {
    name: String,
    code: MeetingCode,
    role: Role,
    camera_on: bool,
    mic_on: bool,
    handle: ClientHandle,
}

#[derive(Debug)]
struct Meeting {
    host: ParticipantId,
    /// Admitted participants in join order, host first.
    admitted: Vec<ParticipantId>,
    /// Pending join requests in arrival order.
    waiting: Vec<ParticipantId>,
    #[allow(dead_code)]
    created_at: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    next_participant: ParticipantId,
    meetings: HashMap<MeetingCode, Meeting>,
    participants: HashMap<ParticipantId, ParticipantEntry>,
}

/// Errors from registry operations; mapped to `ERROR` replies by the
/// dispatcher.
#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum RegistryError {
    #[error("meeting not found")]
    MeetingNotFound,
    #[error("not the meeting host")]
    NotHost,
    #[error("participant is not waiting in this meeting")]
    NotWaiting,
    #[error("not an admitted member of a meeting")]
    NotAdmitted,
    #[error("target participant not in this meeting")]
    NoSuchTarget,
    #[error("meeting code space exhausted")]
    CodesExhausted,
    #[error("live meeting limit reached")]
    MeetingLimit,
    #[error("unknown participant")]
    UnknownParticipant,
}

/// Outcome of a departure, used by the caller to scrub the other registries.
#[derive(Debug)]
pub(crate) struct Departure {
    pub code: MeetingCode,
    pub dissolved: bool,
    /// Every participant removed from the registry by this departure,
    /// the departing one included.
    pub removed: Vec<ParticipantId>,
}

/// The meeting registry. Cheap to clone-share via `Arc`.
#[derive(Debug)]
pub(crate) struct Registry {
    inner: RwLock<Inner>,
    max_meetings: usize,
}

impl Registry {
    pub fn new(max_meetings: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                next_participant: 1,
                ..Inner::default()
            }),
            max_meetings,
        }
    }

    /// Create a meeting with `host_name` as its host.
    ///
    /// The code is rejection-sampled from the six-digit space; a bounded
    /// number of collisions fails the request with a transient error.
    pub async fn create_meeting(
        &self,
        host_name: &str,
        handle: ClientHandle,
    ) -> Result<(ParticipantId, MeetingCode), RegistryError> {
        let mut g = self.inner.write().await;
        if g.meetings.len() >= self.max_meetings {
            return Err(RegistryError::MeetingLimit);
        }
        let code = sample_code(&g.meetings)?;
        let id = g.alloc_participant();
        g.participants.insert(
            id,
            ParticipantEntry {
                name: host_name.to_string(),
                code: code.clone(),
                role: Role::Host,
                camera_on: false,
                mic_on: false,
                handle,
            },
        );
        g.meetings.insert(
            code.clone(),
            Meeting {
                host: id,
                admitted: vec![id],
                waiting: Vec::new(),
                created_at: Instant::now(),
            },
        );
        tracing::info!(%code, host = id, name = host_name, "meeting created");
        Ok((id, code))
    }

    /// Place a new participant in the meeting's waiting set and notify the
    /// host with a `JOIN_REQUEST`.
    pub async fn request_join(
        &self,
        code: &str,
        name: &str,
        handle: ClientHandle,
    ) -> Result<ParticipantId, RegistryError> {
        let mut g = self.inner.write().await;
        if !g.meetings.contains_key(code) {
            return Err(RegistryError::MeetingNotFound);
        }
        let id = g.alloc_participant();
        g.participants.insert(
            id,
            ParticipantEntry {
                name: name.to_string(),
                code: code.to_string(),
                role: Role::Waiting,
                camera_on: false,
                mic_on: false,
                handle,
            },
        );
        let meeting = g.meetings.get_mut(code).expect("checked above");
        meeting.waiting.push(id);
        let host = meeting.host;
        g.send_to(
            host,
            ControlMessage::JoinRequest {
                participant_id: id,
                name: name.to_string(),
            },
        );
        tracing::info!(%code, participant = id, %name, "join requested");
        Ok(id)
    }

    /// Host decision: admit `waiter_id` into the meeting hosted by `host_id`.
    ///
    /// The waiter gets `JOIN_ACCEPTED`; everyone already admitted gets
    /// `MEMBER_JOINED`.
    pub async fn admit(
        &self,
        host_id: ParticipantId,
        waiter_id: ParticipantId,
    ) -> Result<(), RegistryError> {
        let mut g = self.inner.write().await;
        let code = g.hosted_meeting(host_id)?;
        let meeting = g.meetings.get_mut(&code).expect("host entry points here");
        let Some(pos) = meeting.waiting.iter().position(|&w| w == waiter_id) else {
            return Err(RegistryError::NotWaiting);
        };
        meeting.waiting.remove(pos);
        meeting.admitted.push(waiter_id);

        let name = {
            let entry = g
                .participants
                .get_mut(&waiter_id)
                .ok_or(RegistryError::UnknownParticipant)?;
            entry.role = Role::Member;
            entry.name.clone()
        };
        g.send_to(waiter_id, ControlMessage::JoinAccepted { code: code.clone() });
        g.broadcast(
            &code,
            Some(waiter_id),
            ControlMessage::MemberJoined {
                participant_id: waiter_id,
                name: name.clone(),
            },
        );
        tracing::info!(%code, participant = waiter_id, %name, "participant admitted");
        Ok(())
    }

    /// Host decision: reject `waiter_id`. The waiter gets `JOIN_REJECTED`
    /// and returns to the unbound state.
    pub async fn deny(
        &self,
        host_id: ParticipantId,
        waiter_id: ParticipantId,
    ) -> Result<(), RegistryError> {
        let mut g = self.inner.write().await;
        let code = g.hosted_meeting(host_id)?;
        let meeting = g.meetings.get_mut(&code).expect("host entry points here");
        let Some(pos) = meeting.waiting.iter().position(|&w| w == waiter_id) else {
            return Err(RegistryError::NotWaiting);
        };
        meeting.waiting.remove(pos);
        g.send_to(waiter_id, ControlMessage::JoinRejected);
        g.participants.remove(&waiter_id);
        tracing::info!(%code, participant = waiter_id, "join denied");
        Ok(())
    }

    /// Remove a participant from its meeting.
    ///
    /// A host departure dissolves the meeting: every other member and waiter
    /// receives `MEETING_CLOSED` and is unbound. A non-host departure
    /// broadcasts `MEMBER_LEFT` to the remaining admitted set.
    pub async fn leave(&self, id: ParticipantId) -> Option<Departure> {
        let mut g = self.inner.write().await;
        let (code, role, name) = {
            let entry = g.participants.get(&id)?;
            (entry.code.clone(), entry.role, entry.name.clone())
        };

        if role == Role::Host {
            let meeting = g.meetings.remove(&code)?;
            let mut removed = Vec::with_capacity(1 + meeting.admitted.len() + meeting.waiting.len());
            removed.push(id);
            g.participants.remove(&id);
            for other in meeting.admitted.into_iter().chain(meeting.waiting) {
                if other == id {
                    continue;
                }
                g.send_to(other, ControlMessage::MeetingClosed);
                g.participants.remove(&other);
                removed.push(other);
            }
            tracing::info!(%code, host = id, "host left, meeting dissolved");
            return Some(Departure {
                code,
                dissolved: true,
                removed,
            });
        }

        let meeting = g.meetings.get_mut(&code)?;
        meeting.admitted.retain(|&p| p != id);
        meeting.waiting.retain(|&p| p != id);
        g.participants.remove(&id);
        // Any non-host departure, a waiter included, is announced to the
        // remaining admitted set.
        g.broadcast(
            &code,
            None,
            ControlMessage::MemberLeft {
                participant_id: id,
                name,
            },
        );
        tracing::info!(%code, participant = id, "participant left");
        Some(Departure {
            code,
            dissolved: false,
            removed: vec![id],
        })
    }

    /// Current role, or `None` for an unbound/stale id.
    pub async fn role_of(&self, id: ParticipantId) -> Option<Role> {
        self.inner.read().await.participants.get(&id).map(|e| e.role)
    }

    /// Admitted co-members of `id`'s meeting, excluding `id` itself.
    /// `None` when `id` is unknown or merely waiting.
    pub async fn co_members(&self, id: ParticipantId) -> Option<Vec<ParticipantId>> {
        let g = self.inner.read().await;
        let entry = g.participants.get(&id)?;
        if entry.role == Role::Waiting {
            return None;
        }
        let meeting = g.meetings.get(&entry.code)?;
        Some(
            meeting
                .admitted
                .iter()
                .copied()
                .filter(|&p| p != id)
                .collect(),
        )
    }

    /// Deliver a chat line: unicast when `to` names an admitted co-member,
    /// meeting-wide (sender excluded) otherwise.
    pub async fn chat(
        &self,
        from: ParticipantId,
        to: Option<ParticipantId>,
        text: String,
        ts: u64,
    ) -> Result<(), RegistryError> {
        let g = self.inner.read().await;
        let code = g.admitted_meeting(from)?;
        let msg = ControlMessage::ChatBroadcast { from, text, ts };
        match to {
            // Unicast only when the target is an admitted co-member; any
            // other target falls back to the meeting-wide broadcast.
            Some(target) if g.is_admitted_in(&code, target) => g.send_to(target, msg),
            _ => g.broadcast(&code, Some(from), msg),
        }
        Ok(())
    }

    /// Route a receiver link report to the media sender it names.
    pub async fn forward_stats(
        &self,
        reporter: ParticipantId,
        from_media_sender: ParticipantId,
        loss: f64,
        rtt_ms: f64,
        fps: u32,
        bitrate_kbps: u32,
    ) -> Result<(), RegistryError> {
        let g = self.inner.read().await;
        let code = g.admitted_meeting(reporter)?;
        if !g.is_admitted_in(&code, from_media_sender) {
            return Err(RegistryError::NoSuchTarget);
        }
        g.send_to(
            from_media_sender,
            ControlMessage::VideoStatsUpdate {
                reporter,
                from_media_sender,
                loss,
                rtt_ms,
                fps,
                bitrate_kbps,
            },
        );
        Ok(())
    }

    /// Record advisory camera/mic flags and echo them to co-members.
    /// The server never enforces them.
    pub async fn set_camera_status(
        &self,
        id: ParticipantId,
        camera_on: bool,
        mic_on: bool,
    ) -> Result<(), RegistryError> {
        let mut g = self.inner.write().await;
        let code = g.admitted_meeting(id)?;
        if let Some(entry) = g.participants.get_mut(&id) {
            entry.camera_on = camera_on;
            entry.mic_on = mic_on;
        }
        g.broadcast(
            &code,
            Some(id),
            ControlMessage::CameraStatusBroadcast {
                participant_id: id,
                camera_on,
                mic_on,
            },
        );
        Ok(())
    }

    /// Resolve the admitted targets of a file transfer: the named member,
    /// or every admitted co-member when `to` is absent.
    pub async fn transfer_targets(
        &self,
        from: ParticipantId,
        to: Option<ParticipantId>,
    ) -> Result<Vec<(ParticipantId, ClientHandle)>, RegistryError> {
        let g = self.inner.read().await;
        let code = g.admitted_meeting(from)?;
        let ids: Vec<ParticipantId> = match to {
            Some(target) => {
                if target == from || !g.is_admitted_in(&code, target) {
                    return Err(RegistryError::NoSuchTarget);
                }
                vec![target]
            }
            None => g
                .meetings
                .get(&code)
                .map(|m| {
                    m.admitted
                        .iter()
                        .copied()
                        .filter(|&p| p != from)
                        .collect()
                })
                .unwrap_or_default(),
        };
        if ids.is_empty() {
            return Err(RegistryError::NoSuchTarget);
        }
        Ok(ids
            .into_iter()
            .filter_map(|p| g.participants.get(&p).map(|e| (p, e.handle.clone())))
            .collect())
    }

    #[cfg(test)]
    pub async fn live_meetings(&self) -> usize {
        self.inner.read().await.meetings.len()
    }
}

impl Inner {
    fn alloc_participant(&mut self) -> ParticipantId {
        let id = self.next_participant;
        self.next_participant += 1;
        id
    }

    /// Meeting hosted by `id`, or the matching error.
    fn hosted_meeting(&self, id: ParticipantId) -> Result<MeetingCode, RegistryError> {
        let entry = self
            .participants
            .get(&id)
            .ok_or(RegistryError::UnknownParticipant)?;
        if entry.role != Role::Host {
            return Err(RegistryError::NotHost);
        }
        Ok(entry.code.clone())
    }

    /// Meeting `id` is admitted to (host counts), or the matching error.
    fn admitted_meeting(&self, id: ParticipantId) -> Result<MeetingCode, RegistryError> {
        let entry = self
            .participants
            .get(&id)
            .ok_or(RegistryError::UnknownParticipant)?;
        if entry.role == Role::Waiting {
            return Err(RegistryError::NotAdmitted);
        }
        Ok(entry.code.clone())
    }

    fn is_admitted_in(&self, code: &str, id: ParticipantId) -> bool {
        self.meetings
            .get(code)
            .map(|m| m.admitted.contains(&id))
            .unwrap_or(false)
    }

    fn send_to(&self, id: ParticipantId, msg: ControlMessage) {
        if let Some(entry) = self.participants.get(&id) {
            entry.handle.push(msg);
        }
    }

    /// Enqueue `msg` to every admitted member of `code` except `except`.
    fn broadcast(&self, code: &str, except: Option<ParticipantId>, msg: ControlMessage) {
        let Some(meeting) = self.meetings.get(code) else {
            return;
        };
        for &member in &meeting.admitted {
            if Some(member) == except {
                continue;
            }
            self.send_to(member, msg.clone());
        }
    }
}

fn sample_code(live: &HashMap<MeetingCode, Meeting>) -> Result<MeetingCode, RegistryError> {
    let mut rng = rand::thread_rng();
    for _ in 0..CODE_SAMPLE_RETRIES {
        let code = rng.gen_range(100_000..=999_999u32).to_string();
        if !live.contains_key(&code) {
            return Ok(code);
        }
    }
    Err(RegistryError::CodesExhausted)
}

/// Datagram return addresses, learned from each participant's first inbound
/// media datagram and refreshed on every subsequent one.
///
/// Locked independently of the meeting registry and always acquired after it.
#[derive(Debug, Default)]
pub(crate) struct AddressRegistry {
    inner: Mutex<HashMap<ParticipantId, SocketAddr>>,
}

impl AddressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn refresh(&self, id: ParticipantId, addr: SocketAddr) {
        let mut g = self.inner.lock().await;
        let prev = g.insert(id, addr);
        if prev != Some(addr) {
            tracing::debug!(participant = id, %addr, "datagram return address learned");
        }
    }

    pub async fn get(&self, id: ParticipantId) -> Option<SocketAddr> {
        self.inner.lock().await.get(&id).copied()
    }

    pub async fn remove_all(&self, ids: &[ParticipantId]) {
        let mut g = self.inner.lock().await;
        for id in ids {
            g.remove(id);
        }
    }
}
