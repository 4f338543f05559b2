use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the control-channel framing header in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;
/// Default cap on a single control frame, sized to fit file chunks.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 32 * 1024 * 1024;

const READ_CHUNK_SIZE: usize = 8192;

/// Stateful control-frame decoder.
///
/// Retains partial reads across `.read_next()` calls, preventing framing
/// desynchronization when frames arrive fragmented. A partial frame at
/// end-of-stream is a clean end condition, not an error.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame_bytes: usize,
}

/// Outcome of decoding one frame.
#[derive(Debug, Clone)]
pub enum Decoded {
    /// A message from the known catalog.
    Message(ControlMessage),
    /// Valid frame whose `type` tag is not in the catalog; logged and
    /// discarded by callers, the connection stays open.
    Unknown { kind: String },
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl FrameDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_bytes,
        }
    }

    /// Read until one full frame is buffered, then decode it.
    ///
    /// Returns `Ok(None)` on end-of-stream, including a partial frame at EOF.
    pub async fn read_next<R>(&mut self, reader: &mut R) -> Result<Option<Decoded>, FrameError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(body_len) = self.pending_len()? {
                if self.buf.len() >= LENGTH_PREFIX_SIZE + body_len {
                    let body: Vec<u8> = self
                        .buf
                        .drain(..LENGTH_PREFIX_SIZE + body_len)
                        .skip(LENGTH_PREFIX_SIZE)
                        .collect();
                    return decode_body(&body).map(Some);
                }
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn pending_len(&self) -> Result<Option<usize>, FrameError> {
        if self.buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }
        let len =
            u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > self.max_frame_bytes {
            return Err(FrameError::Oversize {
                len,
                limit: self.max_frame_bytes,
            });
        }
        Ok(Some(len))
    }
}

fn decode_body(body: &[u8]) -> Result<Decoded, FrameError> {
    let value: serde_json::Value = serde_json::from_slice(body)?;
    let kind = match value.get("type").and_then(|t| t.as_str()) {
        Some(kind) => kind.to_string(),
        None => return Err(FrameError::MissingType),
    };
    match serde_json::from_value::<ControlMessage>(value) {
        Ok(msg) => Ok(Decoded::Message(msg)),
        Err(err) => {
            if KNOWN_TYPES.contains(&kind.as_str()) {
                Err(FrameError::Body(err))
            } else {
                Ok(Decoded::Unknown { kind })
            }
        }
    }
}

/// Serialize a message into one length-prefixed frame.
pub fn encode_frame(message: &ControlMessage) -> Result<Vec<u8>, FrameError> {
    let body = serde_json::to_vec(message)?;
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Encode and write a message to the provided writer.
pub async fn write_message<W>(writer: &mut W, message: &ControlMessage) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(message)?;
    writer.write_all(&frame).await?;
    Ok(())
}

/// Errors that can occur while framing or decoding control messages.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Declared frame length exceeds the configured cap.
    #[error("frame of {len} bytes exceeds limit of {limit}")]
    Oversize { len: usize, limit: usize },
    /// Underlying stream failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// Body is not valid JSON, or a known message has malformed fields.
    #[error("invalid message body: {0}")]
    Body(#[from] serde_json::Error),
    /// Body carries no `type` string field.
    #[error("message body has no `type` field")]
    MissingType,
}

/// Error categories carried by `ERROR` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ErrorKind {
    /// Malformed traffic; terminal for the connection.
    Protocol,
    /// Command illegal in the connection's current state.
    State,
    /// A bounded resource ran out.
    Resource,
}

/// Reasons carried by `FILE_ABORT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AbortReason {
    /// Retransmission budget for a chunk was exhausted.
    Timeout,
    /// Sender violated the chunk ordering rules.
    Protocol,
    /// The per-session pending queue overflowed.
    Overflow,
    /// A participant of the session left the meeting.
    Departed,
}

/// Fully typed control message, client- and server-originated.
///
/// The wire body is a JSON object whose `type` field selects the variant;
/// remaining fields are variant-specific and camelCase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    // Client -> server.
    CreateMeeting {
        name: String,
    },
    RequestJoin {
        code: String,
        name: String,
    },
    #[serde(rename_all = "camelCase")]
    AllowJoin {
        participant_id: u32,
    },
    #[serde(rename_all = "camelCase")]
    DenyJoin {
        participant_id: u32,
    },
    Chat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<u32>,
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    FileStart {
        transfer_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<u32>,
        name: String,
        size: u64,
    },
    #[serde(rename_all = "camelCase")]
    FileChunk {
        transfer_id: u64,
        seq: u32,
        data: String,
    },
    #[serde(rename_all = "camelCase")]
    FileAck {
        transfer_id: u64,
        seq: u32,
    },
    #[serde(rename_all = "camelCase")]
    FileEnd {
        transfer_id: u64,
    },
    #[serde(rename_all = "camelCase")]
    VideoStats {
        from_media_sender: u32,
        loss: f64,
        rtt_ms: f64,
        fps: u32,
        bitrate_kbps: u32,
    },
    Leave,
    Heartbeat,
    #[serde(rename_all = "camelCase")]
    CameraStatus {
        camera_on: bool,
        mic_on: bool,
    },

    // Server -> client.
    MeetingCreated {
        code: String,
    },
    JoinPending,
    #[serde(rename_all = "camelCase")]
    JoinRequest {
        participant_id: u32,
        name: String,
    },
    JoinAccepted {
        code: String,
    },
    JoinRejected,
    #[serde(rename_all = "camelCase")]
    MemberJoined {
        participant_id: u32,
        name: String,
    },
    #[serde(rename_all = "camelCase")]
    MemberLeft {
        participant_id: u32,
        name: String,
    },
    ChatBroadcast {
        from: u32,
        text: String,
        ts: u64,
    },
    #[serde(rename_all = "camelCase")]
    FileStartForward {
        transfer_id: u64,
        from: u32,
        name: String,
        size: u64,
    },
    #[serde(rename_all = "camelCase")]
    FileChunkForward {
        transfer_id: u64,
        seq: u32,
        data: String,
    },
    #[serde(rename_all = "camelCase")]
    FileAckForward {
        transfer_id: u64,
        seq: u32,
    },
    #[serde(rename_all = "camelCase")]
    FileEndForward {
        transfer_id: u64,
    },
    #[serde(rename_all = "camelCase")]
    FileAbort {
        transfer_id: u64,
        reason: AbortReason,
    },
    #[serde(rename_all = "camelCase")]
    VideoStatsUpdate {
        reporter: u32,
        from_media_sender: u32,
        loss: f64,
        rtt_ms: f64,
        fps: u32,
        bitrate_kbps: u32,
    },
    MeetingClosed,
    Error {
        kind: ErrorKind,
        reason: String,
    },
    HeartbeatAck,
    #[serde(rename_all = "camelCase")]
    CameraStatusBroadcast {
        participant_id: u32,
        camera_on: bool,
        mic_on: bool,
    },
}

/// Every `type` tag in the catalog, used to distinguish an unknown tag from
/// a known message with malformed fields.
const KNOWN_TYPES: &[&str] = &[
    "CREATE_MEETING",
    "REQUEST_JOIN",
    "ALLOW_JOIN",
    "DENY_JOIN",
    "CHAT",
    "FILE_START",
    "FILE_CHUNK",
    "FILE_ACK",
    "FILE_END",
    "VIDEO_STATS",
    "LEAVE",
    "HEARTBEAT",
    "CAMERA_STATUS",
    "MEETING_CREATED",
    "JOIN_PENDING",
    "JOIN_REQUEST",
    "JOIN_ACCEPTED",
    "JOIN_REJECTED",
    "MEMBER_JOINED",
    "MEMBER_LEFT",
    "CHAT_BROADCAST",
    "FILE_START_FORWARD",
    "FILE_CHUNK_FORWARD",
    "FILE_ACK_FORWARD",
    "FILE_END_FORWARD",
    "FILE_ABORT",
    "VIDEO_STATS_UPDATE",
    "MEETING_CLOSED",
    "ERROR",
    "HEARTBEAT_ACK",
    "CAMERA_STATUS_BROADCAST",
];

impl ControlMessage {
    /// The wire `type` tag for this message.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::CreateMeeting { .. } => "CREATE_MEETING",
            ControlMessage::RequestJoin { .. } => "REQUEST_JOIN",
            ControlMessage::AllowJoin { .. } => "ALLOW_JOIN",
            ControlMessage::DenyJoin { .. } => "DENY_JOIN",
            ControlMessage::Chat { .. } => "CHAT",
            ControlMessage::FileStart { .. } => "FILE_START",
            ControlMessage::FileChunk { .. } => "FILE_CHUNK",
            ControlMessage::FileAck { .. } => "FILE_ACK",
            ControlMessage::FileEnd { .. } => "FILE_END",
            ControlMessage::VideoStats { .. } => "VIDEO_STATS",
            ControlMessage::Leave => "LEAVE",
            ControlMessage::Heartbeat => "HEARTBEAT",
            ControlMessage::CameraStatus { .. } => "CAMERA_STATUS",
            ControlMessage::MeetingCreated { .. } => "MEETING_CREATED",
            ControlMessage::JoinPending => "JOIN_PENDING",
            ControlMessage::JoinRequest { .. } => "JOIN_REQUEST",
            ControlMessage::JoinAccepted { .. } => "JOIN_ACCEPTED",
            ControlMessage::JoinRejected => "JOIN_REJECTED",
            ControlMessage::MemberJoined { .. } => "MEMBER_JOINED",
            ControlMessage::MemberLeft { .. } => "MEMBER_LEFT",
            ControlMessage::ChatBroadcast { .. } => "CHAT_BROADCAST",
            ControlMessage::FileStartForward { .. } => "FILE_START_FORWARD",
            ControlMessage::FileChunkForward { .. } => "FILE_CHUNK_FORWARD",
            ControlMessage::FileAckForward { .. } => "FILE_ACK_FORWARD",
            ControlMessage::FileEndForward { .. } => "FILE_END_FORWARD",
            ControlMessage::FileAbort { .. } => "FILE_ABORT",
            ControlMessage::VideoStatsUpdate { .. } => "VIDEO_STATS_UPDATE",
            ControlMessage::MeetingClosed => "MEETING_CLOSED",
            ControlMessage::Error { .. } => "ERROR",
            ControlMessage::HeartbeatAck => "HEARTBEAT_ACK",
            ControlMessage::CameraStatusBroadcast { .. } => "CAMERA_STATUS_BROADCAST",
        }
    }
}
