//! Fixed-layout datagram headers for the media relay.
//!
//! Every media datagram starts with a one-byte kind, the originating
//! participant id, kind-specific fields, and a declared payload length, all
//! big-endian. The relay validates the declared length against the received
//! datagram size and forwards the datagram unchanged.

use thiserror::Error;

/// Kind byte for video frames.
pub const KIND_VIDEO: u8 = 0x01;
/// Kind byte for audio frames.
pub const KIND_AUDIO: u8 = 0x02;

/// Bytes preceding the payload of a video datagram.
/// kind(1) + participant(4) + frame(4) + timestamp(8) + seq(4) + w(2) + h(2) + len(4).
pub const VIDEO_HEADER_SIZE: usize = 29;
/// Bytes preceding the payload of an audio datagram.
/// kind(1) + participant(4) + audio(4) + timestamp(8) + rate(2) + channels(1) + len(4).
pub const AUDIO_HEADER_SIZE: usize = 24;

/// Header of a video datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoHeader {
    pub participant: u32,
    pub frame_id: u32,
    /// Monotonic microsecond timestamp stamped by the sender.
    pub timestamp_us: u64,
    pub sequence: u32,
    pub width: u16,
    pub height: u16,
    pub payload_len: u32,
}

/// Header of an audio datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioHeader {
    pub participant: u32,
    pub audio_id: u32,
    pub timestamp_us: u64,
    pub sample_rate: u16,
    pub channels: u8,
    pub payload_len: u32,
}

/// Parsed media header, either shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaHeader {
    Video(VideoHeader),
    Audio(AudioHeader),
}

/// Reasons a datagram fails header validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MediaParseError {
    #[error("empty datagram")]
    Empty,
    #[error("unknown media kind byte {0:#04x}")]
    UnknownKind(u8),
    #[error("datagram of {len} bytes is shorter than the {expected}-byte header")]
    Truncated { len: usize, expected: usize },
    #[error("declared payload of {declared} bytes, datagram carries {actual}")]
    LengthMismatch { declared: u32, actual: usize },
}

impl MediaHeader {
    /// Parse and validate a datagram's header against its full length.
    pub fn parse(datagram: &[u8]) -> Result<Self, MediaParseError> {
        let kind = *datagram.first().ok_or(MediaParseError::Empty)?;
        match kind {
            KIND_VIDEO => {
                if datagram.len() < VIDEO_HEADER_SIZE {
                    return Err(MediaParseError::Truncated {
                        len: datagram.len(),
                        expected: VIDEO_HEADER_SIZE,
                    });
                }
                let header = VideoHeader {
                    participant: be_u32(&datagram[1..5]),
                    frame_id: be_u32(&datagram[5..9]),
                    timestamp_us: be_u64(&datagram[9..17]),
                    sequence: be_u32(&datagram[17..21]),
                    width: be_u16(&datagram[21..23]),
                    height: be_u16(&datagram[23..25]),
                    payload_len: be_u32(&datagram[25..29]),
                };
                let actual = datagram.len() - VIDEO_HEADER_SIZE;
                if header.payload_len as usize != actual {
                    return Err(MediaParseError::LengthMismatch {
                        declared: header.payload_len,
                        actual,
                    });
                }
                Ok(MediaHeader::Video(header))
            }
            KIND_AUDIO => {
                if datagram.len() < AUDIO_HEADER_SIZE {
                    return Err(MediaParseError::Truncated {
                        len: datagram.len(),
                        expected: AUDIO_HEADER_SIZE,
                    });
                }
                let header = AudioHeader {
                    participant: be_u32(&datagram[1..5]),
                    audio_id: be_u32(&datagram[5..9]),
                    timestamp_us: be_u64(&datagram[9..17]),
                    sample_rate: be_u16(&datagram[17..19]),
                    channels: datagram[19],
                    payload_len: be_u32(&datagram[20..24]),
                };
                let actual = datagram.len() - AUDIO_HEADER_SIZE;
                if header.payload_len as usize != actual {
                    return Err(MediaParseError::LengthMismatch {
                        declared: header.payload_len,
                        actual,
                    });
                }
                Ok(MediaHeader::Audio(header))
            }
            other => Err(MediaParseError::UnknownKind(other)),
        }
    }

    /// Originating participant id, common to both shapes.
    pub fn participant(&self) -> u32 {
        match self {
            MediaHeader::Video(h) => h.participant,
            MediaHeader::Audio(h) => h.participant,
        }
    }
}

impl VideoHeader {
    /// Serialize the header, without payload.
    pub fn encode(&self) -> [u8; VIDEO_HEADER_SIZE] {
        let mut out = [0u8; VIDEO_HEADER_SIZE];
        out[0] = KIND_VIDEO;
        out[1..5].copy_from_slice(&self.participant.to_be_bytes());
        out[5..9].copy_from_slice(&self.frame_id.to_be_bytes());
        out[9..17].copy_from_slice(&self.timestamp_us.to_be_bytes());
        out[17..21].copy_from_slice(&self.sequence.to_be_bytes());
        out[21..23].copy_from_slice(&self.width.to_be_bytes());
        out[23..25].copy_from_slice(&self.height.to_be_bytes());
        out[25..29].copy_from_slice(&self.payload_len.to_be_bytes());
        out
    }
}

impl AudioHeader {
    /// Serialize the header, without payload.
    pub fn encode(&self) -> [u8; AUDIO_HEADER_SIZE] {
        let mut out = [0u8; AUDIO_HEADER_SIZE];
        out[0] = KIND_AUDIO;
        out[1..5].copy_from_slice(&self.participant.to_be_bytes());
        out[5..9].copy_from_slice(&self.audio_id.to_be_bytes());
        out[9..17].copy_from_slice(&self.timestamp_us.to_be_bytes());
        out[17..19].copy_from_slice(&self.sample_rate.to_be_bytes());
        out[19] = self.channels;
        out[20..24].copy_from_slice(&self.payload_len.to_be_bytes());
        out
    }
}

fn be_u16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn be_u64(bytes: &[u8]) -> u64 {
    u64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}
