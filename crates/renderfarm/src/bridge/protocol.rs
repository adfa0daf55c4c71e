//! Wire messages between the coordinator and its workers.
//!
//! Every frame payload is a one-byte type tag followed by the fields of that
//! message. Integers are little-endian; `blob` and `string` are a `u32` length
//! followed by the bytes; a sequence is a `u32` count followed by the items.
//!
//! | Tag | Message  | Direction            | Fields                          |
//! |-----|----------|----------------------|---------------------------------|
//! | 0   | Init     | coordinator → worker | scene: blob                     |
//! | 1   | Assign   | coordinator → worker | frame: u32                      |
//! | 2   | Cancel   | coordinator → worker | frames: [u32], reason: string   |
//! | 3   | Progress | worker → coordinator | frame: u32, remaining_ms: u64   |
//! | 4   | Deliver  | worker → coordinator | frame: u32, image: blob         |
//! | 5   | Failure  | worker → coordinator | frame: u32, reason: string      |

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Index of one frame within a job's frame range.
pub type FrameIndex = u32;

/// Decoding failures for a single payload.
///
/// Scoped to the connection that sent it: that connection is closed, nothing else.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("empty payload")]
    Empty,

    #[error("unknown message tag {0}")]
    UnknownTag(u8),

    #[error("payload ended while reading {field}")]
    Truncated { field: &'static str },

    #[error("{field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },

    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    #[error("{message} is not valid in this direction")]
    Unexpected { message: &'static str },
}

/// Type discriminant written as the first payload byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Init = 0,
    Assign = 1,
    Cancel = 2,
    Progress = 3,
    Deliver = 4,
    Failure = 5,
}

impl MessageKind {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Init),
            1 => Some(Self::Assign),
            2 => Some(Self::Cancel),
            3 => Some(Self::Progress),
            4 => Some(Self::Deliver),
            5 => Some(Self::Failure),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Assign => "assign",
            Self::Cancel => "cancel",
            Self::Progress => "progress",
            Self::Deliver => "deliver",
            Self::Failure => "failure",
        }
    }
}

/// The closed set of messages carried by the protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Scene payload, sent once right after a worker connects.
    Init { scene: Bytes },

    Assign { frame: FrameIndex },

    /// Abort rendering of the listed frames.
    Cancel {
        frames: Vec<FrameIndex>,
        reason: String,
    },

    /// Estimated time left on a frame. Informational only.
    Progress {
        frame: FrameIndex,
        remaining: Duration,
    },

    Deliver { frame: FrameIndex, image: Bytes },

    Failure { frame: FrameIndex, reason: String },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Init { .. } => MessageKind::Init,
            Self::Assign { .. } => MessageKind::Assign,
            Self::Cancel { .. } => MessageKind::Cancel,
            Self::Progress { .. } => MessageKind::Progress,
            Self::Deliver { .. } => MessageKind::Deliver,
            Self::Failure { .. } => MessageKind::Failure,
        }
    }

    /// Error for a message that arrived on the wrong side of the connection.
    pub fn unexpected(&self) -> ProtocolError {
        ProtocolError::Unexpected {
            message: self.kind().as_str(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(self.kind().tag());
        match self {
            Self::Init { scene } => put_blob(&mut buf, scene),
            Self::Assign { frame } => buf.put_u32_le(*frame),
            Self::Cancel { frames, reason } => {
                buf.put_u32_le(frames.len() as u32);
                for frame in frames {
                    buf.put_u32_le(*frame);
                }
                put_blob(&mut buf, reason.as_bytes());
            }
            Self::Progress { frame, remaining } => {
                buf.put_u32_le(*frame);
                buf.put_u64_le(u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX));
            }
            Self::Deliver { frame, image } => {
                buf.put_u32_le(*frame);
                put_blob(&mut buf, image);
            }
            Self::Failure { frame, reason } => {
                buf.put_u32_le(*frame);
                put_blob(&mut buf, reason.as_bytes());
            }
        }
        buf.freeze()
    }

    /// Decode one payload. Blob fields are sliced out of `payload` without copying.
    pub fn decode(payload: Bytes) -> Result<Self, ProtocolError> {
        let mut fields = FieldReader { buf: payload };
        let tag = fields.u8()?;
        let kind = MessageKind::from_tag(tag).ok_or(ProtocolError::UnknownTag(tag))?;

        let message = match kind {
            MessageKind::Init => Self::Init {
                scene: fields.blob("scene")?,
            },
            MessageKind::Assign => Self::Assign {
                frame: fields.u32("frame")?,
            },
            MessageKind::Cancel => {
                let count = fields.u32("frame count")? as usize;
                // Each entry is 4 bytes; reject counts the payload cannot hold before allocating.
                if fields.buf.remaining() < count.saturating_mul(4) {
                    return Err(ProtocolError::Truncated { field: "frames" });
                }
                let mut frames = Vec::with_capacity(count);
                for _ in 0..count {
                    frames.push(fields.u32("frames")?);
                }
                Self::Cancel {
                    frames,
                    reason: fields.string("reason")?,
                }
            }
            MessageKind::Progress => Self::Progress {
                frame: fields.u32("frame")?,
                remaining: Duration::from_millis(fields.u64("remaining")?),
            },
            MessageKind::Deliver => Self::Deliver {
                frame: fields.u32("frame")?,
                image: fields.blob("image")?,
            },
            MessageKind::Failure => Self::Failure {
                frame: fields.u32("frame")?,
                reason: fields.string("reason")?,
            },
        };

        fields.finish()?;
        Ok(message)
    }

    fn encoded_len(&self) -> usize {
        1 + match self {
            Self::Init { scene } => 4 + scene.len(),
            Self::Assign { .. } => 4,
            Self::Cancel { frames, reason } => 4 + frames.len() * 4 + 4 + reason.len(),
            Self::Progress { .. } => 12,
            Self::Deliver { image, .. } => 8 + image.len(),
            Self::Failure { reason, .. } => 8 + reason.len(),
        }
    }
}

fn put_blob(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32_le(bytes.len() as u32);
    buf.put_slice(bytes);
}

struct FieldReader {
    buf: Bytes,
}

impl FieldReader {
    fn u8(&mut self) -> Result<u8, ProtocolError> {
        if !self.buf.has_remaining() {
            return Err(ProtocolError::Empty);
        }
        Ok(self.buf.get_u8())
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, ProtocolError> {
        if self.buf.remaining() < 4 {
            return Err(ProtocolError::Truncated { field });
        }
        Ok(self.buf.get_u32_le())
    }

    fn u64(&mut self, field: &'static str) -> Result<u64, ProtocolError> {
        if self.buf.remaining() < 8 {
            return Err(ProtocolError::Truncated { field });
        }
        Ok(self.buf.get_u64_le())
    }

    fn blob(&mut self, field: &'static str) -> Result<Bytes, ProtocolError> {
        let len = self.u32(field)? as usize;
        if self.buf.remaining() < len {
            return Err(ProtocolError::Truncated { field });
        }
        Ok(self.buf.split_to(len))
    }

    fn string(&mut self, field: &'static str) -> Result<String, ProtocolError> {
        let bytes = self.blob(field)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8 { field })
    }

    fn finish(self) -> Result<(), ProtocolError> {
        match self.buf.remaining() {
            0 => Ok(()),
            n => Err(ProtocolError::TrailingBytes(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(bytes: &[u8]) -> String {
        bytes
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn init_layout() {
        let msg = Message::Init {
            scene: Bytes::from_static(&[0x01, 0x02]),
        };
        insta::assert_snapshot!(hex(&msg.encode()), @"00 02 00 00 00 01 02");
    }

    #[test]
    fn assign_layout() {
        let msg = Message::Assign { frame: 42 };
        insta::assert_snapshot!(hex(&msg.encode()), @"01 2a 00 00 00");
    }

    #[test]
    fn cancel_layout() {
        let msg = Message::Cancel {
            frames: vec![1, 2],
            reason: "stop".to_string(),
        };
        insta::assert_snapshot!(
            hex(&msg.encode()),
            @"02 02 00 00 00 01 00 00 00 02 00 00 00 04 00 00 00 73 74 6f 70"
        );
    }

    #[test]
    fn progress_layout() {
        let msg = Message::Progress {
            frame: 7,
            remaining: Duration::from_millis(1500),
        };
        insta::assert_snapshot!(hex(&msg.encode()), @"03 07 00 00 00 dc 05 00 00 00 00 00 00");
    }

    #[test]
    fn deliver_layout() {
        let msg = Message::Deliver {
            frame: 9,
            image: Bytes::from_static(b"png"),
        };
        insta::assert_snapshot!(hex(&msg.encode()), @"04 09 00 00 00 03 00 00 00 70 6e 67");
    }

    #[test]
    fn failure_layout() {
        let msg = Message::Failure {
            frame: 3,
            reason: "oom".to_string(),
        };
        insta::assert_snapshot!(hex(&msg.encode()), @"05 03 00 00 00 03 00 00 00 6f 6f 6d");
    }

    #[test]
    fn decodes_every_kind() {
        let messages = vec![
            Message::Init {
                scene: Bytes::from_static(b"scene-bytes"),
            },
            Message::Assign { frame: u32::MAX },
            Message::Cancel {
                frames: vec![],
                reason: String::new(),
            },
            Message::Progress {
                frame: 0,
                remaining: Duration::from_secs(90),
            },
            Message::Deliver {
                frame: 12,
                image: Bytes::new(),
            },
            Message::Failure {
                frame: 4,
                reason: "renderer crashed: exit 139".to_string(),
            },
        ];
        for msg in messages {
            assert_eq!(Message::decode(msg.encode()).unwrap(), msg);
        }
    }

    #[test]
    fn progress_truncates_to_whole_millis() {
        let msg = Message::Progress {
            frame: 1,
            remaining: Duration::from_micros(2_500),
        };
        let decoded = Message::decode(msg.encode()).unwrap();
        assert_eq!(
            decoded,
            Message::Progress {
                frame: 1,
                remaining: Duration::from_millis(2)
            }
        );
    }

    #[test]
    fn empty_payload_rejected() {
        assert_eq!(Message::decode(Bytes::new()), Err(ProtocolError::Empty));
    }

    #[test]
    fn unknown_tag_rejected() {
        let err = Message::decode(Bytes::from_static(&[6, 0, 0, 0, 0])).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownTag(6));
    }

    #[test]
    fn truncated_fields_rejected() {
        assert_eq!(
            Message::decode(Bytes::from_static(&[1, 0, 0])),
            Err(ProtocolError::Truncated { field: "frame" })
        );
        // Deliver claims a 10-byte image but carries 2.
        assert_eq!(
            Message::decode(Bytes::from_static(&[4, 1, 0, 0, 0, 10, 0, 0, 0, 0xff, 0xff])),
            Err(ProtocolError::Truncated { field: "image" })
        );
        // Cancel claims a million frames.
        assert_eq!(
            Message::decode(Bytes::from_static(&[2, 0x40, 0x42, 0x0f, 0x00, 1, 0, 0, 0])),
            Err(ProtocolError::Truncated { field: "frames" })
        );
    }

    #[test]
    fn trailing_bytes_rejected() {
        let err = Message::decode(Bytes::from_static(&[1, 5, 0, 0, 0, 0xaa])).unwrap_err();
        assert_eq!(err, ProtocolError::TrailingBytes(1));
    }

    #[test]
    fn invalid_utf8_reason_rejected() {
        let err = Message::decode(Bytes::from_static(&[5, 1, 0, 0, 0, 2, 0, 0, 0, 0xc3, 0x28]))
            .unwrap_err();
        assert_eq!(err, ProtocolError::InvalidUtf8 { field: "reason" });
    }

    #[test]
    fn unexpected_names_the_message() {
        let err = Message::Assign { frame: 1 }.unexpected();
        assert_eq!(err.to_string(), "assign is not valid in this direction");
    }
}
