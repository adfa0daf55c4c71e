//! Length-prefixed framing codec.
//!
//! Wire format: `u32_le(length) payload[length]`.
//! Works over any AsyncRead/AsyncWrite via `FramedRead`/`FramedWrite`.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Size of the little-endian length prefix.
pub const HEADER_LEN: usize = 4;

/// Default ceiling for a single frame (scene files and rendered images fit well under it).
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 256 * 1024 * 1024;

/// Failures of the byte stream underneath a connection.
///
/// Scoped to one connection: the connection closes and nothing else is affected.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("frame of {len} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { len: usize, limit: usize },

    #[error("stream ended mid-frame with {buffered} bytes buffered")]
    Truncated { buffered: usize },

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Codec that frames opaque payloads with a 4-byte little-endian length.
///
/// The header is only consumed once the whole frame is buffered, so a stream
/// ending with leftover bytes is always distinguishable from a clean close.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_length: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self {
            max_frame_length: max_frame_length.min(u32::MAX as usize),
        }
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&src[..HEADER_LEN]);
        let len = u32::from_le_bytes(header) as usize;

        if len > self.max_frame_length {
            return Err(TransportError::FrameTooLarge {
                len,
                limit: self.max_frame_length,
            });
        }

        let total = HEADER_LEN + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        tracing::trace!(frame_len = len, "Decoded frame");
        Ok(Some(payload))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(TransportError::Truncated {
                buffered: src.len(),
            }),
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = TransportError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = payload.len();
        if len > self.max_frame_length {
            return Err(TransportError::FrameTooLarge {
                len,
                limit: self.max_frame_length,
            });
        }

        tracing::trace!(frame_len = len, "Encoding frame");
        dst.reserve(HEADER_LEN + len);
        dst.put_u32_le(len as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    fn patterned(len: usize) -> Bytes {
        (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>().into()
    }

    #[test]
    fn roundtrip_across_payload_sizes() {
        for len in [0usize, 1, 65536, 10_000_000] {
            let mut codec = FrameCodec::new();
            let mut buf = BytesMut::new();
            let payload = patterned(len);

            codec.encode(payload.clone(), &mut buf).unwrap();
            assert_eq!(buf.len(), HEADER_LEN + len);

            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, payload, "payload of {len} bytes");
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn header_is_little_endian_length() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"abc"), &mut buf).unwrap();
        assert_eq!(&buf[..], &[3, 0, 0, 0, b'a', b'b', b'c']);
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[5u8, 0, 0][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&[0, b'h', b'e']);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        // Nothing consumed while incomplete.
        assert_eq!(buf.len(), 6);

        buf.extend_from_slice(b"llo");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], b"hello");
    }

    #[test]
    fn back_to_back_frames_decode_in_order() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"one"), &mut buf).unwrap();
        codec.encode(Bytes::new(), &mut buf).unwrap();
        codec.encode(Bytes::from_static(b"three"), &mut buf).unwrap();

        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"one");
        assert!(codec.decode(&mut buf).unwrap().unwrap().is_empty());
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"three");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_length_rejected_before_payload_arrives() {
        let mut codec = FrameCodec::with_max_frame_length(16);
        let mut buf = BytesMut::from(&17u32.to_le_bytes()[..]);
        match codec.decode(&mut buf) {
            Err(TransportError::FrameTooLarge { len, limit }) => {
                assert_eq!(len, 17);
                assert_eq!(limit, 16);
            }
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let mut codec = FrameCodec::with_max_frame_length(2);
        let mut buf = BytesMut::new();
        let err = codec
            .encode(Bytes::from_static(b"abc"), &mut buf)
            .unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { len: 3, limit: 2 }));
        assert!(buf.is_empty());
    }

    #[test]
    fn eof_on_frame_boundary_is_clean() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn eof_mid_frame_is_truncated() {
        let mut codec = FrameCodec::new();

        let mut header_only = BytesMut::from(&8u32.to_le_bytes()[..]);
        assert!(matches!(
            codec.decode_eof(&mut header_only),
            Err(TransportError::Truncated { buffered: 4 })
        ));

        let mut partial_header = BytesMut::from(&[1u8, 0][..]);
        assert!(matches!(
            codec.decode_eof(&mut partial_header),
            Err(TransportError::Truncated { buffered: 2 })
        ));
    }

    #[tokio::test]
    async fn framed_read_reports_truncated_stream() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&2u32.to_le_bytes());
        wire.extend_from_slice(b"ok");
        wire.extend_from_slice(&100u32.to_le_bytes());
        wire.extend_from_slice(b"short");

        let mut reader = FramedRead::new(&wire[..], FrameCodec::new());
        assert_eq!(&reader.next().await.unwrap().unwrap()[..], b"ok");
        assert!(matches!(
            reader.next().await,
            Some(Err(TransportError::Truncated { buffered: 9 }))
        ));
    }
}
