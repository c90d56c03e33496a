//! Wire frames
//!
//! ```text
//! +------------+---------------------------------------------------+
//! | length u32 |  bincode Envelope { id, kind, part, parts, data } |
//! +------------+---------------------------------------------------+
//! ```
//!
//! Frames are length-delimited. A message body larger than the maximum
//! frame payload is split into `parts` envelopes sharing one `id`, sent in
//! order and reassembled by the receiver. Requests and responses are
//! matched by `id`.

use crate::error::{FabricError, FabricResult};
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio_util::codec::LengthDelimitedCodec;

/// Room for the envelope header on top of the payload
const ENVELOPE_OVERHEAD: usize = 64;

/// Purpose of an envelope
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameKind {
    Request,
    Response,
    /// Response carrying a `RemoteError`
    Error,
    Ping,
    Pong,
    Close,
}

impl FrameKind {
    /// Control frames carry no body and are not reassembled
    #[must_use]
    pub const fn is_control(self) -> bool {
        matches!(self, Self::Ping | Self::Pong | Self::Close)
    }
}

/// One frame on the wire
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: u64,
    pub kind: FrameKind,
    pub part: u32,
    pub parts: u32,
    pub data: Bytes,
}

impl Envelope {
    /// Body-less control frame
    #[must_use]
    pub const fn control(kind: FrameKind, id: u64) -> Self {
        Self {
            id,
            kind,
            part: 0,
            parts: 1,
            data: Bytes::new(),
        }
    }

    pub fn encode(&self) -> FabricResult<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn decode(frame: &[u8]) -> FabricResult<Self> {
        Ok(bincode::deserialize(frame)?)
    }
}

/// Length-delimited codec sized for `max_frame_payload`
#[must_use]
pub fn codec(max_frame_payload: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_payload + ENVELOPE_OVERHEAD)
        .new_codec()
}

/// Split a message body into envelopes of at most `max_payload` bytes
#[must_use]
pub fn split_message(id: u64, kind: FrameKind, body: Bytes, max_payload: usize) -> Vec<Envelope> {
    let max_payload = max_payload.max(1);
    if body.is_empty() {
        return vec![Envelope {
            id,
            kind,
            part: 0,
            parts: 1,
            data: body,
        }];
    }
    let parts = body.len().div_ceil(max_payload);
    let parts_u32 = u32::try_from(parts).unwrap_or(u32::MAX);
    (0..parts)
        .map(|i| {
            let start = i * max_payload;
            let end = (start + max_payload).min(body.len());
            Envelope {
                id,
                kind,
                part: u32::try_from(i).unwrap_or(u32::MAX),
                parts: parts_u32,
                data: body.slice(start..end),
            }
        })
        .collect()
}

struct Partial {
    kind: FrameKind,
    parts: u32,
    received: u32,
    body: BytesMut,
}

/// Collects multi-part messages until complete
#[derive(Default)]
pub struct Reassembler {
    partial: HashMap<u64, Partial>,
}

/// A complete message
#[derive(Debug, PartialEq, Eq)]
pub struct Message {
    pub id: u64,
    pub kind: FrameKind,
    pub body: Bytes,
}

impl Reassembler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an envelope, returning the message once its last part arrives
    pub fn push(&mut self, env: Envelope) -> FabricResult<Option<Message>> {
        if env.parts == 0 || env.part >= env.parts {
            return Err(FabricError::UnexpectedResponse(format!(
                "frame {} has part {} of {}",
                env.id, env.part, env.parts
            )));
        }
        if env.parts == 1 {
            return Ok(Some(Message {
                id: env.id,
                kind: env.kind,
                body: env.data,
            }));
        }
        let partial = self.partial.entry(env.id).or_insert_with(|| Partial {
            kind: env.kind,
            parts: env.parts,
            received: 0,
            body: BytesMut::new(),
        });
        if env.part != partial.received || env.parts != partial.parts || env.kind != partial.kind {
            self.partial.remove(&env.id);
            return Err(FabricError::UnexpectedResponse(format!(
                "frame {} out of sequence at part {}",
                env.id, env.part
            )));
        }
        partial.body.extend_from_slice(&env.data);
        partial.received += 1;
        if partial.received < partial.parts {
            return Ok(None);
        }
        let done = self.partial.remove(&env.id);
        Ok(done.map(|p| Message {
            id: env.id,
            kind: p.kind,
            body: p.body.freeze(),
        }))
    }

    /// Forget a partially received message
    pub fn discard(&mut self, id: u64) {
        self.partial.remove(&id);
    }

    #[must_use]
    pub fn in_progress(&self) -> usize {
        self.partial.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_respects_max_payload() {
        let body = Bytes::from(vec![9u8; 40]);
        let parts = split_message(7, FrameKind::Request, body, 16);

        assert_eq!(parts.len(), 3);
        assert!(parts.iter().all(|p| p.data.len() <= 16 && p.parts == 3 && p.id == 7));
        assert_eq!(parts[2].data.len(), 8);
    }

    #[test]
    fn test_reassemble_interleaved_messages() {
        let a = split_message(1, FrameKind::Response, Bytes::from(vec![1u8; 10]), 4);
        let b = split_message(2, FrameKind::Response, Bytes::from(vec![2u8; 6]), 4);
        let mut r = Reassembler::new();

        assert!(r.push(a[0].clone()).unwrap().is_none());
        assert!(r.push(b[0].clone()).unwrap().is_none());
        assert!(r.push(a[1].clone()).unwrap().is_none());
        let msg_b = r.push(b[1].clone()).unwrap().unwrap();
        assert_eq!(msg_b.body.len(), 6);
        let msg_a = r.push(a[2].clone()).unwrap().unwrap();
        assert_eq!(msg_a.id, 1);
        assert_eq!(msg_a.body, Bytes::from(vec![1u8; 10]));
        assert_eq!(r.in_progress(), 0);
    }

    #[test]
    fn test_out_of_order_part_rejected() {
        let parts = split_message(3, FrameKind::Request, Bytes::from(vec![0u8; 12]), 4);
        let mut r = Reassembler::new();
        r.push(parts[0].clone()).unwrap();
        assert!(r.push(parts[2].clone()).is_err());
        assert_eq!(r.in_progress(), 0);
    }

    #[test]
    fn test_envelope_encodes_within_codec_limit() {
        let env = split_message(1, FrameKind::Request, Bytes::from(vec![5u8; 100]), 100).remove(0);
        let encoded = env.encode().unwrap();
        assert!(encoded.len() <= 100 + ENVELOPE_OVERHEAD);
        assert_eq!(Envelope::decode(&encoded).unwrap(), env);
    }
}
