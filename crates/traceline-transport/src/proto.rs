// Copyright 2025-Present Traceline, Inc. https://traceline.dev/
// SPDX-License-Identifier: Apache-2.0

//! IPC wire protocol between the host process and the worker.
//!
//! Every message is `[4-byte LE message-type id][4-byte LE body length]
//! [body]`. Bodies are JSON. The reader reassembles complete frames from a
//! rolling buffer, so partial writes and coalesced reads are both fine.

use serde::{Deserialize, Serialize};
use tokio_util::bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use traceline_core::TraceEnvelope;

use crate::error::TransportError;

pub const FRAME_HEADER_LEN: usize = 8;

/// Guard against a corrupt length prefix pinning the buffer.
const MAX_BODY_LEN: u32 = 16 * 1024 * 1024;

const MSG_HELLO: u32 = 1;
const MSG_TRACE: u32 = 2;
const MSG_ERROR: u32 = 3;

/// Handshake: sent by every client right after connecting. The relaunch
/// command is what the worker execs when a newer peer shows up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub version: String,
    pub relaunch_command: Vec<String>,
}

impl Hello {
    /// Segment-wise numeric version comparison; a malformed segment
    /// compares as zero.
    pub fn newer_than(&self, version: &str) -> bool {
        let parse = |v: &str| -> Vec<u64> {
            v.split('.')
                .map(|seg| seg.parse::<u64>().unwrap_or(0))
                .collect()
        };
        parse(&self.version) > parse(version)
    }
}

/// Agent-internal failure surfaced to the worker as an event, never as an
/// exception on the host path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalError {
    pub reason: String,
    pub details: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Hello(Hello),
    Trace(TraceEnvelope),
    InternalError(InternalError),
}

impl Message {
    fn type_id(&self) -> u32 {
        match self {
            Message::Hello(_) => MSG_HELLO,
            Message::Trace(_) => MSG_TRACE,
            Message::InternalError(_) => MSG_ERROR,
        }
    }

    fn encode_body(&self) -> Result<Vec<u8>, TransportError> {
        let result = match self {
            Message::Hello(hello) => serde_json::to_vec(hello),
            Message::Trace(envelope) => serde_json::to_vec(envelope),
            Message::InternalError(error) => serde_json::to_vec(error),
        };
        result.map_err(|e| TransportError::Proto(e.to_string()))
    }

    fn decode_body(type_id: u32, body: &[u8]) -> Result<Message, TransportError> {
        let parsed = match type_id {
            MSG_HELLO => serde_json::from_slice(body).map(Message::Hello),
            MSG_TRACE => serde_json::from_slice(body).map(Message::Trace),
            MSG_ERROR => serde_json::from_slice(body).map(Message::InternalError),
            other => return Err(TransportError::UnknownMessage(other)),
        };
        parsed.map_err(|e| TransportError::Proto(e.to_string()))
    }
}

/// Encode one message as a complete frame.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, TransportError> {
    let body = msg.encode_body()?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(&msg.type_id().to_le_bytes());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Rolling reassembly buffer for the synchronous reader side.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> FrameBuffer {
        FrameBuffer::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete message, if a full frame has arrived.
    pub fn next_message(&mut self) -> Result<Option<Message>, TransportError> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let type_id = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        let body_len = u32::from_le_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]);
        if body_len > MAX_BODY_LEN {
            return Err(TransportError::Proto(format!(
                "frame body of {body_len} bytes exceeds limit"
            )));
        }

        let total = FRAME_HEADER_LEN + body_len as usize;
        if self.buf.len() < total {
            return Ok(None);
        }

        let msg = Message::decode_body(type_id, &self.buf[FRAME_HEADER_LEN..total])?;
        self.buf.drain(..total);
        Ok(Some(msg))
    }
}

/// tokio-util codec over the same frame format, for the worker's async
/// reader tasks.
#[derive(Debug, Default)]
pub struct IpcCodec;

impl Decoder for IpcCodec {
    type Item = Message;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, TransportError> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let type_id = u32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        let body_len = u32::from_le_bytes([src[4], src[5], src[6], src[7]]);
        if body_len > MAX_BODY_LEN {
            return Err(TransportError::Proto(format!(
                "frame body of {body_len} bytes exceeds limit"
            )));
        }

        let total = FRAME_HEADER_LEN + body_len as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let frame = src.split_to(total);
        Message::decode_body(type_id, &frame[FRAME_HEADER_LEN..]).map(Some)
    }
}

impl Encoder<Message> for IpcCodec {
    type Error = TransportError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), TransportError> {
        let body = msg.encode_body()?;
        dst.reserve(FRAME_HEADER_LEN + body.len());
        dst.put_u32_le(msg.type_id());
        dst.put_u32_le(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use traceline_core::trace::Component;

    fn hello() -> Message {
        Message::Hello(Hello {
            version: "0.1.0".to_owned(),
            relaunch_command: vec!["traceline-worker".to_owned()],
        })
    }

    fn envelope() -> Message {
        Message::Trace(TraceEnvelope {
            uuid: "abc".to_owned(),
            endpoint: "Endpoint#a".to_owned(),
            segment: None,
            component: Component::Web,
            completed_at: 100,
            payload: vec![1, 2, 3],
        })
    }

    #[test]
    fn frame_round_trip() {
        let mut buffer = FrameBuffer::new();
        buffer.extend(&encode_frame(&hello()).unwrap());
        assert_eq!(buffer.next_message().unwrap(), Some(hello()));
        assert_eq!(buffer.next_message().unwrap(), None);
    }

    #[test]
    fn reassembles_across_partial_reads() {
        let frame = encode_frame(&envelope()).unwrap();
        let mut buffer = FrameBuffer::new();

        for chunk in frame.chunks(3) {
            buffer.extend(chunk);
        }
        assert_eq!(buffer.next_message().unwrap(), Some(envelope()));
    }

    #[test]
    fn drains_multiple_frames_greedily() {
        let mut bytes = encode_frame(&hello()).unwrap();
        bytes.extend(encode_frame(&envelope()).unwrap());

        let mut buffer = FrameBuffer::new();
        buffer.extend(&bytes);
        assert_eq!(buffer.next_message().unwrap(), Some(hello()));
        assert_eq!(buffer.next_message().unwrap(), Some(envelope()));
        assert_eq!(buffer.next_message().unwrap(), None);
    }

    #[test]
    fn unknown_message_id_is_a_protocol_error() {
        let mut frame = encode_frame(&hello()).unwrap();
        frame[0] = 0xFF;
        let mut buffer = FrameBuffer::new();
        buffer.extend(&frame);
        assert!(matches!(
            buffer.next_message(),
            Err(TransportError::UnknownMessage(_))
        ));
    }

    #[test]
    fn oversize_length_prefix_is_rejected() {
        let mut buffer = FrameBuffer::new();
        let mut header = Vec::new();
        header.extend_from_slice(&MSG_HELLO.to_le_bytes());
        header.extend_from_slice(&u32::MAX.to_le_bytes());
        buffer.extend(&header);
        assert!(matches!(
            buffer.next_message(),
            Err(TransportError::Proto(_))
        ));
    }

    #[test]
    fn codec_matches_the_sync_framing() {
        let mut codec = IpcCodec;
        let mut bytes = BytesMut::new();
        codec.encode(envelope(), &mut bytes).unwrap();

        // The async codec must accept frames produced by the sync path.
        assert_eq!(&bytes[..], &encode_frame(&envelope()).unwrap()[..]);

        let decoded = codec.decode(&mut bytes).unwrap();
        assert_eq!(decoded, Some(envelope()));
        assert!(bytes.is_empty());
    }

    #[test]
    fn codec_waits_for_a_full_frame() {
        let mut codec = IpcCodec;
        let frame = encode_frame(&hello()).unwrap();
        let mut bytes = BytesMut::from(&frame[..frame.len() - 1]);
        assert_eq!(codec.decode(&mut bytes).unwrap(), None);
        bytes.extend_from_slice(&frame[frame.len() - 1..]);
        assert_eq!(codec.decode(&mut bytes).unwrap(), Some(hello()));
    }

    #[test]
    fn version_comparison_is_numeric() {
        let hello = Hello {
            version: "0.10.0".to_owned(),
            relaunch_command: vec![],
        };
        assert!(hello.newer_than("0.9.9"));
        assert!(!hello.newer_than("0.10.0"));
        assert!(!hello.newer_than("1.0.0"));
    }
}
