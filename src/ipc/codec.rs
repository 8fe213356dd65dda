//! Wire framing for the control socket.
//!
//! Length-prefixed frames carrying one JSON-encoded [`IpcMessage`] each.
//! Framing errors poison only the connection they occur on.

use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::error::IpcError;
use crate::ipc::message::IpcMessage;

/// Upper bound on one frame; a config snapshot is the largest payload.
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

pub struct MessageCodec {
    inner: LengthDelimitedCodec,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_BYTES)
                .new_codec(),
        }
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MessageCodec {
    type Item = IpcMessage;
    type Error = IpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<IpcMessage>, IpcError> {
        let Some(frame) = self.inner.decode(src)? else {
            return Ok(None);
        };
        serde_json::from_slice(&frame)
            .map(Some)
            .map_err(|e| IpcError::Malformed(e.to_string()))
    }
}

impl Encoder<IpcMessage> for MessageCodec {
    type Error = IpcError;

    fn encode(&mut self, msg: IpcMessage, dst: &mut BytesMut) -> Result<(), IpcError> {
        let body = serde_json::to_vec(&msg).map_err(|e| IpcError::Malformed(e.to_string()))?;
        self.inner
            .encode(Bytes::from(body), dst)
            .map_err(IpcError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frame_roundtrip() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        let msg = IpcMessage::event("media.ready", json!(true));
        codec.encode(msg.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.id, msg.id);
        assert_eq!(decoded.name, "media.ready");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn partial_frame_waits_for_more() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(IpcMessage::event("x", json!(null)), &mut buf)
            .unwrap();
        let full = buf.split();
        let mut partial = BytesMut::from(&full[..full.len() - 2]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full[full.len() - 2..]);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn garbage_is_malformed_not_panic() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        // Valid length prefix, invalid JSON body.
        buf.extend_from_slice(&4u32.to_be_bytes());
        buf.extend_from_slice(b"!!!!");
        assert!(matches!(codec.decode(&mut buf), Err(IpcError::Malformed(_))));
    }
}
