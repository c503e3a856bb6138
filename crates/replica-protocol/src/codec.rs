//! Length-prefixed MessagePack framing
//!
//! ```text
//! +----------------+---------------------------+
//! | len: u32 (BE)  | MessagePack body (len B)  |
//! +----------------+---------------------------+
//! ```

use crate::error::{ProtocolError, ProtocolResult};
use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Maximum frame body size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 4;

/// Appends one frame for `value` to `buf`.
pub fn encode_into<T: Serialize>(value: &T, buf: &mut BytesMut) -> ProtocolResult<()> {
    // Named encoding keeps internally tagged enums decodable.
    let body = rmp_serde::to_vec_named(value)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: body.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    buf.reserve(HEADER_LEN + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    Ok(())
}

pub fn encode<T: Serialize>(value: &T) -> ProtocolResult<BytesMut> {
    let mut buf = BytesMut::new();
    encode_into(value, &mut buf)?;
    Ok(buf)
}

/// Incremental frame decoder.
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Add received bytes to the buffer
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes not yet consumed by [`decode`](Self::decode).
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Try to decode one complete frame. `Ok(None)` means more bytes are
    /// needed.
    pub fn decode<T: DeserializeOwned>(&mut self) -> ProtocolResult<Option<T>> {
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }
        if self.buffer.len() < HEADER_LEN + len {
            return Ok(None);
        }

        self.buffer.advance(HEADER_LEN);
        let body = self.buffer.split_to(len);
        Ok(Some(rmp_serde::from_slice(&body)?))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Textual rendering for logs and diagnostics.
pub fn to_json<T: Serialize>(value: &T) -> ProtocolResult<String> {
    Ok(serde_json::to_string(value)?)
}

pub fn from_json<T: DeserializeOwned>(text: &str) -> ProtocolResult<T> {
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Reply, ReplyValue, Request, RequestBody, ServerMessage};
    use crate::message::ProxyMessage;
    use replica_core::{CrdtData, CrdtKind, CrdtOperation, FieldValue, RawEntity, StorageKey, VersionMap};
    use replica_core::crdt::SetOperation;

    fn sample_request() -> Request {
        let op = CrdtOperation::Set(SetOperation::Add {
            actor: "alice".into(),
            clock: VersionMap::from_entries([("alice", 1)]),
            added: FieldValue::from(
                RawEntity::new("e1").with_singleton("n", Some(FieldValue::Primitive(
                    replica_core::Primitive::Number(1.5),
                ))),
            ),
        });
        Request {
            seq: 7,
            body: RequestBody::SendProxyMessage {
                token: 3,
                message: ProxyMessage::operations(vec![op], Some(3)),
            },
        }
    }

    #[test]
    fn test_frames_split_across_reads() {
        let request = sample_request();
        let register = Request {
            seq: 8,
            body: RequestBody::RegisterCallback {
                storage_key: StorageKey::reference_mode(
                    StorageKey::ramdisk("b"),
                    StorageKey::ramdisk("c"),
                ),
                kind: CrdtKind::Set,
            },
        };
        let mut wire = encode(&request).unwrap();
        encode_into(&register, &mut wire).unwrap();

        let mut decoder = FrameDecoder::new();
        let (first, second) = wire.split_at(5);
        decoder.feed(first);
        assert_eq!(decoder.decode::<Request>().unwrap(), None);
        decoder.feed(second);
        assert_eq!(decoder.decode::<Request>().unwrap(), Some(request));
        assert_eq!(decoder.decode::<Request>().unwrap(), Some(register));
        assert_eq!(decoder.decode::<Request>().unwrap(), None);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_server_messages_decode() {
        let messages = vec![
            ServerMessage::Reply(Reply {
                seq: 1,
                result: Ok(ReplyValue::Token(4)),
            }),
            ServerMessage::Reply(Reply {
                seq: 2,
                result: Err("no such token".into()),
            }),
            ServerMessage::Push {
                token: 4,
                message: ProxyMessage::model_update(CrdtData::empty(CrdtKind::Count), Some(4)),
            },
        ];
        let mut decoder = FrameDecoder::new();
        for message in &messages {
            decoder.feed(&encode(message).unwrap());
        }
        for message in messages {
            assert_eq!(decoder.decode::<ServerMessage>().unwrap(), Some(message));
        }
    }

    #[test]
    fn test_oversized_header_is_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&u32::MAX.to_be_bytes());
        assert!(matches!(
            decoder.decode::<Request>(),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_json_diagnostics() {
        let request = sample_request();
        let text = to_json(&request).unwrap();
        assert!(text.contains("send_proxy_message"));
        assert_eq!(from_json::<Request>(&text).unwrap(), request);
    }
}
