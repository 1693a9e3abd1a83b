//! Frame encoding for relay traffic.
//!
//! JSON text frames are the default. CBOR binary frames are always accepted
//! and emitted when an endpoint is configured for binary frames.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::SyncResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireEncoding {
    #[default]
    Json,
    Cbor,
}

impl WireEncoding {
    pub fn from_binary_flag(binary: bool) -> Self {
        if binary {
            WireEncoding::Cbor
        } else {
            WireEncoding::Json
        }
    }
}

/// Transport-neutral websocket payload
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

pub fn encode<T: Serialize>(value: &T, encoding: WireEncoding) -> SyncResult<Frame> {
    Ok(match encoding {
        WireEncoding::Json => Frame::Text(serde_json::to_string(value)?),
        WireEncoding::Cbor => Frame::Binary(serde_cbor::to_vec(value)?),
    })
}

pub fn decode<T: DeserializeOwned>(frame: &Frame) -> SyncResult<T> {
    match frame {
        Frame::Text(text) => decode_text(text),
        Frame::Binary(bytes) => decode_binary(bytes),
    }
}

pub fn decode_text<T: DeserializeOwned>(text: &str) -> SyncResult<T> {
    Ok(serde_json::from_str(text)?)
}

pub fn decode_binary<T: DeserializeOwned>(bytes: &[u8]) -> SyncResult<T> {
    Ok(serde_cbor::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ChangeNotification, RelayEvent, RelayRequest};
    use serde_json::json;

    #[test]
    fn cbor_frames_carry_structured_payloads() {
        let change = ChangeNotification::new("x1", "Transform", json!("{\"x\":1,\"y\":2}"))
            .with_sequence(4)
            .with_source("Alice");
        let request = RelayRequest::SendChange {
            project_id: "p1".into(),
            change: change.clone(),
        };

        let frame = encode(&request, WireEncoding::Cbor).unwrap();
        assert!(matches!(frame, Frame::Binary(_)));
        let decoded: RelayRequest = decode(&frame).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn json_is_the_default_encoding() {
        let event = RelayEvent::Error {
            message: "boom".into(),
        };
        let frame = encode(&event, WireEncoding::default()).unwrap();
        match &frame {
            Frame::Text(text) => assert!(text.contains("\"Error\"")),
            Frame::Binary(_) => panic!("expected text frame"),
        }
    }

    #[test]
    fn garbage_is_a_serialization_error() {
        let result = decode_text::<RelayRequest>("not json");
        assert!(matches!(result, Err(crate::SyncError::Serialization(_))));
    }
}
