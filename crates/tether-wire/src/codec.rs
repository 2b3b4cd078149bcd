//! Text ↔ frame codec.
//!
//! One frame per socket message; the socket layer is message-oriented, so no
//! additional length framing is applied. Parsing is tolerant of unknown
//! optional fields (forward compatibility) and strict about the protocol tag
//! and the mandatory fields.

use serde_json::Value;
use thiserror::Error;

use crate::frame::{RequestFrame, ResponseFrame};
use crate::PROTOCOL;

/// Request `type` values the codec understands.
const REQUEST_TYPES: &[&str] = &[
    "FunctionCall",
    "MethodCall",
    "NewObject",
    "DisposeObject",
    "DisposeObservable",
];

/// A parsed inbound frame.
#[derive(Debug, Clone)]
pub enum Frame {
    Request(RequestFrame),
    Response(ResponseFrame),
}

impl Frame {
    pub fn request_id(&self) -> u64 {
        match self {
            Frame::Request(req) => req.request_id,
            Frame::Response(resp) => resp.request_id,
        }
    }
}

/// Protocol violations raised while parsing a frame.
///
/// Both variants are logged and the frame dropped; the connection survives.
#[derive(Debug, Clone, Error)]
pub enum WireCodecError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("unknown message type {0:?}")]
    UnknownMessageType(String),
}

/// Parse one text message into a frame.
///
/// Fails with [`WireCodecError::MalformedFrame`] if the payload is not valid
/// JSON, the `protocol` tag does not match [`PROTOCOL`], or a mandatory field
/// is missing; with [`WireCodecError::UnknownMessageType`] if the request
/// `type` is not recognized. Unrecognized optional fields are ignored.
pub fn decode_frame(text: &str) -> Result<Frame, WireCodecError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| WireCodecError::MalformedFrame(format!("invalid JSON: {e}")))?;

    let object = value
        .as_object()
        .ok_or_else(|| WireCodecError::MalformedFrame("frame is not an object".to_string()))?;

    match object.get("protocol").and_then(Value::as_str) {
        Some(tag) if tag == PROTOCOL => {}
        Some(tag) => {
            return Err(WireCodecError::MalformedFrame(format!(
                "unexpected protocol tag {tag:?}"
            )))
        }
        None => {
            return Err(WireCodecError::MalformedFrame(
                "missing protocol tag".to_string(),
            ))
        }
    }

    if !object.contains_key("channel") {
        return Err(WireCodecError::MalformedFrame(
            "missing channel".to_string(),
        ));
    }
    if object.get("requestId").and_then(Value::as_u64).is_none() {
        return Err(WireCodecError::MalformedFrame(
            "missing or non-integer requestId".to_string(),
        ));
    }

    if let Some(type_field) = object.get("type") {
        let type_name = type_field
            .as_str()
            .ok_or_else(|| {
                WireCodecError::MalformedFrame("type field is not a string".to_string())
            })?
            .to_string();
        if !REQUEST_TYPES.contains(&type_name.as_str()) {
            return Err(WireCodecError::UnknownMessageType(type_name.to_string()));
        }
        let request: RequestFrame = serde_json::from_value(value)
            .map_err(|e| WireCodecError::MalformedFrame(format!("bad {type_name} frame: {e}")))?;
        Ok(Frame::Request(request))
    } else if object.contains_key("hadError") {
        let response: ResponseFrame = serde_json::from_value(value)
            .map_err(|e| WireCodecError::MalformedFrame(format!("bad response frame: {e}")))?;
        Ok(Frame::Response(response))
    } else {
        Err(WireCodecError::MalformedFrame(
            "frame carries neither type nor hadError".to_string(),
        ))
    }
}

/// Serialize a request frame to its wire text.
pub fn encode_request(frame: &RequestFrame) -> Result<String, serde_json::Error> {
    serde_json::to_string(frame)
}

/// Serialize a response frame to its wire text.
pub fn encode_response(frame: &ResponseFrame) -> Result<String, serde_json::Error> {
    serde_json::to_string(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Channel, RequestBody};
    use serde_json::json;

    #[test]
    fn test_decode_request() {
        let text = r#"{"protocol":"tether.v1","channel":"rpc","requestId":1,
                       "type":"FunctionCall","function":"add","args":[2,3]}"#;
        let frame = decode_frame(text).unwrap();
        match frame {
            Frame::Request(req) => {
                assert_eq!(req.request_id, 1);
                assert_eq!(req.channel, Channel::Rpc);
                match req.body {
                    RequestBody::FunctionCall { function, args } => {
                        assert_eq!(function, "add");
                        assert_eq!(args, vec![json!(2), json!(3)]);
                    }
                    other => panic!("unexpected body: {other:?}"),
                }
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_decode_response() {
        let text = r#"{"protocol":"tether.v1","channel":"rpc","requestId":1,
                       "hadError":false,"result":5}"#;
        match decode_frame(text).unwrap() {
            Frame::Response(resp) => {
                assert!(!resp.had_error);
                assert_eq!(resp.result, Some(json!(5)));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_invalid_json_is_malformed() {
        assert!(matches!(
            decode_frame("{not json"),
            Err(WireCodecError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_wrong_protocol_is_malformed() {
        let text = r#"{"protocol":"other.v9","channel":"rpc","requestId":1,"hadError":false}"#;
        assert!(matches!(
            decode_frame(text),
            Err(WireCodecError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_missing_request_id_is_malformed() {
        let text = r#"{"protocol":"tether.v1","channel":"rpc","hadError":false}"#;
        assert!(matches!(
            decode_frame(text),
            Err(WireCodecError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_unknown_type_is_distinguished() {
        let text = r#"{"protocol":"tether.v1","channel":"rpc","requestId":2,"type":"Frobnicate"}"#;
        match decode_frame(text) {
            Err(WireCodecError::UnknownMessageType(name)) => assert_eq!(name, "Frobnicate"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_optional_fields_ignored() {
        let text = r#"{"protocol":"tether.v1","channel":"rpc","requestId":3,
                       "type":"DisposeObject","objectId":7,"futureField":true}"#;
        let frame = decode_frame(text).unwrap();
        match frame {
            Frame::Request(req) => {
                assert!(matches!(
                    req.body,
                    RequestBody::DisposeObject { object_id: 7 }
                ));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_roundtrip_through_encode() {
        let frame = RequestFrame::new_object(5, "Session", vec![]);
        let text = encode_request(&frame).unwrap();
        match decode_frame(&text).unwrap() {
            Frame::Request(req) => assert_eq!(req.request_id, 5),
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
