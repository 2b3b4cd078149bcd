use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::PROTOCOL;

/// Multiplexing channel tag.
///
/// Distinguishes RPC traffic from other protocols sharing the socket. Reply
/// frames carry the channel the request was sent on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Rpc,
    Heartbeat,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Rpc => write!(f, "rpc"),
            Channel::Heartbeat => write!(f, "heartbeat"),
        }
    }
}

/// Request-side body, tagged by the `type` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RequestBody {
    /// Call a free function by name.
    FunctionCall { function: String, args: Vec<Value> },
    /// Call a method on a live remote object.
    MethodCall {
        method: String,
        #[serde(rename = "objectId")]
        object_id: u64,
        args: Vec<Value>,
    },
    /// Construct a remote object for the declared interface.
    NewObject { interface: String, args: Vec<Value> },
    /// Release a remote object.
    DisposeObject {
        #[serde(rename = "objectId")]
        object_id: u64,
    },
    /// Cancel the subscription opened under this frame's `requestId`.
    DisposeObservable,
}

impl RequestBody {
    /// The wire name of this request type.
    pub fn type_name(&self) -> &'static str {
        match self {
            RequestBody::FunctionCall { .. } => "FunctionCall",
            RequestBody::MethodCall { .. } => "MethodCall",
            RequestBody::NewObject { .. } => "NewObject",
            RequestBody::DisposeObject { .. } => "DisposeObject",
            RequestBody::DisposeObservable => "DisposeObservable",
        }
    }
}

/// A request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub protocol: String,
    pub channel: Channel,
    #[serde(rename = "requestId")]
    pub request_id: u64,
    #[serde(flatten)]
    pub body: RequestBody,
}

impl RequestFrame {
    pub fn new(request_id: u64, body: RequestBody) -> Self {
        Self {
            protocol: PROTOCOL.to_string(),
            channel: Channel::Rpc,
            request_id,
            body,
        }
    }

    pub fn function_call(request_id: u64, function: impl Into<String>, args: Vec<Value>) -> Self {
        Self::new(
            request_id,
            RequestBody::FunctionCall {
                function: function.into(),
                args,
            },
        )
    }

    pub fn method_call(
        request_id: u64,
        object_id: u64,
        method: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        Self::new(
            request_id,
            RequestBody::MethodCall {
                method: method.into(),
                object_id,
                args,
            },
        )
    }

    pub fn new_object(request_id: u64, interface: impl Into<String>, args: Vec<Value>) -> Self {
        Self::new(
            request_id,
            RequestBody::NewObject {
                interface: interface.into(),
                args,
            },
        )
    }

    pub fn dispose_object(request_id: u64, object_id: u64) -> Self {
        Self::new(request_id, RequestBody::DisposeObject { object_id })
    }

    pub fn dispose_observable(request_id: u64) -> Self {
        Self::new(request_id, RequestBody::DisposeObservable)
    }
}

/// Payload of one stream frame, carried in a response frame's `result` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamPayload {
    /// One emitted value.
    Next { data: Value },
    /// Clean end of the stream.
    Completed,
}

/// A response or stream frame. Untyped on the wire: either
/// `{hadError:false, result}` or `{hadError:true, error}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub protocol: String,
    pub channel: Channel,
    #[serde(rename = "requestId")]
    pub request_id: u64,
    #[serde(rename = "hadError")]
    pub had_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl ResponseFrame {
    /// A successful terminal reply for a promise-shaped call.
    pub fn success(channel: Channel, request_id: u64, result: Value) -> Self {
        Self {
            protocol: PROTOCOL.to_string(),
            channel,
            request_id,
            had_error: false,
            result: Some(result),
            error: None,
        }
    }

    /// An error reply, terminal for both promise and observable calls.
    pub fn failure(channel: Channel, request_id: u64, error: Value) -> Self {
        Self {
            protocol: PROTOCOL.to_string(),
            channel,
            request_id,
            had_error: true,
            result: None,
            error: Some(error),
        }
    }

    /// One `next` frame of a server-streamed result.
    pub fn stream_next(channel: Channel, request_id: u64, data: Value) -> Self {
        let payload = serde_json::to_value(StreamPayload::Next { data })
            .unwrap_or(Value::Null);
        Self::success(channel, request_id, payload)
    }

    /// The clean terminal frame of a server-streamed result.
    pub fn stream_completed(channel: Channel, request_id: u64) -> Self {
        let payload = serde_json::to_value(StreamPayload::Completed).unwrap_or(Value::Null);
        Self::success(channel, request_id, payload)
    }

    /// Interpret this frame's `result` as a stream payload, if it is one.
    ///
    /// Whether a frame *is* a stream frame is decided by the call shape the
    /// receiver registered, not by the frame itself.
    pub fn stream_payload(&self) -> Option<StreamPayload> {
        let result = self.result.as_ref()?;
        serde_json::from_value(result.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{from_str, json, to_string};

    #[test]
    fn test_function_call_wire_shape() {
        let frame = RequestFrame::function_call(1, "add", vec![json!(2), json!(3)]);
        let text = to_string(&frame).unwrap();

        assert!(text.contains("\"protocol\":\"tether.v1\""));
        assert!(text.contains("\"channel\":\"rpc\""));
        assert!(text.contains("\"requestId\":1"));
        assert!(text.contains("\"type\":\"FunctionCall\""));
        assert!(text.contains("\"function\":\"add\""));
    }

    #[test]
    fn test_method_call_carries_object_id() {
        let frame = RequestFrame::method_call(4, 7, "rename", vec![json!("x")]);
        let text = to_string(&frame).unwrap();
        assert!(text.contains("\"objectId\":7"));
        assert!(text.contains("\"method\":\"rename\""));

        let parsed: RequestFrame = from_str(&text).unwrap();
        match parsed.body {
            RequestBody::MethodCall { object_id, .. } => assert_eq!(object_id, 7),
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn test_dispose_observable_roundtrip() {
        let frame = RequestFrame::dispose_observable(9);
        let text = to_string(&frame).unwrap();
        let parsed: RequestFrame = from_str(&text).unwrap();
        assert_eq!(parsed.request_id, 9);
        assert!(matches!(parsed.body, RequestBody::DisposeObservable));
    }

    #[test]
    fn test_response_success_omits_error() {
        let frame = ResponseFrame::success(Channel::Rpc, 1, json!(5));
        let text = to_string(&frame).unwrap();
        assert!(text.contains("\"hadError\":false"));
        assert!(text.contains("\"result\":5"));
        assert!(!text.contains("\"error\""));
    }

    #[test]
    fn test_stream_frames() {
        let next = ResponseFrame::stream_next(Channel::Rpc, 3, json!("a"));
        assert_eq!(
            next.stream_payload(),
            Some(StreamPayload::Next { data: json!("a") })
        );

        let done = ResponseFrame::stream_completed(Channel::Rpc, 3);
        assert_eq!(done.stream_payload(), Some(StreamPayload::Completed));

        // A plain scalar result is not a stream payload.
        let plain = ResponseFrame::success(Channel::Rpc, 3, json!(5));
        assert_eq!(plain.stream_payload(), None);
    }

    #[test]
    fn test_channel_display_matches_wire() {
        assert_eq!(Channel::Rpc.to_string(), "rpc");
        assert_eq!(
            serde_json::to_string(&Channel::Heartbeat).unwrap(),
            "\"heartbeat\""
        );
    }
}
