//! # Tether Wire Protocol
//!
//! Frame types, codec, error encoding, service schema, and type registry for
//! the tether RPC transport. This crate is pure data: no sockets, no runtime.
//!
//! ## Wire format
//!
//! Every frame is one JSON object carried as a single text message on the
//! socket. Request frames are tagged with a `type` field; response and stream
//! frames are untagged and carry `hadError` plus `result` or `error`:
//!
//! ```json
//! {"protocol":"tether.v1","channel":"rpc","requestId":1,
//!  "type":"FunctionCall","function":"add","args":[2,3]}
//! {"protocol":"tether.v1","channel":"rpc","requestId":1,
//!  "hadError":false,"result":5}
//! ```
//!
//! ## Architecture
//!
//! ```rust,ignore
//! // Decode inbound text into a frame; the codec enforces the protocol tag
//! match codec::decode_frame(text)? {
//!     Frame::Request(req) => dispatch(req),
//!     Frame::Response(resp) => correlate(resp),
//! }
//! ```

pub mod codec;
pub mod error;
pub mod frame;
pub mod registry;
pub mod schema;

// Re-export main types
pub use codec::{decode_frame, encode_request, encode_response, Frame, WireCodecError};
pub use error::WireError;
pub use frame::{Channel, RequestBody, RequestFrame, ResponseFrame, StreamPayload};
pub use registry::{HandleBinder, RegistryError, TypeRegistry};
pub use schema::{Declaration, InterfaceDecl, ReturnShape, SchemaError, ServiceSchema, Signature};

/// Protocol tag carried by every tether frame. Frames bearing any other tag
/// belong to other traffic multiplexed on the same socket and are ignored.
pub const PROTOCOL: &str = "tether.v1";
