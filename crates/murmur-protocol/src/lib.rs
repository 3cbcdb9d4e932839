//! # murmur-protocol
//!
//! Wire protocol definitions for the murmur realtime chat and call-signaling
//! core.
//!
//! Every WebSocket text message carries exactly one JSON object whose `type`
//! field selects the variant.
//!
//! ## Frame Types
//!
//! - `message` - 1:1 and group chat
//! - `call_initiate` / `call_response` / `call_end` - call lifecycle
//! - `call_offer` / `ice_candidate` - opaque WebRTC negotiation payloads
//! - `error` - rejection of a single frame
//!
//! ## Example
//!
//! ```rust
//! use murmur_protocol::{codec, ClientFrame};
//!
//! let raw = r#"{"type":"message","receiver_id":2,"content":"hi"}"#;
//! let frame = codec::decode(raw, codec::DEFAULT_MAX_FRAME_SIZE).unwrap();
//! assert!(matches!(frame, ClientFrame::Message { receiver_id: 2, .. }));
//! ```

pub mod codec;
pub mod frames;
pub mod types;

pub use codec::{decode, encode, ProtocolError};
pub use frames::{ClientFrame, ServerFrame};
pub use types::{CallAction, CallId, CallStatus, CallType, GroupId, MessageId, UserId};
