//! Frame types for the murmur protocol.
//!
//! Frames are JSON objects discriminated by a `type` tag. Clients send
//! [`ClientFrame`]s; the server pushes [`ServerFrame`]s.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{CallAction, CallId, CallStatus, CallType, GroupId, MessageId, UserId};

/// A frame sent by a connected client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Chat message to a user or a group.
    Message {
        /// Recipient user, or the group when `is_group` is set and
        /// `group_id` is absent.
        receiver_id: UserId,
        /// Message text.
        content: String,
        /// Whether this addresses a group.
        #[serde(default)]
        is_group: bool,
        /// Explicit group id for group messages.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_id: Option<GroupId>,
    },

    /// Start a call.
    CallInitiate {
        /// Callee.
        receiver_id: UserId,
        /// Requested media.
        call_type: CallType,
    },

    /// SDP offer from the initiator.
    CallOffer {
        call_id: CallId,
        /// Opaque SDP payload.
        sdp: Value,
    },

    /// Callee's answer.
    CallResponse {
        call_id: CallId,
        action: CallAction,
        /// SDP answer, present when accepting.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp: Option<Value>,
    },

    /// ICE candidate for the other participant.
    IceCandidate {
        call_id: CallId,
        /// Opaque candidate payload.
        candidate: Value,
        target_user_id: UserId,
    },

    /// Hang up.
    CallEnd { call_id: CallId },

    /// Keepalive ping.
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ClientFrame {
    /// The `type` tag of this frame.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ClientFrame::Message { .. } => "message",
            ClientFrame::CallInitiate { .. } => "call_initiate",
            ClientFrame::CallOffer { .. } => "call_offer",
            ClientFrame::CallResponse { .. } => "call_response",
            ClientFrame::IceCandidate { .. } => "ice_candidate",
            ClientFrame::CallEnd { .. } => "call_end",
            ClientFrame::Ping { .. } => "ping",
        }
    }
}

/// A frame pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Chat message delivery.
    Message {
        message_id: MessageId,
        sender_id: UserId,
        content: String,
        /// Creation time in milliseconds since the Unix epoch.
        created_at: u64,
        is_group: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_id: Option<GroupId>,
        /// Set when the message was queued while the recipient was away.
        #[serde(default, skip_serializing_if = "is_false")]
        offline: bool,
    },

    /// A call is ringing for the recipient.
    IncomingCall {
        call_id: CallId,
        initiator_id: UserId,
        call_type: CallType,
        timestamp: u64,
    },

    /// Acknowledges a `call_initiate` to the caller.
    CallInitiated {
        call_id: CallId,
        receiver_id: UserId,
        call_type: CallType,
        status: CallStatus,
    },

    /// Forwarded SDP offer.
    CallOffer {
        call_id: CallId,
        sdp: Value,
        initiator_id: UserId,
    },

    /// The callee accepted.
    CallAccepted {
        call_id: CallId,
        receiver_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp: Option<Value>,
    },

    /// The callee declined.
    CallDeclined { call_id: CallId, receiver_id: UserId },

    /// The other participant hung up.
    CallEnd { call_id: CallId, sender_id: UserId },

    /// Forwarded ICE candidate.
    IceCandidate {
        call_id: CallId,
        candidate: Value,
        sender_id: UserId,
    },

    /// Rejection of a single client frame.
    Error { code: u16, message: String },

    /// Keepalive pong.
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl ServerFrame {
    /// The `type` tag of this frame.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ServerFrame::Message { .. } => "message",
            ServerFrame::IncomingCall { .. } => "incoming_call",
            ServerFrame::CallInitiated { .. } => "call_initiated",
            ServerFrame::CallOffer { .. } => "call_offer",
            ServerFrame::CallAccepted { .. } => "call_accepted",
            ServerFrame::CallDeclined { .. } => "call_declined",
            ServerFrame::CallEnd { .. } => "call_end",
            ServerFrame::IceCandidate { .. } => "ice_candidate",
            ServerFrame::Error { .. } => "error",
            ServerFrame::Pong { .. } => "pong",
        }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            code,
            message: message.into(),
        }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        ServerFrame::Pong { timestamp }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_defaults() {
        let frame: ClientFrame =
            serde_json::from_value(json!({"type": "message", "receiver_id": 7, "content": "hi"}))
                .unwrap();

        assert_eq!(
            frame,
            ClientFrame::Message {
                receiver_id: 7,
                content: "hi".into(),
                is_group: false,
                group_id: None,
            }
        );
        assert_eq!(frame.kind(), "message");
    }

    #[test]
    fn test_call_response_without_sdp() {
        let frame: ClientFrame = serde_json::from_value(
            json!({"type": "call_response", "call_id": 3, "action": "decline"}),
        )
        .unwrap();

        assert!(matches!(
            frame,
            ClientFrame::CallResponse {
                call_id: 3,
                action: CallAction::Decline,
                sdp: None
            }
        ));
    }

    #[test]
    fn test_opaque_payloads_survive() {
        let candidate = json!({"candidate": "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host", "sdpMid": "0"});
        let frame: ClientFrame = serde_json::from_value(json!({
            "type": "ice_candidate",
            "call_id": 1,
            "candidate": candidate.clone(),
            "target_user_id": 2,
        }))
        .unwrap();

        match frame {
            ClientFrame::IceCandidate { candidate: c, .. } => assert_eq!(c, candidate),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_server_frame_tags() {
        let value = serde_json::to_value(ServerFrame::CallDeclined {
            call_id: 4,
            receiver_id: 2,
        })
        .unwrap();
        assert_eq!(value["type"], "call_declined");

        let value = serde_json::to_value(ServerFrame::Message {
            message_id: 1,
            sender_id: 1,
            content: "x".into(),
            created_at: 0,
            is_group: false,
            group_id: None,
            offline: false,
        })
        .unwrap();
        assert!(value.get("offline").is_none());
        assert!(value.get("group_id").is_none());
    }
}
