//! Identifiers and closed vocabularies shared by both sides of the wire.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A user identity, owned by the external identity store.
pub type UserId = i64;

/// A group identifier.
pub type GroupId = i64;

/// A persisted chat message identifier.
pub type MessageId = i64;

/// A persisted call identifier.
pub type CallId = i64;

/// Media kind requested when a call is initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    Audio,
    Video,
}

impl CallType {
    /// Stable string form, as stored and sent on the wire.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            CallType::Audio => "audio",
            CallType::Video => "video",
        }
    }
}

impl TryFrom<&str> for CallType {
    type Error = &'static str;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "audio" => Ok(CallType::Audio),
            "video" => Ok(CallType::Video),
            _ => Err("Invalid call type"),
        }
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Callee's answer to a pending call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallAction {
    Accept,
    Decline,
}

/// Lifecycle state of a call.
///
/// `Pending` is the only state that accepts an answer. `Accepted` can still be
/// ended; `Declined`, `Missed` and `Completed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Pending,
    Accepted,
    Declined,
    Missed,
    Completed,
}

impl CallStatus {
    /// Stable string form, as stored and sent on the wire.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Pending => "pending",
            CallStatus::Accepted => "accepted",
            CallStatus::Declined => "declined",
            CallStatus::Missed => "missed",
            CallStatus::Completed => "completed",
        }
    }

    /// No further transition is possible from this state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Declined | CallStatus::Missed | CallStatus::Completed
        )
    }

    /// Negotiation payloads may still flow between the participants.
    #[must_use]
    pub fn is_negotiating(&self) -> bool {
        matches!(self, CallStatus::Pending | CallStatus::Accepted)
    }
}

impl TryFrom<&str> for CallStatus {
    type Error = &'static str;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "pending" => Ok(CallStatus::Pending),
            "accepted" => Ok(CallStatus::Accepted),
            "declined" => Ok(CallStatus::Declined),
            "missed" => Ok(CallStatus::Missed),
            "completed" => Ok(CallStatus::Completed),
            _ => Err("Invalid call status"),
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_status_conversion() {
        for status in [
            CallStatus::Pending,
            CallStatus::Accepted,
            CallStatus::Declined,
            CallStatus::Missed,
            CallStatus::Completed,
        ] {
            assert_eq!(CallStatus::try_from(status.as_str()), Ok(status));
        }
        assert!(CallStatus::try_from("offline").is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!CallStatus::Pending.is_terminal());
        assert!(!CallStatus::Accepted.is_terminal());
        assert!(CallStatus::Declined.is_terminal());
        assert!(CallStatus::Missed.is_terminal());
        assert!(CallStatus::Completed.is_terminal());

        assert!(CallStatus::Accepted.is_negotiating());
        assert!(!CallStatus::Declined.is_negotiating());
    }

    #[test]
    fn test_call_type_serde() {
        assert_eq!(
            serde_json::to_string(&CallType::Video).unwrap(),
            "\"video\""
        );
        assert_eq!(CallType::try_from("audio"), Ok(CallType::Audio));
        assert!(CallType::try_from("hologram").is_err());
    }
}
