//! Call records and the status state machine.

use murmur_protocol::{CallId, CallStatus, CallType, UserId};
use serde::{Deserialize, Serialize};

/// A call about to be persisted in `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewCall {
    pub initiator_id: UserId,
    pub receiver_id: UserId,
    pub call_type: CallType,
}

/// A persisted call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Call {
    pub id: CallId,
    pub initiator_id: UserId,
    pub receiver_id: UserId,
    pub call_type: CallType,
    pub status: CallStatus,
    pub created_at: u64,
    /// Set once, on the first terminal transition.
    pub ended_at: Option<u64>,
}

impl Call {
    /// Whether `user_id` is one of the two parties.
    #[must_use]
    pub fn is_participant(&self, user_id: UserId) -> bool {
        user_id == self.initiator_id || user_id == self.receiver_id
    }

    /// The other party of the call, if `user_id` is a participant.
    #[must_use]
    pub fn peer_of(&self, user_id: UserId) -> Option<UserId> {
        if user_id == self.initiator_id {
            Some(self.receiver_id)
        } else if user_id == self.receiver_id {
            Some(self.initiator_id)
        } else {
            None
        }
    }
}

/// Something that moves a call between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEvent {
    /// Callee accepted.
    Accept,
    /// Callee declined.
    Decline,
    /// Callee had no live session when the call was placed.
    Unreachable,
    /// A participant hung up.
    End,
}

impl CallEvent {
    /// States this event may fire from.
    #[must_use]
    pub fn allowed_from(&self) -> &'static [CallStatus] {
        match self {
            CallEvent::Accept | CallEvent::Decline | CallEvent::Unreachable => {
                &[CallStatus::Pending]
            }
            CallEvent::End => &[CallStatus::Pending, CallStatus::Accepted],
        }
    }

    /// State reached when the event fires.
    #[must_use]
    pub fn target(&self) -> CallStatus {
        match self {
            CallEvent::Accept => CallStatus::Accepted,
            CallEvent::Decline => CallStatus::Declined,
            CallEvent::Unreachable => CallStatus::Missed,
            CallEvent::End => CallStatus::Completed,
        }
    }

    /// Next state from `current`, or `None` if the event does not apply.
    #[must_use]
    pub fn apply(&self, current: CallStatus) -> Option<CallStatus> {
        self.allowed_from()
            .contains(&current)
            .then(|| self.target())
    }
}
