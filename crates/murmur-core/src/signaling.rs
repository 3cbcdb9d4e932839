//! Call signaling engine.
//!
//! Owns the call lifecycle and relays SDP and ICE payloads between the two
//! participants of a call. Every relay re-reads the stored call and checks the
//! sender against it; the client-asserted target is never trusted on its own.
//!
//! Rejected actions are not errors. They come back as
//! [`SignalOutcome::Ignored`] so a retransmitted or spoofed frame is a silent
//! no-op on the wire.

use murmur_protocol::{CallAction, CallId, CallStatus, CallType, ServerFrame, UserId};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::call::{Call, CallEvent, NewCall};
use crate::error::DispatchError;
use crate::message::now_millis;
use crate::session::{Delivery, SessionStore};
use crate::store::Store;

/// Why a signaling action was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// No call with that id.
    CallNotFound,
    /// The callee does not exist.
    UserNotFound,
    /// Sender is neither initiator nor receiver.
    NotParticipant,
    /// Sender is a participant but not the one allowed to act.
    WrongRole,
    /// The call is not in a state that accepts this action.
    InvalidState(CallStatus),
    /// ICE target is not the sender's peer.
    WrongTarget,
    /// Another action moved the call first.
    Superseded,
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IgnoreReason::CallNotFound => f.write_str("call_not_found"),
            IgnoreReason::UserNotFound => f.write_str("user_not_found"),
            IgnoreReason::NotParticipant => f.write_str("not_participant"),
            IgnoreReason::WrongRole => f.write_str("wrong_role"),
            IgnoreReason::InvalidState(status) => write!(f, "invalid_state:{}", status),
            IgnoreReason::WrongTarget => f.write_str("wrong_target"),
            IgnoreReason::Superseded => f.write_str("superseded"),
        }
    }
}

/// What a signaling action did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalOutcome {
    /// A frame reached the other participant.
    Relayed {
        call_id: CallId,
        to: UserId,
        /// Status after the action, when it changed or set one.
        status: Option<CallStatus>,
    },
    /// The other participant had no live session.
    Unreachable {
        call_id: CallId,
        to: UserId,
        status: Option<CallStatus>,
    },
    /// Nothing happened.
    Ignored {
        call_id: Option<CallId>,
        reason: IgnoreReason,
    },
}

impl SignalOutcome {
    fn delivered(
        delivery: Delivery,
        call_id: CallId,
        to: UserId,
        status: Option<CallStatus>,
    ) -> Self {
        match delivery {
            Delivery::Delivered => SignalOutcome::Relayed { call_id, to, status },
            Delivery::Unreachable => SignalOutcome::Unreachable { call_id, to, status },
        }
    }

    fn ignored(call_id: impl Into<Option<CallId>>, reason: IgnoreReason) -> Self {
        let call_id = call_id.into();
        debug!(call = ?call_id, reason = %reason, "Signaling action ignored");
        SignalOutcome::Ignored { call_id, reason }
    }

    /// Status the call reached, if the action changed it.
    #[must_use]
    pub fn status(&self) -> Option<CallStatus> {
        match self {
            SignalOutcome::Relayed { status, .. } | SignalOutcome::Unreachable { status, .. } => {
                *status
            }
            SignalOutcome::Ignored { .. } => None,
        }
    }
}

/// Brokers call negotiation between two users.
pub struct CallSignaling {
    sessions: Arc<SessionStore>,
    store: Arc<dyn Store>,
}

impl CallSignaling {
    /// Create a signaling engine over the shared session store.
    #[must_use]
    pub fn new(sessions: Arc<SessionStore>, store: Arc<dyn Store>) -> Self {
        Self { sessions, store }
    }

    /// Place a call from `caller_id` to `callee_id`.
    ///
    /// Rings the callee if reachable, otherwise marks the call `missed`. The
    /// caller is always told the call id and resulting status.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Unauthorized`] for a call to oneself and
    /// [`DispatchError::Storage`] if persistence fails.
    pub async fn initiate(
        &self,
        caller_id: UserId,
        callee_id: UserId,
        call_type: CallType,
    ) -> Result<SignalOutcome, DispatchError> {
        if caller_id == callee_id {
            return Err(DispatchError::Unauthorized("cannot call yourself".into()));
        }
        if !self.store.user_exists(callee_id).await? {
            return Ok(SignalOutcome::ignored(None::<CallId>, IgnoreReason::UserNotFound));
        }

        let call = self
            .store
            .create_call(NewCall {
                initiator_id: caller_id,
                receiver_id: callee_id,
                call_type,
            })
            .await?;

        let ring = Arc::new(ServerFrame::IncomingCall {
            call_id: call.id,
            initiator_id: caller_id,
            call_type,
            timestamp: call.created_at,
        });

        let outcome = match self.sessions.deliver(callee_id, ring) {
            Delivery::Delivered => {
                info!(
                    call = call.id,
                    caller = caller_id,
                    callee = callee_id,
                    %call_type,
                    "Call ringing"
                );
                SignalOutcome::Relayed {
                    call_id: call.id,
                    to: callee_id,
                    status: Some(CallStatus::Pending),
                }
            }
            Delivery::Unreachable => {
                let event = CallEvent::Unreachable;
                let status = self
                    .store
                    .transition_call(
                        call.id,
                        event.allowed_from(),
                        event.target(),
                        Some(now_millis()),
                    )
                    .await?
                    .map_or(call.status, |c| c.status);
                info!(
                    call = call.id,
                    caller = caller_id,
                    callee = callee_id,
                    %status,
                    "Callee unreachable"
                );
                SignalOutcome::Unreachable {
                    call_id: call.id,
                    to: callee_id,
                    status: Some(status),
                }
            }
        };

        if let Some(status) = outcome.status() {
            let ack = Arc::new(ServerFrame::CallInitiated {
                call_id: call.id,
                receiver_id: callee_id,
                call_type,
                status,
            });
            self.sessions.deliver(caller_id, ack);
        }

        Ok(outcome)
    }

    /// Forward the initiator's SDP offer to the receiver.
    ///
    /// # Errors
    ///
    /// Returns an error if the call cannot be read.
    pub async fn relay_offer(
        &self,
        call_id: CallId,
        sdp: Value,
        from_user: UserId,
    ) -> Result<SignalOutcome, DispatchError> {
        let call = match self.load(call_id, from_user).await? {
            Ok(call) => call,
            Err(ignored) => return Ok(ignored),
        };
        if from_user != call.initiator_id {
            return Ok(SignalOutcome::ignored(call_id, IgnoreReason::WrongRole));
        }
        if call.status != CallStatus::Pending {
            return Ok(SignalOutcome::ignored(call_id, IgnoreReason::InvalidState(call.status)));
        }

        let frame = Arc::new(ServerFrame::CallOffer {
            call_id,
            sdp,
            initiator_id: from_user,
        });
        let delivery = self.sessions.deliver(call.receiver_id, frame);
        debug!(call = call_id, to = call.receiver_id, ?delivery, "Offer relayed");

        Ok(SignalOutcome::delivered(delivery, call_id, call.receiver_id, None))
    }

    /// Apply the receiver's accept or decline and notify the initiator.
    ///
    /// # Errors
    ///
    /// Returns an error if the call cannot be read or updated.
    pub async fn respond(
        &self,
        call_id: CallId,
        action: CallAction,
        sdp: Option<Value>,
        from_user: UserId,
    ) -> Result<SignalOutcome, DispatchError> {
        let call = match self.load(call_id, from_user).await? {
            Ok(call) => call,
            Err(ignored) => return Ok(ignored),
        };
        if from_user != call.receiver_id {
            return Ok(SignalOutcome::ignored(call_id, IgnoreReason::WrongRole));
        }

        let event = match action {
            CallAction::Accept => CallEvent::Accept,
            CallAction::Decline => CallEvent::Decline,
        };
        if event.apply(call.status).is_none() {
            return Ok(SignalOutcome::ignored(call_id, IgnoreReason::InvalidState(call.status)));
        }

        let ended_at = (event == CallEvent::Decline).then(now_millis);
        let Some(updated) = self
            .store
            .transition_call(call_id, event.allowed_from(), event.target(), ended_at)
            .await?
        else {
            return Ok(SignalOutcome::ignored(call_id, IgnoreReason::Superseded));
        };

        let frame = match action {
            CallAction::Accept => ServerFrame::CallAccepted {
                call_id,
                receiver_id: from_user,
                sdp,
            },
            CallAction::Decline => ServerFrame::CallDeclined {
                call_id,
                receiver_id: from_user,
            },
        };
        let delivery = self.sessions.deliver(call.initiator_id, Arc::new(frame));
        info!(call = call_id, status = %updated.status, ?delivery, "Call answered");

        Ok(SignalOutcome::delivered(
            delivery,
            call_id,
            call.initiator_id,
            Some(updated.status),
        ))
    }

    /// Forward an ICE candidate to the sender's peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the call cannot be read.
    pub async fn relay_ice(
        &self,
        call_id: CallId,
        candidate: Value,
        from_user: UserId,
        target_user: UserId,
    ) -> Result<SignalOutcome, DispatchError> {
        let call = match self.load(call_id, from_user).await? {
            Ok(call) => call,
            Err(ignored) => return Ok(ignored),
        };
        if call.peer_of(from_user) != Some(target_user) {
            return Ok(SignalOutcome::ignored(call_id, IgnoreReason::WrongTarget));
        }
        if !call.status.is_negotiating() {
            return Ok(SignalOutcome::ignored(call_id, IgnoreReason::InvalidState(call.status)));
        }

        let frame = Arc::new(ServerFrame::IceCandidate {
            call_id,
            candidate,
            sender_id: from_user,
        });
        let delivery = self.sessions.deliver(target_user, frame);

        Ok(SignalOutcome::delivered(delivery, call_id, target_user, None))
    }

    /// Hang up a call and tell the other participant.
    ///
    /// Ending a call that is already terminal does nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the call cannot be read or updated.
    pub async fn end(
        &self,
        call_id: CallId,
        from_user: UserId,
    ) -> Result<SignalOutcome, DispatchError> {
        let call = match self.load(call_id, from_user).await? {
            Ok(call) => call,
            Err(ignored) => return Ok(ignored),
        };
        let event = CallEvent::End;
        if event.apply(call.status).is_none() {
            return Ok(SignalOutcome::ignored(call_id, IgnoreReason::InvalidState(call.status)));
        }

        let Some(updated) = self
            .store
            .transition_call(call_id, event.allowed_from(), event.target(), Some(now_millis()))
            .await?
        else {
            return Ok(SignalOutcome::ignored(call_id, IgnoreReason::Superseded));
        };

        // Participant check above guarantees a peer.
        let peer = call.peer_of(from_user).unwrap_or(call.initiator_id);
        let frame = Arc::new(ServerFrame::CallEnd {
            call_id,
            sender_id: from_user,
        });
        let delivery = self.sessions.deliver(peer, frame);
        info!(call = call_id, by = from_user, ?delivery, "Call ended");

        Ok(SignalOutcome::delivered(delivery, call_id, peer, Some(updated.status)))
    }

    /// Fetch a call and check that `from_user` takes part in it.
    async fn load(
        &self,
        call_id: CallId,
        from_user: UserId,
    ) -> Result<Result<Call, SignalOutcome>, DispatchError> {
        let Some(call) = self.store.get_call(call_id).await? else {
            return Ok(Err(SignalOutcome::ignored(call_id, IgnoreReason::CallNotFound)));
        };
        if !call.is_participant(from_user) {
            return Ok(Err(SignalOutcome::ignored(call_id, IgnoreReason::NotParticipant)));
        }
        Ok(Ok(call))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::session::{Outbound, SessionHandle};
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Harness {
        sessions: Arc<SessionStore>,
        store: Arc<MemoryStore>,
        signaling: CallSignaling,
    }

    async fn harness() -> Harness {
        let sessions = Arc::new(SessionStore::new());
        let store = Arc::new(MemoryStore::new());
        for user in 1..=3 {
            store.add_user(user, format!("token-{}", user)).await;
        }
        let signaling = CallSignaling::new(Arc::clone(&sessions), store.clone());
        Harness {
            sessions,
            store,
            signaling,
        }
    }

    impl Harness {
        fn online(&self, user_id: UserId) -> UnboundedReceiver<Outbound> {
            let (session, rx) = SessionHandle::open(user_id);
            self.sessions.register(session);
            rx
        }

        async fn status(&self, call_id: CallId) -> CallStatus {
            self.store.get_call(call_id).await.unwrap().unwrap().status
        }
    }

    fn next_kind(rx: &mut UnboundedReceiver<Outbound>) -> Option<&'static str> {
        match rx.try_recv() {
            Ok(Outbound::Frame(frame)) => Some(frame.kind()),
            _ => None,
        }
    }

    async fn ringing_call(
        h: &Harness,
    ) -> (CallId, UnboundedReceiver<Outbound>, UnboundedReceiver<Outbound>) {
        let mut caller = h.online(1);
        let mut callee = h.online(2);
        let outcome = h.signaling.initiate(1, 2, CallType::Video).await.unwrap();
        let SignalOutcome::Relayed { call_id, .. } = outcome else {
            panic!("unexpected outcome {:?}", outcome);
        };
        assert_eq!(next_kind(&mut callee), Some("incoming_call"));
        assert_eq!(next_kind(&mut caller), Some("call_initiated"));
        (call_id, caller, callee)
    }

    #[tokio::test]
    async fn test_initiate_to_offline_is_missed() {
        let h = harness().await;
        let mut caller = h.online(1);

        let outcome = h.signaling.initiate(1, 2, CallType::Audio).await.unwrap();
        let SignalOutcome::Unreachable { call_id, status, .. } = outcome else {
            panic!("unexpected outcome {:?}", outcome);
        };

        assert_eq!(status, Some(CallStatus::Missed));
        let call = h.store.get_call(call_id).await.unwrap().unwrap();
        assert_eq!(call.status, CallStatus::Missed);
        assert!(call.ended_at.is_some());

        match caller.try_recv() {
            Ok(Outbound::Frame(frame)) => assert!(matches!(
                frame.as_ref(),
                ServerFrame::CallInitiated {
                    status: CallStatus::Missed,
                    ..
                }
            )),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_initiate_rejects_self_and_unknown() {
        let h = harness().await;

        let result = h.signaling.initiate(1, 1, CallType::Audio).await;
        assert!(matches!(result, Err(DispatchError::Unauthorized(_))));

        let outcome = h.signaling.initiate(1, 99, CallType::Audio).await.unwrap();
        assert_eq!(
            outcome,
            SignalOutcome::Ignored {
                call_id: None,
                reason: IgnoreReason::UserNotFound
            }
        );
    }

    #[tokio::test]
    async fn test_offer_only_from_initiator() {
        let h = harness().await;
        let (call_id, mut caller, mut callee) = ringing_call(&h).await;

        let outcome = h
            .signaling
            .relay_offer(call_id, json!({"sdp": "v=0"}), 2)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            SignalOutcome::Ignored {
                reason: IgnoreReason::WrongRole,
                ..
            }
        ));
        assert_eq!(next_kind(&mut caller), None);

        let outcome = h
            .signaling
            .relay_offer(call_id, json!({"sdp": "v=0"}), 1)
            .await
            .unwrap();
        assert!(matches!(outcome, SignalOutcome::Relayed { to: 2, .. }));
        assert_eq!(next_kind(&mut callee), Some("call_offer"));
    }

    #[tokio::test]
    async fn test_accept_from_non_receiver_is_noop() {
        let h = harness().await;
        let (call_id, mut caller, _callee) = ringing_call(&h).await;
        let _outsider = h.online(3);

        for from in [1, 3] {
            let outcome = h
                .signaling
                .respond(call_id, CallAction::Accept, None, from)
                .await
                .unwrap();
            assert!(matches!(outcome, SignalOutcome::Ignored { .. }));
        }

        assert_eq!(h.status(call_id).await, CallStatus::Pending);
        assert_eq!(next_kind(&mut caller), None);
    }

    #[tokio::test]
    async fn test_accept_relays_answer() {
        let h = harness().await;
        let (call_id, mut caller, _callee) = ringing_call(&h).await;

        let outcome = h
            .signaling
            .respond(call_id, CallAction::Accept, Some(json!({"sdp": "answer"})), 2)
            .await
            .unwrap();
        assert_eq!(outcome.status(), Some(CallStatus::Accepted));
        assert_eq!(h.status(call_id).await, CallStatus::Accepted);

        match caller.try_recv() {
            Ok(Outbound::Frame(frame)) => match frame.as_ref() {
                ServerFrame::CallAccepted { sdp, receiver_id, .. } => {
                    assert_eq!(*receiver_id, 2);
                    assert_eq!(sdp.as_ref(), Some(&json!({"sdp": "answer"})));
                }
                other => panic!("unexpected frame {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }

        // Duplicate tap.
        let outcome = h
            .signaling
            .respond(call_id, CallAction::Decline, None, 2)
            .await
            .unwrap();
        assert!(matches!(outcome, SignalOutcome::Ignored { .. }));
        assert_eq!(h.status(call_id).await, CallStatus::Accepted);
        assert_eq!(next_kind(&mut caller), None);
    }

    #[tokio::test]
    async fn test_ice_follows_call_state() {
        let h = harness().await;
        let (call_id, mut caller, mut callee) = ringing_call(&h).await;
        let mut outsider = h.online(3);

        let outcome = h
            .signaling
            .relay_ice(call_id, json!({"candidate": "c1"}), 1, 3)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            SignalOutcome::Ignored {
                reason: IgnoreReason::WrongTarget,
                ..
            }
        ));
        assert_eq!(next_kind(&mut outsider), None);

        h.signaling
            .respond(call_id, CallAction::Accept, None, 2)
            .await
            .unwrap();
        assert_eq!(next_kind(&mut caller), Some("call_accepted"));

        let outcome = h
            .signaling
            .relay_ice(call_id, json!({"candidate": "c2"}), 2, 1)
            .await
            .unwrap();
        assert!(matches!(outcome, SignalOutcome::Relayed { to: 1, .. }));
        assert_eq!(next_kind(&mut caller), Some("ice_candidate"));
        assert_eq!(next_kind(&mut callee), None);
        assert_eq!(next_kind(&mut outsider), None);
    }

    #[tokio::test]
    async fn test_ice_rejected_after_decline() {
        let h = harness().await;
        let (call_id, mut caller, _callee) = ringing_call(&h).await;

        h.signaling
            .respond(call_id, CallAction::Decline, None, 2)
            .await
            .unwrap();
        assert_eq!(next_kind(&mut caller), Some("call_declined"));
        let call = h.store.get_call(call_id).await.unwrap().unwrap();
        assert_eq!(call.status, CallStatus::Declined);
        assert!(call.ended_at.is_some());

        let outcome = h
            .signaling
            .relay_ice(call_id, json!({"candidate": "late"}), 2, 1)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            SignalOutcome::Ignored {
                call_id: Some(call_id),
                reason: IgnoreReason::InvalidState(CallStatus::Declined)
            }
        );
        assert_eq!(next_kind(&mut caller), None);
    }

    #[tokio::test]
    async fn test_end_twice_is_idempotent() {
        let h = harness().await;
        let (call_id, _caller, mut callee) = ringing_call(&h).await;

        let first = h.signaling.end(call_id, 1).await.unwrap();
        assert_eq!(first.status(), Some(CallStatus::Completed));
        assert_eq!(next_kind(&mut callee), Some("call_end"));
        let ended_at = h.store.get_call(call_id).await.unwrap().unwrap().ended_at;
        assert!(ended_at.is_some());

        let second = h.signaling.end(call_id, 2).await.unwrap();
        assert!(matches!(second, SignalOutcome::Ignored { .. }));
        assert_eq!(next_kind(&mut callee), None);

        let call = h.store.get_call(call_id).await.unwrap().unwrap();
        assert_eq!(call.status, CallStatus::Completed);
        assert_eq!(call.ended_at, ended_at);
    }

    #[tokio::test]
    async fn test_unknown_call_and_outsider() {
        let h = harness().await;
        let (call_id, _caller, _callee) = ringing_call(&h).await;

        assert_eq!(
            h.signaling.end(404, 1).await.unwrap(),
            SignalOutcome::Ignored {
                call_id: Some(404),
                reason: IgnoreReason::CallNotFound
            }
        );
        assert_eq!(
            h.signaling.end(call_id, 3).await.unwrap(),
            SignalOutcome::Ignored {
                call_id: Some(call_id),
                reason: IgnoreReason::NotParticipant
            }
        );
        assert_eq!(h.status(call_id).await, CallStatus::Pending);
    }
}
