//! The connection-facing facade.
//!
//! A transport drives [`Core`] per connection: [`Core::connect`] once
//! authenticated, [`Core::flush_offline`] once its writer is draining the
//! outbound channel, [`Core::dispatch`] for every inbound text frame, and
//! [`Core::disconnect`] when the socket goes away.

use murmur_protocol::{codec, ClientFrame, ServerFrame, UserId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{ConnectError, DispatchError};
use crate::routing::{FlushOutcome, MessageRouter, Recipient, RouteOutcome};
use crate::session::{Outbound, SessionHandle, SessionStore};
use crate::signaling::{CallSignaling, SignalOutcome};
use crate::store::{Store, StoreError};

/// Core configuration.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Largest inbound text frame accepted, in bytes.
    pub max_frame_size: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_frame_size: codec::DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// A freshly registered connection.
#[derive(Debug)]
pub struct Connected {
    pub session: SessionHandle,
    /// Frames for the transport to write, in order.
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
    /// Whether an older session for the same user was closed.
    pub replaced: bool,
    /// Offline items waiting when the session registered.
    pub backlog: usize,
}

/// What a dispatched frame did.
#[derive(Debug, Clone)]
pub enum Dispatched {
    Message(RouteOutcome),
    Signal {
        /// The client frame type that triggered the action.
        action: &'static str,
        outcome: SignalOutcome,
    },
    Pong,
}

/// Presence, routing and signaling behind one entry point.
pub struct Core {
    sessions: Arc<SessionStore>,
    store: Arc<dyn Store>,
    router: MessageRouter,
    signaling: CallSignaling,
    config: CoreConfig,
    closed: AtomicBool,
}

impl Core {
    /// Create a core over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: CoreConfig) -> Self {
        let sessions = Arc::new(SessionStore::new());
        Self {
            router: MessageRouter::new(Arc::clone(&sessions), Arc::clone(&store)),
            signaling: CallSignaling::new(Arc::clone(&sessions), Arc::clone(&store)),
            sessions,
            store,
            config,
            closed: AtomicBool::new(false),
        }
    }

    /// Whether [`Core::shutdown`] has started.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The shared session registry.
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// The persistence collaborator.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Ids of every user with a live session.
    #[must_use]
    pub fn online_users(&self) -> Vec<UserId> {
        let mut users = self.sessions.online_users();
        users.sort_unstable();
        users
    }

    /// Register a new connection for `user_id`.
    ///
    /// Any previous session of the same user is closed. If offline items are
    /// waiting, the session holds live frames back until
    /// [`Core::flush_offline`] has written the backlog.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::ShuttingDown`] once shutdown has begun, and
    /// [`ConnectError::Storage`] if the queue cannot be read or the user
    /// cannot be marked active. The registration is rolled back in both cases.
    pub async fn connect(&self, user_id: UserId) -> Result<Connected, ConnectError> {
        if self.is_closed() {
            return Err(ConnectError::ShuttingDown);
        }

        let backlog = self.store.pending_offline(user_id).await?.len();
        let (session, outbound) = if backlog > 0 {
            SessionHandle::open_held(user_id)
        } else {
            SessionHandle::open(user_id)
        };

        let replaced = self.sessions.register(session.clone());
        if let Some(previous) = &replaced {
            info!(
                user = user_id,
                old = previous.connection_id(),
                new = session.connection_id(),
                "Replacing existing session"
            );
            previous.close();
        }

        if let Err(e) = self.store.set_active(user_id, true).await {
            self.sessions.unregister(user_id, session.connection_id());
            return Err(e.into());
        }

        // Shutdown may have drained the registry while the flag was written.
        if self.is_closed() {
            self.rollback(&session).await;
            return Err(ConnectError::ShuttingDown);
        }

        info!(
            user = user_id,
            connection = session.connection_id(),
            backlog,
            "User connected"
        );

        Ok(Connected {
            session,
            outbound,
            replaced: replaced.is_some(),
            backlog,
        })
    }

    /// Write the offline queue to `session`, then let held live frames through.
    ///
    /// Call once per connection after the transport has started draining its
    /// outbound channel; items are confirmed one write at a time. Held frames
    /// are released even if the flush fails.
    ///
    /// # Errors
    ///
    /// Returns an error if reading or updating the queue fails.
    pub async fn flush_offline(&self, session: &SessionHandle) -> Result<FlushOutcome, StoreError> {
        let result = self.router.flush_offline(session).await;
        let held = session.release();

        match &result {
            Ok(flushed) => debug!(
                user = session.user_id(),
                delivered = flushed.delivered,
                remaining = flushed.remaining,
                held,
                "Offline flush finished"
            ),
            Err(e) => warn!(user = session.user_id(), error = %e, held, "Offline flush failed"),
        }

        result
    }

    /// Decode and handle one inbound text frame from `session`.
    ///
    /// Rejections are pushed to `session` as `error` frames before returning.
    ///
    /// # Errors
    ///
    /// Returns the [`DispatchError`] for this frame. The connection stays
    /// usable whatever the error.
    pub async fn dispatch(
        &self,
        raw: &str,
        session: &SessionHandle,
    ) -> Result<Dispatched, DispatchError> {
        let result = self.handle(raw, session).await;

        if let Err(e) = &result {
            match e {
                DispatchError::Malformed(_) => {
                    debug!(user = session.user_id(), error = %e, "Dropping frame");
                }
                _ => warn!(user = session.user_id(), error = %e, "Dispatch failed"),
            }
            if let Some(frame) = e.rejection() {
                // A closed session has nobody left to tell.
                let _ = session.send(Arc::new(frame));
            }
        }

        result
    }

    async fn handle(
        &self,
        raw: &str,
        session: &SessionHandle,
    ) -> Result<Dispatched, DispatchError> {
        let frame = codec::decode(raw, self.config.max_frame_size)?;
        let user_id = session.user_id();
        let action = frame.kind();

        let outcome = match frame {
            ClientFrame::Message {
                receiver_id,
                content,
                is_group,
                group_id,
            } => {
                let recipient = Recipient::from_frame(receiver_id, is_group, group_id);
                let routed = self.router.route(user_id, recipient, content).await?;
                return Ok(Dispatched::Message(routed));
            }
            ClientFrame::CallInitiate {
                receiver_id,
                call_type,
            } => self.signaling.initiate(user_id, receiver_id, call_type).await?,
            ClientFrame::CallOffer { call_id, sdp } => {
                self.signaling.relay_offer(call_id, sdp, user_id).await?
            }
            ClientFrame::CallResponse {
                call_id,
                action: answer,
                sdp,
            } => self.signaling.respond(call_id, answer, sdp, user_id).await?,
            ClientFrame::IceCandidate {
                call_id,
                candidate,
                target_user_id,
            } => {
                self.signaling
                    .relay_ice(call_id, candidate, user_id, target_user_id)
                    .await?
            }
            ClientFrame::CallEnd { call_id } => self.signaling.end(call_id, user_id).await?,
            ClientFrame::Ping { timestamp } => {
                let _ = session.send(Arc::new(ServerFrame::pong(timestamp)));
                return Ok(Dispatched::Pong);
            }
        };

        Ok(Dispatched::Signal { action, outcome })
    }

    /// Tear down `session`.
    ///
    /// The user is marked inactive unless a newer session has taken over.
    /// Returns whether this session was still the registered one.
    ///
    /// # Errors
    ///
    /// Returns an error if the active flag cannot be cleared.
    pub async fn disconnect(&self, session: &SessionHandle) -> Result<bool, StoreError> {
        let user_id = session.user_id();
        let removed = self.sessions.unregister(user_id, session.connection_id());

        if removed {
            self.store.set_active(user_id, false).await?;
            info!(user = user_id, connection = session.connection_id(), "User disconnected");
        } else if !self.sessions.is_online(user_id) {
            // Evicted after a failed send; nothing else cleared the flag.
            self.store.set_active(user_id, false).await?;
            info!(
                user = user_id,
                connection = session.connection_id(),
                "Evicted session disconnected"
            );
        } else {
            debug!(
                user = user_id,
                connection = session.connection_id(),
                "Replaced session closed"
            );
        }

        Ok(removed)
    }

    /// Close every live session and clear all active flags.
    ///
    /// Later [`Core::connect`] calls are refused. Calls keep whatever state
    /// they are in. Returns the number of sessions closed.
    ///
    /// # Errors
    ///
    /// Returns an error if the active flags cannot be cleared.
    pub async fn shutdown(&self) -> Result<usize, StoreError> {
        self.closed.store(true, Ordering::SeqCst);
        let drained = self.sessions.drain();
        for session in &drained {
            session.close();
        }
        self.store.clear_active().await?;

        info!(sessions = drained.len(), "Core shut down");
        Ok(drained.len())
    }

    async fn rollback(&self, session: &SessionHandle) {
        if let Err(e) = self.disconnect(session).await {
            warn!(user = session.user_id(), error = %e, "Rollback failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    async fn core() -> (Core, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        for user in 1..=3 {
            store.add_user(user, format!("token-{}", user)).await;
        }
        store.befriend(1, 2).await;
        (Core::new(store.clone(), CoreConfig::default()), store)
    }

    fn next_frame(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Option<ServerFrame> {
        match rx.try_recv() {
            Ok(Outbound::Frame(frame)) => Some(frame.as_ref().clone()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_connect_replaces_session() {
        let (core, store) = core().await;

        let mut first = core.connect(1).await.unwrap();
        assert!(!first.replaced);
        assert!(store.is_active(1).await);

        let second = core.connect(1).await.unwrap();
        assert!(second.replaced);
        assert!(matches!(first.outbound.try_recv(), Ok(Outbound::Close)));
        assert_eq!(core.sessions().len(), 1);

        // The replaced connection's teardown must not evict the new one.
        assert!(!core.disconnect(&first.session).await.unwrap());
        assert!(core.sessions().is_online(1));
        assert!(store.is_active(1).await);

        assert!(core.disconnect(&second.session).await.unwrap());
        assert!(!store.is_active(1).await);
    }

    #[tokio::test]
    async fn test_evicted_session_clears_active_flag() {
        let (core, store) = core().await;
        let alice = core.connect(1).await.unwrap();
        let bob = core.connect(2).await.unwrap();
        drop(bob.outbound);

        core.dispatch(
            r#"{"type":"message","receiver_id":2,"content":"gone?"}"#,
            &alice.session,
        )
        .await
        .unwrap();
        assert!(!core.sessions().is_online(2));
        assert!(store.is_active(2).await);

        assert!(!core.disconnect(&bob.session).await.unwrap());
        assert!(!store.is_active(2).await);
        assert!(store.is_active(1).await);
    }

    #[tokio::test]
    async fn test_connect_refused_after_shutdown() {
        let (core, store) = core().await;
        let _early = core.connect(1).await.unwrap();
        core.shutdown().await.unwrap();
        assert!(core.is_closed());

        assert!(matches!(core.connect(2).await, Err(ConnectError::ShuttingDown)));
        assert!(!store.is_active(2).await);
        assert!(core.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_backlog_holds_live_frames_until_flushed() {
        let (core, _store) = core().await;
        let alice = core.connect(1).await.unwrap();
        core.dispatch(
            r#"{"type":"message","receiver_id":2,"content":"queued"}"#,
            &alice.session,
        )
        .await
        .unwrap();

        let bob = core.connect(2).await.unwrap();
        assert_eq!(bob.backlog, 1);
        let (session, mut outbound) = (bob.session, bob.outbound);
        assert!(session.is_held());

        core.dispatch(r#"{"type":"ping"}"#, &session).await.unwrap();
        assert!(outbound.try_recv().is_err());

        // Writer drops the tracked item unwritten; the pong still follows.
        let (flushed, ()) = tokio::join!(core.flush_offline(&session), async {
            let item = outbound.recv().await.unwrap();
            assert!(matches!(item, Outbound::Tracked { .. }));
        });
        assert_eq!(flushed.unwrap(), FlushOutcome { delivered: 0, remaining: 1 });
        assert!(!session.is_held());
        assert_eq!(
            next_frame(&mut outbound),
            Some(ServerFrame::Pong { timestamp: None })
        );
    }

    #[tokio::test]
    async fn test_unauthorized_gets_error_frame() {
        let (core, _store) = core().await;
        let mut conn = core.connect(1).await.unwrap();

        let result = core
            .dispatch(
                r#"{"type":"message","receiver_id":3,"content":"hi"}"#,
                &conn.session,
            )
            .await;

        assert!(matches!(result, Err(DispatchError::Unauthorized(_))));
        assert!(matches!(
            next_frame(&mut conn.outbound),
            Some(ServerFrame::Error { code: 403, .. })
        ));
    }

    #[tokio::test]
    async fn test_malformed_frame_is_dropped_silently() {
        let (core, _store) = core().await;
        let mut conn = core.connect(1).await.unwrap();

        for raw in [
            "not json",
            r#"{"type":"teleport"}"#,
            r#"{"type":"call_initiate","receiver_id":2,"call_type":"hologram"}"#,
        ] {
            let result = core.dispatch(raw, &conn.session).await;
            assert!(matches!(result, Err(DispatchError::Malformed(_))));
        }
        assert!(conn.outbound.try_recv().is_err());
        assert!(core.sessions().is_online(1));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let store = Arc::new(MemoryStore::new());
        store.add_user(1, "t").await;
        let core = Core::new(store, CoreConfig { max_frame_size: 32 });
        let conn = core.connect(1).await.unwrap();

        let raw = format!(
            r#"{{"type":"message","receiver_id":2,"content":"{}"}}"#,
            "x".repeat(64)
        );
        let result = core.dispatch(&raw, &conn.session).await;
        assert!(matches!(result, Err(DispatchError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let (core, _store) = core().await;
        let mut conn = core.connect(1).await.unwrap();

        let result = core
            .dispatch(r#"{"type":"ping","timestamp":42}"#, &conn.session)
            .await
            .unwrap();
        assert!(matches!(result, Dispatched::Pong));
        assert_eq!(
            next_frame(&mut conn.outbound),
            Some(ServerFrame::Pong {
                timestamp: Some(42)
            })
        );
    }

    #[tokio::test]
    async fn test_signal_action_is_reported() {
        let (core, _store) = core().await;
        let conn = core.connect(1).await.unwrap();

        let result = core
            .dispatch(r#"{"type":"call_end","call_id":77}"#, &conn.session)
            .await
            .unwrap();
        assert!(matches!(
            result,
            Dispatched::Signal {
                action: "call_end",
                outcome: SignalOutcome::Ignored { .. }
            }
        ));
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let (core, store) = core().await;
        let mut a = core.connect(1).await.unwrap();
        let mut b = core.connect(2).await.unwrap();

        assert_eq!(core.online_users(), vec![1, 2]);
        assert_eq!(core.shutdown().await.unwrap(), 2);

        assert!(core.sessions().is_empty());
        assert!(matches!(a.outbound.try_recv(), Ok(Outbound::Close)));
        assert!(matches!(b.outbound.try_recv(), Ok(Outbound::Close)));
        assert!(!store.is_active(1).await);
        assert!(!store.is_active(2).await);
    }
}
