//! Live session registry.
//!
//! The [`SessionStore`] binds each user to at most one outbound channel. It is
//! the only state shared between connection tasks; every operation goes
//! through the sharded map and no map lock is held while a frame is pushed.

use dashmap::DashMap;
use murmur_protocol::{ServerFrame, UserId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::message::now_millis;

/// Process-unique identity of one registration.
pub type ConnectionId = u64;

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Item carried on a session's outbound channel.
#[derive(Debug)]
pub enum Outbound {
    /// A frame to write to the client.
    Frame(Arc<ServerFrame>),
    /// A frame whose successful write must be confirmed on `written`.
    ///
    /// Dropping `written` unanswered tells the sender the write failed.
    Tracked {
        frame: Arc<ServerFrame>,
        written: oneshot::Sender<()>,
    },
    /// The session was replaced or the server is shutting down.
    Close,
}

impl Outbound {
    /// The frame to write, if this item carries one.
    #[must_use]
    pub fn frame(&self) -> Option<&Arc<ServerFrame>> {
        match self {
            Outbound::Frame(frame) | Outbound::Tracked { frame, .. } => Some(frame),
            Outbound::Close => None,
        }
    }
}

/// The outbound side of a session has been dropped by its transport.
#[derive(Debug, Error)]
#[error("Session {0} is closed")]
pub struct SessionClosed(pub ConnectionId);

/// Result of pushing a frame to a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Accepted by the recipient's outbound channel.
    Delivered,
    /// No live session, or the session turned out to be stale.
    Unreachable,
}

/// Whether live frames pass straight to the channel.
#[derive(Debug)]
enum Gate {
    /// Live frames wait here until the offline backlog has been written.
    Held(Vec<Arc<ServerFrame>>),
    Open,
}

/// Handle to one live connection's outbound channel.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    user_id: UserId,
    connection_id: ConnectionId,
    connected_at: u64,
    sender: mpsc::UnboundedSender<Outbound>,
    gate: Arc<Mutex<Gate>>,
}

impl SessionHandle {
    /// Open a new outbound channel for `user_id`.
    ///
    /// The receiver is drained by the transport that owns the socket.
    #[must_use]
    pub fn open(user_id: UserId) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        Self::with_gate(user_id, Gate::Open)
    }

    /// Open a channel that holds live frames back until [`release`].
    ///
    /// Tracked frames pass immediately, so an offline backlog sent with
    /// [`send_tracked`] reaches the client ahead of anything routed live
    /// in the meantime.
    ///
    /// [`release`]: SessionHandle::release
    /// [`send_tracked`]: SessionHandle::send_tracked
    #[must_use]
    pub fn open_held(user_id: UserId) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        Self::with_gate(user_id, Gate::Held(Vec::new()))
    }

    fn with_gate(user_id: UserId, gate: Gate) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = Self {
            user_id,
            connection_id: CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed),
            connected_at: now_millis(),
            sender,
            gate: Arc::new(Mutex::new(gate)),
        };
        (handle, receiver)
    }

    /// The user this session belongs to.
    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Registration identity used for compare-and-swap removal.
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// When the session was opened, in milliseconds since the Unix epoch.
    #[must_use]
    pub fn connected_at(&self) -> u64 {
        self.connected_at
    }

    fn gate(&self) -> MutexGuard<'_, Gate> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push a frame to this session, or hold it while the session is held.
    ///
    /// # Errors
    ///
    /// Returns [`SessionClosed`] if the transport has already gone away.
    pub fn send(&self, frame: Arc<ServerFrame>) -> Result<(), SessionClosed> {
        let mut gate = self.gate();
        match &mut *gate {
            Gate::Held(_) if self.sender.is_closed() => Err(SessionClosed(self.connection_id)),
            Gate::Held(held) => {
                held.push(frame);
                Ok(())
            }
            Gate::Open => self
                .sender
                .send(Outbound::Frame(frame))
                .map_err(|_| SessionClosed(self.connection_id)),
        }
    }

    /// Push a frame whose write the transport confirms.
    ///
    /// The returned receiver resolves once the frame is on the socket and
    /// errors if the transport drops it unwritten. Bypasses the hold.
    ///
    /// # Errors
    ///
    /// Returns [`SessionClosed`] if the transport has already gone away.
    pub fn send_tracked(
        &self,
        frame: Arc<ServerFrame>,
    ) -> Result<oneshot::Receiver<()>, SessionClosed> {
        let (written, confirmed) = oneshot::channel();
        self.sender
            .send(Outbound::Tracked { frame, written })
            .map_err(|_| SessionClosed(self.connection_id))?;
        Ok(confirmed)
    }

    /// Pass held frames on in arrival order and stop holding.
    ///
    /// Returns how many frames had been held.
    pub fn release(&self) -> usize {
        let mut gate = self.gate();
        let Gate::Held(held) = std::mem::replace(&mut *gate, Gate::Open) else {
            return 0;
        };

        let count = held.len();
        for frame in held {
            if self.sender.send(Outbound::Frame(frame)).is_err() {
                break;
            }
        }
        count
    }

    /// Whether live frames are currently being held back.
    #[must_use]
    pub fn is_held(&self) -> bool {
        matches!(*self.gate(), Gate::Held(_))
    }

    /// Ask the transport to close this session.
    pub fn close(&self) {
        // Already-gone transports need no further closing.
        let _ = self.sender.send(Outbound::Close);
    }

    /// Whether the transport side has been dropped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Registry of live sessions, at most one per user.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: DashMap<UserId, SessionHandle>,
}

impl SessionStore {
    /// Create an empty session store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `session` to its user.
    ///
    /// Returns the session it replaced, if any. The caller must close it.
    pub fn register(&self, session: SessionHandle) -> Option<SessionHandle> {
        let user_id = session.user_id;
        let connection_id = session.connection_id;
        let previous = self.sessions.insert(user_id, session);

        debug!(
            user = user_id,
            connection = connection_id,
            replaced = ?previous.as_ref().map(|s| s.connection_id),
            "Session registered"
        );

        previous
    }

    /// Remove the binding for `user_id` only if it is still `connection_id`.
    ///
    /// Returns `true` if the binding was removed.
    pub fn unregister(&self, user_id: UserId, connection_id: ConnectionId) -> bool {
        let removed = self
            .sessions
            .remove_if(&user_id, |_, s| s.connection_id == connection_id)
            .is_some();

        if removed {
            debug!(user = user_id, connection = connection_id, "Session unregistered");
        } else {
            trace!(
                user = user_id,
                connection = connection_id,
                "Stale unregister ignored"
            );
        }

        removed
    }

    /// Current session for `user_id`, if any.
    #[must_use]
    pub fn lookup(&self, user_id: UserId) -> Option<SessionHandle> {
        self.sessions.get(&user_id).map(|s| s.value().clone())
    }

    /// Check if a user has a live session.
    #[must_use]
    pub fn is_online(&self, user_id: UserId) -> bool {
        self.sessions.contains_key(&user_id)
    }

    /// Push `frame` to the user's live session.
    ///
    /// A failed push evicts the stale binding and reports the user as
    /// unreachable.
    pub fn deliver(&self, user_id: UserId, frame: Arc<ServerFrame>) -> Delivery {
        let Some(session) = self.lookup(user_id) else {
            return Delivery::Unreachable;
        };

        match session.send(frame) {
            Ok(()) => Delivery::Delivered,
            Err(e) => {
                warn!(user = user_id, error = %e, "Send failed, evicting stale session");
                self.unregister(user_id, session.connection_id);
                Delivery::Unreachable
            }
        }
    }

    /// Best-effort push of `frame` to every session whose user matches
    /// `predicate`.
    ///
    /// Returns the number of sessions that accepted the frame.
    pub fn broadcast<F>(&self, predicate: F, frame: Arc<ServerFrame>) -> usize
    where
        F: Fn(UserId) -> bool,
    {
        let targets: Vec<SessionHandle> = self
            .sessions
            .iter()
            .filter(|entry| predicate(*entry.key()))
            .map(|entry| entry.value().clone())
            .collect();

        let mut delivered = 0;
        for session in targets {
            match session.send(Arc::clone(&frame)) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(user = session.user_id, error = %e, "Broadcast send failed, skipping");
                    self.unregister(session.user_id, session.connection_id);
                }
            }
        }

        trace!(recipients = delivered, "Broadcast complete");
        delivered
    }

    /// Ids of all users with a live session.
    #[must_use]
    pub fn online_users(&self) -> Vec<UserId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if no session is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Remove and return every registered session.
    pub fn drain(&self) -> Vec<SessionHandle> {
        let users = self.online_users();
        users
            .into_iter()
            .filter_map(|user_id| self.sessions.remove(&user_id).map(|(_, s)| s))
            .collect()
    }
}
