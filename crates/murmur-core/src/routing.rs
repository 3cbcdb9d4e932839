//! Chat message routing and offline queue flushing.
//!
//! Every message is persisted before any delivery attempt. A 1:1 message then
//! goes either to the recipient's live session or to the offline queue,
//! decided by presence at send time. Group messages reach online members
//! only; absent members read them from history.

use murmur_protocol::{GroupId, UserId};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::DispatchError;
use crate::message::{ChatMessage, NewMessage, NewOfflineItem};
use crate::session::{Delivery, SessionHandle, SessionStore};
use crate::store::{Store, StoreError};

/// Who a chat message is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    User(UserId),
    Group(GroupId),
}

impl Recipient {
    /// Resolve the wire fields of a `message` frame.
    #[must_use]
    pub fn from_frame(receiver_id: i64, is_group: bool, group_id: Option<GroupId>) -> Self {
        if is_group {
            Recipient::Group(group_id.unwrap_or(receiver_id))
        } else {
            Recipient::User(receiver_id)
        }
    }
}

/// What happened to a routed message.
#[derive(Debug, Clone)]
pub struct RouteOutcome {
    /// The persisted record.
    pub message: ChatMessage,
    /// Sessions that received the message live.
    pub delivered: usize,
    /// Recipients for whom an offline item was queued.
    pub queued: usize,
}

/// Result of flushing a user's offline queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Items pushed and marked delivered.
    pub delivered: usize,
    /// Items left pending because the session went away mid-flush.
    pub remaining: usize,
}

/// Routes chat messages to live sessions or the offline queue.
pub struct MessageRouter {
    sessions: Arc<SessionStore>,
    store: Arc<dyn Store>,
}

impl MessageRouter {
    /// Create a router over the shared session store.
    #[must_use]
    pub fn new(sessions: Arc<SessionStore>, store: Arc<dyn Store>) -> Self {
        Self { sessions, store }
    }

    /// Route `content` from `sender_id` to `recipient`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Unauthorized`] if the sender is not a friend
    /// of the recipient or not a member of the group, and
    /// [`DispatchError::Storage`] if persistence fails.
    pub async fn route(
        &self,
        sender_id: UserId,
        recipient: Recipient,
        content: String,
    ) -> Result<RouteOutcome, DispatchError> {
        match recipient {
            Recipient::User(recipient_id) => {
                self.route_direct(sender_id, recipient_id, content).await
            }
            Recipient::Group(group_id) => self.route_group(sender_id, group_id, content).await,
        }
    }

    async fn route_direct(
        &self,
        sender_id: UserId,
        recipient_id: UserId,
        content: String,
    ) -> Result<RouteOutcome, DispatchError> {
        if !self.store.are_friends(sender_id, recipient_id).await? {
            return Err(DispatchError::Unauthorized(format!(
                "user {} is not in your friend list",
                recipient_id
            )));
        }

        let message = self
            .store
            .insert_message(NewMessage {
                sender_id,
                recipient_id,
                content,
                is_group: false,
                group_id: None,
            })
            .await?;

        // Presence is sampled once; the two branches never both run.
        let frame = Arc::new(message.to_frame());
        match self.sessions.deliver(recipient_id, frame) {
            Delivery::Delivered => {
                debug!(
                    message = message.id,
                    sender = sender_id,
                    recipient = recipient_id,
                    "Delivered live"
                );
                Ok(RouteOutcome {
                    message,
                    delivered: 1,
                    queued: 0,
                })
            }
            Delivery::Unreachable => {
                let item = self
                    .store
                    .enqueue_offline(NewOfflineItem::from(&message))
                    .await?;
                debug!(
                    message = message.id,
                    item = item.id,
                    recipient = recipient_id,
                    "Recipient offline, queued"
                );
                Ok(RouteOutcome {
                    message,
                    delivered: 0,
                    queued: 1,
                })
            }
        }
    }

    async fn route_group(
        &self,
        sender_id: UserId,
        group_id: GroupId,
        content: String,
    ) -> Result<RouteOutcome, DispatchError> {
        if !self.store.is_group_member(group_id, sender_id).await? {
            return Err(DispatchError::Unauthorized(format!(
                "not a member of group {}",
                group_id
            )));
        }

        let message = self
            .store
            .insert_message(NewMessage {
                sender_id,
                recipient_id: group_id,
                content,
                is_group: true,
                group_id: Some(group_id),
            })
            .await?;

        let members: HashSet<UserId> = self
            .store
            .group_members(group_id)
            .await?
            .into_iter()
            .filter(|member| *member != sender_id)
            .collect();

        let delivered = self.sessions.broadcast(
            |user_id| members.contains(&user_id),
            Arc::new(message.to_frame()),
        );

        debug!(
            message = message.id,
            group = group_id,
            members = members.len(),
            delivered,
            "Group message fanned out"
        );

        Ok(RouteOutcome {
            message,
            delivered,
            queued: 0,
        })
    }

    /// Write every pending offline item to a freshly registered session.
    ///
    /// Items go out oldest first, one at a time. Each is marked delivered only
    /// once the transport confirms it reached the socket; if a write is not
    /// confirmed the flush stops and the rest stay pending for the next
    /// connection. The transport must already be draining the session's
    /// channel.
    ///
    /// # Errors
    ///
    /// Returns an error if reading or updating the queue fails.
    pub async fn flush_offline(&self, session: &SessionHandle) -> Result<FlushOutcome, StoreError> {
        let user_id = session.user_id();
        let pending = self.store.pending_offline(user_id).await?;
        let total = pending.len();
        let mut outcome = FlushOutcome::default();

        for item in pending {
            let confirmed = match session.send_tracked(Arc::new(item.to_frame())) {
                Ok(confirmed) => confirmed,
                Err(e) => {
                    warn!(user = user_id, item = item.id, error = %e, "Offline flush interrupted");
                    break;
                }
            };
            if confirmed.await.is_err() {
                warn!(
                    user = user_id,
                    item = item.id,
                    "Offline item not written, flush interrupted"
                );
                break;
            }
            self.store.mark_delivered(item.id).await?;
            outcome.delivered += 1;
        }
        outcome.remaining = total - outcome.delivered;

        if total > 0 {
            info!(
                user = user_id,
                delivered = outcome.delivered,
                remaining = outcome.remaining,
                "Flushed offline queue"
            );
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::session::Outbound;
    use murmur_protocol::ServerFrame;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::task::JoinHandle;

    async fn setup() -> (Arc<SessionStore>, Arc<MemoryStore>, MessageRouter) {
        let sessions = Arc::new(SessionStore::new());
        let store = Arc::new(MemoryStore::new());
        for user in 1..=4 {
            store.add_user(user, format!("token-{}", user)).await;
        }
        store.befriend(1, 2).await;
        let router = MessageRouter::new(Arc::clone(&sessions), store.clone());
        (sessions, store, router)
    }

    fn content_of(outbound: Outbound) -> String {
        match outbound.frame().map(Arc::as_ref) {
            Some(ServerFrame::Message { content, .. }) => content.clone(),
            other => panic!("unexpected {:?}", other),
        }
    }

    /// Stand-in socket writer that confirms `limit` writes and then goes away.
    fn spawn_writer(mut rx: UnboundedReceiver<Outbound>, limit: usize) -> JoinHandle<Vec<String>> {
        tokio::spawn(async move {
            let mut written = Vec::new();
            while written.len() < limit {
                let Some(item) = rx.recv().await else { break };
                if let Some(ServerFrame::Message { content, .. }) = item.frame().map(Arc::as_ref) {
                    written.push(content.clone());
                }
                if let Outbound::Tracked { written: confirm, .. } = item {
                    let _ = confirm.send(());
                }
            }
            written
        })
    }

    #[test]
    fn test_recipient_resolution() {
        assert_eq!(Recipient::from_frame(5, false, Some(9)), Recipient::User(5));
        assert_eq!(Recipient::from_frame(5, true, Some(9)), Recipient::Group(9));
        assert_eq!(Recipient::from_frame(5, true, None), Recipient::Group(5));
    }

    #[tokio::test]
    async fn test_route_live() {
        let (sessions, store, router) = setup().await;
        let (session, mut rx) = SessionHandle::open(2);
        sessions.register(session);

        let outcome = router
            .route(1, Recipient::User(2), "hello".into())
            .await
            .unwrap();

        assert_eq!(outcome.delivered, 1);
        assert_eq!(outcome.queued, 0);
        assert_eq!(content_of(rx.try_recv().unwrap()), "hello");
        assert_eq!(store.messages().await.len(), 1);
        assert!(store.offline_items().await.is_empty());
    }

    #[tokio::test]
    async fn test_route_offline_queues_once() {
        let (_sessions, store, router) = setup().await;

        let outcome = router
            .route(1, Recipient::User(2), "later".into())
            .await
            .unwrap();

        assert_eq!(outcome.delivered, 0);
        assert_eq!(outcome.queued, 1);
        assert!(!outcome.message.is_read);

        let items = store.offline_items().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].message_id, outcome.message.id);
        assert!(!items[0].delivered);
    }

    #[tokio::test]
    async fn test_route_to_stranger_is_unauthorized() {
        let (_sessions, store, router) = setup().await;

        let result = router.route(1, Recipient::User(3), "hey".into()).await;
        assert!(matches!(result, Err(DispatchError::Unauthorized(_))));
        assert!(store.messages().await.is_empty());
    }

    #[tokio::test]
    async fn test_group_reaches_online_members_only() {
        let (sessions, store, router) = setup().await;
        for user in [1, 2, 3] {
            store.add_group_member(50, user).await;
        }

        let (s1, mut rx1) = SessionHandle::open(1);
        let (s2, mut rx2) = SessionHandle::open(2);
        let (s4, mut rx4) = SessionHandle::open(4);
        sessions.register(s1);
        sessions.register(s2);
        sessions.register(s4);

        let outcome = router
            .route(1, Recipient::Group(50), "team".into())
            .await
            .unwrap();

        assert_eq!(outcome.delivered, 1);
        assert_eq!(outcome.queued, 0);
        assert_eq!(content_of(rx2.try_recv().unwrap()), "team");
        assert!(rx1.try_recv().is_err());
        assert!(rx4.try_recv().is_err());
        assert!(store.offline_items().await.is_empty());
    }

    #[tokio::test]
    async fn test_group_non_member_rejected() {
        let (_sessions, store, router) = setup().await;
        store.add_group_member(50, 2).await;

        let result = router.route(4, Recipient::Group(50), "let me in".into()).await;
        assert!(matches!(result, Err(DispatchError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn test_flush_delivers_in_order() {
        let (_sessions, store, router) = setup().await;
        for text in ["one", "two", "three"] {
            router.route(1, Recipient::User(2), text.into()).await.unwrap();
        }

        let (session, rx) = SessionHandle::open(2);
        let writer = spawn_writer(rx, 3);
        let outcome = router.flush_offline(&session).await.unwrap();

        assert_eq!(outcome, FlushOutcome { delivered: 3, remaining: 0 });
        assert_eq!(writer.await.unwrap(), vec!["one", "two", "three"]);
        assert!(store.offline_items().await.iter().all(|item| item.delivered));
    }

    #[tokio::test]
    async fn test_flush_keeps_item_when_write_fails() {
        let (_sessions, store, router) = setup().await;
        router.route(1, Recipient::User(2), "queued".into()).await.unwrap();

        let (session, mut rx) = SessionHandle::open(2);
        let (outcome, ()) = tokio::join!(router.flush_offline(&session), async {
            // Taken off the channel but never written.
            let item = rx.recv().await.unwrap();
            assert!(matches!(item, Outbound::Tracked { .. }));
            drop(item);
        });

        assert_eq!(outcome.unwrap(), FlushOutcome { delivered: 0, remaining: 1 });
        assert!(!store.offline_items().await[0].delivered);
    }

    #[tokio::test]
    async fn test_flush_stops_at_first_unwritten_item() {
        let (_sessions, store, router) = setup().await;
        for text in ["one", "two", "three"] {
            router.route(1, Recipient::User(2), text.into()).await.unwrap();
        }

        let (session, rx) = SessionHandle::open(2);
        let writer = spawn_writer(rx, 1);
        let outcome = router.flush_offline(&session).await.unwrap();

        assert_eq!(outcome, FlushOutcome { delivered: 1, remaining: 2 });
        assert_eq!(writer.await.unwrap(), vec!["one"]);
        let delivered: Vec<bool> = store
            .offline_items()
            .await
            .iter()
            .map(|item| item.delivered)
            .collect();
        assert_eq!(delivered, vec![true, false, false]);
    }

    #[tokio::test]
    async fn test_flush_stops_when_session_gone() {
        let (_sessions, store, router) = setup().await;
        router.route(1, Recipient::User(2), "lost?".into()).await.unwrap();

        let (session, rx) = SessionHandle::open(2);
        drop(rx);

        let outcome = router.flush_offline(&session).await.unwrap();
        assert_eq!(outcome, FlushOutcome { delivered: 0, remaining: 1 });
        assert!(!store.offline_items().await[0].delivered);
    }
}
