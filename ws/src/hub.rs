use std::sync::Arc;

use axum::extract::ws::Message;
use tracing::{debug, error, info, warn};

use abi::errors::Error;
use abi::model::{ClientFrame, HistoryMessage, ServerFrame};
use db::DbRepo;

use crate::client::Client;
use crate::registry::Registry;

/// the presence and messaging hub
///
/// owns the connection registry and the persistence collaborator; one
/// instance is built at server start and cloned into every connection task
#[derive(Clone)]
pub struct Hub {
    registry: Registry,
    db: Arc<DbRepo>,
}

impl Hub {
    pub fn new(db: Arc<DbRepo>) -> Self {
        Self {
            registry: Registry::new(),
            db,
        }
    }

    /// map the session credential carried by the upgrade request to a
    /// display name; `None` refuses the connection
    pub async fn resolve_identity(&self, session_id: &str) -> Result<Option<String>, Error> {
        self.db.user.get_name_by_session(session_id).await
    }

    pub async fn connect(&self, name: String, client: Client) {
        info!("{} connected", name);
        self.registry.register(name, client);
        self.broadcast_roster().await;
    }

    pub async fn disconnect(&self, name: &str) {
        info!("{} disconnected", name);
        self.registry.unregister(name);
        self.broadcast_roster().await;
    }

    /// dispatch one inbound frame from `conn_name`'s read loop
    pub async fn handle_frame(&self, conn_name: &str, frame: ClientFrame) {
        match frame {
            ClientFrame::PrivateMessage {
                sender,
                receiver,
                message,
            } => {
                debug!("private message from {} to {}", sender, receiver);
                if let Err(e) = self.send_private_message(&sender, &receiver, &message).await {
                    error!("private message from {} to {} failed: {}", sender, receiver, e);
                    self.notify(conn_name, "your message could not be delivered")
                        .await;
                }
            }
            ClientFrame::Typing { sender, receiver } => {
                self.send_typing(&sender, &receiver).await;
            }
            ClientFrame::ChatHistoryRequest { sender, receiver } => {
                debug!("chat history request between {} and {}", sender, receiver);
                if let Err(e) = self.send_chat_history(conn_name, &sender, &receiver).await {
                    error!("chat history between {} and {} failed: {}", sender, receiver, e);
                    self.notify(conn_name, "chat history could not be loaded")
                        .await;
                }
            }
            ClientFrame::Unknown => {
                debug!("ignoring unknown frame from {}", conn_name);
            }
        }
    }

    /// send the current roster to every connection in a registry snapshot;
    /// per-recipient failures are logged and do not stop the fan-out
    pub async fn broadcast_roster(&self) {
        let snapshot = self.registry.snapshot();
        let mut users: Vec<String> = snapshot.iter().map(|(name, _)| name.clone()).collect();
        users.sort();

        let frame = ServerFrame::UserList { users };
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(e) => {
                error!("roster serialization failed: {}", e);
                return;
            }
        };

        for (name, client) in snapshot {
            if let Err(e) = client.send_raw(Message::Text(text.clone())).await {
                error!("roster broadcast to {} failed: {}", name, e);
            }
        }
    }

    /// deliver live to a registered receiver, or persist and tell the
    /// sender the receiver is offline; exactly one of the two happens
    pub async fn send_private_message(
        &self,
        sender: &str,
        receiver: &str,
        body: &str,
    ) -> Result<(), Error> {
        if body.is_empty() {
            warn!("dropping empty private message from {} to {}", sender, receiver);
            return Ok(());
        }

        match self.registry.lookup(receiver) {
            Some(peer) => {
                let frame = ServerFrame::PrivateMessage {
                    sender: sender.to_string(),
                    receiver: receiver.to_string(),
                    message: body.to_string(),
                };
                // a live write failure is logged, not retried; the peer is
                // unregistered by its own read loop, not from here
                if let Err(e) = peer.send_frame(&frame).await {
                    error!("delivery to {} failed: {}", receiver, e);
                }

                if let Some(origin) = self.registry.lookup(sender) {
                    let confirmation = ServerFrame::MessageSent {
                        sender: sender.to_string(),
                        receiver: receiver.to_string(),
                        message: body.to_string(),
                    };
                    if let Err(e) = origin.send_frame(&confirmation).await {
                        error!("delivery confirmation to {} failed: {}", sender, e);
                    }
                }
            }
            None => {
                let sender_id = self.resolve_id(sender).await?;
                let receiver_id = self.resolve_id(receiver).await?;
                self.db.msg.insert(sender_id, receiver_id, body).await?;
                info!("{} offline, message from {} persisted", receiver, sender);
                self.notify(
                    sender,
                    &format!(
                        "{receiver} is currently offline. Your message will be delivered when they reconnect."
                    ),
                )
                .await;
            }
        }
        Ok(())
    }

    /// best-effort: forwarded if the receiver is connected, silently
    /// dropped otherwise
    pub async fn send_typing(&self, sender: &str, receiver: &str) {
        if let Some(peer) = self.registry.lookup(receiver) {
            let frame = ServerFrame::Typing {
                sender: sender.to_string(),
                receiver: receiver.to_string(),
            };
            if let Err(e) = peer.send_frame(&frame).await {
                error!("typing signal to {} failed: {}", receiver, e);
            }
        }
    }

    /// reconstruct the conversation between the two users and reply on the
    /// requester's connection as a single payload
    pub async fn send_chat_history(
        &self,
        requester: &str,
        user1: &str,
        user2: &str,
    ) -> Result<(), Error> {
        let client = match self.registry.lookup(requester) {
            Some(client) => client,
            None => return Ok(()),
        };

        let user1_id = self.resolve_id(user1).await?;
        let user2_id = self.resolve_id(user2).await?;
        let messages = self.db.msg.fetch_conversation(user1_id, user2_id).await?;

        let frame = ServerFrame::ChatHistory {
            user1: user1.to_string(),
            user2: user2.to_string(),
            messages: messages.into_iter().map(HistoryMessage::from).collect(),
        };
        client.send_frame(&frame).await
    }

    async fn notify(&self, name: &str, message: &str) {
        if let Some(client) = self.registry.lookup(name) {
            let frame = ServerFrame::SystemNotification {
                receiver: name.to_string(),
                message: message.to_string(),
            };
            if let Err(e) = client.send_frame(&frame).await {
                error!("notification to {} failed: {}", name, e);
            }
        }
    }

    async fn resolve_id(&self, name: &str) -> Result<i64, Error> {
        self.db
            .user
            .get_id_by_name(name)
            .await?
            .ok_or_else(|| Error::not_found_with_details(format!("unknown user {name}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    use abi::errors::ErrorKind;
    use abi::model::StoredMessage;
    use db::{MessageRepo, UserRepo};

    struct FakeUsers {
        ids: HashMap<String, i64>,
        sessions: HashMap<String, String>,
    }

    #[async_trait]
    impl UserRepo for FakeUsers {
        async fn get_name_by_session(&self, session_id: &str) -> Result<Option<String>, Error> {
            Ok(self.sessions.get(session_id).cloned())
        }

        async fn get_id_by_name(&self, name: &str) -> Result<Option<i64>, Error> {
            Ok(self.ids.get(name).copied())
        }
    }

    struct FakeMessages {
        rows: Arc<Mutex<Vec<(i64, i64, String)>>>,
        names: HashMap<i64, String>,
        fail: bool,
    }

    #[async_trait]
    impl MessageRepo for FakeMessages {
        async fn insert(
            &self,
            sender_id: i64,
            receiver_id: i64,
            body: &str,
        ) -> Result<i64, Error> {
            if self.fail {
                return Err(Error::with_details(ErrorKind::DbError, "storage offline"));
            }
            let mut rows = self.rows.lock().unwrap();
            rows.push((sender_id, receiver_id, body.to_string()));
            Ok(rows.len() as i64)
        }

        async fn fetch_conversation(
            &self,
            user_a: i64,
            user_b: i64,
        ) -> Result<Vec<StoredMessage>, Error> {
            if self.fail {
                return Err(Error::with_details(ErrorKind::DbError, "storage offline"));
            }
            let rows = self.rows.lock().unwrap();
            Ok(rows
                .iter()
                .enumerate()
                .filter(|(_, (s, r, _))| {
                    (*s == user_a && *r == user_b) || (*s == user_b && *r == user_a)
                })
                .map(|(i, (s, r, body))| StoredMessage {
                    id: i as i64 + 1,
                    sender: self.names[s].clone(),
                    receiver: self.names[r].clone(),
                    body: body.clone(),
                    created_at: chrono::DateTime::from_timestamp(i as i64, 0)
                        .unwrap()
                        .naive_utc(),
                })
                .collect())
        }
    }

    fn test_hub(fail: bool) -> (Hub, Arc<Mutex<Vec<(i64, i64, String)>>>) {
        let ids = HashMap::from([
            ("alice".to_string(), 1),
            ("bob".to_string(), 2),
            ("carol".to_string(), 3),
        ]);
        let names = ids.iter().map(|(n, id)| (*id, n.clone())).collect();
        let sessions = HashMap::from([("session-alice".to_string(), "alice".to_string())]);
        let rows = Arc::new(Mutex::new(Vec::new()));
        let db = DbRepo {
            user: Box::new(FakeUsers { ids, sessions }),
            msg: Box::new(FakeMessages {
                rows: rows.clone(),
                names,
                fail,
            }),
        };
        (Hub::new(Arc::new(db)), rows)
    }

    async fn join(hub: &Hub, name: &str) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(32);
        hub.connect(name.to_string(), Client::new(name, tx)).await;
        rx
    }

    fn next_frame(rx: &mut mpsc::Receiver<Message>) -> ServerFrame {
        loop {
            match rx.try_recv().expect("expected a frame") {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                // control frames are irrelevant here
                _ => continue,
            }
        }
    }

    fn assert_empty(rx: &mut mpsc::Receiver<Message>) {
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn resolve_identity_maps_session_to_name() {
        let (hub, _) = test_hub(false);
        let name = hub.resolve_identity("session-alice").await.unwrap();
        assert_eq!(name.as_deref(), Some("alice"));
        assert!(hub.resolve_identity("bogus").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn roster_follows_membership() {
        let (hub, _) = test_hub(false);
        let mut alice = join(&hub, "alice").await;
        assert_eq!(
            next_frame(&mut alice),
            ServerFrame::UserList {
                users: vec!["alice".to_string()]
            }
        );

        let mut bob = join(&hub, "bob").await;
        let both = ServerFrame::UserList {
            users: vec!["alice".to_string(), "bob".to_string()],
        };
        assert_eq!(next_frame(&mut alice), both);
        assert_eq!(next_frame(&mut bob), both);

        hub.disconnect("alice").await;
        assert_eq!(
            next_frame(&mut bob),
            ServerFrame::UserList {
                users: vec!["bob".to_string()]
            }
        );
    }

    #[tokio::test]
    async fn live_delivery_reaches_peer_and_confirms_sender() {
        let (hub, rows) = test_hub(false);
        let mut alice = join(&hub, "alice").await;
        let mut bob = join(&hub, "bob").await;
        next_frame(&mut alice);
        next_frame(&mut alice);
        next_frame(&mut bob);

        hub.handle_frame(
            "alice",
            ClientFrame::PrivateMessage {
                sender: "alice".to_string(),
                receiver: "bob".to_string(),
                message: "hi".to_string(),
            },
        )
        .await;

        assert_eq!(
            next_frame(&mut bob),
            ServerFrame::PrivateMessage {
                sender: "alice".to_string(),
                receiver: "bob".to_string(),
                message: "hi".to_string(),
            }
        );
        assert_eq!(
            next_frame(&mut alice),
            ServerFrame::MessageSent {
                sender: "alice".to_string(),
                receiver: "bob".to_string(),
                message: "hi".to_string(),
            }
        );
        assert_empty(&mut bob);
        // delivered live, so nothing was persisted
        assert!(rows.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn offline_receiver_persists_once_and_notifies_sender() {
        let (hub, rows) = test_hub(false);
        let mut alice = join(&hub, "alice").await;
        next_frame(&mut alice);

        hub.handle_frame(
            "alice",
            ClientFrame::PrivateMessage {
                sender: "alice".to_string(),
                receiver: "bob".to_string(),
                message: "hi".to_string(),
            },
        )
        .await;

        assert_eq!(
            rows.lock().unwrap().as_slice(),
            &[(1, 2, "hi".to_string())]
        );
        match next_frame(&mut alice) {
            ServerFrame::SystemNotification { receiver, message } => {
                assert_eq!(receiver, "alice");
                assert!(message.contains("bob is currently offline"));
            }
            other => panic!("expected offline notice, got {other:?}"),
        }
        assert_empty(&mut alice);
    }

    #[tokio::test]
    async fn offline_message_is_retrievable_through_history() {
        let (hub, _) = test_hub(false);
        let mut alice = join(&hub, "alice").await;
        next_frame(&mut alice);

        hub.handle_frame(
            "alice",
            ClientFrame::PrivateMessage {
                sender: "alice".to_string(),
                receiver: "bob".to_string(),
                message: "see you tomorrow".to_string(),
            },
        )
        .await;
        next_frame(&mut alice); // offline notice

        hub.handle_frame(
            "alice",
            ClientFrame::ChatHistoryRequest {
                sender: "alice".to_string(),
                receiver: "bob".to_string(),
            },
        )
        .await;

        match next_frame(&mut alice) {
            ServerFrame::ChatHistory { messages, .. } => {
                assert_eq!(messages.len(), 1);
                assert_eq!(messages[0].sender, "alice");
                assert_eq!(messages[0].receiver, "bob");
                assert_eq!(messages[0].message, "see you tomorrow");
            }
            other => panic!("expected chat history, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_body_is_rejected_without_side_effect() {
        let (hub, rows) = test_hub(false);
        let mut alice = join(&hub, "alice").await;
        let mut bob = join(&hub, "bob").await;
        next_frame(&mut alice);
        next_frame(&mut alice);
        next_frame(&mut bob);

        hub.handle_frame(
            "alice",
            ClientFrame::PrivateMessage {
                sender: "alice".to_string(),
                receiver: "bob".to_string(),
                message: String::new(),
            },
        )
        .await;

        assert_empty(&mut alice);
        assert_empty(&mut bob);
        assert!(rows.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn typing_is_forwarded_or_silently_dropped() {
        let (hub, rows) = test_hub(false);
        let mut alice = join(&hub, "alice").await;
        let mut bob = join(&hub, "bob").await;
        next_frame(&mut alice);
        next_frame(&mut alice);
        next_frame(&mut bob);

        hub.handle_frame(
            "alice",
            ClientFrame::Typing {
                sender: "alice".to_string(),
                receiver: "bob".to_string(),
            },
        )
        .await;
        assert_eq!(
            next_frame(&mut bob),
            ServerFrame::Typing {
                sender: "alice".to_string(),
                receiver: "bob".to_string(),
            }
        );

        // carol is not connected; nothing happens, nothing is stored
        hub.handle_frame(
            "alice",
            ClientFrame::Typing {
                sender: "alice".to_string(),
                receiver: "carol".to_string(),
            },
        )
        .await;
        assert_empty(&mut alice);
        assert!(rows.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn chat_history_covers_both_orientations_in_order() {
        let (hub, rows) = test_hub(false);
        rows.lock().unwrap().extend([
            (1, 2, "hi bob".to_string()),
            (2, 1, "hi alice".to_string()),
            (1, 2, "how are you".to_string()),
        ]);
        let mut alice = join(&hub, "alice").await;
        next_frame(&mut alice);

        hub.handle_frame(
            "alice",
            ClientFrame::ChatHistoryRequest {
                sender: "alice".to_string(),
                receiver: "bob".to_string(),
            },
        )
        .await;

        match next_frame(&mut alice) {
            ServerFrame::ChatHistory {
                user1,
                user2,
                messages,
            } => {
                assert_eq!(user1, "alice");
                assert_eq!(user2, "bob");
                let bodies: Vec<&str> = messages.iter().map(|m| m.message.as_str()).collect();
                assert_eq!(bodies, ["hi bob", "hi alice", "how are you"]);
                assert_eq!(messages[1].sender, "bob");
                assert_eq!(messages[1].receiver, "alice");
            }
            other => panic!("expected chat history, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn history_failure_is_reported_and_connection_survives() {
        let (hub, _) = test_hub(true);
        let mut alice = join(&hub, "alice").await;
        next_frame(&mut alice);

        hub.handle_frame(
            "alice",
            ClientFrame::ChatHistoryRequest {
                sender: "alice".to_string(),
                receiver: "bob".to_string(),
            },
        )
        .await;

        match next_frame(&mut alice) {
            ServerFrame::SystemNotification { message, .. } => {
                assert!(message.contains("chat history"));
            }
            other => panic!("expected failure notice, got {other:?}"),
        }

        // the connection is still registered and usable
        hub.handle_frame(
            "alice",
            ClientFrame::Typing {
                sender: "bob".to_string(),
                receiver: "alice".to_string(),
            },
        )
        .await;
        assert_eq!(
            next_frame(&mut alice),
            ServerFrame::Typing {
                sender: "bob".to_string(),
                receiver: "alice".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn persistence_failure_surfaces_as_delivery_failure() {
        let (hub, rows) = test_hub(true);
        let mut alice = join(&hub, "alice").await;
        next_frame(&mut alice);

        hub.handle_frame(
            "alice",
            ClientFrame::PrivateMessage {
                sender: "alice".to_string(),
                receiver: "bob".to_string(),
                message: "hi".to_string(),
            },
        )
        .await;

        match next_frame(&mut alice) {
            ServerFrame::SystemNotification { message, .. } => {
                assert!(message.contains("could not be delivered"));
            }
            other => panic!("expected failure notice, got {other:?}"),
        }
        assert!(rows.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn message_to_unknown_user_fails_without_persisting() {
        let (hub, rows) = test_hub(false);
        let mut alice = join(&hub, "alice").await;
        next_frame(&mut alice);

        hub.handle_frame(
            "alice",
            ClientFrame::PrivateMessage {
                sender: "alice".to_string(),
                receiver: "mallory".to_string(),
                message: "hi".to_string(),
            },
        )
        .await;

        match next_frame(&mut alice) {
            ServerFrame::SystemNotification { message, .. } => {
                assert!(message.contains("could not be delivered"));
            }
            other => panic!("expected failure notice, got {other:?}"),
        }
        assert!(rows.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_frame_is_ignored() {
        let (hub, rows) = test_hub(false);
        let mut alice = join(&hub, "alice").await;
        next_frame(&mut alice);

        hub.handle_frame("alice", ClientFrame::Unknown).await;
        assert_empty(&mut alice);
        assert!(rows.lock().unwrap().is_empty());
    }
}
