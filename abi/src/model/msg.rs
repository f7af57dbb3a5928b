use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// frame received on a client connection
///
/// a frame whose tag is not one of the known kinds deserializes to
/// `Unknown` and is dropped by the read loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    PrivateMessage {
        sender: String,
        receiver: String,
        message: String,
    },
    Typing {
        sender: String,
        receiver: String,
    },
    ChatHistoryRequest {
        sender: String,
        receiver: String,
    },
    #[serde(other)]
    Unknown,
}

/// frame written to a client connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// roster of currently connected display names
    UserList { users: Vec<String> },
    PrivateMessage {
        sender: String,
        receiver: String,
        message: String,
    },
    /// delivery confirmation sent back to the sender
    MessageSent {
        sender: String,
        receiver: String,
        message: String,
    },
    /// offline notice / delivery failure, addressed to one connection
    SystemNotification { receiver: String, message: String },
    Typing {
        sender: String,
        receiver: String,
    },
    ChatHistory {
        user1: String,
        user2: String,
        messages: Vec<HistoryMessage>,
    },
}

/// one entry of a chat_history payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub sender: String,
    pub receiver: String,
    pub message: String,
    pub timestamp: String,
}

/// persisted private message row, joined with both display names
#[derive(Debug, Clone, FromRow)]
pub struct StoredMessage {
    pub id: i64,
    pub sender: String,
    pub receiver: String,
    pub body: String,
    pub created_at: chrono::NaiveDateTime,
}

impl From<StoredMessage> for HistoryMessage {
    fn from(msg: StoredMessage) -> Self {
        HistoryMessage {
            sender: msg.sender,
            receiver: msg.receiver,
            message: msg.body,
            timestamp: msg.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}
