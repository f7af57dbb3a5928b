use abi::errors::Error;
use abi::model::StoredMessage;
use async_trait::async_trait;

#[async_trait]
pub trait MessageRepo: Sync + Send {
    /// persist a private message that could not be delivered live
    async fn insert(&self, sender_id: i64, receiver_id: i64, body: &str) -> Result<i64, Error>;

    /// all persisted messages between the two users, either orientation,
    /// ascending by creation time
    async fn fetch_conversation(
        &self,
        user_a: i64,
        user_b: i64,
    ) -> Result<Vec<StoredMessage>, Error>;
}
