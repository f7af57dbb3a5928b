use async_trait::async_trait;
use sqlx::PgPool;
use tracing::debug;

use abi::errors::Error;
use abi::model::StoredMessage;

use crate::database::message::MessageRepo;

pub struct PostgresMessage {
    pool: PgPool,
}

impl PostgresMessage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageRepo for PostgresMessage {
    async fn insert(&self, sender_id: i64, receiver_id: i64, body: &str) -> Result<i64, Error> {
        debug!("persisting private message: {} -> {}", sender_id, receiver_id);
        let id: (i64,) = sqlx::query_as(
            "INSERT INTO private_messages (sender_id, receiver_id, body)
             VALUES ($1, $2, $3)
             RETURNING id",
        )
        .bind(sender_id)
        .bind(receiver_id)
        .bind(body)
        .fetch_one(&self.pool)
        .await?;
        Ok(id.0)
    }

    async fn fetch_conversation(
        &self,
        user_a: i64,
        user_b: i64,
    ) -> Result<Vec<StoredMessage>, Error> {
        debug!("loading conversation: {} <-> {}", user_a, user_b);
        let messages = sqlx::query_as(
            "SELECT pm.id, u_sender.name AS sender, u_receiver.name AS receiver,
                    pm.body, pm.created_at
             FROM private_messages pm
             JOIN users u_sender ON pm.sender_id = u_sender.id
             JOIN users u_receiver ON pm.receiver_id = u_receiver.id
             WHERE (pm.sender_id = $1 AND pm.receiver_id = $2)
                OR (pm.sender_id = $2 AND pm.receiver_id = $1)
             ORDER BY pm.created_at ASC, pm.id ASC",
        )
        .bind(user_a)
        .bind(user_b)
        .fetch_all(&self.pool)
        .await?;
        Ok(messages)
    }
}
