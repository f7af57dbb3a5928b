use async_trait::async_trait;
use sqlx::PgPool;

use abi::errors::Error;

use crate::database::user::UserRepo;

pub struct PostgresUser {
    pool: PgPool,
}

impl PostgresUser {
    pub fn new(pool: PgPool) -> Self {
        PostgresUser { pool }
    }
}

#[async_trait]
impl UserRepo for PostgresUser {
    async fn get_name_by_session(&self, session_id: &str) -> Result<Option<String>, Error> {
        let name: Option<(String,)> =
            sqlx::query_as("SELECT name FROM users WHERE session_id = $1")
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(name.map(|row| row.0))
    }

    async fn get_id_by_name(&self, name: &str) -> Result<Option<i64>, Error> {
        let id: Option<(i64,)> = sqlx::query_as("SELECT id FROM users WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id.map(|row| row.0))
    }
}
