mod message;
mod postgres;
mod user;

use abi::config::Config;
use abi::errors::Error;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub use crate::database::message::MessageRepo;
pub use crate::database::user::UserRepo;

/// the persistence collaborator seen by the hub:
/// identity resolution plus the private message store
pub struct DbRepo {
    pub user: Box<dyn UserRepo>,
    pub msg: Box<dyn MessageRepo>,
}

impl DbRepo {
    pub async fn new(config: &Config) -> Result<Self, Error> {
        let pool = PgPoolOptions::new()
            .max_connections(config.db.max_connections)
            .connect(&config.db.url())
            .await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        let user = Box::new(postgres::PostgresUser::new(pool.clone()));
        let msg = Box::new(postgres::PostgresMessage::new(pool));
        Self { user, msg }
    }
}
