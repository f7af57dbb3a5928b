mod message;
mod user;

pub(crate) use message::PostgresMessage;
pub(crate) use user::PostgresUser;
