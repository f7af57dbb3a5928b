use abi::errors::Error;
use async_trait::async_trait;

#[async_trait]
pub trait UserRepo: Sync + Send {
    /// resolve a session credential to a display name;
    /// `None` means the credential does not map to a known user
    async fn get_name_by_session(&self, session_id: &str) -> Result<Option<String>, Error>;

    /// resolve a display name to the user id used to attribute
    /// persisted messages
    async fn get_id_by_name(&self, name: &str) -> Result<Option<i64>, Error>;
}
