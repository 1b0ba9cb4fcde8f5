use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Shared-secret cleartext auth. The `user` parameter is the identity
/// claim; this only gates that the caller came through the identity
/// collaborator, which holds the same secret.
#[derive(Debug)]
pub struct UniRoomAuthSource {
    password: String,
}

impl UniRoomAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for UniRoomAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
