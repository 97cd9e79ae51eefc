use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// One password for every login. The login name is not a secret here:
/// it carries the caller's account ULID, which the Role Gate checks on
/// every command.
#[derive(Debug, Clone)]
pub struct SharedPassword {
    secret: Vec<u8>,
}

impl SharedPassword {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            secret: password.into().into_bytes(),
        }
    }
}

#[async_trait]
impl AuthSource for SharedPassword {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.secret.clone()))
    }
}
