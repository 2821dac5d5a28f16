use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Every login shares one password. The login user name is not checked here;
/// the query handler resolves it to a principal, and unknown names act as an
/// anonymous session.
#[derive(Debug)]
pub struct RoomShareAuthSource {
    password: String,
}

impl RoomShareAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for RoomShareAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
