use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

use crate::engine::Engine;
use crate::observability::AUTH_FAILURES_TOTAL;
use crate::wire::user_error;

/// Logins are user emails sharing one deployment password. Unknown and
/// deactivated accounts are refused before the password exchange.
pub struct RoomBookAuthSource {
    engine: Arc<Engine>,
    password: String,
}

impl RoomBookAuthSource {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self { engine, password }
    }
}

// `AuthSource` requires `Debug`; the engine and the secret stay out of it.
impl fmt::Debug for RoomBookAuthSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomBookAuthSource").finish_non_exhaustive()
    }
}

#[async_trait]
impl AuthSource for RoomBookAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let email = login.user().unwrap_or_default();
        if self.engine.resolve_principal(email).is_none() {
            metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
            tracing::warn!(login = email, "login refused: no active user");
            return Err(user_error("28000", format!("no active user with email {email:?}")));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
