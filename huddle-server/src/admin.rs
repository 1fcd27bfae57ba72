//! Admin authorization: an external credential engine consumed as an
//! opaque accept/reject identity oracle, plus TTL'd session bookkeeping.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use huddle_core::http::Request;
use huddle_core::Error;

/// Cookie carrying the admin session id.
pub const SESSION_COOKIE: &str = "huddleAdminSession";

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("credential rejected")]
    Rejected,
    #[error("unknown user")]
    UnknownUser,
}

/// External credential engine. Implementations verify the request payload
/// and return the authenticated identity; nothing about the verification
/// scheme leaks into the rest of the server.
pub trait CredentialEngine: Send + Sync {
    fn register(&self, username: &str, request: &Value) -> Result<String, CredentialError>;
    fn authenticate(&self, username: &str, request: &Value) -> Result<String, CredentialError>;
}

/// Development engine: checks a shared secret from config. With no secret
/// configured it accepts every identity as-is.
pub struct SharedSecretEngine {
    secret: Option<String>,
}

impl SharedSecretEngine {
    pub fn new(secret: Option<String>) -> Self {
        Self { secret }
    }

    fn check(&self, username: &str, request: &Value) -> Result<String, CredentialError> {
        match &self.secret {
            None => Ok(username.to_string()),
            Some(secret) if request["secret"].as_str() == Some(secret) => {
                Ok(username.to_string())
            }
            Some(_) => Err(CredentialError::Rejected),
        }
    }
}

impl CredentialEngine for SharedSecretEngine {
    fn register(&self, username: &str, request: &Value) -> Result<String, CredentialError> {
        self.check(username, request)
    }

    fn authenticate(&self, username: &str, request: &Value) -> Result<String, CredentialError> {
        self.check(username, request)
    }
}

struct Session {
    username: String,
    created_at: DateTime<Utc>,
}

/// Login handling and session validity. Sessions expire after the
/// configured TTL; expiry is the only invalidation path.
pub struct AdminGate {
    engine: Box<dyn CredentialEngine>,
    admin_username: String,
    ttl: Duration,
    sessions: Mutex<HashMap<String, Session>>,
}

impl AdminGate {
    pub fn new(engine: Box<dyn CredentialEngine>, admin_username: &str, ttl_secs: i64) -> Self {
        Self {
            engine,
            admin_username: admin_username.to_string(),
            ttl: Duration::seconds(ttl_secs),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Register a credential with the engine. Registration is open to any
    /// username; admin session issuance stays gated separately.
    pub fn register(&self, username: &str, request: &Value) -> Result<String, Error> {
        self.engine
            .register(username, request)
            .map_err(|e| Error::Auth(e.to_string()))
    }

    /// Authenticate against the engine and issue a session. Non-admin
    /// identities authenticate fine but are refused a session.
    pub async fn login(&self, username: &str, request: &Value) -> Result<String, Error> {
        let identity = self
            .engine
            .authenticate(username, request)
            .map_err(|e| Error::Auth(e.to_string()))?;
        if identity != self.admin_username {
            return Err(Error::Forbidden(format!("{identity} is not an admin")));
        }

        let session_id = Uuid::new_v4().simple().to_string();
        self.sessions.lock().await.insert(
            session_id.clone(),
            Session {
                username: identity,
                created_at: Utc::now(),
            },
        );
        Ok(session_id)
    }

    /// Username behind a request's session cookie, if the session is live.
    pub async fn validate(&self, request: &Request) -> Option<String> {
        let session_id = request.cookie(SESSION_COOKIE)?;
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get(session_id)?;
        if Utc::now() - session.created_at > self.ttl {
            sessions.remove(session_id);
            return None;
        }
        Some(session.username.clone())
    }

    /// Drop expired sessions.
    pub async fn cleanup(&self) {
        let now = Utc::now();
        self.sessions
            .lock()
            .await
            .retain(|_, s| now - s.created_at <= self.ttl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_core::http::RequestAssembler;
    use serde_json::json;

    fn gate(ttl_secs: i64) -> AdminGate {
        AdminGate::new(Box::new(SharedSecretEngine::new(None)), "Admin", ttl_secs)
    }

    fn request_with_cookie(session_id: &str) -> Request {
        let mut asm = RequestAssembler::new();
        asm.push(
            format!("GET /admin/api/session HTTP/1.1\r\nCookie: {SESSION_COOKIE}={session_id}\r\n\r\n")
                .as_bytes(),
        );
        asm.try_parse().unwrap().unwrap()
    }

    #[tokio::test]
    async fn login_issues_validatable_session() {
        let gate = gate(3600);
        let session_id = gate.login("Admin", &json!({})).await.unwrap();
        let request = request_with_cookie(&session_id);
        assert_eq!(gate.validate(&request).await.as_deref(), Some("Admin"));
    }

    #[tokio::test]
    async fn non_admin_identity_is_forbidden() {
        let gate = gate(3600);
        let err = gate.login("mallory", &json!({})).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[tokio::test]
    async fn shared_secret_rejects_bad_credentials() {
        let gate = AdminGate::new(
            Box::new(SharedSecretEngine::new(Some("hunter2".to_string()))),
            "Admin",
            3600,
        );
        let err = gate
            .login("Admin", &json!({ "secret": "wrong" }))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Auth(_)));

        let ok = gate.login("Admin", &json!({ "secret": "hunter2" })).await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn sessions_expire_after_ttl() {
        let gate = gate(0);
        let session_id = gate.login("Admin", &json!({})).await.unwrap();
        // TTL of zero: already expired by validation time.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let request = request_with_cookie(&session_id);
        assert_eq!(gate.validate(&request).await, None);

        gate.cleanup().await;
        assert!(gate.sessions.lock().await.is_empty());
    }
}
