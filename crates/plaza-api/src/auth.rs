use std::sync::Arc;

use anyhow::anyhow;
use argon2::{
    password_hash::{rand_core::OsRng, SaltString},
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use plaza_db::Database;
use plaza_mailer::Mailer;
use plaza_types::api::{Claims, LoginRequest, LoginResponse, RegisterRequest, StatusResponse};

use crate::error::ApiError;

/// Session tokens are valid for one hour; expiry forces re-login.
pub const SESSION_TTL_SECS: i64 = 3600;

pub type AppState = Arc<AppStateInner>;

/// All injected dependencies live here, constructed once in main and passed
/// by reference to every handler. No ambient globals.
pub struct AppStateInner {
    pub db: Database,
    pub mailer: Arc<dyn Mailer>,
    pub jwt_secret: String,
    pub base_url: String,
}

impl AppStateInner {
    /// Register a new account, or re-send the verification link when the
    /// email already belongs to a pending account. Blocking (argon2 + SQLite
    /// + SMTP); callers run it under spawn_blocking.
    pub fn register(&self, req: &RegisterRequest) -> Result<&'static str, ApiError> {
        let name = req.name.trim();
        let email = req.email.trim();
        if name.is_empty() || email.is_empty() || req.password.is_empty() {
            return Err(ApiError::Validation("all fields are required"));
        }

        match self.db.get_user_by_email(email)? {
            Some(user) if user.verified => Err(ApiError::Conflict),
            Some(user) => {
                // Pending account: idempotent retry. Re-send the stored token
                // so a link already in the user's inbox stays valid.
                let token = user
                    .verify_token
                    .ok_or_else(|| anyhow!("unverified account {} has no token", user.id))?;
                self.dispatch_verification(email, &user.name, &token);
                Ok("Account already pending verification; the email was re-sent.")
            }
            None => {
                let password_hash = hash_password(&req.password)?;
                let token = Uuid::new_v4().to_string();
                let id = Uuid::new_v4().to_string();

                // The UNIQUE constraint is the arbiter under concurrent
                // registrations for the same new email.
                if !self.db.create_user(&id, name, email, &password_hash, &token)? {
                    return Err(ApiError::Conflict);
                }

                // Row is committed before dispatch; a bounced email never
                // rolls the account back.
                self.dispatch_verification(email, name, &token);
                Ok("Account created; check your email for the verification link.")
            }
        }
    }

    fn dispatch_verification(&self, to: &str, name: &str, token: &str) {
        let link = format!("{}/verify?token={}", self.base_url, token);
        if let Err(e) = self.mailer.send_verification(to, name, &link) {
            warn!("verification email to {} failed: {}", to, e);
        }
    }

    /// Consume a verification token. Safe to call any number of times with
    /// stale or foreign tokens.
    pub fn verify(&self, token: &str) -> Result<(), ApiError> {
        if token.is_empty() {
            return Err(ApiError::InvalidToken);
        }
        if self.db.mark_verified(token)? {
            Ok(())
        } else {
            Err(ApiError::InvalidToken)
        }
    }

    /// Check credentials and issue a session token. Unverified accounts are
    /// rejected before the password is even looked at.
    pub fn login(&self, req: &LoginRequest) -> Result<String, ApiError> {
        let email = req.email.trim();
        if email.is_empty() || req.password.is_empty() {
            return Err(ApiError::Validation("all fields are required"));
        }

        let user = self.db.get_user_by_email(email)?.ok_or(ApiError::NotFound)?;

        if !user.verified {
            return Err(ApiError::NotVerified);
        }

        verify_password(&req.password, &user.password)?;

        let user_id: Uuid = user
            .id
            .parse()
            .map_err(|_| anyhow!("corrupt user id: {}", user.id))?;

        create_token(&self.jwt_secret, user_id, &user.name, SESSION_TTL_SECS)
    }
}

fn hash_password(password: &str) -> Result<String, ApiError> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow!("password hashing failed: {}", e))?;
    Ok(hash.to_string())
}

/// Verification goes through the argon2 library's own comparison, never a
/// string equality on raw material.
fn verify_password(password: &str, stored_hash: &str) -> Result<(), ApiError> {
    let parsed = PasswordHash::new(stored_hash)
        .map_err(|e| anyhow!("stored password hash unparsable: {}", e))?;

    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .map_err(|_| ApiError::InvalidCredentials)
}

pub fn create_token(
    secret: &str,
    user_id: Uuid,
    name: &str,
    ttl_secs: i64,
) -> Result<String, ApiError> {
    let now = chrono::Utc::now();
    let claims = Claims {
        sub: user_id,
        name: name.to_string(),
        iat: now.timestamp() as usize,
        exp: (now + chrono::Duration::seconds(ttl_secs)).timestamp() as usize,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| ApiError::Dependency(anyhow!("token encoding failed: {}", e)))
}

// -- Handlers --

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let message = run_blocking(state, move |s| s.register(&req)).await?;
    Ok(Json(StatusResponse {
        success: true,
        message: message.to_string(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct VerifyQuery {
    #[serde(default)]
    pub token: String,
}

pub async fn verify(
    State(state): State<AppState>,
    Query(query): Query<VerifyQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let result = run_blocking(state, move |s| s.verify(&query.token)).await;
    // Link targets are opened in a browser, so this endpoint answers in
    // plain text rather than JSON.
    match result {
        Ok(()) => Ok((StatusCode::OK, "Account verified, you can now log in.")),
        Err(ApiError::InvalidToken) => Ok((
            StatusCode::BAD_REQUEST,
            "Invalid or already used verification link.",
        )),
        Err(e) => Err(e),
    }
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let token = run_blocking(state, move |s| s.login(&req)).await?;
    Ok(Json(LoginResponse {
        success: true,
        token,
    }))
}

/// Run one of the blocking account flows off the async runtime. Argon2 and
/// SMTP dispatch dominate latency; neither may stall the event threads.
async fn run_blocking<T, F>(state: AppState, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&AppStateInner) -> Result<T, ApiError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&state))
        .await
        .map_err(|e| ApiError::Dependency(anyhow!("spawn_blocking join error: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::decode_token;
    use plaza_mailer::MailerError;
    use std::sync::Mutex;

    /// Records every dispatched verification link.
    struct MockMailer {
        sent: Mutex<Vec<(String, String)>>,
    }

    impl MockMailer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<(String, String)> {
            self.sent.lock().unwrap().clone()
        }

        /// Token embedded in the most recent link.
        fn last_token(&self) -> String {
            let sent = self.sent.lock().unwrap();
            let (_, link) = sent.last().expect("no email was sent");
            link.split_once("token=").expect("link has no token").1.to_string()
        }
    }

    impl Mailer for MockMailer {
        fn send_verification(&self, to: &str, _name: &str, link: &str) -> Result<(), MailerError> {
            self.sent
                .lock()
                .unwrap()
                .push((to.to_string(), link.to_string()));
            Ok(())
        }
    }

    /// Always fails, for the dispatch-failure path.
    struct BrokenMailer;

    impl Mailer for BrokenMailer {
        fn send_verification(&self, _: &str, _: &str, _: &str) -> Result<(), MailerError> {
            Err(MailerError::Dispatch("smtp down".into()))
        }
    }

    fn state_with(mailer: Arc<dyn Mailer>) -> AppStateInner {
        AppStateInner {
            db: Database::open_in_memory().unwrap(),
            mailer,
            jwt_secret: "test-secret".into(),
            base_url: "http://localhost:3000".into(),
        }
    }

    fn register_req(name: &str, email: &str, password: &str) -> RegisterRequest {
        RegisterRequest {
            name: name.into(),
            email: email.into(),
            password: password.into(),
        }
    }

    fn login_req(email: &str, password: &str) -> LoginRequest {
        LoginRequest {
            email: email.into(),
            password: password.into(),
        }
    }

    #[test]
    fn register_creates_unverified_account_with_token() {
        let mailer = MockMailer::new();
        let state = state_with(mailer.clone());

        state
            .register(&register_req("Alice", "alice@example.com", "hunter22"))
            .unwrap();

        let user = state
            .db
            .get_user_by_email("alice@example.com")
            .unwrap()
            .unwrap();
        assert!(!user.verified);
        assert!(user.verify_token.is_some());
        assert_ne!(user.password, "hunter22");

        let sent = mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "alice@example.com");
        assert_eq!(
            sent[0].1,
            format!(
                "http://localhost:3000/verify?token={}",
                user.verify_token.unwrap()
            )
        );
    }

    #[test]
    fn register_rejects_missing_fields() {
        let state = state_with(MockMailer::new());

        for req in [
            register_req("", "alice@example.com", "pw"),
            register_req("Alice", "", "pw"),
            register_req("Alice", "alice@example.com", ""),
        ] {
            assert!(matches!(
                state.register(&req),
                Err(ApiError::Validation(_))
            ));
        }
        assert!(state
            .db
            .get_user_by_email("alice@example.com")
            .unwrap()
            .is_none());
    }

    #[test]
    fn duplicate_unverified_register_resends_same_token() {
        let mailer = MockMailer::new();
        let state = state_with(mailer.clone());

        state
            .register(&register_req("Alice", "alice@example.com", "hunter22"))
            .unwrap();
        let first_token = mailer.last_token();

        // Retry with a different password: no new row, no new token
        state
            .register(&register_req("Alice", "alice@example.com", "other-password"))
            .unwrap();

        assert_eq!(mailer.sent().len(), 2);
        assert_eq!(mailer.last_token(), first_token);

        let user = state
            .db
            .get_user_by_email("alice@example.com")
            .unwrap()
            .unwrap();
        assert_eq!(user.verify_token.as_deref(), Some(first_token.as_str()));
        assert!(!user.verified);
    }

    #[test]
    fn register_verified_email_conflicts() {
        let mailer = MockMailer::new();
        let state = state_with(mailer.clone());

        state
            .register(&register_req("Alice", "alice@example.com", "hunter22"))
            .unwrap();
        state.verify(&mailer.last_token()).unwrap();

        let result = state.register(&register_req("Mallory", "alice@example.com", "whatever"));
        assert!(matches!(result, Err(ApiError::Conflict)));

        // No extra email goes out for a verified address
        assert_eq!(mailer.sent().len(), 1);
    }

    #[test]
    fn register_survives_mailer_failure() {
        let state = state_with(Arc::new(BrokenMailer));

        // Dispatch fails, account creation still succeeds
        state
            .register(&register_req("Alice", "alice@example.com", "hunter22"))
            .unwrap();
        assert!(state
            .db
            .get_user_by_email("alice@example.com")
            .unwrap()
            .is_some());
    }

    #[test]
    fn verify_succeeds_exactly_once() {
        let mailer = MockMailer::new();
        let state = state_with(mailer.clone());

        state
            .register(&register_req("Alice", "alice@example.com", "hunter22"))
            .unwrap();
        let token = mailer.last_token();

        state.verify(&token).unwrap();
        assert!(matches!(state.verify(&token), Err(ApiError::InvalidToken)));
        assert!(matches!(state.verify(""), Err(ApiError::InvalidToken)));
        assert!(matches!(
            state.verify("never-issued"),
            Err(ApiError::InvalidToken)
        ));
    }

    #[test]
    fn login_rejected_until_verified() {
        let mailer = MockMailer::new();
        let state = state_with(mailer.clone());

        state
            .register(&register_req("Alice", "alice@example.com", "hunter22"))
            .unwrap();

        // Correct password, still rejected while unverified
        let result = state.login(&login_req("alice@example.com", "hunter22"));
        assert!(matches!(result, Err(ApiError::NotVerified)));

        state.verify(&mailer.last_token()).unwrap();
        state
            .login(&login_req("alice@example.com", "hunter22"))
            .unwrap();
    }

    #[test]
    fn login_unknown_email_is_not_found() {
        let state = state_with(MockMailer::new());
        let result = state.login(&login_req("nobody@example.com", "pw"));
        assert!(matches!(result, Err(ApiError::NotFound)));
    }

    #[test]
    fn full_account_lifecycle() {
        let mailer = MockMailer::new();
        let state = state_with(mailer.clone());

        state
            .register(&register_req("Alice", "alice@example.com", "correct horse"))
            .unwrap();
        let user = state
            .db
            .get_user_by_email("alice@example.com")
            .unwrap()
            .unwrap();
        assert!(!user.verified);

        let token = mailer.last_token();
        state.verify(&token).unwrap();
        let user = state
            .db
            .get_user_by_email("alice@example.com")
            .unwrap()
            .unwrap();
        assert!(user.verified);
        assert!(user.verify_token.is_none());

        // Correct password: session token maps back to the account id
        let session = state
            .login(&login_req("alice@example.com", "correct horse"))
            .unwrap();
        let claims = decode_token(&session, "test-secret").unwrap();
        assert_eq!(claims.sub.to_string(), user.id);
        assert_eq!(claims.name, "Alice");

        // Wrong password
        let result = state.login(&login_req("alice@example.com", "wrong horse"));
        assert!(matches!(result, Err(ApiError::InvalidCredentials)));

        // The consumed verification token never works again
        assert!(matches!(state.verify(&token), Err(ApiError::InvalidToken)));
    }

    #[test]
    fn password_hashing_properties() {
        let hash = hash_password("hunter22").unwrap();
        assert_ne!(hash, "hunter22");

        verify_password("hunter22", &hash).unwrap();
        assert!(matches!(
            verify_password("hunter23", &hash),
            Err(ApiError::InvalidCredentials)
        ));

        // Per-password random salt: same input, different hash
        assert_ne!(hash, hash_password("hunter22").unwrap());
    }
}
