//! User service
//!
//! Implements business logic for accounts:
//! - Registration (first user becomes admin) and account provisioning
//! - Email verification codes
//! - Login/logout and session validation
//! - Password changes

use crate::db::repositories::{SessionRepository, UserRepository, VerificationRepository};
use crate::db::DynDatabasePool;
use crate::models::{EmailVerification, InventorySource, Session, User, UserRole};
use crate::services::economy::ensure_wallets_in;
use crate::services::email::{generate_verification_code, EmailService};
use crate::services::password::{
    hash_password, is_acceptable_password, verify_password, MIN_PASSWORD_LEN,
};
use anyhow::Context;
use chrono::{Duration, Utc};
use std::sync::Arc;

/// Default session expiration time in days
const DEFAULT_SESSION_EXPIRATION_DAYS: i64 = 7;

/// Default lifetime of a verification code
const DEFAULT_VERIFICATION_TTL_MINUTES: i64 = 15;

/// Attempts at drawing a verification code not already in use
const CODE_ATTEMPTS: usize = 10;

/// Error types for user service operations
#[derive(Debug, thiserror::Error)]
pub enum UserServiceError {
    /// Authentication failed (invalid credentials)
    #[error("Authentication failed: {0}")]
    AuthenticationError(String),

    /// The account exists but is not activated yet
    #[error("Account is not activated")]
    AccountInactive,

    /// Validation error (invalid input)
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// User already exists
    #[error("User already exists: {0}")]
    UserExists(String),

    #[error("User not found")]
    UserNotFound,

    /// Internal error
    #[error("Internal error: {0}")]
    InternalError(#[from] anyhow::Error),
}

/// Account lifetimes and policies
#[derive(Debug, Clone)]
pub struct UserServiceOptions {
    pub session_days: i64,
    pub verification_ttl_minutes: i64,
    pub require_email_verification: bool,
}

impl Default for UserServiceOptions {
    fn default() -> Self {
        Self {
            session_days: DEFAULT_SESSION_EXPIRATION_DAYS,
            verification_ttl_minutes: DEFAULT_VERIFICATION_TTL_MINUTES,
            require_email_verification: true,
        }
    }
}

impl From<&crate::config::AuthConfig> for UserServiceOptions {
    fn from(auth: &crate::config::AuthConfig) -> Self {
        Self {
            session_days: auth.session_days,
            verification_ttl_minutes: auth.verification_ttl_minutes,
            require_email_verification: auth.require_email_verification,
        }
    }
}

/// User service for managing accounts and authentication
pub struct UserService {
    pool: DynDatabasePool,
    user_repo: Arc<dyn UserRepository>,
    session_repo: Arc<dyn SessionRepository>,
    verification_repo: Arc<dyn VerificationRepository>,
    email: Arc<EmailService>,
    options: UserServiceOptions,
}

impl UserService {
    /// Create a new user service with the given repositories
    pub fn new(
        pool: DynDatabasePool,
        user_repo: Arc<dyn UserRepository>,
        session_repo: Arc<dyn SessionRepository>,
        verification_repo: Arc<dyn VerificationRepository>,
        email: Arc<EmailService>,
        options: UserServiceOptions,
    ) -> Self {
        Self {
            pool,
            user_repo,
            session_repo,
            verification_repo,
            email,
            options,
        }
    }

    /// Register a new user
    ///
    /// The first user in the system becomes an admin. The account is created
    /// inactive and provisioned with a profile, both wallets, the default
    /// headers and an empty applied-customization row; a verification code
    /// is then emailed.
    ///
    /// # Errors
    ///
    /// - `ValidationError` for missing fields, a malformed email or a short password
    /// - `UserExists` if username or email is already taken
    /// - `InternalError` for database errors
    pub async fn register(&self, input: RegisterInput) -> Result<User, UserServiceError> {
        let input = input.normalized();
        self.validate_register_input(&input)?;

        if self
            .user_repo
            .get_by_username(&input.username)
            .await
            .context("Failed to check username")?
            .is_some()
        {
            return Err(UserServiceError::UserExists(format!(
                "Username '{}' is already taken",
                input.username
            )));
        }

        if self
            .user_repo
            .get_by_email(&input.email)
            .await
            .context("Failed to check email")?
            .is_some()
        {
            return Err(UserServiceError::UserExists(format!(
                "Email '{}' is already registered",
                input.email
            )));
        }

        let role = if self.is_first_user().await? {
            UserRole::Admin
        } else {
            UserRole::User
        };

        let password_hash = hash_password(&input.password).context("Failed to hash password")?;
        let mut user = User::new(input.username, input.email, password_hash, role);
        if !self.options.require_email_verification {
            user.is_active = true;
        }

        let user = self
            .user_repo
            .create(&user)
            .await
            .context("Failed to create user")?;

        self.provision(user.id).await?;

        if self.options.require_email_verification {
            self.send_verification(&user).await?;
        }

        tracing::info!(user_id = user.id, username = %user.username, role = %user.role, "User registered");
        Ok(user)
    }

    /// Activate an account with the emailed code
    ///
    /// # Errors
    ///
    /// - `UserNotFound` if no account has this email
    /// - `ValidationError` if the code is unknown, used or expired
    pub async fn verify_email(&self, email: &str, code: &str) -> Result<User, UserServiceError> {
        let mut user = self
            .user_repo
            .get_by_email(&email.trim().to_lowercase())
            .await
            .context("Failed to get user by email")?
            .ok_or(UserServiceError::UserNotFound)?;

        let verification = self
            .verification_repo
            .find_for_user(user.id, code.trim())
            .await?
            .filter(|v| v.is_valid_at(Utc::now()))
            .ok_or_else(|| {
                UserServiceError::ValidationError("Invalid or expired code".to_string())
            })?;

        self.verification_repo.mark_used(verification.id).await?;

        if !user.is_active {
            user.is_active = true;
            user = self
                .user_repo
                .update(&user)
                .await
                .context("Failed to activate user")?;
        }

        tracing::info!(user_id = user.id, "Email verified");
        Ok(user)
    }

    /// Login with username or email
    ///
    /// # Errors
    ///
    /// - `AuthenticationError` if credentials are invalid
    /// - `AccountInactive` if the email is not verified yet
    pub async fn login(&self, input: LoginInput) -> Result<(User, Session), UserServiceError> {
        let user = self
            .user_repo
            .get_by_login(input.username_or_email.trim())
            .await
            .context("Failed to find user")?
            .ok_or_else(|| {
                UserServiceError::AuthenticationError("Invalid username or password".to_string())
            })?;

        let password_valid = verify_password(&input.password, &user.password_hash)
            .context("Failed to verify password")?;
        if !password_valid {
            return Err(UserServiceError::AuthenticationError(
                "Invalid username or password".to_string(),
            ));
        }

        if !user.is_active {
            return Err(UserServiceError::AccountInactive);
        }

        let session = Session::new(user.id, Duration::days(self.options.session_days));
        self.session_repo
            .create(&session)
            .await
            .context("Failed to create session")?;

        tracing::info!(user_id = user.id, "User logged in");
        Ok((user, session))
    }

    /// Logout (invalidate session)
    pub async fn logout(&self, session_id: &str) -> Result<(), UserServiceError> {
        self.session_repo
            .delete(session_id)
            .await
            .context("Failed to delete session")?;
        Ok(())
    }

    /// Change the password after checking the old one
    ///
    /// Other sessions of the user are dropped; `keep_session` survives.
    pub async fn change_password(
        &self,
        user_id: i64,
        old_password: &str,
        new_password: &str,
        keep_session: Option<&str>,
    ) -> Result<(), UserServiceError> {
        let mut user = self
            .get_by_id(user_id)
            .await?
            .ok_or(UserServiceError::UserNotFound)?;

        if !verify_password(old_password, &user.password_hash)
            .context("Failed to verify password")?
        {
            return Err(UserServiceError::ValidationError(
                "Old password is incorrect".to_string(),
            ));
        }
        if !is_acceptable_password(new_password) {
            return Err(UserServiceError::ValidationError(format!(
                "Password must be at least {} characters",
                MIN_PASSWORD_LEN
            )));
        }

        user.password_hash = hash_password(new_password).context("Failed to hash password")?;
        self.user_repo
            .update(&user)
            .await
            .context("Failed to update password")?;

        let dropped = self
            .session_repo
            .delete_for_user_except(user_id, keep_session)
            .await
            .context("Failed to drop sessions")?;
        tracing::debug!(user_id, dropped, "Other sessions dropped");

        tracing::info!(user_id, "Password changed");
        Ok(())
    }

    /// Get user by ID
    pub async fn get_by_id(&self, id: i64) -> Result<Option<User>, UserServiceError> {
        let user = self
            .user_repo
            .get_by_id(id)
            .await
            .context("Failed to get user by ID")?;

        Ok(user)
    }

    /// Get user by username
    pub async fn get_by_username(&self, username: &str) -> Result<Option<User>, UserServiceError> {
        let user = self
            .user_repo
            .get_by_username(username)
            .await
            .context("Failed to get user by username")?;

        Ok(user)
    }

    /// Validate session token and return the associated user
    ///
    /// # Returns
    ///
    /// The user if the session is valid, `None` if the session doesn't exist
    /// or is expired. Expired sessions are deleted on sight.
    pub async fn validate_session(&self, token: &str) -> Result<Option<User>, UserServiceError> {
        let Some((session, user)) = self
            .session_repo
            .resolve(token)
            .await
            .context("Failed to get session")?
        else {
            return Ok(None);
        };

        if session.is_expired() {
            let _ = self.session_repo.delete(token).await;
            return Ok(None);
        }

        Ok(Some(user))
    }

    /// Check if this is the first user (for auto-admin)
    pub async fn is_first_user(&self) -> Result<bool, UserServiceError> {
        let count = self
            .user_repo
            .count()
            .await
            .context("Failed to count users")?;

        Ok(count == 0)
    }

    /// Delete all expired sessions
    ///
    /// # Returns
    ///
    /// The number of sessions deleted
    pub async fn cleanup_expired_sessions(&self) -> Result<u64, UserServiceError> {
        let count = self
            .session_repo
            .delete_expired(Utc::now())
            .await
            .context("Failed to delete expired sessions")?;

        Ok(count)
    }

    // ========================================================================
    // Private helper methods
    // ========================================================================

    fn validate_register_input(&self, input: &RegisterInput) -> Result<(), UserServiceError> {
        if input.username.is_empty() {
            return Err(UserServiceError::ValidationError(
                "Username cannot be empty".to_string(),
            ));
        }

        if input.email.is_empty() {
            return Err(UserServiceError::ValidationError(
                "Email cannot be empty".to_string(),
            ));
        }

        if !input.email.contains('@') {
            return Err(UserServiceError::ValidationError(
                "Invalid email format".to_string(),
            ));
        }

        if !is_acceptable_password(&input.password) {
            return Err(UserServiceError::ValidationError(format!(
                "Password must be at least {} characters",
                MIN_PASSWORD_LEN
            )));
        }

        Ok(())
    }

    /// Profile, wallets, default headers and applied row for a new account
    async fn provision(&self, user_id: i64) -> Result<(), UserServiceError> {
        let mut tx = self.pool.begin().await?;
        tx.profile_create(user_id).await?;
        ensure_wallets_in(tx.as_mut(), user_id)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create wallets: {}", e))?;

        for header in tx.items_default_headers().await? {
            if !tx.inventory_owned(user_id, header.id).await? {
                tx.inventory_grant(user_id, header.id, InventorySource::Gift, "Default header")
                    .await?;
            }
        }

        tx.applied_ensure(user_id).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn send_verification(&self, user: &User) -> Result<(), UserServiceError> {
        let mut code = generate_verification_code();
        for _ in 1..CODE_ATTEMPTS {
            if !self.verification_repo.code_exists(&code).await? {
                break;
            }
            code = generate_verification_code();
        }

        let now = Utc::now();
        let verification = EmailVerification {
            id: 0,
            user_id: user.id,
            code,
            expires_at: now + Duration::minutes(self.options.verification_ttl_minutes),
            is_used: false,
            created_at: now,
        };
        let verification = self.verification_repo.create(&verification).await?;

        // A mail failure leaves the account registered; the code is logged for support
        if let Err(e) = self
            .email
            .send_verification_code(
                &user.email,
                &verification.code,
                self.options.verification_ttl_minutes,
            )
            .await
        {
            tracing::warn!(user_id = user.id, error = %e, "Failed to send verification email");
        }
        Ok(())
    }
}

/// Input for user registration
#[derive(Debug, Clone)]
pub struct RegisterInput {
    pub username: String,
    pub email: String,
    pub password: String,
}

impl RegisterInput {
    /// Create a new registration input
    pub fn new(
        username: impl Into<String>,
        email: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            email: email.into(),
            password: password.into(),
        }
    }

    fn normalized(self) -> Self {
        Self {
            username: self.username.trim().to_string(),
            email: self.email.trim().to_lowercase(),
            password: self.password,
        }
    }
}

/// Input for user login
#[derive(Debug, Clone)]
pub struct LoginInput {
    pub username_or_email: String,
    pub password: String,
}

impl LoginInput {
    /// Create a new login input
    pub fn new(username_or_email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username_or_email: username_or_email.into(),
            password: password.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SmtpConfig;
    use crate::db::repositories::test_support::migrated_pool;
    use crate::db::repositories::{
        ItemRepository, ProfileRepository, SqlxItemRepository, SqlxProfileRepository,
        SqlxSessionRepository, SqlxUserRepository, SqlxVerificationRepository,
        SqlxWalletRepository, WalletRepository,
    };

    fn build_service(pool: &DynDatabasePool, options: UserServiceOptions) -> UserService {
        UserService::new(
            pool.clone(),
            SqlxUserRepository::boxed(pool.clone()),
            SqlxSessionRepository::boxed(pool.clone()),
            SqlxVerificationRepository::boxed(pool.clone()),
            Arc::new(EmailService::new(SmtpConfig::default())),
            options,
        )
    }

    async fn setup_test_service() -> (DynDatabasePool, UserService) {
        let pool = migrated_pool().await;
        let service = build_service(&pool, UserServiceOptions::default());
        (pool, service)
    }

    /// Register and activate in one step
    async fn register_active(service: &UserService, name: &str) -> User {
        let user = service
            .register(RegisterInput::new(name, format!("{}@example.com", name), "password123"))
            .await
            .expect("Failed to register");
        let mut user = service.get_by_id(user.id).await.unwrap().unwrap();
        user.is_active = true;
        service.user_repo.update(&user).await.unwrap()
    }

    async fn latest_code(pool: &DynDatabasePool, user_id: i64) -> String {
        let sqlite = pool.as_sqlite().unwrap();
        sqlx::query_scalar::<_, String>(
            "SELECT code FROM email_verifications WHERE user_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(user_id)
        .fetch_one(sqlite)
        .await
        .unwrap()
    }

    // ========================================================================
    // Registration tests
    // ========================================================================

    #[tokio::test]
    async fn test_register_first_user_becomes_admin() {
        let (_pool, service) = setup_test_service().await;

        let user = service
            .register(RegisterInput::new("admin", "admin@example.com", "password123"))
            .await
            .expect("Failed to register");

        assert_eq!(user.role, UserRole::Admin);
        assert!(!user.is_active);
    }

    #[tokio::test]
    async fn test_register_second_user_is_regular() {
        let (_pool, service) = setup_test_service().await;
        register_active(&service, "first").await;

        let user = service
            .register(RegisterInput::new("second", "second@example.com", "password123"))
            .await
            .unwrap();
        assert_eq!(user.role, UserRole::User);
    }

    #[tokio::test]
    async fn test_register_rejects_bad_input() {
        let (_pool, service) = setup_test_service().await;

        let cases = [
            RegisterInput::new("", "a@example.com", "password123"),
            RegisterInput::new("aki", "", "password123"),
            RegisterInput::new("aki", "not-an-email", "password123"),
            RegisterInput::new("aki", "a@example.com", "short"),
        ];
        for input in cases {
            let err = service.register(input).await.unwrap_err();
            assert!(matches!(err, UserServiceError::ValidationError(_)));
        }
    }

    #[tokio::test]
    async fn test_register_duplicates_conflict() {
        let (_pool, service) = setup_test_service().await;
        register_active(&service, "aki").await;

        let err = service
            .register(RegisterInput::new("aki", "other@example.com", "password123"))
            .await
            .unwrap_err();
        assert!(matches!(err, UserServiceError::UserExists(_)));

        let err = service
            .register(RegisterInput::new("other", "AKI@example.com", "password123"))
            .await
            .unwrap_err();
        assert!(matches!(err, UserServiceError::UserExists(_)));
    }

    #[tokio::test]
    async fn test_register_provisions_account() {
        let (pool, service) = setup_test_service().await;
        let items = SqlxItemRepository::new(pool.clone());

        let user = service
            .register(RegisterInput::new("aki", "aki@example.com", "password123"))
            .await
            .unwrap();

        let profile = SqlxProfileRepository::new(pool.clone())
            .get(user.id)
            .await
            .unwrap()
            .expect("profile created");
        assert_eq!(profile.xp, 0);

        let wallets = SqlxWalletRepository::new(pool.clone())
            .list_for_user(user.id)
            .await
            .unwrap();
        assert_eq!(wallets.len(), 2);
        assert!(wallets.iter().all(|w| w.balance == 0));

        let inventory = items.inventory_for_user(user.id).await.unwrap();
        assert_eq!(inventory.len(), 3);
        assert!(inventory.iter().all(|e| e.source == InventorySource::Gift));
        assert!(items.get_applied(user.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_register_without_verification_is_active() {
        let pool = migrated_pool().await;
        let service = build_service(
            &pool,
            UserServiceOptions {
                require_email_verification: false,
                ..Default::default()
            },
        );

        let user = service
            .register(RegisterInput::new("aki", "aki@example.com", "password123"))
            .await
            .unwrap();
        assert!(user.is_active);
        service
            .login(LoginInput::new("aki", "password123"))
            .await
            .expect("active user can log in");
    }

    // ========================================================================
    // Verification tests
    // ========================================================================

    #[tokio::test]
    async fn test_verify_email_activates_account() {
        let (pool, service) = setup_test_service().await;
        let user = service
            .register(RegisterInput::new("aki", "aki@example.com", "password123"))
            .await
            .unwrap();

        let err = service.login(LoginInput::new("aki", "password123")).await.unwrap_err();
        assert!(matches!(err, UserServiceError::AccountInactive));

        let code = latest_code(&pool, user.id).await;
        let wrong = if code == "000000" { "000001" } else { "000000" };
        assert!(matches!(
            service.verify_email("aki@example.com", wrong).await,
            Err(UserServiceError::ValidationError(_))
        ));

        let verified = service.verify_email("aki@example.com", &code).await.unwrap();
        assert!(verified.is_active);

        // The code is single use
        assert!(matches!(
            service.verify_email("aki@example.com", &code).await,
            Err(UserServiceError::ValidationError(_))
        ));
        assert!(matches!(
            service.verify_email("nobody@example.com", &code).await,
            Err(UserServiceError::UserNotFound)
        ));

        service.login(LoginInput::new("aki", "password123")).await.unwrap();
    }

    // ========================================================================
    // Login and session tests
    // ========================================================================

    #[tokio::test]
    async fn test_login_with_username_or_email() {
        let (_pool, service) = setup_test_service().await;
        let user = register_active(&service, "aki").await;

        let (logged, session) = service.login(LoginInput::new("aki", "password123")).await.unwrap();
        assert_eq!(logged.id, user.id);
        assert!(session.expires_at > Utc::now() + Duration::days(6));

        service
            .login(LoginInput::new("aki@example.com", "password123"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_login_invalid_credentials() {
        let (_pool, service) = setup_test_service().await;
        register_active(&service, "aki").await;

        for input in [
            LoginInput::new("aki", "wrong-password"),
            LoginInput::new("nobody", "password123"),
        ] {
            let err = service.login(input).await.unwrap_err();
            assert!(matches!(err, UserServiceError::AuthenticationError(_)));
        }
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let (_pool, service) = setup_test_service().await;
        let user = register_active(&service, "aki").await;
        let (_, session) = service.login(LoginInput::new("aki", "password123")).await.unwrap();

        let validated = service.validate_session(&session.id).await.unwrap();
        assert_eq!(validated.map(|u| u.id), Some(user.id));

        service.logout(&session.id).await.unwrap();
        assert!(service.validate_session(&session.id).await.unwrap().is_none());
        assert!(service.validate_session("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_session_is_dropped() {
        let (_pool, service) = setup_test_service().await;
        let user = register_active(&service, "aki").await;

        let expired = Session::new(user.id, Duration::seconds(-10));
        service.session_repo.create(&expired).await.unwrap();

        assert!(service.validate_session(&expired.id).await.unwrap().is_none());
        assert!(service.session_repo.resolve(&expired.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cleanup_expired_sessions() {
        let (_pool, service) = setup_test_service().await;
        let user = register_active(&service, "aki").await;

        for _ in 0..2 {
            let expired = Session::new(user.id, Duration::seconds(-10));
            service.session_repo.create(&expired).await.unwrap();
        }
        service.login(LoginInput::new("aki", "password123")).await.unwrap();

        assert_eq!(service.cleanup_expired_sessions().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_change_password() {
        let (_pool, service) = setup_test_service().await;
        let user = register_active(&service, "aki").await;
        let (_, current) = service.login(LoginInput::new("aki", "password123")).await.unwrap();
        let (_, other) = service.login(LoginInput::new("aki", "password123")).await.unwrap();

        assert!(matches!(
            service
                .change_password(user.id, "wrong-password", "newpassword1", None)
                .await,
            Err(UserServiceError::ValidationError(_))
        ));
        assert!(matches!(
            service.change_password(user.id, "password123", "short", None).await,
            Err(UserServiceError::ValidationError(_))
        ));

        service
            .change_password(user.id, "password123", "newpassword1", Some(&current.id))
            .await
            .unwrap();

        assert!(service.validate_session(&current.id).await.unwrap().is_some());
        assert!(service.validate_session(&other.id).await.unwrap().is_none());
        assert!(service.login(LoginInput::new("aki", "password123")).await.is_err());
        service.login(LoginInput::new("aki", "newpassword1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_password_is_hashed() {
        let (_pool, service) = setup_test_service().await;
        let user = register_active(&service, "aki").await;

        assert_ne!(user.password_hash, "password123");
        assert!(user.password_hash.starts_with("$argon2"));
    }
}
