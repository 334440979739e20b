//! User model
//!
//! Accounts, roles and email verification codes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A registered account.
///
/// Accounts are created inactive and become active once the email
/// verification code is confirmed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Unique identifier
    pub id: i64,
    /// Username (unique)
    pub username: String,
    /// Email address (unique)
    pub email: String,
    /// Password hash (argon2)
    #[serde(skip_serializing)]
    pub password_hash: String,
    /// User role
    pub role: UserRole,
    /// Whether the email was verified
    pub is_active: bool,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Create a new, not yet verified user.
    ///
    /// Note: The password should already be hashed before calling this function.
    pub fn new(username: String, email: String, password_hash: String, role: UserRole) -> Self {
        let now = Utc::now();
        Self {
            id: 0, // Will be set by the database
            username,
            email,
            password_hash,
            role,
            is_active: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check if the user is an administrator
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }

    /// Moderators and admins are staff
    pub fn is_staff(&self) -> bool {
        matches!(self.role, UserRole::Admin | UserRole::Moderator)
    }
}

/// User role for authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    #[default]
    User,
    Moderator,
    Admin,
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserRole::User => write!(f, "user"),
            UserRole::Moderator => write!(f, "moderator"),
            UserRole::Admin => write!(f, "admin"),
        }
    }
}

impl FromStr for UserRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(UserRole::User),
            "moderator" => Ok(UserRole::Moderator),
            "admin" => Ok(UserRole::Admin),
            _ => Err(anyhow::anyhow!("Invalid user role: {}", s)),
        }
    }
}

/// One-time email verification code
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailVerification {
    pub id: i64,
    pub user_id: i64,
    /// Six decimal digits
    pub code: String,
    pub expires_at: DateTime<Utc>,
    pub is_used: bool,
    pub created_at: DateTime<Utc>,
}

impl EmailVerification {
    /// A code is usable when it is neither used nor expired
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_used && now <= self.expires_at
    }
}

/// Input for creating a new user (before password hashing)
#[derive(Debug, Clone)]
pub struct CreateUserInput {
    pub username: String,
    pub email: String,
    /// Plaintext password (will be hashed)
    pub password: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_user_new_is_inactive() {
        let user = User::new(
            "testuser".to_string(),
            "test@example.com".to_string(),
            "hashed_password".to_string(),
            UserRole::User,
        );

        assert_eq!(user.id, 0);
        assert!(!user.is_active);
        assert_eq!(user.role, UserRole::User);
    }

    #[test]
    fn test_user_staff_roles() {
        let make = |role| User::new("u".into(), "u@test.com".into(), "hash".into(), role);

        assert!(make(UserRole::Admin).is_staff());
        assert!(make(UserRole::Moderator).is_staff());
        assert!(!make(UserRole::User).is_staff());
        assert!(make(UserRole::Admin).is_admin());
        assert!(!make(UserRole::Moderator).is_admin());
    }

    #[test]
    fn test_user_role_round_trip_strings() {
        assert_eq!(UserRole::Moderator.to_string(), "moderator");
        assert_eq!(UserRole::from_str("ADMIN").unwrap(), UserRole::Admin);
        assert_eq!(UserRole::from_str("user").unwrap(), UserRole::User);
        assert!(UserRole::from_str("author").is_err());
        assert_eq!(UserRole::default(), UserRole::User);
    }

    #[test]
    fn test_verification_validity() {
        let now = Utc::now();
        let mut code = EmailVerification {
            id: 1,
            user_id: 1,
            code: "012345".to_string(),
            expires_at: now + Duration::minutes(15),
            is_used: false,
            created_at: now,
        };
        assert!(code.is_valid_at(now));
        assert!(!code.is_valid_at(now + Duration::minutes(16)));

        code.is_used = true;
        assert!(!code.is_valid_at(now));
    }
}
