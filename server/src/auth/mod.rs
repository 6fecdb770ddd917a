// Authentication for the setup wizard
//
// Only what the wizard needs: sign the new admin in with a persistent session and
// resolve that session on later requests.

pub mod password;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use std::sync::Arc;

use crate::database::connection::Database;
use crate::database::users::UserId;
use crate::security::crypto::random_token;
use crate::utils::logging::mask_sensitive;

pub const PERSISTENT_SESSION_DAYS: i64 = 30;
pub const BROWSER_SESSION_HOURS: i64 = 48;

#[derive(Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
    pub remember_me: bool,
}

/// A session created by a successful sign-in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedIn {
    pub user_id: UserId,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub persistent: bool,
}

/// The principal behind a session cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUser {
    pub user_id: UserId,
    pub name: String,
    /// Superuser flag; bypasses every permission check.
    pub admin: bool,
    pub permissions: Vec<String>,
}

impl SessionUser {
    pub fn check_permission(&self, permission: &str) -> bool {
        self.admin || self.permissions.iter().any(|p| p == permission)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("The email and password you entered were not correct.")]
    InvalidCredentials,

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credentials: &Credentials) -> Result<SignedIn, AuthError>;

    /// Resolve a session token; `None` for unknown or expired sessions.
    async fn session_user(&self, token: &str) -> Result<Option<SessionUser>>;
}

pub fn session_expiry(now: DateTime<Utc>, remember_me: bool) -> DateTime<Utc> {
    if remember_me {
        now + Duration::days(PERSISTENT_SESSION_DAYS)
    } else {
        now + Duration::hours(BROWSER_SESSION_HOURS)
    }
}

pub struct DatabaseAuthenticator {
    database: Arc<Database>,
}

impl DatabaseAuthenticator {
    pub fn new(database: Arc<Database>) -> Self {
        Self { database }
    }
}

#[async_trait]
impl Authenticator for DatabaseAuthenticator {
    async fn authenticate(&self, credentials: &Credentials) -> Result<SignedIn, AuthError> {
        let pool = self.database.pool().await?;

        let row: Option<(i64, String)> =
            sqlx::query_as("SELECT `UserID`, `Password` FROM `GDN_User` WHERE `Email` = ?")
                .bind(credentials.email.trim())
                .fetch_optional(&pool)
                .await
                .context("Failed to look up user")?;

        let Some((user_id, hash)) = row else {
            warn!(
                "[PHASE: auth] [STEP: authenticate] Unknown email (email={})",
                mask_sensitive(&credentials.email)
            );
            return Err(AuthError::InvalidCredentials);
        };

        let verified = password::verify_password(&credentials.password, &hash)
            .map_err(|e| anyhow::anyhow!("Stored password hash is unusable: {}", e))?;
        if !verified {
            warn!(
                "[PHASE: auth] [STEP: authenticate] Wrong password (user_id={})",
                user_id
            );
            return Err(AuthError::InvalidCredentials);
        }

        let now = Utc::now();
        let expires_at = session_expiry(now, credentials.remember_me);
        let token = random_token(32)?;

        sqlx::query(
            "INSERT INTO `GDN_Session` (`SessionID`, `UserID`, `Persistent`, `DateInserted`, `DateExpires`) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&token)
        .bind(user_id)
        .bind(credentials.remember_me)
        .bind(now.naive_utc())
        .bind(expires_at.naive_utc())
        .execute(&pool)
        .await
        .context("Failed to create session")?;

        sqlx::query("UPDATE `GDN_User` SET `DateLastActive` = ? WHERE `UserID` = ?")
            .bind(now.naive_utc())
            .bind(user_id)
            .execute(&pool)
            .await
            .context("Failed to update last activity")?;

        info!(
            "[PHASE: auth] [STEP: authenticate] Session started (user_id={}, persistent={})",
            user_id, credentials.remember_me
        );

        Ok(SignedIn {
            user_id,
            token,
            expires_at,
            persistent: credentials.remember_me,
        })
    }

    async fn session_user(&self, token: &str) -> Result<Option<SessionUser>> {
        let pool = self.database.pool().await?;

        let row: Option<(i64, String, i8)> = sqlx::query_as(
            "SELECT u.`UserID`, u.`Name`, u.`Admin` FROM `GDN_Session` s JOIN `GDN_User` u ON u.`UserID` = s.`UserID` WHERE s.`SessionID` = ? AND s.`DateExpires` > UTC_TIMESTAMP()",
        )
        .bind(token)
        .fetch_optional(&pool)
        .await
        .context("Failed to look up session")?;

        let Some((user_id, name, admin)) = row else {
            return Ok(None);
        };

        let permissions: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT p.`Name` FROM `GDN_UserRole` ur JOIN `GDN_Permission` p ON p.`RoleID` = ur.`RoleID` WHERE ur.`UserID` = ?",
        )
        .bind(user_id)
        .fetch_all(&pool)
        .await
        .context("Failed to load permissions")?;

        Ok(Some(SessionUser {
            user_id,
            name,
            admin: admin != 0,
            permissions,
        }))
    }
}

// =============================================================================
// Session cookie helpers
// =============================================================================

/// `Set-Cookie` value for a new session.
pub fn session_cookie(name: &str, signed_in: &SignedIn, domain: &str, path: &str) -> String {
    let mut cookie = format!("{}={}; Path={}; HttpOnly; SameSite=Lax", name, signed_in.token, path);
    if !domain.trim().is_empty() {
        cookie.push_str(&format!("; Domain={}", domain.trim()));
    }
    if signed_in.persistent {
        let max_age = (signed_in.expires_at - Utc::now()).num_seconds().max(0);
        cookie.push_str(&format!("; Max-Age={}", max_age));
    }
    cookie
}

/// Value of cookie `name` from a `Cookie` request header.
pub fn cookie_value(header: &str, name: &str) -> Option<String> {
    header.split(';').find_map(|pair| {
        let (k, v) = pair.trim().split_once('=')?;
        (k.trim() == name).then(|| v.trim().to_string())
    })
}
