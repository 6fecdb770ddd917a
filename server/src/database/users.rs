// Admin user store

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::info;
use std::sync::Arc;

use crate::auth::password::hash_password;
use crate::database::connection::Database;
use crate::setup::validation::{IssueKind, ValidationResults};
use crate::utils::logging::mask_sensitive;
use crate::utils::validation::{is_blank, is_valid_username, looks_like_email, USERNAME_ERROR};

pub type UserId = i64;

pub const ADMINISTRATOR_ROLE_ID: i64 = 16;

/// Fields of the first administrative account, as posted on the setup form.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AdminUserFields {
    pub name: String,
    pub email: String,
    pub password: String,
    pub password_match: String,
}

impl std::fmt::Debug for AdminUserFields {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminUserFields")
            .field("name", &self.name)
            .field("email", &mask_sensitive(&self.email))
            .finish_non_exhaustive()
    }
}

/// Field rules for the admin account. Uniqueness is checked by the store.
pub fn validate_admin_fields(fields: &AdminUserFields) -> ValidationResults {
    let mut results = ValidationResults::default();

    if is_blank(&fields.name) {
        results.add_field(IssueKind::Validation, "Name", "You must specify an admin username.");
    } else if !is_valid_username(fields.name.trim()) {
        results.add_field(IssueKind::Validation, "Name", USERNAME_ERROR);
    }

    if is_blank(&fields.email) {
        results.add_field(IssueKind::Validation, "Email", "You must specify an admin email.");
    } else if !looks_like_email(&fields.email) {
        results.add_field(IssueKind::Validation, "Email", "The email you entered is invalid.");
    }

    if fields.password.is_empty() {
        results.add_field(IssueKind::Validation, "Password", "You must specify an admin password.");
    } else if fields.password != fields.password_match {
        results.add_field(
            IssueKind::Validation,
            "PasswordMatch",
            "The passwords you entered do not match.",
        );
    }

    results
}

/// A user row already holding the submitted name or email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingUser {
    pub user_id: UserId,
    pub name: String,
    pub email: String,
    pub admin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminSave {
    Insert,
    /// An admin with this name and email exists from an earlier, unfinished attempt.
    Reuse(UserId),
    Conflict(ValidationResults),
}

/// Decide how to store the admin given the rows that share its name or email.
/// Comparisons are case-insensitive like the table's collation.
pub fn plan_admin_save(name: &str, email: &str, existing: &[ExistingUser]) -> AdminSave {
    let name = name.trim();
    let email = email.trim();

    if let Some(row) = existing.iter().find(|u| {
        u.admin && u.name.eq_ignore_ascii_case(name) && u.email.eq_ignore_ascii_case(email)
    }) {
        return AdminSave::Reuse(row.user_id);
    }

    let mut issues = ValidationResults::default();
    if existing.iter().any(|u| u.name.eq_ignore_ascii_case(name)) {
        issues.add_field(
            IssueKind::Validation,
            "Name",
            "The name you entered is already in use by another member.",
        );
    }
    if existing.iter().any(|u| u.email.eq_ignore_ascii_case(email)) {
        issues.add_field(
            IssueKind::Validation,
            "Email",
            "The email you entered is in use by another member.",
        );
    }

    if issues.is_empty() {
        AdminSave::Insert
    } else {
        AdminSave::Conflict(issues)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SaveUserError {
    /// The submitted fields break a rule; shown on the form.
    #[error("admin user failed validation ({} issue(s))", .0.error_count())]
    Validation(ValidationResults),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Confirm the user table is present before any save.
    async fn define_schema(&self) -> Result<()>;

    /// Validate and insert the admin account, returning its id. An admin with the same
    /// name and email left by an earlier attempt gets the new password instead.
    async fn save_admin_user(&self, fields: &AdminUserFields) -> Result<UserId, SaveUserError>;
}

pub struct MySqlUserStore {
    database: Arc<Database>,
}

impl MySqlUserStore {
    pub fn new(database: Arc<Database>) -> Self {
        Self { database }
    }
}

#[async_trait]
impl UserStore for MySqlUserStore {
    async fn define_schema(&self) -> Result<()> {
        let pool = self.database.pool().await?;
        let columns: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM information_schema.columns WHERE table_schema = DATABASE() AND table_name = 'GDN_User'",
        )
        .fetch_one(&pool)
        .await
        .context("Failed to read the user table definition")?;

        if columns == 0 {
            anyhow::bail!("The user table does not exist. The database structure was not installed.");
        }
        Ok(())
    }

    async fn save_admin_user(&self, fields: &AdminUserFields) -> Result<UserId, SaveUserError> {
        let issues = validate_admin_fields(fields);
        if !issues.is_empty() {
            return Err(SaveUserError::Validation(issues));
        }

        let pool = self.database.pool().await?;
        let name = fields.name.trim();
        let email = fields.email.trim();

        let rows: Vec<(i64, String, String, i8)> = sqlx::query_as(
            "SELECT `UserID`, `Name`, `Email`, `Admin` FROM `GDN_User` WHERE `Name` = ? OR `Email` = ?",
        )
        .bind(name)
        .bind(email)
        .fetch_all(&pool)
        .await
        .context("Failed to check username and email uniqueness")?;
        let existing: Vec<ExistingUser> = rows
            .into_iter()
            .map(|(user_id, name, email, admin)| ExistingUser {
                user_id,
                name,
                email,
                admin: admin != 0,
            })
            .collect();

        let reuse = match plan_admin_save(name, email, &existing) {
            AdminSave::Conflict(issues) => return Err(SaveUserError::Validation(issues)),
            AdminSave::Reuse(user_id) => Some(user_id),
            AdminSave::Insert => None,
        };

        let hash = hash_password(&fields.password)
            .map_err(|e| anyhow::anyhow!("Failed to hash admin password: {}", e))?;

        let mut tx = pool.begin().await.context("Failed to begin transaction")?;
        let user_id = match reuse {
            Some(user_id) => {
                sqlx::query(
                    "UPDATE `GDN_User` SET `Password` = ?, `HashMethod` = 'argon2id' WHERE `UserID` = ?",
                )
                .bind(&hash)
                .bind(user_id)
                .execute(&mut *tx)
                .await
                .context("Failed to update admin user")?;
                info!(
                    "[PHASE: setup] [STEP: admin_user] Reusing admin user from an earlier attempt (user_id={})",
                    user_id
                );
                user_id
            }
            None => {
                let inserted = sqlx::query(
                    "INSERT INTO `GDN_User` (`Name`, `Email`, `Password`, `HashMethod`, `Admin`, `DateInserted`) VALUES (?, ?, ?, 'argon2id', 1, UTC_TIMESTAMP())",
                )
                .bind(name)
                .bind(email)
                .bind(&hash)
                .execute(&mut *tx)
                .await
                .context("Failed to insert admin user")?;
                inserted.last_insert_id() as UserId
            }
        };

        sqlx::query("INSERT IGNORE INTO `GDN_UserRole` (`UserID`, `RoleID`) VALUES (?, ?)")
            .bind(user_id)
            .bind(ADMINISTRATOR_ROLE_ID)
            .execute(&mut *tx)
            .await
            .context("Failed to assign administrator role")?;

        tx.commit().await.context("Failed to commit admin user")?;

        info!(
            "[PHASE: setup] [STEP: admin_user] Admin user saved (user_id={}, name={})",
            user_id, name
        );
        Ok(user_id)
    }
}
