// Database structure installer
//
// Creates the forum tables and seed rows. Each table definition is checksummed
// and recorded in GDN_Structure so re-running the installer can tell an
// unchanged table from one created by a different version.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use sqlx::MySqlPool;
use std::sync::Arc;
use std::time::Instant;

use crate::database::connection::Database;
use crate::security::crypto::sha256_hex;

/// Bookkeeping table; always created first and never dropped.
pub const STRUCTURE_TABLE: &str = "GDN_Structure";

/// A table the forum needs, with rows that must exist after install.
#[derive(Debug, Clone, Copy)]
pub struct TableDefinition {
    pub name: &'static str,
    pub create_sql: &'static str,
    pub seed_sql: &'static [&'static str],
}

impl TableDefinition {
    pub fn checksum(&self) -> String {
        sha256_hex(self.create_sql.as_bytes())
    }
}

pub const TABLES: &[TableDefinition] = &[
    TableDefinition {
        name: "GDN_Role",
        create_sql: "CREATE TABLE IF NOT EXISTS `GDN_Role` (
  `RoleID` INT NOT NULL AUTO_INCREMENT,
  `Name` VARCHAR(100) NOT NULL,
  `Description` VARCHAR(500) NULL,
  `Sort` INT NULL,
  `Deletable` TINYINT NOT NULL DEFAULT 1,
  PRIMARY KEY (`RoleID`),
  UNIQUE KEY `UX_Role_Name` (`Name`)
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4",
        seed_sql: &[
            "INSERT IGNORE INTO `GDN_Role` (`RoleID`, `Name`, `Description`, `Sort`, `Deletable`) VALUES (2, 'Guest', 'Guests can only view content.', 1, 0)",
            "INSERT IGNORE INTO `GDN_Role` (`RoleID`, `Name`, `Description`, `Sort`, `Deletable`) VALUES (8, 'Member', 'Members can participate in discussions.', 2, 1)",
            "INSERT IGNORE INTO `GDN_Role` (`RoleID`, `Name`, `Description`, `Sort`, `Deletable`) VALUES (16, 'Administrator', 'Administrators have permission to do anything.', 3, 1)",
        ],
    },
    TableDefinition {
        name: "GDN_User",
        create_sql: "CREATE TABLE IF NOT EXISTS `GDN_User` (
  `UserID` INT NOT NULL AUTO_INCREMENT,
  `Name` VARCHAR(50) NOT NULL,
  `Email` VARCHAR(200) NOT NULL,
  `Password` VARCHAR(255) NOT NULL,
  `HashMethod` VARCHAR(10) NOT NULL DEFAULT 'argon2id',
  `Admin` TINYINT NOT NULL DEFAULT 0,
  `DateInserted` DATETIME NOT NULL,
  `DateLastActive` DATETIME NULL,
  PRIMARY KEY (`UserID`),
  UNIQUE KEY `UX_User_Name` (`Name`),
  UNIQUE KEY `UX_User_Email` (`Email`)
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4",
        seed_sql: &[],
    },
    TableDefinition {
        name: "GDN_UserRole",
        create_sql: "CREATE TABLE IF NOT EXISTS `GDN_UserRole` (
  `UserID` INT NOT NULL,
  `RoleID` INT NOT NULL,
  PRIMARY KEY (`UserID`, `RoleID`)
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4",
        seed_sql: &[],
    },
    TableDefinition {
        name: "GDN_Permission",
        create_sql: "CREATE TABLE IF NOT EXISTS `GDN_Permission` (
  `PermissionID` INT NOT NULL AUTO_INCREMENT,
  `RoleID` INT NOT NULL,
  `Name` VARCHAR(100) NOT NULL,
  PRIMARY KEY (`PermissionID`),
  UNIQUE KEY `UX_Permission_Role_Name` (`RoleID`, `Name`)
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4",
        seed_sql: &[
            "INSERT IGNORE INTO `GDN_Permission` (`RoleID`, `Name`) VALUES (2, 'Garden.SignIn.Allow')",
            "INSERT IGNORE INTO `GDN_Permission` (`RoleID`, `Name`) VALUES (8, 'Garden.SignIn.Allow')",
            "INSERT IGNORE INTO `GDN_Permission` (`RoleID`, `Name`) VALUES (8, 'Garden.Profiles.Edit')",
            "INSERT IGNORE INTO `GDN_Permission` (`RoleID`, `Name`) VALUES (16, 'Garden.Settings.Manage')",
        ],
    },
    TableDefinition {
        name: "GDN_Session",
        create_sql: "CREATE TABLE IF NOT EXISTS `GDN_Session` (
  `SessionID` CHAR(43) NOT NULL,
  `UserID` INT NOT NULL,
  `Persistent` TINYINT NOT NULL DEFAULT 0,
  `DateInserted` DATETIME NOT NULL,
  `DateExpires` DATETIME NOT NULL,
  PRIMARY KEY (`SessionID`),
  KEY `IX_Session_User` (`UserID`)
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4",
        seed_sql: &[],
    },
];

const STRUCTURE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS `GDN_Structure` (
  `TableName` VARCHAR(64) NOT NULL,
  `Checksum` CHAR(64) NOT NULL,
  `DateApplied` DATETIME NOT NULL,
  PRIMARY KEY (`TableName`)
) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4";

/// What an install run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StructureReport {
    pub dropped: Vec<String>,
    pub created: Vec<String>,
    pub unchanged: Vec<String>,
}

/// Ensures the database structure matches what this version expects.
#[async_trait]
pub trait SchemaInstaller: Send + Sync {
    /// `drop_existing` drops the forum tables first. `explicit` refuses to reuse
    /// an existing table whose recorded definition differs from the current one.
    async fn install(&self, drop_existing: bool, explicit: bool) -> Result<StructureReport>;
}

/// Where an existing table stands relative to its current definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableState {
    Missing,
    Matches,
    /// Exists but no checksum was recorded, or the recorded one differs.
    Differs,
}

/// Decide what to do with one table. Pure so the policy can be tested without a
/// database.
pub fn plan_table(name: &str, state: TableState, explicit: bool) -> Result<bool> {
    match (state, explicit) {
        (TableState::Missing, _) => Ok(true),
        (TableState::Matches, _) => Ok(false),
        (TableState::Differs, false) => Ok(false),
        (TableState::Differs, true) => anyhow::bail!(
            "Table {} already exists with a different definition. Remove it or install without explicit mode.",
            name
        ),
    }
}

pub struct MySqlStructureInstaller {
    database: Arc<Database>,
}

impl MySqlStructureInstaller {
    pub fn new(database: Arc<Database>) -> Self {
        Self { database }
    }

    async fn table_state(&self, pool: &MySqlPool, table: &TableDefinition) -> Result<TableState> {
        let exists: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = DATABASE() AND table_name = ?",
        )
        .bind(table.name)
        .fetch_one(pool)
        .await
        .with_context(|| format!("Failed to inspect table {}", table.name))?;

        if exists == 0 {
            return Ok(TableState::Missing);
        }

        let recorded: Option<String> =
            sqlx::query_scalar("SELECT `Checksum` FROM `GDN_Structure` WHERE `TableName` = ?")
                .bind(table.name)
                .fetch_optional(pool)
                .await
                .with_context(|| format!("Failed to read recorded structure for {}", table.name))?;

        Ok(match recorded {
            Some(sum) if sum == table.checksum() => TableState::Matches,
            _ => TableState::Differs,
        })
    }

    async fn create_table(&self, pool: &MySqlPool, table: &TableDefinition) -> Result<()> {
        let mut tx = pool.begin().await.context("Failed to begin transaction")?;

        sqlx::query(table.create_sql)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to create table {}", table.name))?;

        for seed in table.seed_sql {
            sqlx::query(seed)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Failed to seed table {}", table.name))?;
        }

        sqlx::query(
            "REPLACE INTO `GDN_Structure` (`TableName`, `Checksum`, `DateApplied`) VALUES (?, ?, UTC_TIMESTAMP())",
        )
        .bind(table.name)
        .bind(table.checksum())
        .execute(&mut *tx)
        .await
        .with_context(|| format!("Failed to record structure for {}", table.name))?;

        tx.commit().await.context("Failed to commit structure changes")?;
        Ok(())
    }
}

#[async_trait]
impl SchemaInstaller for MySqlStructureInstaller {
    async fn install(&self, drop_existing: bool, explicit: bool) -> Result<StructureReport> {
        let started = Instant::now();
        info!(
            "[PHASE: database] [STEP: structure] Installing structure (tables={}, drop_existing={}, explicit={})",
            TABLES.len(),
            drop_existing,
            explicit
        );

        let pool = self.database.pool().await?;
        let mut report = StructureReport::default();

        sqlx::query(STRUCTURE_TABLE_SQL)
            .execute(&pool)
            .await
            .with_context(|| format!("Failed to create table {}", STRUCTURE_TABLE))?;

        if drop_existing {
            for table in TABLES.iter().rev() {
                warn!(
                    "[PHASE: database] [STEP: structure] Dropping table {}",
                    table.name
                );
                sqlx::query(&format!("DROP TABLE IF EXISTS `{}`", table.name))
                    .execute(&pool)
                    .await
                    .with_context(|| format!("Failed to drop table {}", table.name))?;
                sqlx::query("DELETE FROM `GDN_Structure` WHERE `TableName` = ?")
                    .bind(table.name)
                    .execute(&pool)
                    .await?;
                report.dropped.push(table.name.to_string());
            }
        }

        for table in TABLES {
            let state = self.table_state(&pool, table).await?;
            if plan_table(table.name, state, explicit)? {
                self.create_table(&pool, table).await?;
                debug!(
                    "[PHASE: database] [STEP: structure] Created table {}",
                    table.name
                );
                report.created.push(table.name.to_string());
            } else {
                if state == TableState::Differs {
                    warn!(
                        "[PHASE: database] [STEP: structure] Reusing existing table {} with unrecorded or different definition",
                        table.name
                    );
                }
                report.unchanged.push(table.name.to_string());
            }
        }

        info!(
            "[PHASE: database] [STEP: structure] Structure installed (created={}, unchanged={}, duration_ms={})",
            report.created.len(),
            report.unchanged.len(),
            started.elapsed().as_millis()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn table_names_are_unique_and_prefixed() {
        let mut seen = HashSet::new();
        for t in TABLES {
            assert!(t.name.starts_with("GDN_"), "{}", t.name);
            assert!(seen.insert(t.name), "duplicate table {}", t.name);
            assert!(t.create_sql.contains(&format!("`{}`", t.name)));
        }
    }

    #[test]
    fn create_statements_are_non_destructive() {
        for t in TABLES {
            assert!(t.create_sql.starts_with("CREATE TABLE IF NOT EXISTS"), "{}", t.name);
            for seed in t.seed_sql {
                assert!(seed.starts_with("INSERT IGNORE"), "{}: {}", t.name, seed);
            }
        }
    }

    #[test]
    fn checksums_are_stable_and_distinct() {
        let sums: HashSet<String> = TABLES.iter().map(|t| t.checksum()).collect();
        assert_eq!(sums.len(), TABLES.len());
        assert_eq!(TABLES[0].checksum(), TABLES[0].checksum());
        assert_eq!(TABLES[0].checksum().len(), 64);
    }

    #[test]
    fn plan_creates_missing_and_skips_matching() {
        assert!(plan_table("GDN_User", TableState::Missing, false).unwrap());
        assert!(plan_table("GDN_User", TableState::Missing, true).unwrap());
        assert!(!plan_table("GDN_User", TableState::Matches, true).unwrap());
    }

    #[test]
    fn plan_reuses_differing_table_unless_explicit() {
        assert!(!plan_table("GDN_User", TableState::Differs, false).unwrap());
        let err = plan_table("GDN_User", TableState::Differs, true).unwrap_err();
        assert!(err.to_string().contains("GDN_User"));
    }

    #[tokio::test]
    async fn install_without_configured_database_fails() {
        let installer = MySqlStructureInstaller::new(Arc::new(Database::new()));
        let err = installer.install(false, false).await.unwrap_err();
        assert!(err.to_string().contains("not been configured"));
    }
}
