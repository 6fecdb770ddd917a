// Database connection management
//
// DbConnector is the seam the setup form uses to test submitted credentials;
// Database is the live pool handle the rest of the install sequence shares.

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use sqlx::mysql::{MySqlConnectOptions, MySqlDatabaseError, MySqlPool, MySqlPoolOptions};
use sqlx::{ConnectOptions, Connection};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::timeout;

use crate::config_store::{keys, ConfigStore};
use crate::utils::logging::describe_database_target;
use crate::utils::validation::strip_tags;

pub const DEFAULT_MYSQL_PORT: u16 = 3306;

// =============================================================================
// Connection settings
// =============================================================================

/// Credentials and location of the forum database.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct DatabaseSettings {
    /// `host`, `host:port` or an absolute unix socket path.
    pub host: String,
    pub name: String,
    pub user: String,
    pub password: String,
}

impl std::fmt::Debug for DatabaseSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&describe_database_target(&self.host, &self.name, &self.user))
    }
}

impl DatabaseSettings {
    pub fn new(
        host: impl Into<String>,
        name: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            name: name.into(),
            user: user.into(),
            password: password.into(),
        }
    }

    /// Read the `Database.*` keys from the configuration store.
    pub async fn from_store(store: &ConfigStore) -> Self {
        Self {
            host: store.get_text(keys::DATABASE_HOST, "localhost").await,
            name: store.get_text(keys::DATABASE_NAME, "").await,
            user: store.get_text(keys::DATABASE_USER, "").await,
            password: store.get_text(keys::DATABASE_PASSWORD, "").await,
        }
    }

    /// Split `host[:port]`; missing or unparsable ports fall back to 3306.
    pub fn host_and_port(&self) -> (String, u16) {
        let host = self.host.trim();
        match host.rsplit_once(':') {
            Some((h, p)) if !h.is_empty() => match p.parse::<u16>() {
                Ok(port) => (h.to_string(), port),
                Err(_) => (host.to_string(), DEFAULT_MYSQL_PORT),
            },
            _ => (host.to_string(), DEFAULT_MYSQL_PORT),
        }
    }

    pub fn connect_options(&self) -> MySqlConnectOptions {
        let mut opts = MySqlConnectOptions::new()
            .username(self.user.trim())
            .password(&self.password);

        let host = self.host.trim();
        opts = if host.starts_with('/') {
            opts.socket(host)
        } else {
            let (h, port) = self.host_and_port();
            opts.host(&h).port(port)
        };

        if !self.name.trim().is_empty() {
            opts = opts.database(self.name.trim());
        }

        opts.log_statements(log::LevelFilter::Debug)
    }
}

// =============================================================================
// Driver errors
// =============================================================================

/// MySQL server/client error numbers the setup form explains specifically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// 1044 ER_DBACCESS_DENIED_ERROR
    AccessDeniedToDatabase,
    /// 1045 ER_ACCESS_DENIED_ERROR
    AccessDeniedCredentials,
    /// 1049 ER_BAD_DB_ERROR
    UnknownDatabase,
    /// 2005 CR_UNKNOWN_HOST
    UnknownHost,
    Other,
}

impl DriverErrorKind {
    pub fn from_code(code: Option<u16>) -> Self {
        match code {
            Some(1044) => DriverErrorKind::AccessDeniedToDatabase,
            Some(1045) => DriverErrorKind::AccessDeniedCredentials,
            Some(1049) => DriverErrorKind::UnknownDatabase,
            Some(2005) => DriverErrorKind::UnknownHost,
            _ => DriverErrorKind::Other,
        }
    }
}

/// A failed connection attempt, carrying the driver's error number when known.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("database connection failed (code={code:?}): {details}")]
pub struct DriverError {
    pub code: Option<u16>,
    /// Raw driver text. Shown to the user only after markup is stripped.
    pub details: String,
}

impl DriverError {
    pub fn new(code: Option<u16>, details: impl Into<String>) -> Self {
        Self {
            code,
            details: details.into(),
        }
    }

    pub fn kind(&self) -> DriverErrorKind {
        DriverErrorKind::from_code(self.code)
    }

    /// Message shown on the setup form.
    pub fn user_message(&self) -> String {
        let reported = strip_tags(&self.details);
        match self.kind() {
            DriverErrorKind::AccessDeniedToDatabase => format!(
                "The database user you specified does not have permission to access the database. The database reported: {}",
                reported
            ),
            DriverErrorKind::AccessDeniedCredentials => format!(
                "Failed to connect to the database with the username and password you entered. Did you mistype them? The database reported: {}",
                reported
            ),
            DriverErrorKind::UnknownDatabase => format!(
                "It appears as though the database you specified does not exist yet. Have you created it yet? Did you mistype the name? The database reported: {}",
                reported
            ),
            DriverErrorKind::UnknownHost => format!(
                "Are you sure you've entered the correct database host name? Maybe you mistyped it? The database reported: {}",
                reported
            ),
            DriverErrorKind::Other => format!(
                "We couldn't connect to the database. The database reported: {}",
                reported
            ),
        }
    }
}

fn is_unknown_host(err: &std::io::Error) -> bool {
    let msg = err.to_string().to_ascii_lowercase();
    msg.contains("failed to lookup address")
        || msg.contains("name or service not known")
        || msg.contains("nodename nor servname")
        || msg.contains("no such host")
        || msg.contains("temporary failure in name resolution")
}

/// Map a sqlx error to a [`DriverError`] carrying the MySQL error number.
pub fn classify_sqlx_error(err: &sqlx::Error) -> DriverError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err
                .try_downcast_ref::<MySqlDatabaseError>()
                .map(|e| e.number());
            DriverError::new(code, db_err.message())
        }
        sqlx::Error::Io(io) if is_unknown_host(io) => DriverError::new(Some(2005), io.to_string()),
        // 2003 CR_CONN_HOST_ERROR
        sqlx::Error::Io(io) => DriverError::new(Some(2003), io.to_string()),
        other => DriverError::new(None, other.to_string()),
    }
}

// =============================================================================
// DbConnector trait
// =============================================================================

/// Trait for database connection attempts.
/// Production code uses MySqlConnector; tests use stubs.
#[async_trait]
pub trait DbConnector: Send + Sync {
    /// Open and close one connection with the given credentials.
    async fn connect(&self, settings: &DatabaseSettings) -> Result<(), DriverError>;

    fn timeout_duration(&self) -> Duration {
        Duration::from_secs(15)
    }
}

/// Production connector that actually connects to MySQL.
pub struct MySqlConnector;

#[async_trait]
impl DbConnector for MySqlConnector {
    async fn connect(&self, settings: &DatabaseSettings) -> Result<(), DriverError> {
        debug!(
            "[PHASE: database] [STEP: connect] Testing connection (target={:?})",
            settings
        );

        let opts = settings.connect_options();
        let result = timeout(self.timeout_duration(), opts.connect()).await;

        match result {
            Ok(Ok(conn)) => {
                if let Err(e) = conn.close().await {
                    debug!(
                        "[PHASE: database] [STEP: connect] Ignoring close error after successful test: {}",
                        e
                    );
                }
                info!(
                    "[PHASE: database] [STEP: connect] Connection test succeeded (target={:?})",
                    settings
                );
                Ok(())
            }
            Ok(Err(e)) => {
                let mapped = classify_sqlx_error(&e);
                warn!(
                    "[PHASE: database] [STEP: connect] Connection test failed (target={:?}, code={:?})",
                    settings, mapped.code
                );
                Err(mapped)
            }
            Err(_) => {
                warn!(
                    "[PHASE: database] [STEP: connect] Connection test timed out (target={:?})",
                    settings
                );
                Err(DriverError::new(
                    None,
                    format!(
                        "Connection timed out after {}s",
                        self.timeout_duration().as_secs()
                    ),
                ))
            }
        }
    }
}

// =============================================================================
// Live database handle
// =============================================================================

/// Shared pool handle. Starts unconfigured; `reconfigure` swaps in a pool for
/// newly saved credentials so later steps of the same request use them.
#[derive(Debug, Default)]
pub struct Database {
    pool: RwLock<Option<MySqlPool>>,
}

impl Database {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn reconfigure(&self, settings: &DatabaseSettings) {
        let pool = MySqlPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(15))
            .connect_lazy_with(settings.connect_options());

        let previous = self.pool.write().await.replace(pool);
        if let Some(old) = previous {
            old.close().await;
        }

        info!(
            "[PHASE: database] [STEP: reconfigure] Database handle now targets {:?}",
            settings
        );
    }

    pub async fn is_configured(&self) -> bool {
        self.pool.read().await.is_some()
    }

    pub async fn pool(&self) -> Result<MySqlPool> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or_else(|| anyhow::anyhow!("Database connection has not been configured"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Stub that immediately returns a controlled failure.
    struct FailingConnector {
        code: Option<u16>,
        details: String,
        call_count: AtomicU32,
    }

    #[async_trait]
    impl DbConnector for FailingConnector {
        async fn connect(&self, _settings: &DatabaseSettings) -> Result<(), DriverError> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            Err(DriverError::new(self.code, self.details.clone()))
        }
    }

    #[tokio::test]
    async fn stub_failure_surfaces_friendly_message() {
        let stub = FailingConnector {
            code: Some(1045),
            details: "Access denied for user 'forum'@'localhost' (using password: YES)".into(),
            call_count: AtomicU32::new(0),
        };

        let err = stub
            .connect(&DatabaseSettings::new("localhost", "forum", "forum", "pw"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), DriverErrorKind::AccessDeniedCredentials);
        assert!(err.user_message().starts_with("Failed to connect to the database"));
        assert_eq!(stub.call_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn code_table_maps_each_known_code() {
        let cases = [
            (Some(1044), "does not have permission to access the database"),
            (Some(1045), "username and password you entered"),
            (Some(1049), "does not exist yet"),
            (Some(2005), "correct database host name"),
            (Some(2003), "couldn't connect to the database"),
            (None, "couldn't connect to the database"),
        ];

        for (code, expected) in cases {
            let msg = DriverError::new(code, "raw").user_message();
            assert!(msg.contains(expected), "code {:?} -> {}", code, msg);
            assert!(msg.ends_with("The database reported: raw"), "{}", msg);
        }
    }

    #[test]
    fn user_message_strips_markup_from_driver_text() {
        let msg = DriverError::new(Some(1049), "Unknown database '<b>forum</b>'").user_message();
        assert!(msg.ends_with("Unknown database 'forum'"), "{}", msg);
    }

    #[test]
    fn io_lookup_failures_map_to_unknown_host() {
        let io = std::io::Error::new(
            std::io::ErrorKind::Other,
            "failed to lookup address information: Name or service not known",
        );
        let mapped = classify_sqlx_error(&sqlx::Error::Io(io));
        assert_eq!(mapped.kind(), DriverErrorKind::UnknownHost);

        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let mapped = classify_sqlx_error(&sqlx::Error::Io(refused));
        assert_eq!(mapped.code, Some(2003));
        assert_eq!(mapped.kind(), DriverErrorKind::Other);
    }

    #[test]
    fn host_and_port_parsing() {
        let s = |h: &str| DatabaseSettings::new(h, "", "", "");
        assert_eq!(s("localhost").host_and_port(), ("localhost".into(), 3306));
        assert_eq!(s("db.example.com:3307").host_and_port(), ("db.example.com".into(), 3307));
        assert_eq!(s("db:notaport").host_and_port(), ("db:notaport".into(), 3306));
    }

    #[test]
    fn debug_output_never_contains_password() {
        let settings = DatabaseSettings::new("localhost", "forum", "forum_user", "TopSecretPassword");
        let printed = format!("{:?}", settings);
        assert!(!printed.contains("TopSecretPassword"), "{}", printed);
        assert!(printed.contains("localhost/forum"), "{}", printed);
    }

    #[tokio::test]
    async fn unconfigured_database_reports_error() {
        let db = Database::new();
        assert!(!db.is_configured().await);
        assert!(db.pool().await.is_err());
    }

    #[tokio::test]
    async fn reconfigure_installs_lazy_pool() {
        let db = Database::new();
        db.reconfigure(&DatabaseSettings::new("127.0.0.1:1", "forum", "u", "p"))
            .await;
        assert!(db.is_configured().await);
        assert!(db.pool().await.is_ok());
    }
}
