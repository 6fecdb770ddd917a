// Application and plugin metadata
//
// Each application or plugin lives in its own folder with an `about.toml` describing
// it. Enabled extensions are recorded in the configuration store under
// `EnabledApplications.<Name>` and `EnabledPlugins.<Name>`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config_store::{keys, ConfigStore, ConfigValue, ConfigValues};
use crate::database::connection::Database;
use crate::database::users::ADMINISTRATOR_ROLE_ID;

pub const ABOUT_FILE: &str = "about.toml";

/// The application that ships the setup wizard itself. Always present, never
/// enabled through the registry.
pub const DASHBOARD: &str = "dashboard";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExtensionInfo {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: String,
    /// Permission names this extension defines.
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Folder the extension was loaded from; filled in by the loader.
    #[serde(skip)]
    pub folder: String,
}

pub fn parse_about(folder: &str, raw: &str) -> Result<ExtensionInfo> {
    let mut info: ExtensionInfo =
        toml::from_str(raw).with_context(|| format!("Invalid {} in '{}'", ABOUT_FILE, folder))?;
    info.folder = folder.to_string();
    Ok(info)
}

#[async_trait]
pub trait ExtensionRegistry: Send + Sync {
    /// All applications on disk, keyed by folder name.
    async fn available_applications(&self) -> Result<BTreeMap<String, ExtensionInfo>>;

    /// Plugins recorded as enabled: plugin name to folder.
    async fn enabled_plugins(&self) -> Result<BTreeMap<String, String>>;

    async fn enable_plugin(&self, name: &str, folder: &str) -> Result<()>;

    async fn register_permissions(&self, application: &str) -> Result<()>;

    async fn enable_application(&self, application: &str) -> Result<()>;
}

pub struct FileExtensionRegistry {
    applications_dir: PathBuf,
    plugins_dir: PathBuf,
    config: Arc<ConfigStore>,
    database: Arc<Database>,
}

impl FileExtensionRegistry {
    pub fn new(
        applications_dir: impl Into<PathBuf>,
        plugins_dir: impl Into<PathBuf>,
        config: Arc<ConfigStore>,
        database: Arc<Database>,
    ) -> Self {
        Self {
            applications_dir: applications_dir.into(),
            plugins_dir: plugins_dir.into(),
            config,
            database,
        }
    }

    async fn application(&self, folder: &str) -> Result<ExtensionInfo> {
        load_about(&self.applications_dir, folder)
            .await?
            .with_context(|| format!("The application '{}' could not be found.", folder))
    }
}

async fn load_about(root: &Path, folder: &str) -> Result<Option<ExtensionInfo>> {
    let path = root.join(folder).join(ABOUT_FILE);
    match tokio::fs::read_to_string(&path).await {
        Ok(raw) => parse_about(folder, &raw).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(anyhow::Error::new(e).context(format!("Failed to read {:?}", path))),
    }
}

async fn scan(root: &Path) -> Result<BTreeMap<String, ExtensionInfo>> {
    let mut found = BTreeMap::new();

    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(
                "[PHASE: extensions] [STEP: scan] Folder does not exist: {:?}",
                root
            );
            return Ok(found);
        }
        Err(e) => return Err(anyhow::Error::new(e).context(format!("Failed to list {:?}", root))),
    };

    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("Failed to list {:?}", root))?
    {
        if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let folder = entry.file_name().to_string_lossy().to_string();
        match load_about(root, &folder).await {
            Ok(Some(info)) => {
                found.insert(folder, info);
            }
            Ok(None) => debug!(
                "[PHASE: extensions] [STEP: scan] Skipping '{}' (no {})",
                folder, ABOUT_FILE
            ),
            Err(e) => warn!(
                "[PHASE: extensions] [STEP: scan] Skipping '{}': {:#}",
                folder, e
            ),
        }
    }

    Ok(found)
}

#[async_trait]
impl ExtensionRegistry for FileExtensionRegistry {
    async fn available_applications(&self) -> Result<BTreeMap<String, ExtensionInfo>> {
        let apps = scan(&self.applications_dir).await?;
        info!(
            "[PHASE: extensions] [STEP: applications] Found {} application(s)",
            apps.len()
        );
        Ok(apps)
    }

    async fn enabled_plugins(&self) -> Result<BTreeMap<String, String>> {
        Ok(self
            .config
            .keys_with_prefix(keys::ENABLED_PLUGINS)
            .await
            .into_iter()
            .map(|(name, folder)| (name, folder.as_text()))
            .collect())
    }

    async fn enable_plugin(&self, name: &str, folder: &str) -> Result<()> {
        if load_about(&self.plugins_dir, folder).await?.is_none() {
            anyhow::bail!("The plugin folder '{}' could not be found.", folder);
        }

        let mut values = ConfigValues::new();
        values.insert(
            format!("{}.{}", keys::ENABLED_PLUGINS, name),
            ConfigValue::from(folder),
        );
        self.config.save(values).await?;

        info!(
            "[PHASE: extensions] [STEP: enable_plugin] Plugin enabled (name={}, folder={})",
            name, folder
        );
        Ok(())
    }

    async fn register_permissions(&self, application: &str) -> Result<()> {
        let info = self.application(application).await?;
        if info.permissions.is_empty() {
            return Ok(());
        }

        let pool = self.database.pool().await?;
        let mut tx = pool.begin().await.context("Failed to begin transaction")?;
        for permission in &info.permissions {
            sqlx::query("INSERT IGNORE INTO `GDN_Permission` (`RoleID`, `Name`) VALUES (?, ?)")
                .bind(ADMINISTRATOR_ROLE_ID)
                .bind(permission)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Failed to register permission '{}'", permission))?;
        }
        tx.commit().await.context("Failed to commit permissions")?;

        let mut values = ConfigValues::new();
        for permission in &info.permissions {
            values.insert(
                format!("{}.{}", keys::PERMISSIONS, permission),
                ConfigValue::from(application),
            );
        }
        self.config.save(values).await?;

        info!(
            "[PHASE: extensions] [STEP: register_permissions] Registered {} permission(s) for '{}'",
            info.permissions.len(),
            application
        );
        Ok(())
    }

    async fn enable_application(&self, application: &str) -> Result<()> {
        let info = self.application(application).await?;

        let mut values = ConfigValues::new();
        values.insert(
            format!("{}.{}", keys::ENABLED_APPLICATIONS, info.name),
            ConfigValue::from(application),
        );
        self.config.save(values).await?;

        info!(
            "[PHASE: extensions] [STEP: enable_application] Application enabled (name={}, folder={})",
            info.name, application
        );
        Ok(())
    }
}
