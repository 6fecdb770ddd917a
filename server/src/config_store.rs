// Forum configuration store
//
// File-backed key/value map (`conf/config.toml`). Keys are dotted names such as
// `Garden.Installed`; they are written as quoted keys so the file stays flat.
// Every save rewrites the whole file through a temp file + rename.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::error::SetupError;

pub mod keys {
    pub const INSTALLED: &str = "Garden.Installed";
    pub const ERRORS_MASTER_VIEW: &str = "Garden.Errors.MasterView";
    pub const TITLE: &str = "Garden.Title";
    pub const LOCALE: &str = "Garden.Locale";
    pub const REWRITE_URLS: &str = "Garden.RewriteUrls";
    pub const WEB_ROOT: &str = "Garden.WebRoot";
    pub const DOMAIN: &str = "Garden.Domain";
    pub const VERSION: &str = "Garden.Version";
    pub const CAN_PROCESS_IMAGES: &str = "Garden.CanProcessImages";
    pub const COOKIE_SALT: &str = "Garden.Cookie.Salt";
    pub const COOKIE_DOMAIN: &str = "Garden.Cookie.Domain";
    pub const COOKIE_NAME: &str = "Garden.Cookie.Name";
    pub const DATABASE_HOST: &str = "Database.Host";
    pub const DATABASE_NAME: &str = "Database.Name";
    pub const DATABASE_USER: &str = "Database.User";
    pub const DATABASE_PASSWORD: &str = "Database.Password";
    pub const ENABLED_PLUGINS: &str = "EnabledPlugins";
    pub const ENABLED_APPLICATIONS: &str = "EnabledApplications";
    pub const PERMISSIONS: &str = "Permissions";
}

/// A single configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl ConfigValue {
    /// Loose truthiness: `true`, non-zero numbers and non-empty strings other than
    /// "0"/"false".
    pub fn as_bool(&self) -> bool {
        match self {
            ConfigValue::Bool(b) => *b,
            ConfigValue::Int(i) => *i != 0,
            ConfigValue::Text(s) => {
                let s = s.trim();
                !(s.is_empty() || s == "0" || s.eq_ignore_ascii_case("false"))
            }
        }
    }

    pub fn as_text(&self) -> String {
        match self {
            ConfigValue::Bool(b) => b.to_string(),
            ConfigValue::Int(i) => i.to_string(),
            ConfigValue::Text(s) => s.clone(),
        }
    }
}

impl From<bool> for ConfigValue {
    fn from(v: bool) -> Self {
        ConfigValue::Bool(v)
    }
}

impl From<i64> for ConfigValue {
    fn from(v: i64) -> Self {
        ConfigValue::Int(v)
    }
}

impl From<&str> for ConfigValue {
    fn from(v: &str) -> Self {
        ConfigValue::Text(v.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(v: String) -> Self {
        ConfigValue::Text(v)
    }
}

pub type ConfigValues = BTreeMap<String, ConfigValue>;

#[derive(Debug, Default)]
struct StoreState {
    persisted: ConfigValues,
    /// Values set for the running process; read before `persisted`.
    overrides: ConfigValues,
    /// Override keys that the next save will also write to disk.
    pending: BTreeSet<String>,
}

#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl ConfigStore {
    /// Open the store backed by `path`. A missing or empty file is an empty store.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let persisted = read_config_file(&path).await?;
        info!(
            "[PHASE: config] [STEP: open] Configuration store opened (path={:?}, keys={})",
            path,
            persisted.len()
        );
        Ok(Self {
            path,
            state: Mutex::new(StoreState {
                persisted,
                ..Default::default()
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self, key: &str) -> Option<ConfigValue> {
        let state = self.state.lock().await;
        state
            .overrides
            .get(key)
            .or_else(|| state.persisted.get(key))
            .cloned()
    }

    pub async fn get_text(&self, key: &str, default: &str) -> String {
        self.get(key)
            .await
            .map(|v| v.as_text())
            .unwrap_or_else(|| default.to_string())
    }

    pub async fn is_installed(&self) -> bool {
        self.get(keys::INSTALLED)
            .await
            .map(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// All keys (persisted or overridden) starting with `prefix.`, with the prefix removed.
    pub async fn keys_with_prefix(&self, prefix: &str) -> ConfigValues {
        let state = self.state.lock().await;
        let dotted = format!("{}.", prefix);
        state
            .persisted
            .iter()
            .chain(state.overrides.iter())
            .filter_map(|(k, v)| {
                k.strip_prefix(&dotted)
                    .map(|rest| (rest.to_string(), v.clone()))
            })
            .collect()
    }

    /// Set a value for the running process. It is written to disk by the next
    /// [`save`](Self::save) unless [`clear_pending_writes`](Self::clear_pending_writes)
    /// is called first.
    pub async fn set_runtime(&self, key: &str, value: ConfigValue) {
        let mut state = self.state.lock().await;
        state.overrides.insert(key.to_string(), value);
        state.pending.insert(key.to_string());
    }

    /// Forget staged runtime values so no later save persists them. The values stay
    /// readable for the rest of the process.
    pub async fn clear_pending_writes(&self) {
        let mut state = self.state.lock().await;
        debug!(
            "[PHASE: config] [STEP: clear_pending] Dropping {} pending write(s)",
            state.pending.len()
        );
        state.pending.clear();
    }

    /// Merge `values` into the persisted map and write the file atomically.
    pub async fn save(&self, values: ConfigValues) -> Result<()> {
        let mut state = self.state.lock().await;
        self.save_locked(&mut state, values).await
    }

    /// Persist `Garden.Installed = true` together with `extra`, failing with
    /// [`SetupError::AlreadyInstalled`] if the flag is already set. The check and the
    /// write happen under one lock.
    pub async fn mark_installed(&self, extra: ConfigValues) -> Result<(), SetupError> {
        let mut state = self.state.lock().await;

        let on_disk = read_config_file(&self.path).await?;
        let already = on_disk
            .get(keys::INSTALLED)
            .or_else(|| state.persisted.get(keys::INSTALLED))
            .map(|v| v.as_bool())
            .unwrap_or(false);
        if already {
            warn!("[PHASE: config] [STEP: mark_installed] Installed flag already set; refusing");
            return Err(SetupError::AlreadyInstalled);
        }

        let mut values = extra;
        values.insert(keys::INSTALLED.to_string(), ConfigValue::Bool(true));
        self.save_locked(&mut state, values).await?;

        info!("[PHASE: config] [STEP: mark_installed] Installation flag persisted");
        Ok(())
    }

    async fn save_locked(&self, state: &mut StoreState, values: ConfigValues) -> Result<()> {
        let mut next = state.persisted.clone();
        for key in &state.pending {
            if let Some(v) = state.overrides.get(key) {
                next.insert(key.clone(), v.clone());
            }
        }
        let written: Vec<String> = values.keys().cloned().collect();
        next.extend(values);

        write_config_file(&self.path, &next).await?;

        for key in &written {
            state.overrides.remove(key);
        }
        state.pending.clear();
        state.persisted = next;

        debug!(
            "[PHASE: config] [STEP: save] Saved configuration (keys_written={}, total_keys={})",
            written.len(),
            state.persisted.len()
        );
        Ok(())
    }
}

async fn read_config_file(path: &Path) -> Result<ConfigValues> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ConfigValues::new()),
        Err(e) => {
            return Err(anyhow::Error::new(e)
                .context(format!("Failed to read configuration file: {:?}", path)))
        }
    };

    if raw.trim().is_empty() {
        return Ok(ConfigValues::new());
    }

    let table: toml::Table = raw
        .parse()
        .with_context(|| format!("Failed to parse configuration file: {:?}", path))?;

    let mut out = ConfigValues::new();
    flatten_table("", &table, &mut out);
    Ok(out)
}

/// Hand-edited files may use real TOML tables (`[Garden]`); those are flattened to
/// dotted keys.
fn flatten_table(prefix: &str, table: &toml::Table, out: &mut ConfigValues) {
    for (k, v) in table {
        let key = if prefix.is_empty() {
            k.clone()
        } else {
            format!("{}.{}", prefix, k)
        };
        match v {
            toml::Value::Table(t) => flatten_table(&key, t, out),
            toml::Value::Boolean(b) => {
                out.insert(key, ConfigValue::Bool(*b));
            }
            toml::Value::Integer(i) => {
                out.insert(key, ConfigValue::Int(*i));
            }
            toml::Value::String(s) => {
                out.insert(key, ConfigValue::Text(s.clone()));
            }
            other => {
                out.insert(key, ConfigValue::Text(other.to_string()));
            }
        }
    }
}

async fn write_config_file(path: &Path, values: &ConfigValues) -> Result<()> {
    let body = toml::to_string(values).context("Failed to serialize configuration")?;
    let contents = format!(
        "# Forum configuration. Written by forum-setup; keys are dotted names.\n{}",
        body
    );

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "config.toml".to_string());
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple()));

    tokio::fs::write(&tmp, contents)
        .await
        .with_context(|| format!("Failed to write temp configuration file: {:?}", tmp))?;

    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(anyhow::Error::new(e)
            .context(format!("Failed to replace configuration file: {:?}", path)));
    }
    Ok(())
}
