// Service settings
//
// Layered with the `config` crate: built-in defaults, then an optional
// `forum-setup.toml` in the working directory, then `FORUM_SETUP__SECTION__KEY`
// environment variables.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::utils::path_resolver::resolve_deployment_folder;

pub const SETTINGS_FILE: &str = "forum-setup";
pub const ENV_PREFIX: &str = "FORUM_SETUP";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub paths: PathSettings,
    pub setup: SetupSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Path prefix the forum is served under, always with a trailing slash.
    pub web_root: String,
    /// Scheme used to build the public domain when probing ourselves.
    pub scheme: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathSettings {
    /// Forum installation root. Empty means the deployment folder.
    #[serde(default)]
    pub root: String,
    pub conf: String,
    pub cache: String,
    pub uploads: String,
    pub applications: String,
    pub plugins: String,
    pub logs: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetupSettings {
    pub minimum_runtime_version: String,
    pub probe_timeout_secs: u64,
    pub config_file: String,
    pub session_cookie: String,
}

/// Absolute folders the wizard touches, resolved from [`PathSettings`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupPaths {
    pub root: PathBuf,
    pub conf: PathBuf,
    pub config_file: PathBuf,
    pub cache: PathBuf,
    pub uploads: PathBuf,
    pub applications: PathBuf,
    pub plugins: PathBuf,
    pub logs: PathBuf,
}

impl SetupPaths {
    /// Standard layout under a single root (conf/, cache/, uploads/, ...).
    pub fn under(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            conf: root.join("conf"),
            config_file: root.join("conf").join("config.toml"),
            cache: root.join("cache"),
            uploads: root.join("uploads"),
            applications: root.join("applications"),
            plugins: root.join("plugins"),
            logs: root.join("logs"),
        }
    }
}

impl Settings {
    /// Load settings from defaults, `forum-setup.toml` and the environment.
    pub fn load() -> Result<Self> {
        let builder = Self::defaults()?
            .add_source(config::File::with_name(SETTINGS_FILE).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            );

        builder
            .build()
            .context("Failed to build settings")?
            .try_deserialize::<Settings>()
            .context("Failed to parse settings")
    }

    /// Built-in defaults only, ignoring files and the environment.
    pub fn with_defaults() -> Result<Self> {
        Self::defaults()?
            .build()
            .context("Failed to build settings")?
            .try_deserialize::<Settings>()
            .context("Failed to parse settings")
    }

    fn defaults() -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
        let b = config::Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.web_root", "/")?
            .set_default("server.scheme", "http")?
            .set_default("server.request_timeout_secs", 120)?
            .set_default("paths.root", "")?
            .set_default("paths.conf", "conf")?
            .set_default("paths.cache", "cache")?
            .set_default("paths.uploads", "uploads")?
            .set_default("paths.applications", "applications")?
            .set_default("paths.plugins", "plugins")?
            .set_default("paths.logs", "logs")?
            .set_default("setup.minimum_runtime_version", "1.78.0")?
            .set_default("setup.probe_timeout_secs", 10)?
            .set_default("setup.config_file", "config.toml")?
            .set_default("setup.session_cookie", "Vanilla")?;
        Ok(b)
    }

    /// Resolve the configured folders to absolute paths.
    pub fn resolve_paths(&self) -> Result<SetupPaths> {
        let root = if self.paths.root.trim().is_empty() {
            resolve_deployment_folder()?
        } else {
            PathBuf::from(self.paths.root.trim())
        };

        let under_root = |p: &str| {
            let p = Path::new(p.trim());
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                root.join(p)
            }
        };

        let conf = under_root(&self.paths.conf);
        Ok(SetupPaths {
            config_file: conf.join(&self.setup.config_file),
            conf,
            cache: under_root(&self.paths.cache),
            uploads: under_root(&self.paths.uploads),
            applications: under_root(&self.paths.applications),
            plugins: under_root(&self.paths.plugins),
            logs: under_root(&self.paths.logs),
            root,
        })
    }

    /// Web root normalized to start and end with `/`.
    pub fn web_root(&self) -> String {
        normalize_web_root(&self.server.web_root)
    }
}

pub fn normalize_web_root(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{}/", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults_only() -> Settings {
        Settings::with_defaults().expect("defaults")
    }

    #[test]
    fn defaults_deserialize() {
        let s = defaults_only();
        assert_eq!(s.server.port, 8080);
        assert_eq!(s.setup.minimum_runtime_version, "1.78.0");
        assert_eq!(s.setup.session_cookie, "Vanilla");
        assert_eq!(s.web_root(), "/");
    }

    #[test]
    fn relative_paths_resolve_under_root() {
        let mut s = defaults_only();
        s.paths.root = "/srv/forum".to_string();
        s.paths.uploads = "/var/forum-uploads".to_string();

        let p = s.resolve_paths().expect("paths");
        assert_eq!(p.conf, PathBuf::from("/srv/forum/conf"));
        assert_eq!(p.config_file, PathBuf::from("/srv/forum/conf/config.toml"));
        assert_eq!(p.cache, PathBuf::from("/srv/forum/cache"));
        assert_eq!(p.uploads, PathBuf::from("/var/forum-uploads"));
    }

    #[test]
    fn standard_layout_matches_resolved_defaults() {
        let mut s = defaults_only();
        s.paths.root = "/srv/forum".to_string();
        assert_eq!(
            s.resolve_paths().expect("paths"),
            SetupPaths::under(Path::new("/srv/forum"))
        );
    }

    #[test]
    fn web_root_normalization() {
        assert_eq!(normalize_web_root(""), "/");
        assert_eq!(normalize_web_root("/"), "/");
        assert_eq!(normalize_web_root("forum"), "/forum/");
        assert_eq!(normalize_web_root("/forum/"), "/forum/");
    }
}
