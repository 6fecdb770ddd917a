// Prerequisite checks
//
// Every check runs even when an earlier one failed so the operator sees the full list.
// Apart from short-lived write-test files, the only mutations are creating an empty
// config file and the cache subfolders.

use log::{debug, info, warn};
use std::cmp::Ordering;
use std::path::Path;
use std::sync::Arc;

use crate::settings::SetupPaths;
use crate::setup::validation::{IssueKind, ValidationResults};

pub const CACHE_SUBDIRS: &[&str] = &["HtmlPurifier", "Smarty", "Smarty/cache", "Smarty/compile"];

/// Facts about the running binary and host.
pub trait RuntimeProbe: Send + Sync {
    fn runtime_version(&self) -> String;
    fn has_database_driver(&self) -> bool;
    fn has_driver_feature(&self) -> bool;
    fn can_process_images(&self) -> bool;
}

/// Probe backed by build-time facts and the host `PATH`.
pub struct BuildRuntimeProbe;

impl RuntimeProbe for BuildRuntimeProbe {
    fn runtime_version(&self) -> String {
        env!("FORUM_SETUP_RUSTC_VERSION").to_string()
    }

    fn has_database_driver(&self) -> bool {
        // The MySQL driver is compiled in unconditionally.
        true
    }

    fn has_driver_feature(&self) -> bool {
        cfg!(feature = "tls")
    }

    fn can_process_images(&self) -> bool {
        which::which("magick").is_ok() || which::which("convert").is_ok()
    }
}

/// Compare dotted version strings numerically. Missing parts count as zero and
/// pre-release suffixes (`1.80.0-nightly`) are ignored.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    fn parts(v: &str) -> Vec<u64> {
        v.trim()
            .split(['-', '+'])
            .next()
            .unwrap_or("")
            .split('.')
            .map(|p| {
                p.chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0)
            })
            .collect()
    }

    let (a, b) = (parts(a), parts(b));
    let len = a.len().max(b.len());
    for i in 0..len {
        let (x, y) = (a.get(i).copied().unwrap_or(0), b.get(i).copied().unwrap_or(0));
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Folders must list and accept a new file; files must open for read and write.
/// The marker file created in a folder is removed again.
async fn is_readable_writable(path: &Path) -> bool {
    let Ok(meta) = tokio::fs::metadata(path).await else {
        return false;
    };

    if !meta.is_dir() {
        return tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .await
            .is_ok();
    }

    if tokio::fs::read_dir(path).await.is_err() {
        return false;
    }

    let marker = path.join(format!(".forum-setup-write-test-{}", uuid::Uuid::new_v4().simple()));
    match tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&marker)
        .await
    {
        Ok(file) => {
            drop(file);
            if let Err(e) = tokio::fs::remove_file(&marker).await {
                warn!(
                    "[PHASE: prerequisites] [STEP: permissions] Could not remove {:?}: {}",
                    marker, e
                );
            }
            true
        }
        Err(e) => {
            debug!(
                "[PHASE: prerequisites] [STEP: permissions] {:?} is not writable: {}",
                path, e
            );
            false
        }
    }
}

fn permission_help(paths: &SetupPaths) -> String {
    format!(
        "Using your ftp client, or via command line, make sure that the following permissions are set for your forum installation:\n\
chmod -R 777 {}\nchmod -R 777 {}\nchmod -R 777 {}",
        paths.conf.display(),
        paths.cache.display(),
        paths.uploads.display()
    )
}

#[derive(Debug, Clone, Default)]
pub struct PrerequisiteReport {
    pub errors: ValidationResults,
}

impl PrerequisiteReport {
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }
}

pub struct PrerequisiteChecker {
    paths: SetupPaths,
    minimum_runtime_version: String,
    runtime: Arc<dyn RuntimeProbe>,
}

impl PrerequisiteChecker {
    pub fn new(
        paths: SetupPaths,
        minimum_runtime_version: impl Into<String>,
        runtime: Arc<dyn RuntimeProbe>,
    ) -> Self {
        Self {
            paths,
            minimum_runtime_version: minimum_runtime_version.into(),
            runtime,
        }
    }

    pub async fn check(&self) -> PrerequisiteReport {
        info!("[PHASE: prerequisites] [STEP: check] Checking server prerequisites");
        let mut errors = ValidationResults::default();

        let running = self.runtime.runtime_version();
        if compare_versions(&running, &self.minimum_runtime_version) == Ordering::Less {
            errors.add_error(
                IssueKind::Environment,
                format!(
                    "You are running runtime version {}. The forum requires version {} or greater. You must upgrade before you can continue.",
                    running, self.minimum_runtime_version
                ),
            );
        }

        if !self.runtime.has_database_driver() {
            errors.add_error(
                IssueKind::Environment,
                "You must have the database module available in order for the forum to connect to your database.",
            );
        }

        if !self.runtime.has_driver_feature() {
            errors.add_error(
                IssueKind::Environment,
                "You must have the MySQL driver built with TLS support in order for the forum to connect to your database.",
            );
        }

        let mut permission_problem = false;

        if !is_readable_writable(&self.paths.conf).await {
            errors.add_error(
                IssueKind::Permission,
                "Your configuration folder does not have the correct permissions. The server needs to be able to read and write to this folder.",
            );
            permission_problem = true;
        } else {
            let config_file = &self.paths.config_file;
            if !config_file.exists() {
                if let Err(e) = tokio::fs::write(config_file, "").await {
                    warn!(
                        "[PHASE: prerequisites] [STEP: config_file] Could not create {:?}: {}",
                        config_file, e
                    );
                }
            }
            if !is_readable_writable(config_file).await {
                errors.add_error(
                    IssueKind::Permission,
                    format!(
                        "Your configuration file does not have the correct permissions. The server needs to be able to read and write to this file: {}",
                        config_file.display()
                    ),
                );
                permission_problem = true;
            }
        }

        if !is_readable_writable(&self.paths.uploads).await {
            errors.add_error(
                IssueKind::Permission,
                format!(
                    "Your uploads folder does not have the correct permissions. The server needs to be able to read and write to this folder: {}",
                    self.paths.uploads.display()
                ),
            );
            permission_problem = true;
        }

        if !is_readable_writable(&self.paths.cache).await {
            errors.add_error(
                IssueKind::Permission,
                format!(
                    "Your cache folder does not have the correct permissions. The server needs to be able to read and write to this folder and all the files within: {}",
                    self.paths.cache.display()
                ),
            );
            permission_problem = true;
        } else {
            for sub in CACHE_SUBDIRS {
                let dir = self.paths.cache.join(sub);
                if let Err(e) = tokio::fs::create_dir_all(&dir).await {
                    warn!(
                        "[PHASE: prerequisites] [STEP: cache] Could not create {:?}: {}",
                        dir, e
                    );
                }
            }
        }

        if permission_problem {
            errors.add_error(IssueKind::Permission, permission_help(&self.paths));
        }

        if errors.is_empty() {
            info!("[PHASE: prerequisites] [STEP: check] All prerequisites met");
        } else {
            warn!(
                "[PHASE: prerequisites] [STEP: check] {} prerequisite problem(s) found",
                errors.error_count()
            );
        }

        PrerequisiteReport { errors }
    }
}
