use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Resolve deployment folder (absolute path)
pub fn resolve_deployment_folder() -> Result<PathBuf> {
    // Prefer the working directory: the forum root is normally where the service is started.
    if let Ok(cwd) = std::env::current_dir() {
        return Ok(cwd);
    }

    // Fallback: the folder the executable lives in
    let exe = std::env::current_exe().context("Unable to resolve executable path")?;
    Ok(exe
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(".")))
}

/// Resolve log folder (absolute path), creating it when missing.
pub fn resolve_log_folder(configured: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(configured)
        .with_context(|| format!("Failed to create log folder: {:?}", configured))?;
    Ok(configured.to_path_buf())
}
