//! Directory layout for vmterm.
//!
//! `AppPaths` resolves every directory the service touches, with config
//! overrides applied on top of XDG-style defaults:
//!
//! - Config:   `~/.config/vmterm/`
//! - Runtime:  `~/.local/share/vmterm/runtime/`  (disk images, `qemu-data/`,
//!   console sockets; produced by the installer)
//! - Tmp:      `~/.local/share/vmterm/tmp/`
//! - Logs:     `~/.local/share/vmterm/logs/`
//!
//! The runtime directory is read-only input: `ensure()` never creates it, it
//! only checks that the installer has run.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::config::PathsConfig;
use crate::error::{Error, Result};

const APP_NAME: &str = "vmterm";

/// All resolved application directory paths.
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub config: PathBuf,
    pub runtime: PathBuf,
    pub tmp: PathBuf,
    pub logs: PathBuf,
    /// Directory holding the machine and bridge executables, if pinned.
    pub executables: Option<PathBuf>,
    /// Host directory shared with the guest, if configured.
    pub storage: Option<PathBuf>,
}

impl AppPaths {
    /// Resolve all paths from the environment and the `[paths]` overrides.
    /// Does not touch the filesystem.
    pub fn resolve(overrides: &PathsConfig) -> Option<Self> {
        let home = std::env::var("HOME").ok().map(PathBuf::from)?;
        let data = resolve_data_dir(&home);

        Some(Self {
            config: resolve_config_dir(&home),
            runtime: overrides
                .runtime_dir
                .clone()
                .unwrap_or_else(|| data.join("runtime")),
            tmp: overrides.tmp_dir.clone().unwrap_or_else(|| data.join("tmp")),
            logs: overrides.logs_dir.clone().unwrap_or_else(|| data.join("logs")),
            executables: overrides.executable_dir.clone(),
            storage: overrides.storage_dir.clone(),
        })
    }

    /// Default config file location.
    pub fn config_file(&self) -> PathBuf {
        self.config.join("config.toml")
    }

    /// Check the installer's runtime directory and create the directories
    /// the service owns.
    pub fn ensure(&self) -> Result<()> {
        if !self.runtime.is_dir() {
            return Err(Error::Configuration(format!(
                "runtime data directory {} does not exist",
                self.runtime.display()
            )));
        }

        for dir in [&self.tmp, &self.logs] {
            std::fs::create_dir_all(dir)?;
            info!("ensured directory: {}", dir.display());
        }

        Ok(())
    }
}

fn resolve_config_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".config").join(APP_NAME)
    }
}

fn resolve_data_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".local").join("share").join(APP_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_produces_valid_paths() {
        let paths = AppPaths::resolve(&PathsConfig::default()).expect("HOME should be set in tests");
        assert!(paths.config.to_string_lossy().contains("vmterm"));
        assert!(paths.runtime.ends_with("runtime"));
        assert!(paths.tmp.ends_with("tmp"));
        assert!(paths.logs.ends_with("logs"));
        assert!(paths.executables.is_none());
        assert!(paths.storage.is_none());
        assert!(paths.config_file().ends_with("config.toml"));
    }

    #[test]
    fn overrides_win() {
        let overrides = PathsConfig {
            runtime_dir: Some(PathBuf::from("/srv/vm")),
            executable_dir: Some(PathBuf::from("/opt/qemu/bin")),
            storage_dir: Some(PathBuf::from("/home/shared")),
            tmp_dir: Some(PathBuf::from("/var/tmp/vmterm")),
            logs_dir: Some(PathBuf::from("/var/log/vmterm")),
        };
        let paths = AppPaths::resolve(&overrides).unwrap();
        assert_eq!(paths.runtime, PathBuf::from("/srv/vm"));
        assert_eq!(paths.tmp, PathBuf::from("/var/tmp/vmterm"));
        assert_eq!(paths.logs, PathBuf::from("/var/log/vmterm"));
        assert_eq!(paths.executables, Some(PathBuf::from("/opt/qemu/bin")));
        assert_eq!(paths.storage, Some(PathBuf::from("/home/shared")));
    }

    #[test]
    fn ensure_requires_runtime_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = AppPaths {
            config: tmp.path().join("config"),
            runtime: tmp.path().join("missing-runtime"),
            tmp: tmp.path().join("tmp"),
            logs: tmp.path().join("logs"),
            executables: None,
            storage: None,
        };

        let err = paths.ensure().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(!paths.tmp.exists());
    }

    #[test]
    fn ensure_creates_owned_directories() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("runtime")).unwrap();
        let paths = AppPaths {
            config: tmp.path().join("config"),
            runtime: tmp.path().join("runtime"),
            tmp: tmp.path().join("tmp"),
            logs: tmp.path().join("logs"),
            executables: None,
            storage: None,
        };

        paths.ensure().expect("ensure should succeed");

        assert!(paths.tmp.is_dir());
        assert!(paths.logs.is_dir());
    }
}
