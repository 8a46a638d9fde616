//! User configuration for vmterm.
//!
//! Every section is `#[serde(default)]`, so a config file only needs the keys
//! it overrides. The memory ratios and console wiring are not configurable:
//! the machine executable expects them exactly as built in [`crate::vm::args`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Root configuration container.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub machine: MachineConfig,
    pub bridge: BridgeConfig,
    pub terminal: TerminalConfig,
    pub keep_alive: KeepAliveConfig,
    pub logging: LoggingConfig,
}

/// Directory overrides. Unset entries fall back to [`crate::paths::AppPaths`].
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Runtime data directory holding the disk images and `qemu-data/`.
    pub runtime_dir: Option<PathBuf>,
    /// Directory holding the machine and bridge executables. When unset the
    /// executables are looked up on `PATH`.
    pub executable_dir: Option<PathBuf>,
    /// Host directory shared with the guest over 9p. Treated as mounted when
    /// it exists.
    pub storage_dir: Option<PathBuf>,
    pub tmp_dir: Option<PathBuf>,
    pub logs_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MachineConfig {
    /// Session name and QEMU instance name.
    pub name: String,
    pub executable: String,
    /// Upstream DNS handed to the user-mode network stack.
    pub upstream_dns: String,
    /// Variables copied from the supervisor's environment when present.
    pub passthrough_env: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub executable: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TerminalConfig {
    pub columns: u16,
    pub rows: u16,
    pub scrollback: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KeepAliveConfig {
    /// Acquire the wake/network lock pair as soon as the service starts.
    pub acquire_on_start: bool,
    /// Command held running for as long as the wake lock is held.
    pub wake_lock_command: Vec<String>,
    /// Command held running for as long as the network keepalive is held.
    /// Empty means the network half is a no-op.
    pub network_lock_command: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Also write logs to a daily file under the logs directory.
    /// `VMTERM_LOG=1` turns this on regardless.
    pub file: bool,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            name: "QEMU".to_string(),
            executable: "qemu-system-x86_64".to_string(),
            upstream_dns: "8.8.8.8".to_string(),
            passthrough_env: ["TZ", "LD_LIBRARY_PATH", "XDG_RUNTIME_DIR"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            executable: "socat".to_string(),
        }
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            columns: 80,
            rows: 24,
            scrollback: 2000,
        }
    }
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            acquire_on_start: false,
            wake_lock_command: [
                "systemd-inhibit",
                "--what=sleep:idle",
                "--who=vmterm",
                "--why=virtual machine running",
                "--mode=block",
                "sleep",
                "infinity",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            network_lock_command: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: false,
        }
    }
}

impl Config {
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Configuration(format!("cannot serialize config: {e}")))
    }

    /// Load the config file at `path`. A missing file yields the defaults; a
    /// file that exists but does not parse is a configuration error.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        Self::from_toml(&text).map_err(|e| {
            Error::Configuration(format!("invalid config file {}: {e}", path.display()))
        })
    }
}
