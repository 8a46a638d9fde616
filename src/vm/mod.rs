//! Launch specifications for the machine and its console bridges.
//!
//! [`host::probe`](HostFacts::probe) gathers everything about the host that
//! influences a launch; [`args`] turns those facts into argv/env/cwd without
//! touching the system again.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{Error, Result};

pub mod args;
pub mod host;

// ---------------------------------------------------------------------------
// Runtime data layout
// ---------------------------------------------------------------------------

/// Number of serial consoles wired to local sockets, one bridge each.
pub const CONSOLE_COUNT: usize = 4;

/// Boot CD-ROM image installed into the runtime directory.
pub const CDROM_IMAGE_NAME: &str = "alpine-x86_64.iso";

/// System disk image installed into the runtime directory.
pub const HDD_IMAGE_NAME: &str = "alpine-x86_64.qcow2";

/// Firmware and keymap directory inside the runtime directory.
pub const QEMU_DATA_DIR: &str = "qemu-data";

/// User-supplied images, looked up in the machine's working directory.
pub const CUSTOM_CDROM_IMAGE_NAME: &str = "cdrom.iso";
pub const CUSTOM_HDD_IMAGE_NAME: &str = "hdd.qcow2";

// ---------------------------------------------------------------------------
// Shared types
// ---------------------------------------------------------------------------

/// An executable looked up at probe time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executable {
    /// Configured name, kept for error messages.
    pub name: String,
    /// Resolved absolute path, `None` when not found.
    pub path: Option<PathBuf>,
}

impl Executable {
    pub fn require(&self) -> Result<&Path> {
        self.path.as_deref().ok_or_else(|| {
            Error::Configuration(format!("executable `{}` not found", self.name))
        })
    }
}

/// Host capability facts, collected once per session build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostFacts {
    /// Physical memory of the host, `None` if the query failed.
    pub total_memory_bytes: Option<u64>,
    pub machine_executable: Executable,
    pub bridge_executable: Executable,
    /// Pinned executable directory; becomes the children's `PATH`.
    pub executable_dir: Option<PathBuf>,
    pub runtime_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub storage_mounted: bool,
    pub storage_root: PathBuf,
    pub custom_cdrom_present: bool,
    pub custom_hdd_present: bool,
    pub upstream_dns: String,
    /// QEMU instance name.
    pub machine_name: String,
    /// Passthrough variables present in the supervisor's environment.
    pub inherited_env: BTreeMap<String, String>,
}

impl HostFacts {
    /// Working directory of the machine session: the shared storage when
    /// mounted, the runtime directory otherwise. Custom images live here.
    pub fn machine_work_dir(&self) -> &Path {
        if self.storage_mounted {
            &self.storage_root
        } else {
            &self.runtime_dir
        }
    }
}

/// Everything needed to start one child process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchSpec {
    pub program: PathBuf,
    /// Full argument vector, `argv[0]` included.
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: PathBuf,
}

pub use args::{build_bridge, build_machine, console_socket_path};
