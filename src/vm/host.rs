//! Host probing: the only side-effecting step before a launch.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::{CUSTOM_CDROM_IMAGE_NAME, CUSTOM_HDD_IMAGE_NAME, Executable, HostFacts};
use crate::config::Config;
use crate::paths::AppPaths;

impl HostFacts {
    /// Collect host facts for one session build.
    ///
    /// Memory query failure is not an error: the builder falls back to its
    /// fixed default sizing.
    pub fn probe(paths: &AppPaths, config: &Config) -> Self {
        let total_memory_bytes = total_memory_bytes();
        if total_memory_bytes.is_none() {
            warn!("failed to determine size of host memory");
        }

        let storage_root = paths.storage.clone().unwrap_or_default();
        let storage_mounted = paths.storage.as_deref().is_some_and(Path::is_dir);

        let work_dir = if storage_mounted {
            storage_root.as_path()
        } else {
            paths.runtime.as_path()
        };
        let custom_cdrom_present = work_dir.join(CUSTOM_CDROM_IMAGE_NAME).is_file();
        let custom_hdd_present = work_dir.join(CUSTOM_HDD_IMAGE_NAME).is_file();

        let inherited_env = config
            .machine
            .passthrough_env
            .iter()
            .filter_map(|name| std::env::var(name).ok().map(|v| (name.clone(), v)))
            .chain(std::env::var("PATH").ok().map(|v| ("PATH".to_string(), v)))
            .collect::<BTreeMap<_, _>>();

        let facts = Self {
            total_memory_bytes,
            machine_executable: resolve_executable(
                &config.machine.executable,
                paths.executables.as_deref(),
            ),
            bridge_executable: resolve_executable(
                &config.bridge.executable,
                paths.executables.as_deref(),
            ),
            executable_dir: paths.executables.clone(),
            runtime_dir: paths.runtime.clone(),
            tmp_dir: paths.tmp.clone(),
            storage_mounted,
            storage_root,
            custom_cdrom_present,
            custom_hdd_present,
            upstream_dns: config.machine.upstream_dns.clone(),
            machine_name: config.machine.name.clone(),
            inherited_env,
        };

        debug!(?facts, "probed host facts");
        facts
    }
}

/// Resolve an executable name: absolute paths as-is, then the pinned
/// executable directory, then `PATH`.
pub fn resolve_executable(name: &str, executable_dir: Option<&Path>) -> Executable {
    let path = find_executable(name, executable_dir);
    Executable {
        name: name.to_string(),
        path,
    }
}

fn find_executable(name: &str, executable_dir: Option<&Path>) -> Option<PathBuf> {
    let candidate = PathBuf::from(name);
    if candidate.is_absolute() {
        return candidate.is_file().then_some(candidate);
    }

    if let Some(dir) = executable_dir {
        let candidate = dir.join(name);
        return candidate.is_file().then_some(candidate);
    }

    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Total physical memory of the host in bytes.
#[cfg(unix)]
pub fn total_memory_bytes() -> Option<u64> {
    // SAFETY: sysconf has no preconditions; it returns -1 on failure.
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    // SAFETY: as above.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if pages <= 0 || page_size <= 0 {
        return None;
    }
    (pages as u64).checked_mul(page_size as u64)
}

#[cfg(not(unix))]
pub fn total_memory_bytes() -> Option<u64> {
    None
}
