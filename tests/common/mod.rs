//! Shared helpers for the integration tests.
//!
//! `ScriptLauncher` runs a `/bin/sh -c` script per launch on a real PTY in
//! place of QEMU or socat, keeping the built environment and working
//! directory. Scripts only use shell builtins.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use vmterm::error::Result;
use vmterm::pty::{Launcher, ProcessHandle, PtyLauncher};
use vmterm::registry::SessionObserver;
use vmterm::session::Session;
use vmterm::vm::{Executable, HostFacts, LaunchSpec};

/// Echoes every input line back as `got:<line>`.
pub const ECHO_SCRIPT: &str = "while read line; do echo \"got:$line\"; done";

// ---------------------------------------------------------------------------
// Launcher
// ---------------------------------------------------------------------------

pub struct ScriptLauncher {
    inner: PtyLauncher,
    scripts: Mutex<VecDeque<String>>,
    pub launched: Mutex<Vec<LaunchSpec>>,
}

impl ScriptLauncher {
    /// Every launch runs [`ECHO_SCRIPT`].
    pub fn echo() -> Arc<Self> {
        Self::with_scripts(&[])
    }

    /// Launches take `scripts` in order, then fall back to [`ECHO_SCRIPT`].
    pub fn with_scripts(scripts: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            inner: PtyLauncher::new(80, 24),
            scripts: Mutex::new(scripts.iter().map(|s| s.to_string()).collect()),
            launched: Mutex::new(Vec::new()),
        })
    }
}

impl Launcher for ScriptLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<ProcessHandle> {
        self.launched.lock().push(spec.clone());
        let script = self
            .scripts
            .lock()
            .pop_front()
            .unwrap_or_else(|| ECHO_SCRIPT.to_string());
        let shell = LaunchSpec {
            program: PathBuf::from("/bin/sh"),
            argv: vec!["/bin/sh".into(), "-c".into(), script],
            env: spec.env.clone(),
            cwd: spec.cwd.clone(),
        };
        self.inner.launch(&shell)
    }
}

// ---------------------------------------------------------------------------
// Host facts
// ---------------------------------------------------------------------------

pub fn facts(runtime: &Path) -> HostFacts {
    HostFacts {
        total_memory_bytes: Some(8 * 1024 * 1024 * 1024),
        machine_executable: Executable {
            name: "qemu-system-x86_64".into(),
            path: Some(PathBuf::from("/bin/sh")),
        },
        bridge_executable: Executable {
            name: "socat".into(),
            path: Some(PathBuf::from("/bin/sh")),
        },
        executable_dir: None,
        runtime_dir: runtime.to_path_buf(),
        tmp_dir: runtime.join("tmp"),
        storage_mounted: false,
        storage_root: PathBuf::new(),
        custom_cdrom_present: false,
        custom_hdd_present: false,
        upstream_dns: "8.8.8.8".into(),
        machine_name: "QEMU".into(),
        inherited_env: BTreeMap::from([("PATH".to_string(), "/usr/bin:/bin".to_string())]),
    }
}

// ---------------------------------------------------------------------------
// Observer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
    Title(String),
    Finished,
    Text,
    Bell,
    Clipboard(String),
    Colors,
}

#[derive(Default)]
pub struct RecordingObserver {
    pub events: Mutex<Vec<(u64, Seen)>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self, session: &Session, seen: &Seen) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|(id, s)| *id == session.id().get() && s == seen)
            .count()
    }

    pub fn has(&self, session: &Session, seen: &Seen) -> bool {
        self.count(session, seen) > 0
    }

    fn push(&self, session: &Session, seen: Seen) {
        self.events.lock().push((session.id().get(), seen));
    }
}

impl SessionObserver for RecordingObserver {
    fn on_title_changed(&self, session: &Arc<Session>, title: &str) {
        self.push(session, Seen::Title(title.to_string()));
    }
    fn on_session_finished(&self, session: &Arc<Session>) {
        self.push(session, Seen::Finished);
    }
    fn on_text_changed(&self, session: &Arc<Session>) {
        self.push(session, Seen::Text);
    }
    fn on_bell(&self, session: &Arc<Session>) {
        self.push(session, Seen::Bell);
    }
    fn on_clipboard_text(&self, session: &Arc<Session>, text: &str) {
        self.push(session, Seen::Clipboard(text.to_string()));
    }
    fn on_colors_changed(&self, session: &Arc<Session>) {
        self.push(session, Seen::Colors);
    }
}

// ---------------------------------------------------------------------------
// Waiting
// ---------------------------------------------------------------------------

/// Poll `condition` until it holds, panicking after 10 s.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
