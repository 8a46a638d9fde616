//! Process-wide service context.
//!
//! Owns the resolved paths and configuration, the session registry and the
//! keep-alive controller. One per process; `main` creates it and hands out
//! references.

use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::info;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::keep_alive::{CommandLockProvider, KeepAlive, LockProvider};
use crate::paths::AppPaths;
use crate::pty::{Launcher, PtyLauncher};
use crate::registry::Registry;
use crate::vm::{CONSOLE_COUNT, HostFacts, build_bridge, build_machine};

pub struct Service {
    config: Config,
    paths: AppPaths,
    registry: Arc<Registry>,
    keep_alive: KeepAlive,
}

impl Service {
    /// Start with the production launcher and lock provider.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: Config) -> Result<Self> {
        let paths = AppPaths::resolve(&config.paths)
            .ok_or_else(|| Error::Configuration("HOME is not set".to_string()))?;
        let launcher = Arc::new(PtyLauncher::new(config.terminal.columns, config.terminal.rows));
        let locks = Box::new(CommandLockProvider::new(&config.keep_alive));
        Self::start_with(config, paths, launcher, locks)
    }

    pub fn start_with(
        config: Config,
        paths: AppPaths,
        launcher: Arc<dyn Launcher>,
        locks: Box<dyn LockProvider>,
    ) -> Result<Self> {
        paths.ensure()?;
        let runtime = Handle::try_current()
            .map_err(|e| Error::Configuration(format!("no tokio runtime: {e}")))?;

        let registry = Registry::new(launcher, config.terminal.clone(), runtime);
        let keep_alive = KeepAlive::new(Arc::clone(&registry), locks);
        if config.keep_alive.acquire_on_start {
            keep_alive.enable()?;
        }

        info!(
            runtime = %paths.runtime.display(),
            storage = ?paths.storage,
            "service started"
        );

        Ok(Self {
            config,
            paths,
            registry,
            keep_alive,
        })
    }

    /// Create the machine and its bridges, `[M, B0, B1, B2, B3]`, unless
    /// sessions already exist.
    ///
    /// Every launch spec is built before anything starts, so an unresolved
    /// executable fails with no process left behind.
    pub fn bootstrap(&self) -> Result<()> {
        if !self.registry.is_empty() {
            return Ok(());
        }
        let facts = self.host_facts();
        build_machine(&facts)?;
        for index in 0..CONSOLE_COUNT {
            build_bridge(index, &facts)?;
        }

        self.registry.create_machine_session(&facts)?;
        for index in 0..CONSOLE_COUNT {
            self.registry.create_bridge_session(index, &facts)?;
        }
        info!(sessions = self.registry.len(), "bootstrap complete");
        Ok(())
    }

    /// Probe the host now.
    pub fn host_facts(&self) -> HostFacts {
        HostFacts::probe(&self.paths, &self.config)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn keep_alive(&self) -> &KeepAlive {
        &self.keep_alive
    }

    pub fn request_termination(&self) {
        self.registry.request_termination();
    }

    pub async fn wait_for_shutdown(&self) {
        self.registry.wait_for_shutdown().await;
    }

    /// Release locks and stop all sessions.
    pub fn shutdown(&self) {
        self.keep_alive.release();
        self.registry.request_termination();
    }
}
