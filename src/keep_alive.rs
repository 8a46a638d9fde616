//! Keep-alive lock and status indicator.
//!
//! The lock is a pair: a wake lock and a network keepalive, acquired and
//! released together. While the registry has sessions or the lock is held,
//! the service stays up; the indicator published on the registry's watch
//! channel reflects both.
//!
//! ```text
//!   enable ──► acquire wake ──► acquire network ──► lock_held = true ──► refresh
//!                                   │ fails
//!                                   └──► release wake, Err(Lock)
//!   disable ──► drop pair ──► lock_held = false ──► refresh (may tear down)
//! ```

use std::fmt;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::KeepAliveConfig;
use crate::error::{Error, Result};
use crate::registry::Registry;

// ---------------------------------------------------------------------------
// Indicator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineStatus {
    NotInitialized,
    Running,
    Stopped,
}

/// Published status of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Indicator {
    pub machine: MachineStatus,
    pub lock_held: bool,
    pub sessions: usize,
}

impl Default for Indicator {
    fn default() -> Self {
        Self {
            machine: MachineStatus::NotInitialized,
            lock_held: false,
            sessions: 0,
        }
    }
}

impl fmt::Display for Indicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self.machine {
            MachineStatus::Running => "Virtual machine is running.",
            MachineStatus::NotInitialized => "Virtual machine is not initialized.",
            MachineStatus::Stopped => "Virtual machine has stopped.",
        })?;
        if self.lock_held {
            f.write_str(" Wake lock held.")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Lock providers
// ---------------------------------------------------------------------------

/// A held lock half. Released on drop.
pub trait LockGuard: Send {}

pub trait LockProvider: Send + Sync {
    fn acquire_wake(&self) -> Result<Box<dyn LockGuard>>;
    fn acquire_network(&self) -> Result<Box<dyn LockGuard>>;
}

/// Holds each lock half by running an inhibitor command for as long as the
/// lock is held, e.g. `systemd-inhibit ... sleep infinity`.
#[derive(Debug, Clone, Default)]
pub struct CommandLockProvider {
    wake: Vec<String>,
    network: Vec<String>,
}

impl CommandLockProvider {
    pub fn new(config: &KeepAliveConfig) -> Self {
        Self {
            wake: config.wake_lock_command.clone(),
            network: config.network_lock_command.clone(),
        }
    }

    fn hold(kind: &'static str, command: &[String]) -> Result<Box<dyn LockGuard>> {
        let Some((program, args)) = command.split_first() else {
            return Ok(Box::new(NoopGuard));
        };
        let child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start {kind} lock command `{program}`"))
            .map_err(Error::Lock)?;
        debug!(kind, pid = ?child.id(), "lock command started");
        Ok(Box::new(CommandGuard { _child: child }))
    }
}

impl LockProvider for CommandLockProvider {
    fn acquire_wake(&self) -> Result<Box<dyn LockGuard>> {
        Self::hold("wake", &self.wake)
    }

    fn acquire_network(&self) -> Result<Box<dyn LockGuard>> {
        Self::hold("network", &self.network)
    }
}

struct NoopGuard;

impl LockGuard for NoopGuard {}

/// The inhibitor process is killed when this is dropped.
struct CommandGuard {
    _child: tokio::process::Child,
}

impl LockGuard for CommandGuard {}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

struct LockPair {
    _wake: Box<dyn LockGuard>,
    _network: Box<dyn LockGuard>,
}

pub struct KeepAlive {
    registry: Arc<Registry>,
    provider: Box<dyn LockProvider>,
    locks: Mutex<Option<LockPair>>,
}

impl KeepAlive {
    pub fn new(registry: Arc<Registry>, provider: Box<dyn LockProvider>) -> Self {
        Self {
            registry,
            provider,
            locks: Mutex::new(None),
        }
    }

    pub fn is_held(&self) -> bool {
        self.locks.lock().is_some()
    }

    /// Acquire the lock pair if not already held.
    pub fn enable(&self) -> Result<()> {
        {
            let mut locks = self.locks.lock();
            if locks.is_some() {
                return Ok(());
            }
            let wake = self.provider.acquire_wake()?;
            let network = match self.provider.acquire_network() {
                Ok(network) => network,
                Err(e) => {
                    drop(wake);
                    return Err(e);
                }
            };
            *locks = Some(LockPair {
                _wake: wake,
                _network: network,
            });
            self.registry.set_lock_held(true);
        }
        info!("wake lock acquired");
        self.registry.refresh_status();
        Ok(())
    }

    /// Release the lock pair if held. With no sessions left this tears the
    /// service down.
    pub fn disable(&self) {
        if self.take() {
            info!("wake lock released");
        }
        self.registry.refresh_status();
    }

    /// Drop the lock pair without touching the indicator.
    pub fn release(&self) {
        if self.take() {
            debug!("wake lock released at shutdown");
        }
    }

    pub fn indicator(&self) -> watch::Receiver<Indicator> {
        self.registry.status()
    }

    fn take(&self) -> bool {
        let pair = self.locks.lock().take();
        self.registry.set_lock_held(false);
        pair.is_some()
    }
}
