//! vmterm: supervises a QEMU virtual machine and the socat bridges that
//! expose its serial consoles as terminal sessions.
//!
//! `vmterm run` keeps the sessions alive with no UI attached; session events
//! are logged and OSC 52 clipboard requests go to the system clipboard.
//! `vmterm print-args` shows exactly what would be launched and
//! `vmterm print-config` the configuration in effect.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc as std_mpsc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, info, warn};

use vmterm::config::Config;
use vmterm::paths::AppPaths;
use vmterm::registry::SessionObserver;
use vmterm::service::Service;
use vmterm::session::{Session, SessionState};
use vmterm::vm::{HostFacts, LaunchSpec, build_bridge, build_machine};

/// Virtual machine terminal supervisor
#[derive(Parser, Debug)]
#[command(name = "vmterm", version, about)]
struct Cli {
    /// Config file (default: <config dir>/vmterm/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Runtime data directory with disk images and qemu-data/
    #[arg(long, global = true)]
    runtime_dir: Option<PathBuf>,

    /// Host directory shared with the guest over 9p
    #[arg(long, global = true)]
    storage_dir: Option<PathBuf>,

    /// Directory holding the qemu and socat executables
    #[arg(long, global = true)]
    exec_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the machine and its console bridges and keep them running
    Run {
        /// Hold the wake lock from the start
        #[arg(long)]
        wake_lock: bool,
    },
    /// Print the launch spec for one session
    PrintArgs {
        #[command(subcommand)]
        target: Target,

        /// Print as JSON
        #[arg(long, global = true)]
        json: bool,
    },
    /// Print the effective configuration as TOML
    PrintConfig,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Target {
    Machine,
    Bridge { index: usize },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, config_path) = load_config(&cli)?;
    let logs = AppPaths::resolve(&config.paths).map(|paths| paths.logs);
    let _log_guard = vmterm::logging::init(&config.logging, logs.as_deref());
    debug!(path = %config_path.display(), exists = config_path.is_file(), "config");

    match cli.command {
        Command::Run { wake_lock } => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to create tokio runtime")?;
            let result = runtime.block_on(run(config, wake_lock));
            runtime.shutdown_timeout(std::time::Duration::from_secs(1));
            result
        }
        Command::PrintArgs { target, json } => print_args(&config, target, json),
        Command::PrintConfig => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> Result<(Config, PathBuf)> {
    let path = match &cli.config {
        Some(path) => path.clone(),
        None => AppPaths::resolve(&Default::default())
            .context("HOME is not set")?
            .config_file(),
    };
    let mut config = Config::load(&path)?;

    if let Some(dir) = &cli.runtime_dir {
        config.paths.runtime_dir = Some(dir.clone());
    }
    if let Some(dir) = &cli.storage_dir {
        config.paths.storage_dir = Some(dir.clone());
    }
    if let Some(dir) = &cli.exec_dir {
        config.paths.executable_dir = Some(dir.clone());
    }
    Ok((config, path))
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

async fn run(config: Config, wake_lock: bool) -> Result<()> {
    let service = Service::start(config)?;
    if let Err(e) = service.bootstrap() {
        // Whatever did start must not outlive us.
        service.shutdown();
        return Err(e).context("bootstrap failed");
    }
    if wake_lock {
        service.keep_alive().enable()?;
    }

    let observer: Arc<dyn SessionObserver> = Arc::new(LoggingObserver::new());
    service.registry().attach(&observer);

    let mut status = service.keep_alive().indicator();
    let mut usr1 = signal(SignalKind::user_defined1())?;
    let mut usr2 = signal(SignalKind::user_defined2())?;
    info!("running; SIGUSR1 holds the wake lock, SIGUSR2 releases it");

    loop {
        tokio::select! {
            _ = service.wait_for_shutdown() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let indicator = *status.borrow_and_update();
                info!(sessions = indicator.sessions, "{indicator}");
            }
            _ = usr1.recv() => {
                if let Err(e) = service.keep_alive().enable() {
                    warn!(error = %e, "could not acquire wake lock");
                }
            }
            _ = usr2.recv() => service.keep_alive().disable(),
            interrupted = tokio::signal::ctrl_c() => {
                interrupted?;
                info!("interrupted, stopping sessions");
                service.request_termination();
            }
        }
    }

    service.registry().detach();
    service.shutdown();
    info!("stopped");
    Ok(())
}

/// Logs session events and forwards clipboard text to the system clipboard.
struct LoggingObserver {
    clipboard: std_mpsc::Sender<String>,
}

impl LoggingObserver {
    fn new() -> Self {
        let (clipboard, rx) = std_mpsc::channel::<String>();
        // The clipboard owner must outlive each copy on X11/Wayland.
        std::thread::spawn(move || {
            let mut board = match arboard::Clipboard::new() {
                Ok(board) => board,
                Err(e) => {
                    warn!(error = %e, "system clipboard unavailable");
                    return;
                }
            };
            for text in rx {
                if let Err(e) = board.set_text(text) {
                    warn!(error = %e, "failed to set clipboard");
                }
            }
        });
        Self { clipboard }
    }
}

impl SessionObserver for LoggingObserver {
    fn on_title_changed(&self, session: &Arc<Session>, title: &str) {
        info!(session = session.name(), title, "title changed");
    }

    fn on_session_finished(&self, session: &Arc<Session>) {
        let exit_code = match session.state() {
            SessionState::Finished { exit_code } => exit_code,
            SessionState::Running => None,
        };
        info!(session = session.name(), id = %session.id(), ?exit_code, "session finished");
        debug!(session = session.name(), "last screen:\n{}", session.screen_text());
    }

    fn on_bell(&self, session: &Arc<Session>) {
        debug!(session = session.name(), "bell");
    }

    fn on_clipboard_text(&self, session: &Arc<Session>, text: &str) {
        debug!(session = session.name(), len = text.len(), "clipboard text");
        let _ = self.clipboard.send(text.to_string());
    }
}

// ---------------------------------------------------------------------------
// print-args
// ---------------------------------------------------------------------------

fn print_args(config: &Config, target: Target, json: bool) -> Result<()> {
    let paths = AppPaths::resolve(&config.paths).context("HOME is not set")?;
    let facts = HostFacts::probe(&paths, config);
    let spec = match target {
        Target::Machine => build_machine(&facts)?,
        Target::Bridge { index } => build_bridge(index, &facts)?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&spec)?);
    } else {
        print!("{}", render_spec(&spec));
    }
    Ok(())
}

fn render_spec(spec: &LaunchSpec) -> String {
    let mut out = format!("cd {}\n", spec.cwd.display());
    for (key, value) in &spec.env {
        out.push_str(&format!("{key}={value} \\\n"));
    }
    out.push_str(&spec.argv.join(" \\\n    "));
    out.push('\n');
    out
}
