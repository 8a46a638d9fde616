//! Process launcher: starts a [`LaunchSpec`] on a pseudo-terminal.
//!
//! ```text
//!              ┌──────────── PtyLauncher::launch ────────────┐
//! LaunchSpec ──► openpty ──► spawn argv (env cleared, cwd set) │
//!              └──────┬──────────────┬──────────────┬────────┘
//!                     │              │              │
//!              [waiter thread] [reader thread] [writer thread]
//!          Exited(code), once ─┐  ┌─ Output(Vec<u8>)    ▲
//!                              ▼  ▼                     │ input chunks
//!                        unbounded mpsc ──► pump   ProcessControl::write
//! ```
//!
//! Output and exit are pushed, never polled. The waiter gives the reader a
//! short grace period so the tail of the output arrives before `Exited`.
//! Input goes through the writer thread, so a child that stops reading only
//! ever stalls that thread.

use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use anyhow::Context;
use portable_pty::{Child, ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::vm::LaunchSpec;

/// How long the waiter holds `Exited` back while the reader drains.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(250);

const READ_BUF_SIZE: usize = 4096;

type BoxedChild = Box<dyn Child + Send + Sync>;

/// Something that turns a launch spec into a running process.
pub trait Launcher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> Result<ProcessHandle>;
}

/// Pushed from the process side, in order per process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Output(Vec<u8>),
    Exited(u32),
}

/// A freshly launched process: its control half and its event stream.
pub struct ProcessHandle {
    pub control: ProcessControl,
    pub events: mpsc::UnboundedReceiver<ProcessEvent>,
}

/// Write/resize/kill side of a launched process.
pub struct ProcessControl {
    pid: Option<u32>,
    input: std_mpsc::Sender<Vec<u8>>,
    master: Box<dyn MasterPty + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    running: Arc<AtomicBool>,
    finish_requested: bool,
}

impl ProcessControl {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Queue input bytes for the process terminal. Never blocks.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        if !self.is_running() {
            return Err(Error::NotRunning);
        }
        // The writer thread only goes away when the terminal does.
        self.input
            .send(bytes.to_vec())
            .map_err(|_| Error::NotRunning)
    }

    /// Ask the process to terminate. Does not wait for it to die.
    pub fn request_finish(&mut self) {
        if self.finish_requested || !self.is_running() {
            return;
        }
        self.finish_requested = true;
        if let Err(e) = self.killer.kill() {
            // Usually a race with a natural exit.
            debug!(pid = ?self.pid, error = %e, "kill failed");
        }
    }

    pub fn resize(&mut self, cols: u16, rows: u16) -> Result<()> {
        if !self.is_running() {
            return Err(Error::NotRunning);
        }
        self.master
            .resize(pty_size(cols, rows))
            .map_err(|e| Error::Io(std::io::Error::other(e)))
    }
}

/// Production launcher on `portable-pty`.
#[derive(Debug, Clone, Copy)]
pub struct PtyLauncher {
    pub cols: u16,
    pub rows: u16,
}

impl PtyLauncher {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

impl Launcher for PtyLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<ProcessHandle> {
        let launch_err = |source: anyhow::Error| Error::Launch {
            program: spec.program.clone(),
            source,
        };

        let pair = native_pty_system()
            .openpty(pty_size(self.cols, self.rows))
            .context("failed to open pty")
            .map_err(launch_err)?;

        let mut command = CommandBuilder::new(&spec.program);
        command.args(spec.argv.iter().skip(1));
        command.env_clear();
        for (key, value) in &spec.env {
            command.env(key, value);
        }
        command.cwd(&spec.cwd);

        let child = pair
            .slave
            .spawn_command(command)
            .context("failed to spawn command")
            .map_err(launch_err)?;
        // Only the child keeps the slave open, so the reader sees EOF at exit.
        drop(pair.slave);

        let pid = child.process_id();
        let streams = pair
            .master
            .try_clone_reader()
            .and_then(|reader| Ok((reader, pair.master.take_writer()?)));
        let (reader, writer) = match streams {
            Ok(streams) => streams,
            Err(e) => {
                reap(child);
                return Err(launch_err(e.context("failed to attach pty streams")));
            }
        };
        let mut killer = child.clone_killer();

        let running = Arc::new(AtomicBool::new(true));
        let (tx, events) = mpsc::unbounded_channel();
        let (drained_tx, drained_rx) = std_mpsc::channel::<()>();

        // The child is handed over only once the waiter exists, so a failed
        // spawn still leaves it here to be reaped.
        let (child_tx, child_rx) = std_mpsc::channel::<BoxedChild>();
        let waiter = {
            let running = Arc::clone(&running);
            let tx = tx.clone();
            std::thread::Builder::new()
                .name(format!("pty-waiter-{}", pid.unwrap_or_default()))
                .spawn(move || {
                    let Ok(child) = child_rx.recv() else {
                        return;
                    };
                    wait_for_exit(child, pid, &running, &drained_rx, &tx);
                })
        };
        if let Err(e) = waiter {
            reap(child);
            return Err(launch_err(e.into()));
        }
        if let Err(std_mpsc::SendError(child)) = child_tx.send(child) {
            reap(child);
            return Err(launch_err(anyhow::anyhow!("exit waiter stopped early")));
        }

        // From here on the waiter owns the child: killing it is enough, the
        // waiter reaps.
        let spawned = std::thread::Builder::new()
            .name(format!("pty-reader-{}", pid.unwrap_or_default()))
            .spawn(move || {
                read_output(reader, &tx);
                let _ = drained_tx.send(());
            });
        if let Err(e) = spawned {
            let _ = killer.kill();
            return Err(launch_err(e.into()));
        }

        let (input, input_rx) = std_mpsc::channel::<Vec<u8>>();
        let spawned = std::thread::Builder::new()
            .name(format!("pty-writer-{}", pid.unwrap_or_default()))
            .spawn(move || write_input(writer, input_rx, pid));
        if let Err(e) = spawned {
            let _ = killer.kill();
            return Err(launch_err(e.into()));
        }

        debug!(?pid, program = %spec.program.display(), "launched");

        Ok(ProcessHandle {
            control: ProcessControl {
                pid,
                input,
                master: pair.master,
                killer,
                running,
                finish_requested: false,
            },
            events,
        })
    }
}

/// Kill and reap a child that never got its worker threads.
fn reap(mut child: BoxedChild) {
    let _ = child.kill();
    let _ = child.wait();
}

fn wait_for_exit(
    mut child: BoxedChild,
    pid: Option<u32>,
    running: &AtomicBool,
    drained: &std_mpsc::Receiver<()>,
    tx: &mpsc::UnboundedSender<ProcessEvent>,
) {
    let code = match child.wait() {
        Ok(status) => status.exit_code(),
        Err(e) => {
            warn!(?pid, error = %e, "wait on child failed");
            1
        }
    };
    running.store(false, Ordering::Release);
    let _ = drained.recv_timeout(OUTPUT_DRAIN_GRACE);
    debug!(?pid, code, "child exited");
    let _ = tx.send(ProcessEvent::Exited(code));
}

fn read_output(mut reader: Box<dyn Read + Send>, tx: &mpsc::UnboundedSender<ProcessEvent>) {
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        match reader.read(&mut buf) {
            // EIO once the slave side is gone.
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(ProcessEvent::Output(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
        }
    }
}

/// Drains queued input into the terminal until the control half is dropped
/// or the terminal stops accepting writes.
fn write_input(mut writer: Box<dyn Write + Send>, input: std_mpsc::Receiver<Vec<u8>>, pid: Option<u32>) {
    for chunk in input {
        if let Err(e) = writer.write_all(&chunk).and_then(|()| writer.flush()) {
            debug!(?pid, error = %e, "pty input closed");
            break;
        }
    }
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}
