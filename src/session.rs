//! One supervised child process and its terminal binding.
//!
//! A session is created by the registry, never removed, and moves once from
//! `Running` to `Finished`. All of its output flows through a single pump
//! task:
//!
//! ```text
//! ProcessEvent::Output ──► Emulator::feed ──► Notification{TitleChanged | Bell | ...}
//!                                │                        then TextChanged
//!                                └─ Reply ──► written back to the process
//! ProcessEvent::Exited ──► lifecycle ──► Notification{Finished} (once)
//!                   └─ bridge, not asked to finish ──► relaunch same spec
//! ```
//!
//! A bridge's relay exits whenever its console socket goes away. The session
//! relaunches it after [`RELAUNCH_INTERVAL`] and stays `Running`; only a
//! requested finish (or a failed relaunch) ends a bridge session.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use statig::blocking::{IntoStateMachineExt, StateMachine};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::TerminalConfig;
use crate::error::{Error, Result};
use crate::pty::{Launcher, ProcessControl, ProcessEvent};
use crate::state_machine::session_sm::{LifecycleEvent, SessionLifecycle};
use crate::terminal::{EngineEvent, Emulator};
use crate::vm::LaunchSpec;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Pause before a bridge relay that lost its console is started again.
pub const RELAUNCH_INTERVAL: Duration = Duration::from_millis(100);

/// Process-unique session identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Machine,
    /// Bridge for the console with this index.
    Bridge(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,
    /// `exit_code` is `None` when the finish was requested before the OS
    /// reported a status.
    Finished { exit_code: Option<u32> },
}

/// What happened to a session, as seen by observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    TitleChanged(String),
    TextChanged,
    Bell,
    ClipboardText(String),
    ColorsChanged,
    Finished,
}

/// A session event on its way to the registry dispatcher.
#[derive(Debug)]
pub struct Notification {
    pub session: Arc<Session>,
    pub event: SessionEvent,
}

struct Inner {
    lifecycle: StateMachine<SessionLifecycle>,
    process: ProcessControl,
    finished_at: Option<DateTime<Utc>>,
}

pub struct Session {
    id: SessionId,
    name: String,
    kind: SessionKind,
    spec: LaunchSpec,
    started_at: DateTime<Utc>,
    inner: Mutex<Inner>,
    emulator: Mutex<Emulator>,
    launcher: Arc<dyn Launcher>,
    notify: mpsc::UnboundedSender<Notification>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("pid", &self.pid())
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    /// Wrap a launched process. Nothing is delivered until
    /// [`Session::spawn_pump`] runs.
    pub(crate) fn new(
        name: String,
        kind: SessionKind,
        spec: LaunchSpec,
        control: ProcessControl,
        launcher: Arc<dyn Launcher>,
        terminal: &TerminalConfig,
        notify: mpsc::UnboundedSender<Notification>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: SessionId::next(),
            inner: Mutex::new(Inner {
                lifecycle: SessionLifecycle::new(name.clone()).state_machine(),
                process: control,
                finished_at: None,
            }),
            emulator: Mutex::new(Emulator::new(
                terminal.columns as usize,
                terminal.rows as usize,
                terminal.scrollback,
            )),
            name,
            kind,
            spec,
            started_at: Utc::now(),
            launcher,
            notify,
        })
    }

    /// Start consuming process events on `runtime`.
    pub(crate) fn spawn_pump(
        self: &Arc<Self>,
        events: mpsc::UnboundedReceiver<ProcessEvent>,
        runtime: &Handle,
    ) {
        runtime.spawn(pump(Arc::clone(self), events));
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn spec(&self) -> &LaunchSpec {
        &self.spec
    }

    /// Pid of the current process. Changes when a bridge is relaunched.
    pub fn pid(&self) -> Option<u32> {
        self.inner.lock().process.pid()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().finished_at
    }

    pub fn state(&self) -> SessionState {
        let inner = self.inner.lock();
        let state = inner.lifecycle.state();
        if SessionLifecycle::is_running(state) {
            SessionState::Running
        } else {
            SessionState::Finished {
                exit_code: SessionLifecycle::exit_code(state),
            }
        }
    }

    pub fn is_running(&self) -> bool {
        SessionLifecycle::is_running(self.inner.lock().lifecycle.state())
    }

    /// Send input to the process. Rejected once the session has finished.
    /// Only queues the bytes, so a process that stops reading never holds
    /// the session lock.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        let inner = self.inner.lock();
        if !SessionLifecycle::is_running(inner.lifecycle.state()) {
            return Err(Error::NotRunning);
        }
        inner.process.write(bytes)
    }

    /// Request termination and mark the session finished. Returns whether
    /// this call did the transition; later calls are no-ops.
    pub fn finish_if_running(self: &Arc<Self>) -> bool {
        {
            let mut inner = self.inner.lock();
            if !SessionLifecycle::is_running(inner.lifecycle.state()) {
                return false;
            }
            inner.process.request_finish();
            inner.lifecycle.handle(&LifecycleEvent::FinishRequested);
            inner.finished_at = Some(Utc::now());
        }
        self.emit(SessionEvent::Finished);
        true
    }

    /// Latest title set by the program, empty if none.
    pub fn title(&self) -> String {
        self.emulator.lock().title().to_string()
    }

    /// Visible screen contents.
    pub fn screen_text(&self) -> String {
        self.emulator.lock().screen_text()
    }

    pub fn resize(&self, columns: u16, rows: u16) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if !SessionLifecycle::is_running(inner.lifecycle.state()) {
                return Err(Error::NotRunning);
            }
            inner.process.resize(columns, rows)?;
        }
        self.emulator.lock().resize(columns as usize, rows as usize);
        Ok(())
    }

    fn emit(self: &Arc<Self>, event: SessionEvent) {
        let _ = self.notify.send(Notification {
            session: Arc::clone(self),
            event,
        });
    }

    fn handle_output(self: &Arc<Self>, bytes: &[u8]) {
        let engine_events = self.emulator.lock().feed(bytes);
        for event in engine_events {
            match event {
                EngineEvent::TitleChanged(title) => self.emit(SessionEvent::TitleChanged(title)),
                EngineEvent::Bell => self.emit(SessionEvent::Bell),
                EngineEvent::ClipboardText(text) => self.emit(SessionEvent::ClipboardText(text)),
                EngineEvent::ColorsChanged => self.emit(SessionEvent::ColorsChanged),
                EngineEvent::Reply(reply) => {
                    if let Err(e) = self.write(reply.as_bytes()) {
                        debug!(session = %self.name, error = %e, "dropped terminal reply");
                    }
                }
            }
        }
        self.emit(SessionEvent::TextChanged);
    }

    /// Start the bridge relay again after it exited on its own. Returns the
    /// new event stream, or `None` when the session should finish instead.
    async fn relaunch(self: &Arc<Self>, code: u32) -> Option<mpsc::UnboundedReceiver<ProcessEvent>> {
        if !matches!(self.kind, SessionKind::Bridge(_)) || !self.is_running() {
            return None;
        }
        debug!(session = %self.name, id = %self.id, exit_code = code, "bridge relay exited, relaunching");
        tokio::time::sleep(RELAUNCH_INTERVAL).await;

        let mut handle = match self.launcher.launch(&self.spec) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(session = %self.name, id = %self.id, error = %e, "bridge relaunch failed");
                return None;
            }
        };

        let (columns, rows) = {
            let emulator = self.emulator.lock();
            (emulator.columns() as u16, emulator.rows() as u16)
        };
        if let Err(e) = handle.control.resize(columns, rows) {
            debug!(session = %self.name, error = %e, "could not restore terminal size");
        }

        let mut inner = self.inner.lock();
        if !SessionLifecycle::is_running(inner.lifecycle.state()) {
            // Finished while the relay was down.
            handle.control.request_finish();
            return None;
        }
        inner.process = handle.control;
        Some(handle.events)
    }

    fn handle_exit(self: &Arc<Self>, code: u32) {
        let transitioned = {
            let mut inner = self.inner.lock();
            let was_running = SessionLifecycle::is_running(inner.lifecycle.state());
            inner.lifecycle.handle(&LifecycleEvent::Exited(code));
            if was_running {
                inner.finished_at = Some(Utc::now());
            }
            was_running
        };

        if transitioned {
            if code != 0 {
                warn!(session = %self.name, id = %self.id, exit_code = code, "session exited with failure");
            }
            self.emit(SessionEvent::Finished);
        }
    }
}

async fn pump(session: Arc<Session>, mut events: mpsc::UnboundedReceiver<ProcessEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ProcessEvent::Output(bytes) => session.handle_output(&bytes),
            ProcessEvent::Exited(code) => match session.relaunch(code).await {
                Some(next) => events = next,
                None => session.handle_exit(code),
            },
        }
    }
    debug!(session = %session.name, id = %session.id, "pump finished");
}
