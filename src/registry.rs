//! Session registry: the ordered, append-only set of supervised sessions.
//!
//! ```text
//!  create_*_session ──► build spec ──► Launcher ──► Session::new ──► push (slot = index) ──► pump
//!
//!  session pumps ──Notification──► [dispatcher task] ──► observer (Weak, optional)
//!                                          │                └─ absent: queue Finished
//!                                          └──► refresh_status ──► watch<Indicator>
//!                                                     │ empty and no lock
//!                                                     ▼
//!                                                 teardown (once) ──► watch<bool> shutdown
//! ```
//!
//! Sessions are never removed, so a slot index stays valid for the life of
//! the registry. Observers are held weakly and can come and go; finished
//! sessions that nobody saw are replayed to the next observer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::config::TerminalConfig;
use crate::error::{Error, Result};
use crate::keep_alive::{Indicator, MachineStatus};
use crate::pty::{Launcher, ProcessHandle};
use crate::session::{Notification, Session, SessionEvent, SessionId, SessionKind};
use crate::vm::{HostFacts, LaunchSpec, build_bridge, build_machine};

/// Receives session events. Every method defaults to a no-op.
///
/// Called from the registry's dispatcher task, one event at a time, in the
/// order each session produced them.
pub trait SessionObserver: Send + Sync {
    fn on_title_changed(&self, _session: &Arc<Session>, _title: &str) {}
    fn on_session_finished(&self, _session: &Arc<Session>) {}
    fn on_text_changed(&self, _session: &Arc<Session>) {}
    fn on_bell(&self, _session: &Arc<Session>) {}
    fn on_clipboard_text(&self, _session: &Arc<Session>, _text: &str) {}
    fn on_colors_changed(&self, _session: &Arc<Session>) {}
}

#[derive(Default)]
struct ObserverSlot {
    current: Option<Weak<dyn SessionObserver>>,
    /// Finished sessions no observer has seen yet.
    pending_finished: Vec<Arc<Session>>,
}

impl ObserverSlot {
    fn live(&self) -> Option<Arc<dyn SessionObserver>> {
        self.current.as_ref().and_then(Weak::upgrade)
    }
}

pub struct Registry {
    sessions: RwLock<Vec<Arc<Session>>>,
    observer: Mutex<ObserverSlot>,
    wants_to_stop: AtomicBool,
    terminated: AtomicBool,
    lock_held: AtomicBool,
    launcher: Arc<dyn Launcher>,
    terminal: TerminalConfig,
    runtime: Handle,
    notify_tx: mpsc::UnboundedSender<Notification>,
    status_tx: watch::Sender<Indicator>,
    shutdown_tx: watch::Sender<bool>,
}

impl Registry {
    /// Create an empty registry and start its dispatcher on `runtime`.
    pub fn new(launcher: Arc<dyn Launcher>, terminal: TerminalConfig, runtime: Handle) -> Arc<Self> {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            sessions: RwLock::new(Vec::new()),
            observer: Mutex::new(ObserverSlot::default()),
            wants_to_stop: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            lock_held: AtomicBool::new(false),
            launcher,
            terminal,
            runtime: runtime.clone(),
            notify_tx,
            status_tx: watch::Sender::new(Indicator::default()),
            shutdown_tx: watch::Sender::new(false),
        });
        runtime.spawn(dispatch(Arc::downgrade(&registry), notify_rx));
        registry
    }

    // -----------------------------------------------------------------------
    // Session creation
    // -----------------------------------------------------------------------

    pub fn create_machine_session(&self, facts: &HostFacts) -> Result<Arc<Session>> {
        let spec = build_machine(facts)?;
        self.create_session(facts.machine_name.clone(), SessionKind::Machine, spec)
    }

    pub fn create_bridge_session(&self, index: usize, facts: &HostFacts) -> Result<Arc<Session>> {
        let spec = build_bridge(index, facts)?;
        self.create_session(
            format!("/dev/ttyS{index}"),
            SessionKind::Bridge(index),
            spec,
        )
    }

    fn create_session(&self, name: String, kind: SessionKind, spec: LaunchSpec) -> Result<Arc<Session>> {
        if self.is_terminated() {
            return Err(Error::Terminating);
        }

        let ProcessHandle { control, events } = self.launcher.launch(&spec)?;
        let session = Session::new(
            name,
            kind,
            spec,
            control,
            Arc::clone(&self.launcher),
            &self.terminal,
            self.notify_tx.clone(),
        );

        // Appended before its pump starts, so the session's own events
        // always find it in the list.
        let slot = {
            let mut sessions = self.sessions.write();
            // Teardown reads the list after setting the flag, so checking
            // under the write lock means no session escapes it.
            if self.is_terminated() {
                drop(sessions);
                session.finish_if_running();
                return Err(Error::Terminating);
            }
            sessions.push(Arc::clone(&session));
            sessions.len() - 1
        };
        session.spawn_pump(events, &self.runtime);

        info!(
            slot,
            id = %session.id(),
            name = session.name(),
            pid = ?session.pid(),
            "session created"
        );
        self.refresh_status();
        Ok(session)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Snapshot of all sessions in creation order.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.read().clone()
    }

    pub fn session(&self, slot: usize) -> Option<Arc<Session>> {
        self.sessions.read().get(slot).cloned()
    }

    pub fn slot_of(&self, id: SessionId) -> Option<usize> {
        self.sessions.read().iter().position(|s| s.id() == id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn wants_to_stop(&self) -> bool {
        self.wants_to_stop.load(Ordering::Acquire)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    // -----------------------------------------------------------------------
    // Observer
    // -----------------------------------------------------------------------

    /// Attach `observer`, replacing any previous one. Finished sessions
    /// queued while nobody was attached are delivered right away.
    pub fn attach(&self, observer: &Arc<dyn SessionObserver>) {
        let pending = {
            let mut slot = self.observer.lock();
            slot.current = Some(Arc::downgrade(observer));
            std::mem::take(&mut slot.pending_finished)
        };
        debug!(replayed = pending.len(), "observer attached");
        for session in &pending {
            observer.on_session_finished(session);
        }
    }

    pub fn detach(&self) {
        self.observer.lock().current = None;
        debug!("observer detached");
    }

    fn deliver(&self, notification: Notification) {
        let Notification { session, event } = notification;
        let is_finished = event == SessionEvent::Finished;

        let observer = {
            let mut slot = self.observer.lock();
            let observer = slot.live();
            if observer.is_none() && is_finished {
                slot.pending_finished.push(Arc::clone(&session));
            }
            observer
        };

        if let Some(observer) = observer {
            match &event {
                SessionEvent::TitleChanged(title) => observer.on_title_changed(&session, title),
                SessionEvent::TextChanged => observer.on_text_changed(&session),
                SessionEvent::Bell => observer.on_bell(&session),
                SessionEvent::ClipboardText(text) => observer.on_clipboard_text(&session, text),
                SessionEvent::ColorsChanged => observer.on_colors_changed(&session),
                SessionEvent::Finished => observer.on_session_finished(&session),
            }
        }

        if is_finished {
            self.refresh_status();
        }
    }

    // -----------------------------------------------------------------------
    // Status and teardown
    // -----------------------------------------------------------------------

    pub(crate) fn set_lock_held(&self, held: bool) {
        self.lock_held.store(held, Ordering::Release);
    }

    /// Recompute and publish the indicator. An empty registry with no lock
    /// held has nothing to keep alive and is torn down instead.
    pub fn refresh_status(&self) {
        let lock_held = self.lock_held.load(Ordering::Acquire);
        let indicator = {
            let sessions = self.sessions.read();
            let machine = match sessions.iter().find(|s| s.kind() == SessionKind::Machine) {
                None => MachineStatus::NotInitialized,
                Some(s) if s.is_running() => MachineStatus::Running,
                Some(_) => MachineStatus::Stopped,
            };
            Indicator {
                machine,
                lock_held,
                sessions: sessions.len(),
            }
        };

        self.status_tx.send_if_modified(|current| {
            if *current == indicator {
                return false;
            }
            *current = indicator;
            true
        });

        if indicator.sessions == 0 && !lock_held {
            self.terminate();
        }
    }

    pub fn status(&self) -> watch::Receiver<Indicator> {
        self.status_tx.subscribe()
    }

    /// Stop everything. Idempotent, does not wait for processes to die.
    pub fn request_termination(&self) {
        self.wants_to_stop.store(true, Ordering::Release);
        self.terminate();
    }

    fn terminate(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        let sessions = self.sessions();
        info!(sessions = sessions.len(), "tearing down");
        for session in &sessions {
            session.finish_if_running();
        }
        self.shutdown_tx.send_replace(true);
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Resolve once teardown has run.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.shutdown_signal();
        let _ = rx.wait_for(|done| *done).await;
    }
}

async fn dispatch(registry: Weak<Registry>, mut rx: mpsc::UnboundedReceiver<Notification>) {
    while let Some(notification) = rx.recv().await {
        let Some(registry) = registry.upgrade() else {
            break;
        };
        registry.deliver(notification);
    }
    debug!("dispatcher stopped");
}
