//! Registry, session and keep-alive behaviour against real PTY processes.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::runtime::Handle;

use common::{RecordingObserver, ScriptLauncher, Seen, eventually, facts};
use vmterm::config::TerminalConfig;
use vmterm::error::{Error, Result};
use vmterm::keep_alive::{KeepAlive, LockGuard, LockProvider, MachineStatus};
use vmterm::pty::{Launcher, ProcessHandle};
use vmterm::registry::{Registry, SessionObserver};
use vmterm::session::{SessionKind, SessionState};
use vmterm::vm::LaunchSpec;

fn registry(launcher: Arc<ScriptLauncher>) -> Arc<Registry> {
    Registry::new(launcher, TerminalConfig::default(), Handle::current())
}

fn attach(registry: &Registry) -> Arc<RecordingObserver> {
    let observer = RecordingObserver::new();
    let dyn_observer: Arc<dyn SessionObserver> = observer.clone();
    registry.attach(&dyn_observer);
    observer
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn input_reaches_the_process_and_output_the_screen() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = registry(ScriptLauncher::echo());
    let observer = attach(&registry);

    let session = registry.create_bridge_session(0, &facts(tmp.path())).unwrap();
    assert_eq!(session.state(), SessionState::Running);

    session.write(b"hello\r").unwrap();
    eventually("echoed line", || session.screen_text().contains("got:hello")).await;
    eventually("text notification", || observer.has(&session, &Seen::Text)).await;
}

#[tokio::test]
async fn title_bell_clipboard_and_colors_are_forwarded() {
    let tmp = tempfile::tempdir().unwrap();
    let script = concat!(
        "printf '\\033]0;alpine:~#\\007'; ",
        "printf '\\007'; ",
        "printf '\\033]52;c;Y29waWVk\\007'; ",
        "printf '\\033]4;1;rgb:12/34/56\\007'; ",
        "while read line; do :; done",
    );
    let registry = registry(ScriptLauncher::with_scripts(&[script]));
    let observer = attach(&registry);

    let session = registry.create_bridge_session(1, &facts(tmp.path())).unwrap();

    eventually("title", || observer.has(&session, &Seen::Title("alpine:~#".into()))).await;
    eventually("bell", || observer.has(&session, &Seen::Bell)).await;
    eventually("clipboard", || observer.has(&session, &Seen::Clipboard("copied".into()))).await;
    eventually("colors", || observer.has(&session, &Seen::Colors)).await;
    assert_eq!(session.title(), "alpine:~#");

    session.finish_if_running();
}

#[tokio::test]
async fn exit_status_is_recorded() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = registry(ScriptLauncher::with_scripts(&["exit 3"]));
    let observer = attach(&registry);

    let session = registry.create_machine_session(&facts(tmp.path())).unwrap();

    eventually("finish", || observer.has(&session, &Seen::Finished)).await;
    assert_eq!(session.state(), SessionState::Finished { exit_code: Some(3) });
    assert!(session.finished_at().is_some());
    assert!(matches!(session.write(b"x"), Err(Error::NotRunning)));
}

#[tokio::test]
async fn finish_is_idempotent_with_a_single_notification() {
    let tmp = tempfile::tempdir().unwrap();
    let launcher = ScriptLauncher::echo();
    let registry = registry(launcher.clone());
    let observer = attach(&registry);
    let session = registry.create_bridge_session(2, &facts(tmp.path())).unwrap();

    assert!(session.finish_if_running());
    assert!(!session.finish_if_running());
    assert!(matches!(session.state(), SessionState::Finished { .. }));
    assert!(matches!(session.write(b"late\r"), Err(Error::NotRunning)));
    assert!(matches!(session.resize(100, 30), Err(Error::NotRunning)));

    // The OS status arrives later and is kept without a second callback.
    eventually("late exit code", || {
        matches!(session.state(), SessionState::Finished { exit_code: Some(_) })
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(observer.count(&session, &Seen::Finished), 1);
    // A finished bridge is not relaunched.
    assert_eq!(launcher.launched.lock().len(), 1);
}

#[tokio::test]
async fn bridge_relay_is_relaunched_after_it_exits() {
    let tmp = tempfile::tempdir().unwrap();
    let launcher = ScriptLauncher::with_scripts(&["echo 'relay one'; exit 0"]);
    let registry = registry(launcher.clone());
    let observer = attach(&registry);
    let session = registry.create_bridge_session(0, &facts(tmp.path())).unwrap();

    eventually("relaunch", || launcher.launched.lock().len() == 2).await;
    assert_eq!(session.state(), SessionState::Running);
    assert_eq!(launcher.launched.lock()[1], *session.spec());

    // The relaunched relay is wired to the same terminal.
    eventually("write to relaunched relay", || session.write(b"again\r").is_ok()).await;
    eventually("echo", || session.screen_text().contains("got:again")).await;
    assert!(session.screen_text().contains("relay one"));
    assert!(!observer.has(&session, &Seen::Finished));
    assert_eq!(registry.len(), 1);

    registry.request_termination();
    eventually("finish", || observer.has(&session, &Seen::Finished)).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(launcher.launched.lock().len(), 2);
}

#[tokio::test]
async fn machine_exit_is_not_relaunched() {
    let tmp = tempfile::tempdir().unwrap();
    let launcher = ScriptLauncher::with_scripts(&["exit 0"]);
    let registry = registry(launcher.clone());
    let session = registry.create_machine_session(&facts(tmp.path())).unwrap();

    eventually("exit", || !session.is_running()).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(launcher.launched.lock().len(), 1);
    assert_eq!(session.state(), SessionState::Finished { exit_code: Some(0) });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn finish_is_not_held_up_by_a_process_that_stops_reading() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = registry(ScriptLauncher::with_scripts(&["stty raw -echo; exec sleep 1000"]));
    let session = registry.create_machine_session(&facts(tmp.path())).unwrap();

    let writer = Arc::clone(&session);
    let write = tokio::task::spawn_blocking(move || writer.write(&vec![b'x'; 1 << 20]));
    tokio::time::timeout(Duration::from_secs(5), write)
        .await
        .expect("write returned")
        .unwrap()
        .unwrap();

    let finisher = Arc::clone(&session);
    let finished = tokio::time::timeout(
        Duration::from_secs(5),
        tokio::task::spawn_blocking(move || finisher.finish_if_running()),
    )
    .await
    .expect("finish returned")
    .unwrap();
    assert!(finished);

    tokio::time::timeout(Duration::from_secs(5), async {
        registry.request_termination();
        registry.wait_for_shutdown().await;
    })
    .await
    .expect("teardown completed");
}

/// Hands out processes that have already exited by the time the registry
/// sees them.
struct SlowLauncher(Arc<ScriptLauncher>);

impl Launcher for SlowLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<ProcessHandle> {
        let handle = self.0.launch(spec)?;
        std::thread::sleep(Duration::from_millis(400));
        Ok(handle)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_that_exits_during_creation_is_still_registered() {
    let tmp = tempfile::tempdir().unwrap();
    for _ in 0..3 {
        let launcher = SlowLauncher(ScriptLauncher::with_scripts(&["exit 1"]));
        let registry = Registry::new(Arc::new(launcher), TerminalConfig::default(), Handle::current());
        let observer = attach(&registry);

        let session = registry.create_machine_session(&facts(tmp.path())).unwrap();
        assert_eq!(registry.len(), 1);

        eventually("finish", || observer.has(&session, &Seen::Finished)).await;
        assert_eq!(session.state(), SessionState::Finished { exit_code: Some(1) });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!registry.is_terminated());
        assert_eq!(registry.session(0).unwrap().id(), session.id());
    }
}

#[tokio::test]
async fn slots_follow_creation_order() {
    let tmp = tempfile::tempdir().unwrap();
    let facts = facts(tmp.path());
    let launcher = ScriptLauncher::echo();
    let registry = registry(launcher.clone());

    let machine = registry.create_machine_session(&facts).unwrap();
    let bridges: Vec<_> = (0..4)
        .map(|i| registry.create_bridge_session(i, &facts).unwrap())
        .collect();

    assert_eq!(registry.len(), 5);
    let sessions = registry.sessions();
    assert_eq!(sessions[0].id(), machine.id());
    assert_eq!(sessions[0].name(), "QEMU");
    assert_eq!(sessions[1].kind(), SessionKind::Bridge(0));
    assert_eq!(sessions[1].name(), "/dev/ttyS0");
    assert_eq!(sessions[4].name(), "/dev/ttyS3");
    assert_eq!(registry.slot_of(bridges[2].id()), Some(3));

    // Finishing does not remove or reorder.
    bridges[0].finish_if_running();
    assert_eq!(registry.session(1).unwrap().id(), bridges[0].id());
    assert_eq!(registry.len(), 5);

    // The launcher saw the built specs, not the test scripts.
    let launched = launcher.launched.lock();
    assert!(launched[0].argv.iter().any(|a| a == "-nographic"));
    assert_eq!(
        launched[1].argv[2],
        format!("UNIX-CONNECT:{}/.qemu0,interval=0.1,forever", tmp.path().display())
    );

    registry.request_termination();
}

#[tokio::test]
async fn out_of_range_bridge_is_refused() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = registry(ScriptLauncher::echo());
    assert!(matches!(
        registry.create_bridge_session(4, &facts(tmp.path())),
        Err(Error::ConsoleOutOfRange(4))
    ));
    assert!(registry.is_empty());
}

#[tokio::test]
async fn finished_sessions_are_replayed_to_a_late_observer_once() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = registry(ScriptLauncher::with_scripts(&["exit 0"]));
    let session = registry.create_machine_session(&facts(tmp.path())).unwrap();

    eventually("exit", || !session.is_running()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let first = attach(&registry);
    eventually("replayed finish", || first.has(&session, &Seen::Finished)).await;

    let second = attach(&registry);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(first.count(&session, &Seen::Finished), 1);
    assert_eq!(second.count(&session, &Seen::Finished), 0);
}

#[tokio::test]
async fn dropped_observer_is_treated_as_detached() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = registry(ScriptLauncher::echo());
    let session = registry.create_bridge_session(0, &facts(tmp.path())).unwrap();

    drop(attach(&registry));
    session.finish_if_running();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let observer = attach(&registry);
    eventually("queued finish", || observer.has(&session, &Seen::Finished)).await;
}

#[tokio::test]
async fn machine_status_follows_the_machine_session() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = registry(ScriptLauncher::echo());
    let facts = facts(tmp.path());
    let status = registry.status();

    registry.create_bridge_session(0, &facts).unwrap();
    assert_eq!(status.borrow().machine, MachineStatus::NotInitialized);

    let machine = registry.create_machine_session(&facts).unwrap();
    assert_eq!(status.borrow().machine, MachineStatus::Running);
    assert_eq!(status.borrow().sessions, 2);

    machine.finish_if_running();
    eventually("stopped indicator", || status.borrow().machine == MachineStatus::Stopped).await;
    assert_eq!(status.borrow().to_string(), "Virtual machine has stopped.");

    // All sessions finished is not a reason to tear down.
    registry.sessions()[0].finish_if_running();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!registry.is_terminated());
}

#[tokio::test]
async fn termination_finishes_everything_and_refuses_new_sessions() {
    let tmp = tempfile::tempdir().unwrap();
    let facts = facts(tmp.path());
    let registry = registry(ScriptLauncher::echo());
    let a = registry.create_machine_session(&facts).unwrap();
    let b = registry.create_bridge_session(0, &facts).unwrap();

    registry.request_termination();
    registry.request_termination();
    tokio::time::timeout(Duration::from_secs(5), registry.wait_for_shutdown())
        .await
        .expect("shutdown signalled");

    assert!(registry.wants_to_stop());
    assert!(!a.is_running());
    assert!(!b.is_running());
    assert!(matches!(
        registry.create_bridge_session(1, &facts),
        Err(Error::Terminating)
    ));
    assert_eq!(registry.len(), 2);
}

// ---------------------------------------------------------------------------
// Keep-alive
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Counters {
    acquired: AtomicUsize,
    released: AtomicUsize,
}

struct CountingGuard(Arc<Counters>);

impl LockGuard for CountingGuard {}

impl Drop for CountingGuard {
    fn drop(&mut self) {
        self.0.released.fetch_add(1, Ordering::SeqCst);
    }
}

struct CountingProvider {
    counters: Arc<Counters>,
    fail_network: bool,
}

impl CountingProvider {
    fn guard(&self) -> Box<dyn LockGuard> {
        self.counters.acquired.fetch_add(1, Ordering::SeqCst);
        Box::new(CountingGuard(self.counters.clone()))
    }
}

impl LockProvider for CountingProvider {
    fn acquire_wake(&self) -> Result<Box<dyn LockGuard>> {
        Ok(self.guard())
    }

    fn acquire_network(&self) -> Result<Box<dyn LockGuard>> {
        if self.fail_network {
            return Err(Error::Lock(anyhow::anyhow!("network lock refused")));
        }
        Ok(self.guard())
    }
}

fn keep_alive(registry: &Arc<Registry>, fail_network: bool) -> (KeepAlive, Arc<Counters>) {
    let counters = Arc::new(Counters::default());
    let provider = CountingProvider {
        counters: counters.clone(),
        fail_network,
    };
    (KeepAlive::new(registry.clone(), Box::new(provider)), counters)
}

#[tokio::test]
async fn disabling_with_no_sessions_tears_down_once() {
    let registry = registry(ScriptLauncher::echo());
    let (keep_alive, counters) = keep_alive(&registry, false);
    let indicator = keep_alive.indicator();
    let mut shutdown = registry.shutdown_signal();

    keep_alive.enable().unwrap();
    keep_alive.enable().unwrap();
    assert!(keep_alive.is_held());
    assert_eq!(counters.acquired.load(Ordering::SeqCst), 2);
    assert!(indicator.borrow().lock_held);
    assert_eq!(
        indicator.borrow().to_string(),
        "Virtual machine is not initialized. Wake lock held."
    );
    assert!(!registry.is_terminated());

    keep_alive.disable();
    assert_eq!(counters.released.load(Ordering::SeqCst), 2);
    assert!(registry.is_terminated());
    assert!(*shutdown.borrow_and_update());

    // A second disable does not tear down again or fail.
    keep_alive.disable();
    assert!(!shutdown.has_changed().unwrap());
}

#[tokio::test]
async fn disabling_with_sessions_keeps_running() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = registry(ScriptLauncher::echo());
    let (keep_alive, _) = keep_alive(&registry, false);
    let session = registry.create_bridge_session(0, &facts(tmp.path())).unwrap();

    keep_alive.enable().unwrap();
    keep_alive.disable();

    assert!(!registry.is_terminated());
    assert!(session.is_running());
    assert!(!keep_alive.indicator().borrow().lock_held);
    registry.request_termination();
}

#[tokio::test]
async fn failed_network_half_releases_the_wake_half() {
    let registry = registry(ScriptLauncher::echo());
    let (keep_alive, counters) = keep_alive(&registry, true);

    assert!(matches!(keep_alive.enable(), Err(Error::Lock(_))));
    assert!(!keep_alive.is_held());
    assert_eq!(counters.acquired.load(Ordering::SeqCst), 1);
    assert_eq!(counters.released.load(Ordering::SeqCst), 1);
    assert!(!registry.is_terminated());
}

#[tokio::test]
async fn release_does_not_tear_down() {
    let registry = registry(ScriptLauncher::echo());
    let (keep_alive, counters) = keep_alive(&registry, false);

    keep_alive.enable().unwrap();
    keep_alive.release();
    assert!(!keep_alive.is_held());
    assert_eq!(counters.released.load(Ordering::SeqCst), 2);
    assert!(!registry.is_terminated());
}
