//! Session lifecycle state machine.
//!
//! ```text
//! Running ──Exited(code)──────► Finished { exit_code: Some(code) }
//!    └─────FinishRequested────► Finished { exit_code: None }
//!                                   │ Exited(code): record late code
//!                                   ▼
//!                               (terminal)
//! ```

use statig::prelude::*;
use tracing::info;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The OS reported the child's exit status.
    Exited(u32),
    /// Termination was requested before any status was observed.
    FinishRequested,
}

// ---------------------------------------------------------------------------
// Shared storage
// ---------------------------------------------------------------------------

pub struct SessionLifecycle {
    /// Session name, for logs only.
    pub name: String,
}

impl SessionLifecycle {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn is_running(state: &State) -> bool {
        matches!(state, State::Running {})
    }

    pub fn exit_code(state: &State) -> Option<u32> {
        match state {
            State::Running {} => None,
            State::Finished { exit_code } => *exit_code,
        }
    }
}

// ---------------------------------------------------------------------------
// State machine implementation
// ---------------------------------------------------------------------------

#[state_machine(
    initial = "State::running()",
    state(derive(Debug, Clone, PartialEq, Eq))
)]
impl SessionLifecycle {
    #[state]
    fn running(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Exited(code) => {
                info!(session = %self.name, exit_code = code, "session exited");
                Transition(State::finished(Some(*code)))
            }
            LifecycleEvent::FinishRequested => {
                info!(session = %self.name, "session finished on request");
                Transition(State::finished(None))
            }
        }
    }

    /// Terminal. A status arriving after a requested finish is kept, but
    /// nothing transitions.
    #[state]
    fn finished(&mut self, exit_code: &mut Option<u32>, event: &LifecycleEvent) -> Outcome<State> {
        if let LifecycleEvent::Exited(code) = event {
            if exit_code.is_none() {
                *exit_code = Some(*code);
            }
        }
        Handled
    }
}
