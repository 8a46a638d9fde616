//! Error taxonomy for the session supervision layer.
//!
//! Non-zero process exits are not errors here: they are recorded as the
//! session's terminal state. Bridge reconnects are not errors either.

use std::path::PathBuf;

use crate::vm::CONSOLE_COUNT;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An executable, a required directory or the config file could not be
    /// resolved. Fatal to the operation that needed it.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The OS failed to start the child process.
    #[error("failed to launch {}: {source:#}", .program.display())]
    Launch {
        program: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    /// Write or resize attempted after the process finished.
    #[error("session is not running")]
    NotRunning,

    #[error("console index {0} out of range (expected 0..{max})", max = CONSOLE_COUNT)]
    ConsoleOutOfRange(usize),

    /// The registry has been torn down and accepts no new sessions.
    #[error("service is terminating")]
    Terminating,

    #[error("failed to acquire keep-alive lock: {0:#}")]
    Lock(#[source] anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
