//! Session orchestration for a QEMU virtual machine and its console bridges.
//!
//! ```text
//!                    Service
//!        ┌──────────────┼───────────────┐
//!    AppPaths        Registry ◄──── KeepAlive (wake/network lock pair)
//!    Config     ┌───────┼─────────┐
//!           [M] QEMU  [B0..B3] socat ──► <runtime>/.qemu0..3 ◄── QEMU serial
//!               │ pty + alacritty_terminal per session
//!               ▼
//!         Notification ──► dispatcher ──► SessionObserver / Indicator
//! ```
//!
//! Everything is driven from one tokio runtime. See [`service::Service`] for
//! the entry point.

pub mod config;
pub mod error;
pub mod keep_alive;
pub mod logging;
pub mod paths;
pub mod pty;
pub mod registry;
pub mod service;
pub mod session;
pub mod state_machine;
pub mod terminal;
pub mod vm;

pub use error::{Error, Result};
