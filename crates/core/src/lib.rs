//! RAPL Monitor Core Library
//!
//! Startup plumbing shared by the monitor processes
//!
//! Architecture:
//! - Settings are loaded once, repaired, and written by a single writer thread
//! - The bootstrap worker installs the binary, registers it for logon and
//!   hands off to the installed copy, reporting back over a channel
//! - A named instance lock keeps autostart from launching two monitors

mod atomic_file;
pub mod autostart;
pub mod bootstrap;
pub mod config;
pub mod elevation;
pub mod error;
pub mod geometry;
pub mod handoff;
pub mod installer;
pub mod instance_lock;
pub mod session;
pub mod settings;
pub mod settings_writer;
pub mod worker;

pub use bootstrap::{BootstrapReport, BootstrapState, Capabilities, Orchestrator};
pub use config::AppConfig;
pub use error::FailureReason;
pub use session::Session;
