//! Fleetdeck Common Library
//!
//! Shared types, probing, and caching infrastructure for the Fleetdeck daemon.

pub mod cache;
pub mod error;
pub mod probe;
pub mod runner;
pub mod types;

// Re-export commonly used types
pub use cache::TtlCache;
pub use error::{Error, Result};
pub use probe::Prober;
pub use runner::{CmdOutput, CommandRunner, SystemRunner};
pub use types::*;

/// Fleetdeck version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".fleetdeck")
}

fn home_dir() -> Option<std::path::PathBuf> {
    std::env::var_os("HOME").map(std::path::PathBuf::from)
}
