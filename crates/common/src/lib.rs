//! Meshgate Common Library
//!
//! Shared types, persistence handle, key codec and the secure channel used by
//! the coordinator and its tools.

pub mod crypto;
pub mod db;
pub mod error;
pub mod keys;
pub mod types;

// Re-export commonly used types
pub use db::Database;
pub use error::{Error, ErrorKind, KeyRejection, Result};
pub use keys::{DiscoPublic, KeyKind, MachinePrivate, MachinePublic, NodePublic};
pub use types::*;

/// Meshgate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".meshgate")
}

/// Default database path
pub fn default_db_path() -> std::path::PathBuf {
    default_store_path().join("state.db")
}

/// Default configuration file path
pub fn default_config_path() -> std::path::PathBuf {
    default_store_path().join("config.toml")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
