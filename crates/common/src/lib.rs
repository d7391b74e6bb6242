//! DeviceFarm Common Library
//!
//! Shared types, errors, and the document store for the DeviceFarm
//! device pool.

pub mod db;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use db::{Database, Filter, Set};
pub use error::{Error, Result};
pub use types::*;

/// DeviceFarm version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".devicefarm")
}

/// Default configuration file path
pub fn default_config_path() -> std::path::PathBuf {
    default_store_path().join("config.toml")
}

/// Default database path
pub fn default_db_path() -> std::path::PathBuf {
    default_store_path().join("farm.db")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
