//! Cactus bridge configuration
//!
//! Provides configuration for hosts that drive the native inference engine:
//! - Engine library location and model context size
//! - Completion defaults (buffer size, sampling options)
//! - Utility collaborator library and data directory
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded and merged in the following order (later overrides earlier):
//! 1. Global config (~/.cactus/config.toml)
//! 2. Project config (./cactus.toml, searched upwards)
//! 3. Environment variables (CACTUS_*)
//! 4. CLI flags (applied by the caller)
//!
//! # Example
//!
//! ```no_run
//! use cactus_config::ConfigLoader;
//! use std::path::Path;
//!
//! let mut loader = ConfigLoader::new();
//! let config = loader.load_from_directory(Path::new(".")).unwrap();
//! println!("engine library: {}", config.engine_library());
//! ```

pub mod file;
pub mod loader;

use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid TOML syntax in {file}: {error}")]
    TomlParseError {
        file: PathBuf,
        error: toml::de::Error,
    },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Home directory not found")]
    HomeNotFound,
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

pub use file::{CompletionSection, ConfigFile, EngineSection, UtilitySection};
pub use loader::{Config, ConfigLoader};

/// Default engine library short name
pub const DEFAULT_ENGINE_LIBRARY: &str = "cactus";
/// Default utility collaborator library short name
pub const DEFAULT_UTILITY_LIBRARY: &str = "cactus_util";
/// Default symbol the utility collaborator exports to release strings it returned
pub const DEFAULT_RELEASE_SYMBOL: &str = "cactus_free_string";
/// Default model context size, in tokens
pub const DEFAULT_CONTEXT_SIZE: u32 = 2048;
/// Default response buffer capacity, in bytes
pub const DEFAULT_BUFFER_SIZE: usize = 1024;
