//! Configuration Loader
//!
//! Handles loading and merging configuration from multiple sources with proper precedence.

use crate::file::ConfigFile;
use crate::{
    ConfigError, ConfigResult, DEFAULT_BUFFER_SIZE, DEFAULT_CONTEXT_SIZE, DEFAULT_ENGINE_LIBRARY,
    DEFAULT_RELEASE_SYMBOL, DEFAULT_UTILITY_LIBRARY,
};
use std::env;
use std::path::{Path, PathBuf};

/// Project configuration file name
pub const PROJECT_CONFIG_FILE: &str = "cactus.toml";

/// Configuration loader
///
/// Loads configuration from multiple sources and merges them with proper precedence:
/// 1. Global config (~/.cactus/config.toml) - lowest priority
/// 2. Project config (./cactus.toml) - overrides global
/// 3. Environment variables (CACTUS_*) - overrides project
/// 4. CLI flags - highest priority (handled by caller)
pub struct ConfigLoader {
    /// Cached global config path
    global_config_path: Option<PathBuf>,
}

/// Merged configuration result
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// All layers merged
    pub merged: ConfigFile,

    /// Directory where cactus.toml was found
    pub project_root: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self {
            global_config_path: None,
        }
    }

    /// Use an explicit global config path instead of ~/.cactus/config.toml
    pub fn with_global_config_path(path: PathBuf) -> Self {
        Self {
            global_config_path: Some(path),
        }
    }

    /// Load configuration starting from the given directory
    ///
    /// Walks up the directory tree to find cactus.toml, then merges it over
    /// the global config and applies environment overrides.
    pub fn load_from_directory(&mut self, start_dir: &Path) -> ConfigResult<Config> {
        let (project_root, project) = self.find_project_config(start_dir)?;
        self.assemble(project, project_root)
    }

    /// Load configuration from a specific project config file
    pub fn load_from_file(&mut self, config_path: &Path) -> ConfigResult<Config> {
        let project = ConfigFile::load_from_file(config_path)?;
        let project_root = config_path.parent().map(|p| p.to_path_buf());
        self.assemble(project, project_root)
    }

    fn assemble(
        &mut self,
        project: ConfigFile,
        project_root: Option<PathBuf>,
    ) -> ConfigResult<Config> {
        let mut merged = self.load_global_config()?;
        merged.merge(&project);
        apply_env_overrides(&mut merged)?;
        merged.validate()?;

        Ok(Config {
            merged,
            project_root,
        })
    }

    /// Find project configuration by walking up directory tree
    fn find_project_config(&self, start_dir: &Path) -> ConfigResult<(Option<PathBuf>, ConfigFile)> {
        let mut current = start_dir.to_path_buf();

        loop {
            let config_path = current.join(PROJECT_CONFIG_FILE);

            if config_path.exists() {
                let project = ConfigFile::load_from_file(&config_path)?;
                return Ok((Some(current), project));
            }

            match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => return Ok((None, ConfigFile::default())),
            }
        }
    }

    /// Load global configuration; a missing file or home directory yields defaults
    fn load_global_config(&mut self) -> ConfigResult<ConfigFile> {
        if self.global_config_path.is_none() {
            match Self::global_config_dir() {
                Ok(dir) => self.global_config_path = Some(dir.join("config.toml")),
                Err(ConfigError::HomeNotFound) => return Ok(ConfigFile::default()),
                Err(e) => return Err(e),
            }
        }

        match &self.global_config_path {
            Some(path) if path.exists() => ConfigFile::load_from_file(path),
            _ => Ok(ConfigFile::default()),
        }
    }

    /// Get the global configuration directory (~/.cactus)
    pub fn global_config_dir() -> ConfigResult<PathBuf> {
        let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
        Ok(home.join(".cactus"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply environment variable overrides
///
/// Recognized: CACTUS_LIBRARY, CACTUS_UTIL_LIBRARY, CACTUS_CONTEXT_SIZE,
/// CACTUS_BUFFER_SIZE, CACTUS_DATA_DIR
fn apply_env_overrides(config: &mut ConfigFile) -> ConfigResult<()> {
    if let Ok(library) = env::var("CACTUS_LIBRARY") {
        config.engine.get_or_insert_with(Default::default).library = Some(library);
    }

    if let Ok(raw) = env::var("CACTUS_CONTEXT_SIZE") {
        let size = parse_env_number::<u32>("CACTUS_CONTEXT_SIZE", &raw)?;
        config.engine.get_or_insert_with(Default::default).context_size = Some(size);
    }

    if let Ok(raw) = env::var("CACTUS_BUFFER_SIZE") {
        let size = parse_env_number::<usize>("CACTUS_BUFFER_SIZE", &raw)?;
        config.completion.get_or_insert_with(Default::default).buffer_size = Some(size);
    }

    if let Ok(library) = env::var("CACTUS_UTIL_LIBRARY") {
        config.utility.get_or_insert_with(Default::default).library = Some(library);
    }

    if let Ok(dir) = env::var("CACTUS_DATA_DIR") {
        config.utility.get_or_insert_with(Default::default).data_directory =
            Some(PathBuf::from(dir));
    }

    Ok(())
}

fn parse_env_number<T: std::str::FromStr>(name: &str, raw: &str) -> ConfigResult<T> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        field: name.to_string(),
        reason: format!("expected an unsigned integer, got '{}'", raw),
    })
}

impl Config {
    /// Engine library name or path
    pub fn engine_library(&self) -> &str {
        self.merged
            .engine
            .as_ref()
            .and_then(|e| e.library.as_deref())
            .unwrap_or(DEFAULT_ENGINE_LIBRARY)
    }

    /// Extra library search paths
    pub fn search_paths(&self) -> &[PathBuf] {
        self.merged
            .engine
            .as_ref()
            .map(|e| e.search_paths.as_slice())
            .unwrap_or(&[])
    }

    pub fn context_size(&self) -> u32 {
        self.merged
            .engine
            .as_ref()
            .and_then(|e| e.context_size)
            .unwrap_or(DEFAULT_CONTEXT_SIZE)
    }

    pub fn buffer_size(&self) -> usize {
        self.completion_field(|c| c.buffer_size)
            .unwrap_or(DEFAULT_BUFFER_SIZE)
    }

    pub fn temperature(&self) -> f64 {
        self.completion_field(|c| c.temperature).unwrap_or(0.8)
    }

    pub fn top_k(&self) -> u32 {
        self.completion_field(|c| c.top_k).unwrap_or(40)
    }

    pub fn top_p(&self) -> f64 {
        self.completion_field(|c| c.top_p).unwrap_or(0.95)
    }

    pub fn max_tokens(&self) -> u32 {
        self.completion_field(|c| c.max_tokens).unwrap_or(1024)
    }

    pub fn stop(&self) -> &[String] {
        self.merged
            .completion
            .as_ref()
            .map(|c| c.stop.as_slice())
            .unwrap_or(&[])
    }

    /// Utility collaborator library name or path
    pub fn utility_library(&self) -> &str {
        self.merged
            .utility
            .as_ref()
            .and_then(|u| u.library.as_deref())
            .unwrap_or(DEFAULT_UTILITY_LIBRARY)
    }

    pub fn release_symbol(&self) -> &str {
        self.merged
            .utility
            .as_ref()
            .and_then(|u| u.release_symbol.as_deref())
            .unwrap_or(DEFAULT_RELEASE_SYMBOL)
    }

    /// Data directory, if configured. There is no implicit default.
    pub fn data_directory(&self) -> Option<&Path> {
        self.merged
            .utility
            .as_ref()
            .and_then(|u| u.data_directory.as_deref())
    }

    pub fn project_root(&self) -> Option<&Path> {
        self.project_root.as_deref()
    }

    fn completion_field<T>(
        &self,
        get: impl Fn(&crate::file::CompletionSection) -> Option<T>,
    ) -> Option<T> {
        self.merged.completion.as_ref().and_then(get)
    }
}
