//! Configuration files (cactus.toml, ~/.cactus/config.toml)
//!
//! Both the project file and the global file share one schema. Every field is
//! optional so that layers can be merged field by field.

use crate::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One configuration layer as read from disk
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    /// Native engine settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineSection>,

    /// Completion defaults
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion: Option<CompletionSection>,

    /// Device/licensing collaborator settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utility: Option<UtilitySection>,
}

/// `[engine]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct EngineSection {
    /// Library short name ("cactus") or path to the shared object
    #[serde(skip_serializing_if = "Option::is_none")]
    pub library: Option<String>,

    /// Extra directories searched before the platform defaults
    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub search_paths: Vec<PathBuf>,

    /// Model context size in tokens (default: 2048)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_size: Option<u32>,
}

/// `[completion]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct CompletionSection {
    /// Response buffer capacity in bytes (default: 1024)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buffer_size: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Stop sequences
    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

/// `[utility]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct UtilitySection {
    /// Library short name ("cactus_util") or path to the shared object
    #[serde(skip_serializing_if = "Option::is_none")]
    pub library: Option<String>,

    /// Symbol used to release strings returned by the collaborator
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_symbol: Option<String>,

    /// Directory the collaborator persists device identity under
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_directory: Option<PathBuf>,
}

impl ConfigFile {
    /// Load a configuration layer from a file
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::IoError(e)
            }
        })?;

        Self::parse(&content, path)
    }

    /// Parse a configuration layer; `origin` is only used for error messages
    pub fn parse(content: &str, origin: &Path) -> ConfigResult<Self> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::TomlParseError {
            file: origin.to_path_buf(),
            error: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate value ranges
    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(engine) = &self.engine {
            if let Some(library) = &engine.library {
                require_non_empty("engine.library", library)?;
            }
            if engine.context_size == Some(0) {
                return Err(invalid("engine.context_size", "must be greater than 0"));
            }
        }

        if let Some(completion) = &self.completion {
            if completion.buffer_size == Some(0) {
                return Err(invalid("completion.buffer_size", "must be greater than 0"));
            }
            if let Some(temperature) = completion.temperature {
                if !(temperature.is_finite() && temperature >= 0.0) {
                    return Err(invalid(
                        "completion.temperature",
                        &format!("must be a non-negative number, got {}", temperature),
                    ));
                }
            }
            if let Some(top_p) = completion.top_p {
                if !(top_p > 0.0 && top_p <= 1.0) {
                    return Err(invalid(
                        "completion.top_p",
                        &format!("must be in (0, 1], got {}", top_p),
                    ));
                }
            }
        }

        if let Some(utility) = &self.utility {
            if let Some(library) = &utility.library {
                require_non_empty("utility.library", library)?;
            }
            if let Some(symbol) = &utility.release_symbol {
                require_non_empty("utility.release_symbol", symbol)?;
            }
        }

        Ok(())
    }

    /// Merge another layer into this one
    /// Other layer takes precedence for every field it sets
    pub fn merge(&mut self, other: &ConfigFile) {
        if let Some(theirs) = &other.engine {
            let ours = self.engine.get_or_insert_with(Default::default);
            if theirs.library.is_some() {
                ours.library = theirs.library.clone();
            }
            if !theirs.search_paths.is_empty() {
                ours.search_paths = theirs.search_paths.clone();
            }
            ours.context_size = theirs.context_size.or(ours.context_size);
        }

        if let Some(theirs) = &other.completion {
            let ours = self.completion.get_or_insert_with(Default::default);
            ours.buffer_size = theirs.buffer_size.or(ours.buffer_size);
            ours.temperature = theirs.temperature.or(ours.temperature);
            ours.top_k = theirs.top_k.or(ours.top_k);
            ours.top_p = theirs.top_p.or(ours.top_p);
            ours.max_tokens = theirs.max_tokens.or(ours.max_tokens);
            if !theirs.stop.is_empty() {
                ours.stop = theirs.stop.clone();
            }
        }

        if let Some(theirs) = &other.utility {
            let ours = self.utility.get_or_insert_with(Default::default);
            if theirs.library.is_some() {
                ours.library = theirs.library.clone();
            }
            if theirs.release_symbol.is_some() {
                ours.release_symbol = theirs.release_symbol.clone();
            }
            if theirs.data_directory.is_some() {
                ours.data_directory = theirs.data_directory.clone();
            }
        }
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn require_non_empty(field: &str, value: &str) -> ConfigResult<()> {
    if value.trim().is_empty() {
        return Err(invalid(field, "must not be empty"));
    }
    Ok(())
}
