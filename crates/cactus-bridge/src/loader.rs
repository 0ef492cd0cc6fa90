//! Dynamic library loading for the native collaborators
//!
//! Resolves short library names (`cactus` -> `libcactus.so`) against a list of
//! search paths and caches every library it opens. Symbol extraction lives with
//! the API tables that need it (`EngineApi`, `UtilityApi`).

use libloading::Library;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Library loading errors
#[derive(Debug, Error)]
pub enum LoadError {
    /// No candidate file exists in any search path
    #[error("library '{name}' not found in {searched} search path(s)")]
    LibraryNotFound { name: String, searched: usize },

    /// A required symbol is missing
    #[error("symbol '{symbol}' not found in library '{library}'")]
    SymbolNotFound { library: String, symbol: String },

    /// The dynamic loader rejected the file
    #[error("failed to load library '{path}': {source}")]
    LoadFailed {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },
}

/// Dynamic library loader with caching and platform-specific path resolution
///
/// # Safety
///
/// Loading a dynamic library runs its initialization code in this process.
/// Only load libraries you trust.
pub struct LibraryLoader {
    /// Cache of loaded libraries by resolved path
    loaded: HashMap<PathBuf, Arc<Library>>,
    /// Search paths, highest priority first
    search_paths: Vec<PathBuf>,
}

impl LibraryLoader {
    /// Create a loader with the platform default search paths
    pub fn new() -> Self {
        Self {
            loaded: HashMap::new(),
            search_paths: Self::default_search_paths(),
        }
    }

    /// Create a loader whose configured paths are searched before the platform defaults
    pub fn with_search_paths<I>(paths: I) -> Self
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let mut search_paths: Vec<PathBuf> = paths.into_iter().collect();
        search_paths.extend(Self::default_search_paths());
        Self {
            loaded: HashMap::new(),
            search_paths,
        }
    }

    /// Platform default search paths
    ///
    /// - Linux: /usr/lib, /usr/local/lib, /lib (plus lib64 variants)
    /// - macOS: /usr/lib, /usr/local/lib, /opt/homebrew/lib
    /// - Windows: System32
    /// - All platforms: the current directory first
    fn default_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        #[cfg(target_os = "linux")]
        {
            paths.push(PathBuf::from("/usr/lib"));
            paths.push(PathBuf::from("/usr/local/lib"));
            paths.push(PathBuf::from("/lib"));

            if cfg!(target_pointer_width = "64") {
                paths.push(PathBuf::from("/usr/lib64"));
                paths.push(PathBuf::from("/lib64"));
            }
        }

        #[cfg(target_os = "macos")]
        {
            paths.push(PathBuf::from("/usr/lib"));
            paths.push(PathBuf::from("/usr/local/lib"));
            paths.push(PathBuf::from("/opt/homebrew/lib"));
        }

        #[cfg(target_os = "windows")]
        {
            if let Ok(system_root) = std::env::var("SystemRoot") {
                paths.push(PathBuf::from(format!("{}\\System32", system_root)));
            }
        }

        if let Ok(cwd) = std::env::current_dir() {
            paths.insert(0, cwd);
        }

        paths
    }

    /// Candidate file names for a short library name on this platform
    pub fn candidate_file_names(name: &str) -> Vec<String> {
        let extensions: &[&str] = if cfg!(target_os = "windows") {
            &["dll"]
        } else if cfg!(target_os = "macos") {
            &["dylib", "so"]
        } else {
            &["so"]
        };

        let prefixes: &[&str] = if cfg!(target_os = "windows") {
            &["", "lib"]
        } else {
            &["lib", ""]
        };

        let mut names = Vec::with_capacity(extensions.len() * prefixes.len());
        for prefix in prefixes {
            for ext in extensions {
                names.push(format!("{}{}.{}", prefix, name, ext));
            }
        }
        names
    }

    /// Resolve a library name or path to an existing file
    ///
    /// A name containing a path separator is taken as a path and must exist.
    pub fn resolve_library_path(&self, name: &str) -> Option<PathBuf> {
        let path = Path::new(name);
        if path.components().count() > 1 || path.is_absolute() {
            return path.exists().then(|| path.to_path_buf());
        }

        let candidates = Self::candidate_file_names(name);
        self.search_paths.iter().find_map(|dir| {
            candidates
                .iter()
                .map(|file| dir.join(file))
                .find(|full| full.exists())
        })
    }

    /// Load a library by name or path, returning the cached instance when already open
    ///
    /// A short name that is not found in the search paths is handed to the
    /// system loader by file name, which covers directories only the platform
    /// knows about (an Android app's native library directory, `LD_LIBRARY_PATH`).
    pub fn load(&mut self, name: &str) -> Result<Arc<Library>, LoadError> {
        let Some(path) = self.resolve_library_path(name) else {
            return self.load_from_system(name);
        };

        if let Some(library) = self.loaded.get(&path) {
            return Ok(Arc::clone(library));
        }

        let library = unsafe { Library::new(&path) }.map_err(|source| LoadError::LoadFailed {
            path: path.clone(),
            source,
        })?;

        tracing::info!(library = %name, path = %path.display(), "Loaded native library");

        let library = Arc::new(library);
        self.loaded.insert(path, Arc::clone(&library));
        Ok(library)
    }

    fn load_from_system(&mut self, name: &str) -> Result<Arc<Library>, LoadError> {
        let searched = self.search_paths.len();
        let not_found = || LoadError::LibraryNotFound {
            name: name.to_string(),
            searched,
        };

        if Path::new(name).components().count() > 1 {
            return Err(not_found());
        }

        for file in Self::candidate_file_names(name) {
            let key = PathBuf::from(&file);
            if let Some(library) = self.loaded.get(&key) {
                return Ok(Arc::clone(library));
            }
            if let Ok(library) = unsafe { Library::new(&file) } {
                tracing::info!(
                    library = %name,
                    file = %file,
                    "Loaded native library via system search"
                );
                let library = Arc::new(library);
                self.loaded.insert(key, Arc::clone(&library));
                return Ok(library);
            }
        }

        Err(not_found())
    }

    /// Prepend a search path
    pub fn add_search_path(&mut self, path: PathBuf) {
        self.search_paths.insert(0, path);
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Number of distinct libraries opened so far
    pub fn loaded_count(&self) -> usize {
        self.loaded.len()
    }
}

impl Default for LibraryLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy a function pointer out of a loaded library
///
/// # Safety
///
/// `T` must be the exact function pointer type of the exported symbol, and the
/// returned pointer must not be called after `library` is dropped.
pub(crate) unsafe fn required_symbol<T: Copy>(
    library: &Library,
    library_name: &str,
    symbol: &str,
) -> Result<T, LoadError> {
    optional_symbol(library, symbol).ok_or_else(|| LoadError::SymbolNotFound {
        library: library_name.to_string(),
        symbol: symbol.to_string(),
    })
}

/// Like [`required_symbol`] but a missing export is `None`
///
/// # Safety
///
/// Same contract as [`required_symbol`].
pub(crate) unsafe fn optional_symbol<T: Copy>(library: &Library, symbol: &str) -> Option<T> {
    library.get::<T>(symbol.as_bytes()).ok().map(|s| *s)
}
