//! Device registration and identity, proxied to the utility collaborator
//!
//! The collaborator persists device identity under a data directory that must
//! be configured once per process with [`UtilityProxy::set_data_directory`].
//! Calls made before that are still forwarded (the collaborator decides what
//! an unset directory means) but log a warning.

use crate::loader::{optional_symbol, required_symbol, LibraryLoader, LoadError};
use crate::marshal::{MarshalContext, MarshalError, NativeString};
use crate::sys::{
    GetDeviceIdFn, RegisterAppFn, ReleaseStringFn, SetDataDirectoryFn, SYM_GET_DEVICE_ID,
    SYM_REGISTER_APP, SYM_SET_DATA_DIRECTORY,
};
use libloading::Library;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

static DATA_DIRECTORY: RwLock<Option<PathBuf>> = RwLock::new(None);

/// The data directory last handed to the collaborator, if any
pub fn data_directory() -> Option<PathBuf> {
    DATA_DIRECTORY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Utility collaborator entry points
#[derive(Clone)]
pub struct UtilityApi {
    register_app: RegisterAppFn,
    get_device_id: GetDeviceIdFn,
    set_data_directory: SetDataDirectoryFn,
    release: Option<ReleaseStringFn>,
    library: Option<Arc<Library>>,
}

impl UtilityApi {
    /// Build the table from function pointers
    ///
    /// # Safety
    ///
    /// Each pointer must implement the matching collaborator contract, and
    /// `release` must free exactly the strings `register_app` and
    /// `get_device_id` return.
    pub unsafe fn from_raw_parts(
        register_app: RegisterAppFn,
        get_device_id: GetDeviceIdFn,
        set_data_directory: SetDataDirectoryFn,
        release: Option<ReleaseStringFn>,
    ) -> Self {
        Self {
            register_app,
            get_device_id,
            set_data_directory,
            release,
            library: None,
        }
    }

    /// Load the collaborator library
    ///
    /// `release_symbol` is optional in the library; without it returned
    /// strings are leaked.
    pub fn load(
        loader: &mut LibraryLoader,
        name: &str,
        release_symbol: &str,
    ) -> Result<Self, LoadError> {
        let library = loader.load(name)?;

        let (register_app, get_device_id, set_data_directory, release) = unsafe {
            (
                required_symbol::<RegisterAppFn>(&library, name, SYM_REGISTER_APP)?,
                required_symbol::<GetDeviceIdFn>(&library, name, SYM_GET_DEVICE_ID)?,
                required_symbol::<SetDataDirectoryFn>(&library, name, SYM_SET_DATA_DIRECTORY)?,
                optional_symbol::<ReleaseStringFn>(&library, release_symbol),
            )
        };

        tracing::debug!(
            library = %name,
            releases_strings = release.is_some(),
            "Resolved utility entry points"
        );

        Ok(Self {
            register_app,
            get_device_id,
            set_data_directory,
            release,
            library: Some(library),
        })
    }

    pub fn releases_strings(&self) -> bool {
        self.release.is_some()
    }
}

impl std::fmt::Debug for UtilityApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UtilityApi")
            .field("releases_strings", &self.release.is_some())
            .field("loaded_library", &self.library.is_some())
            .finish_non_exhaustive()
    }
}

/// Forwards the three utility operations and owns their results
#[derive(Debug)]
pub struct UtilityProxy {
    api: UtilityApi,
    leak_warned: AtomicBool,
}

impl UtilityProxy {
    pub fn new(api: UtilityApi) -> Self {
        Self {
            api,
            leak_warned: AtomicBool::new(false),
        }
    }

    /// Register this app with an encrypted payload
    ///
    /// `Ok(None)` when the collaborator returns nothing, e.g. for an
    /// undecodable payload.
    pub fn register_app(&self, encrypted_payload: &str) -> Result<Option<String>, MarshalError> {
        let mut ctx = MarshalContext::new();
        let payload = ctx.text("encrypted_payload", encrypted_payload)?;
        self.warn_if_no_data_directory("register_app");

        let raw = unsafe { (self.api.register_app)(payload) };
        let result = self.take_result(raw);
        if result.is_none() {
            tracing::debug!("register_app returned no result");
        }
        Ok(result)
    }

    /// The persisted device id, if the collaborator has one
    pub fn get_device_id(&self) -> Option<String> {
        self.warn_if_no_data_directory("get_device_id");

        let raw = unsafe { (self.api.get_device_id)() };
        self.take_result(raw)
    }

    /// Point the collaborator at `path` and record it for this process
    pub fn set_data_directory(&self, path: &Path) -> Result<(), MarshalError> {
        let text = path
            .to_str()
            .ok_or(MarshalError::InvalidUtf8 { argument: "data_directory" })?;

        let mut ctx = MarshalContext::new();
        let c_path = ctx.text("data_directory", text)?;

        // hold the lock across the call so the record matches what the collaborator saw last
        let mut current = DATA_DIRECTORY.write().unwrap_or_else(PoisonError::into_inner);
        unsafe { (self.api.set_data_directory)(c_path) };
        *current = Some(path.to_path_buf());

        tracing::info!(path = %path.display(), "Data directory set");
        Ok(())
    }

    fn take_result(&self, raw: *mut std::ffi::c_char) -> Option<String> {
        let native = unsafe { NativeString::from_raw(raw, self.api.release) }?;
        if !native.is_released_on_drop() && !self.leak_warned.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                "Utility library exports no release function; returned strings are leaked"
            );
        }
        Some(native.into_string_lossy())
    }

    fn warn_if_no_data_directory(&self, operation: &'static str) {
        if data_directory().is_none() {
            tracing::warn!(operation, "Data directory not set; forwarding anyway");
        }
    }
}
