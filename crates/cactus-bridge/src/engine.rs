//! Opaque handle contract with the inference engine
//!
//! [`EngineApi`] is the table of engine entry points. It comes either from a
//! shared library ([`EngineApi::load`]) or from function pointers the host
//! already has ([`EngineApi::from_raw_parts`]), e.g. a statically linked
//! engine or a test double.

use crate::loader::{required_symbol, LibraryLoader, LoadError};
use crate::sys::{
    CactusCompleteFn, CactusDestroyFn, CactusInitFn, TokenCallbackFn, SYM_COMPLETE, SYM_DESTROY,
    SYM_INIT,
};
use libloading::Library;
use std::ffi::{c_char, c_int, c_void, CStr};
use std::ptr::NonNull;
use std::sync::Arc;

/// Engine entry points
///
/// Cloning is cheap. A loaded library stays open while any clone (or any
/// model created through one) is alive.
#[derive(Clone)]
pub struct EngineApi {
    init: CactusInitFn,
    complete: CactusCompleteFn,
    destroy: CactusDestroyFn,
    library: Option<Arc<Library>>,
}

impl EngineApi {
    /// Build the table from function pointers
    ///
    /// # Safety
    ///
    /// Each pointer must implement the matching engine contract and stay
    /// callable for as long as the returned table or any model created from
    /// it exists.
    pub unsafe fn from_raw_parts(
        init: CactusInitFn,
        complete: CactusCompleteFn,
        destroy: CactusDestroyFn,
    ) -> Self {
        Self {
            init,
            complete,
            destroy,
            library: None,
        }
    }

    /// Load the engine library and extract all entry points up front
    pub fn load(loader: &mut LibraryLoader, name: &str) -> Result<Self, LoadError> {
        let library = loader.load(name)?;

        let (init, complete, destroy) = unsafe {
            (
                required_symbol::<CactusInitFn>(&library, name, SYM_INIT)?,
                required_symbol::<CactusCompleteFn>(&library, name, SYM_COMPLETE)?,
                required_symbol::<CactusDestroyFn>(&library, name, SYM_DESTROY)?,
            )
        };

        tracing::debug!(library = %name, "Resolved engine entry points");

        Ok(Self {
            init,
            complete,
            destroy,
            library: Some(library),
        })
    }

    /// `cactus_init`; `None` when the engine reports failure with a null handle
    pub(crate) fn init(&self, model_path: &CStr, context_size: usize) -> Option<RawModel> {
        let handle = unsafe { (self.init)(model_path.as_ptr(), context_size) };
        NonNull::new(handle).map(RawModel)
    }

    /// `cactus_complete`
    ///
    /// # Safety
    ///
    /// All text pointers must be NUL-terminated (or null where nullable) and
    /// outlive the call; `response` must be writable for `capacity` bytes;
    /// `user_data` must be what `callback` expects.
    #[allow(clippy::too_many_arguments)]
    pub(crate) unsafe fn complete(
        &self,
        model: &mut RawModel,
        messages: *const c_char,
        response: *mut c_char,
        capacity: usize,
        options: *const c_char,
        tools: *const c_char,
        callback: Option<TokenCallbackFn>,
        user_data: *mut c_void,
    ) -> c_int {
        (self.complete)(
            model.as_ptr(),
            messages,
            response,
            capacity,
            options,
            tools,
            callback,
            user_data,
        )
    }

    /// `cactus_destroy`
    ///
    /// # Safety
    ///
    /// `model` must not be passed to the engine again.
    pub(crate) unsafe fn destroy(&self, model: &mut RawModel) {
        (self.destroy)(model.as_ptr())
    }

    /// Whether the entry points come from a library this table keeps open
    pub fn is_loaded_library(&self) -> bool {
        self.library.is_some()
    }
}

impl std::fmt::Debug for EngineApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineApi")
            .field("loaded_library", &self.library.is_some())
            .finish_non_exhaustive()
    }
}

/// Non-null engine state pointer
///
/// Only the engine dereferences it. Not `Clone`: exactly one owner exists
/// between create and destroy.
#[derive(Debug)]
pub struct RawModel(NonNull<c_void>);

// The engine keeps no thread-local state per model; a handle may move between
// threads as long as only one thread uses it at a time.
unsafe impl Send for RawModel {}

impl RawModel {
    fn as_ptr(&self) -> *mut c_void {
        self.0.as_ptr()
    }
}
