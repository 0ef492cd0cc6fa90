//! Raw C signatures of the native collaborators
//!
//! The engine (`libcactus`) and the device/licensing collaborator
//! (`libcactus_util`) are external. Only their call contracts live here.

use std::ffi::{c_char, c_int, c_void};

/// Opaque engine state, `cactus_model_t` on the C side.
pub type CactusModel = *mut c_void;

/// Per-token callback the engine invokes synchronously during generation.
///
/// ```c
/// typedef void (*cactus_token_callback)(const char* token, uint32_t token_id, void* user_data);
/// ```
///
/// `token` is only valid for the duration of the invocation.
pub type TokenCallbackFn =
    unsafe extern "C" fn(token: *const c_char, token_id: u32, user_data: *mut c_void);

/// ```c
/// cactus_model_t cactus_init(const char* model_path, size_t context_size);
/// ```
///
/// Returns null when the model cannot be loaded.
pub type CactusInitFn =
    unsafe extern "C" fn(model_path: *const c_char, context_size: usize) -> CactusModel;

/// ```c
/// int cactus_complete(
///     cactus_model_t model,
///     const char*    messages_json,
///     char*          response_buffer,
///     size_t         buffer_size,
///     const char*    options_json,   /* nullable */
///     const char*    tools_json,     /* nullable */
///     cactus_token_callback callback, /* nullable */
///     void*          user_data       /* nullable */
/// );
/// ```
///
/// A positive result is the length of the full response; zero or negative is
/// an engine failure code.
pub type CactusCompleteFn = unsafe extern "C" fn(
    model: CactusModel,
    messages_json: *const c_char,
    response_buffer: *mut c_char,
    buffer_size: usize,
    options_json: *const c_char,
    tools_json: *const c_char,
    callback: Option<TokenCallbackFn>,
    user_data: *mut c_void,
) -> c_int;

/// ```c
/// void cactus_destroy(cactus_model_t model);
/// ```
pub type CactusDestroyFn = unsafe extern "C" fn(model: CactusModel);

/// ```c
/// char* register_app(const char* encrypted_payload);
/// ```
pub type RegisterAppFn = unsafe extern "C" fn(encrypted_payload: *const c_char) -> *mut c_char;

/// ```c
/// char* get_device_id(void);
/// ```
pub type GetDeviceIdFn = unsafe extern "C" fn() -> *mut c_char;

/// ```c
/// void set_android_data_directory(const char* data_directory);
/// ```
pub type SetDataDirectoryFn = unsafe extern "C" fn(data_directory: *const c_char);

/// Releases a string previously returned by the utility collaborator.
pub type ReleaseStringFn = unsafe extern "C" fn(s: *mut c_char);

pub const SYM_INIT: &str = "cactus_init";
pub const SYM_COMPLETE: &str = "cactus_complete";
pub const SYM_DESTROY: &str = "cactus_destroy";
pub const SYM_REGISTER_APP: &str = "register_app";
pub const SYM_GET_DEVICE_ID: &str = "get_device_id";
pub const SYM_SET_DATA_DIRECTORY: &str = "set_android_data_directory";
