//! Shared test doubles for the bridge integration tests
//!
//! - a mock engine written as `extern "C"` functions with the engine's exact
//!   signatures
//! - a mock utility collaborator that allocates its results with `CString`
//! - `FakeHost`, a `ManagedEnv` whose failures can be switched on
//!
//! Model counters belong to the thread that created the model and travel
//! with it, so a model destroyed on another thread still updates them. The
//! other counters are thread-local: tests running in parallel do not see
//! each other. Nothing inside the `extern "C"` functions can panic.

#![allow(dead_code)]

use cactus_bridge::host::{HostError, HostFault, ManagedEnv};
use cactus_bridge::sys::TokenCallbackFn;
use cactus_bridge::{ChatMessage, EngineApi, UtilityApi};
use std::cell::{Cell, RefCell};
use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Engine failure code returned for the prompt "fail"
pub const ENGINE_FAILURE: c_int = -3;

/// Entry point id `FakeHost` hands out and expects back
const FAKE_ENTRY: u32 = 0xC0FFEE;

#[derive(Default)]
struct ModelCounters {
    live: AtomicUsize,
    destroyed: AtomicUsize,
}

thread_local! {
    static MODEL_COUNTERS: Arc<ModelCounters> = Arc::new(ModelCounters::default());
    static LAST_TOKEN_COUNT: Cell<usize> = const { Cell::new(0) };
    static LAST_OPTIONS: RefCell<Option<String>> = const { RefCell::new(None) };
    static LAST_TOOLS: RefCell<Option<String>> = const { RefCell::new(None) };
    static UTIL_ALLOCATED: Cell<usize> = const { Cell::new(0) };
    static UTIL_RELEASED: Cell<usize> = const { Cell::new(0) };
    static UTIL_DATA_DIR: RefCell<Option<String>> = const { RefCell::new(None) };
}

struct MockModel {
    counters: Arc<ModelCounters>,
}

// ============================================================================
// Mock engine
// ============================================================================

/// What the mock engine generates for a conversation: the response document
/// and the tokens streamed while producing it
pub fn expected_generation(messages_json: &str) -> (String, Vec<String>) {
    let messages: Vec<ChatMessage> = serde_json::from_str(messages_json).unwrap_or_default();
    let prompt = messages.last().map(|m| m.content.as_str()).unwrap_or("");
    let reply = format!("Echo: {}", prompt);

    let mut tokens = Vec::new();
    for (i, word) in reply.split(' ').enumerate() {
        tokens.push(if i == 0 {
            word.to_string()
        } else {
            format!(" {}", word)
        });
    }

    let document = serde_json::json!({
        "success": true,
        "response": reply,
        "prefill_tokens": prompt.split_whitespace().count(),
        "decode_tokens": tokens.len(),
        "total_tokens": prompt.split_whitespace().count() + tokens.len(),
    })
    .to_string();

    (document, tokens)
}

unsafe fn optional(text: *const c_char) -> Option<String> {
    (!text.is_null()).then(|| CStr::from_ptr(text).to_string_lossy().into_owned())
}

pub unsafe extern "C" fn mock_init(model_path: *const c_char, context_size: usize) -> *mut c_void {
    let path = CStr::from_ptr(model_path).to_string_lossy();
    if path.contains("missing") {
        return ptr::null_mut();
    }
    if context_size == 0 {
        return ptr::null_mut();
    }
    let counters = MODEL_COUNTERS.with(Arc::clone);
    counters.live.fetch_add(1, Ordering::SeqCst);
    Box::into_raw(Box::new(MockModel { counters })).cast()
}

#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn mock_complete(
    model: *mut c_void,
    messages_json: *const c_char,
    response_buffer: *mut c_char,
    buffer_size: usize,
    options_json: *const c_char,
    tools_json: *const c_char,
    callback: Option<TokenCallbackFn>,
    user_data: *mut c_void,
) -> c_int {
    if model.is_null() {
        return ENGINE_FAILURE;
    }

    LAST_OPTIONS.with(|o| *o.borrow_mut() = optional(options_json));
    LAST_TOOLS.with(|t| *t.borrow_mut() = optional(tools_json));

    let messages = CStr::from_ptr(messages_json).to_string_lossy();
    if messages.contains("\"content\":\"fail\"") {
        return ENGINE_FAILURE;
    }

    let (document, tokens) = expected_generation(&messages);
    LAST_TOKEN_COUNT.with(|c| c.set(tokens.len()));

    if let Some(callback) = callback {
        for (i, token) in tokens.iter().enumerate() {
            let Ok(token) = CString::new(token.as_str()) else {
                continue;
            };
            callback(token.as_ptr(), (i + 1) as u32, user_data);
        }
    }

    let bytes = document.as_bytes();
    let n = bytes.len().min(buffer_size);
    ptr::copy_nonoverlapping(bytes.as_ptr(), response_buffer.cast::<u8>(), n);
    if n < buffer_size {
        *response_buffer.add(n) = 0;
    }

    bytes.len() as c_int
}

pub unsafe extern "C" fn mock_destroy(model: *mut c_void) {
    if model.is_null() {
        return;
    }
    let model = Box::from_raw(model.cast::<MockModel>());
    let _ = model
        .counters
        .live
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    model.counters.destroyed.fetch_add(1, Ordering::SeqCst);
}

pub fn mock_engine() -> EngineApi {
    unsafe { EngineApi::from_raw_parts(mock_init, mock_complete, mock_destroy) }
}

/// Models created on this thread and not yet destroyed, wherever they went
pub fn live_models() -> usize {
    MODEL_COUNTERS.with(|c| c.live.load(Ordering::SeqCst))
}

/// Destroy calls for models created on this thread
pub fn destroy_calls() -> usize {
    MODEL_COUNTERS.with(|c| c.destroyed.load(Ordering::SeqCst))
}

/// Tokens the mock engine produced in the last run on this thread
pub fn last_token_count() -> usize {
    LAST_TOKEN_COUNT.with(Cell::get)
}

pub fn last_options() -> Option<String> {
    LAST_OPTIONS.with(|o| o.borrow().clone())
}

pub fn last_tools() -> Option<String> {
    LAST_TOOLS.with(|t| t.borrow().clone())
}

pub fn user_messages(content: &str) -> String {
    cactus_bridge::payload::messages_json(&[ChatMessage::user(content)]).unwrap()
}

// ============================================================================
// Mock utility collaborator
// ============================================================================

fn allocate(text: String) -> *mut c_char {
    let Ok(text) = CString::new(text) else {
        return ptr::null_mut();
    };
    UTIL_ALLOCATED.with(|c| c.set(c.get() + 1));
    text.into_raw()
}

pub unsafe extern "C" fn mock_register_app(payload: *const c_char) -> *mut c_char {
    if payload.is_null() {
        return ptr::null_mut();
    }
    let payload = CStr::from_ptr(payload).to_string_lossy();
    if payload == "garbage-payload" {
        return ptr::null_mut();
    }
    allocate(format!("registered:{}", payload))
}

pub unsafe extern "C" fn mock_get_device_id() -> *mut c_char {
    allocate("device-0001".to_string())
}

pub unsafe extern "C" fn mock_set_data_directory(path: *const c_char) {
    UTIL_DATA_DIR.with(|d| *d.borrow_mut() = optional(path));
}

pub unsafe extern "C" fn mock_release(text: *mut c_char) {
    if text.is_null() {
        return;
    }
    UTIL_RELEASED.with(|c| c.set(c.get() + 1));
    drop(CString::from_raw(text));
}

pub fn mock_utility() -> UtilityApi {
    unsafe {
        UtilityApi::from_raw_parts(
            mock_register_app,
            mock_get_device_id,
            mock_set_data_directory,
            Some(mock_release),
        )
    }
}

/// A collaborator that exports no release function
pub fn mock_utility_without_release() -> UtilityApi {
    unsafe {
        UtilityApi::from_raw_parts(
            mock_register_app,
            mock_get_device_id,
            mock_set_data_directory,
            None,
        )
    }
}

pub fn util_allocated() -> usize {
    UTIL_ALLOCATED.with(Cell::get)
}

pub fn util_released() -> usize {
    UTIL_RELEASED.with(Cell::get)
}

pub fn util_data_dir() -> Option<String> {
    UTIL_DATA_DIR.with(|d| d.borrow().clone())
}

// ============================================================================
// Fake managed host
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeLocal {
    Text(String),
    Id(u32),
}

/// A host that records everything and fails on request
#[derive(Debug, Default)]
pub struct FakeHost {
    pub fail_resolve: bool,
    pub fail_pin: bool,
    pub fault_every_invoke: bool,
    /// Refuse to box this token id
    pub fail_box_for: Option<u32>,

    pub events: Vec<(String, u32)>,
    pub live_locals: usize,
    pub peak_locals: usize,
    pub pinned: usize,
    pub unpinned: usize,
    pub faults_cleared: usize,
    /// Invocations made with an entry point this host never resolved
    pub foreign_entries: usize,
    pending: Option<HostFault>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn created(&mut self) {
        self.live_locals += 1;
        self.peak_locals = self.peak_locals.max(self.live_locals);
    }
}

impl ManagedEnv for FakeHost {
    type Callable = &'static str;
    type Pinned = String;
    type EntryPoint = u32;
    type Local = FakeLocal;

    fn resolve_entry_point(&mut self, callable: &&'static str) -> Result<u32, HostError> {
        if self.fail_resolve {
            self.pending = Some(HostFault::new("NoSuchMethodError: invoke"));
            return Err(HostError::Unresolvable(format!("{} has no invoke", callable)));
        }
        Ok(FAKE_ENTRY)
    }

    fn pin(&mut self, callable: &&'static str) -> Result<String, HostError> {
        if self.fail_pin {
            return Err(HostError::PinFailed("global reference table full".to_string()));
        }
        self.pinned += 1;
        Ok(callable.to_string())
    }

    fn unpin(&mut self, _pinned: String) {
        self.unpinned += 1;
    }

    fn new_text(&mut self, text: &str) -> Result<FakeLocal, HostError> {
        self.created();
        Ok(FakeLocal::Text(text.to_string()))
    }

    fn box_token_id(&mut self, token_id: u32) -> Result<FakeLocal, HostError> {
        if self.fail_box_for == Some(token_id) {
            self.pending = Some(HostFault::new("OutOfMemoryError"));
            return Err(HostError::Allocation("Integer.valueOf failed".to_string()));
        }
        self.created();
        Ok(FakeLocal::Id(token_id))
    }

    fn invoke(&mut self, _target: &String, entry: u32, text: &FakeLocal, token_id: &FakeLocal) {
        if entry != FAKE_ENTRY {
            self.foreign_entries += 1;
        }
        if let (FakeLocal::Text(text), FakeLocal::Id(id)) = (text, token_id) {
            self.events.push((text.clone(), *id));
        }
        if self.fault_every_invoke {
            self.pending = Some(HostFault::new("IllegalStateException: listener closed"));
        }
    }

    fn take_pending_fault(&mut self) -> Option<HostFault> {
        let fault = self.pending.take();
        if fault.is_some() {
            self.faults_cleared += 1;
        }
        fault
    }

    fn release_local(&mut self, _local: FakeLocal) {
        self.live_locals = self.live_locals.saturating_sub(1);
    }
}
