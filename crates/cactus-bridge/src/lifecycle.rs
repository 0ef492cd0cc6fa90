//! Model lifecycle: create, run, destroy
//!
//! Two front ends share one state machine (`Uninitialized -> Ready ->
//! Destroyed`, `run` only while `Ready`):
//!
//! - [`Model`] for Rust callers. Ownership enforces the machine: `complete`
//!   takes `&mut self`, `destroy` takes `self`, and the type is `Send` but
//!   not `Sync`, so one handle never sees two concurrent runs.
//! - [`HandleTable`] for hosts that can only hold integers. Ids map to slots
//!   whose state is checked on every operation, so use-after-destroy, double
//!   destroy and overlapping runs become errors instead of undefined
//!   behavior.

use crate::callback::{EventStats, TokenCallback};
use crate::engine::{EngineApi, RawModel};
use crate::error::{BridgeError, BridgeResult};
use crate::host::{ClosureEnv, ManagedEnv};
use crate::marshal::{MarshalContext, MarshalError, ResponseBuffer};
use std::cell::Cell;
use std::collections::HashMap;
use std::ffi::{c_int, CStr};
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Handle-table errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("unknown model handle {0}")]
    UnknownHandle(u64),

    #[error("model handle {0} has been destroyed")]
    Destroyed(u64),

    #[error("model handle {0} is already running a completion")]
    Busy(u64),
}

/// Inputs of one run, passed through to the engine unparsed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionRequest<'a> {
    /// Chat messages as JSON text
    pub messages: &'a str,
    /// Sampling options as JSON text
    pub options: Option<&'a str>,
    /// Tool definitions as JSON text
    pub tools: Option<&'a str>,
}

impl<'a> CompletionRequest<'a> {
    pub fn new(messages: &'a str) -> Self {
        Self {
            messages,
            options: None,
            tools: None,
        }
    }

    pub fn with_options(mut self, options: &'a str) -> Self {
        self.options = Some(options);
        self
    }

    pub fn with_tools(mut self, tools: &'a str) -> Self {
        self.tools = Some(tools);
        self
    }
}

/// Interpretation of the engine's return code against the buffer capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// The whole response fits
    Complete { written: usize },
    /// The response needs `required` bytes; only `written` (= capacity) are present
    Truncated { written: usize, required: usize },
    /// Engine failure code, forwarded unchanged
    Failed { code: i32 },
}

impl CompletionStatus {
    pub fn from_code(code: c_int, capacity: usize) -> Self {
        if code <= 0 {
            return Self::Failed { code };
        }

        // positive c_int always fits in usize on supported targets
        let required = code as usize;
        if required <= capacity {
            Self::Complete { written: required }
        } else {
            Self::Truncated {
                written: capacity,
                required,
            }
        }
    }

    /// The engine's original return code
    pub fn code(&self) -> i32 {
        match *self {
            Self::Complete { written } => written as i32,
            Self::Truncated { required, .. } => required as i32,
            Self::Failed { code } => code,
        }
    }

    /// Bytes of the buffer holding response text
    pub fn written(&self) -> Option<usize> {
        match *self {
            Self::Complete { written } | Self::Truncated { written, .. } => Some(written),
            Self::Failed { .. } => None,
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }

    pub fn is_truncated(&self) -> bool {
        matches!(self, Self::Truncated { .. })
    }
}

/// Result of one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionOutcome {
    pub status: CompletionStatus,
    /// Response text; `None` for engine failures, whose buffer is meaningless
    pub text: Option<String>,
    /// Token callback statistics; all zero in buffer-only mode
    pub events: EventStats,
}

/// An owned engine model
///
/// Destroyed exactly once: explicitly through [`Model::destroy`] or when
/// dropped.
pub struct Model {
    raw: RawModel,
    api: EngineApi,
    // one run at a time: movable between threads, never shared
    _not_sync: PhantomData<Cell<()>>,
}

impl Model {
    /// Create a model
    ///
    /// A zero `context_size` is rejected before the engine is called. A null
    /// engine handle becomes [`BridgeError::EngineInit`].
    pub fn create(api: &EngineApi, model_path: &str, context_size: usize) -> BridgeResult<Self> {
        if context_size == 0 {
            return Err(MarshalError::OutOfRange {
                argument: "context_size",
                value: 0,
            }
            .into());
        }

        let mut ctx = MarshalContext::new();
        let path = ctx.text("model_path", model_path)?;
        let path = unsafe { CStr::from_ptr(path) };

        let raw = api
            .init(path, context_size)
            .ok_or_else(|| BridgeError::EngineInit {
                model_path: model_path.to_string(),
                context_size,
            })?;

        tracing::info!(model_path, context_size, "Model created");

        Ok(Self {
            raw,
            api: api.clone(),
            _not_sync: PhantomData,
        })
    }

    /// Run a completion without streaming
    pub fn complete(
        &mut self,
        request: &CompletionRequest<'_>,
        buffer: &mut ResponseBuffer<'_>,
    ) -> BridgeResult<CompletionOutcome> {
        self.complete_streaming(request, buffer, TokenCallback::<ClosureEnv<'_>>::Absent)
    }

    /// Run a completion, delivering each token to `callback` as it is generated
    ///
    /// The callback is consumed: its callable is unpinned when this returns,
    /// whatever the exit path.
    pub fn complete_streaming<E: ManagedEnv>(
        &mut self,
        request: &CompletionRequest<'_>,
        buffer: &mut ResponseBuffer<'_>,
        mut callback: TokenCallback<'_, E>,
    ) -> BridgeResult<CompletionOutcome> {
        let mut ctx = MarshalContext::new();
        let messages = ctx.text("messages", request.messages)?;
        let options = ctx.optional_text("options", request.options)?;
        let tools = ctx.optional_text("tools", request.tools)?;

        let capacity = buffer.capacity();
        let (native_callback, user_data) = callback.native_parts();

        tracing::debug!(
            capacity,
            streaming = native_callback.is_some(),
            "Running completion"
        );

        let code = unsafe {
            self.api.complete(
                &mut self.raw,
                messages,
                buffer.as_mut_ptr(),
                capacity,
                options,
                tools,
                native_callback,
                user_data,
            )
        };

        let status = CompletionStatus::from_code(code, capacity);
        let events = callback.stats();
        drop(callback);

        match status {
            CompletionStatus::Failed { code } => {
                tracing::warn!(code, "Engine reported failure");
            }
            CompletionStatus::Truncated { written, required } => {
                tracing::warn!(written, required, "Response truncated to buffer capacity");
            }
            CompletionStatus::Complete { .. } => {}
        }
        if events.faulted > 0 {
            tracing::warn!(
                faulted = events.faulted,
                delivered = events.delivered,
                "Token callback faulted during run"
            );
        }

        let text = status.written().map(|len| buffer.text(len).into_owned());
        Ok(CompletionOutcome {
            status,
            text,
            events,
        })
    }

    /// Destroy the model now
    pub fn destroy(self) {
        drop(self);
    }
}

impl Drop for Model {
    fn drop(&mut self) {
        // SAFETY: drop runs once and `raw` is not touched afterwards
        unsafe { self.api.destroy(&mut self.raw) };
        tracing::info!("Model destroyed");
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model").field("raw", &self.raw).finish_non_exhaustive()
    }
}

/// Observable state of a handle-table slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Ready,
    Running,
    Destroyed,
}

enum Slot {
    Ready(Model),
    Running,
}

impl Slot {
    fn state(&self) -> HandleState {
        match self {
            Slot::Ready(_) => HandleState::Ready,
            Slot::Running => HandleState::Running,
        }
    }
}

/// Only live ids hold a slot. Ids are issued in increasing order and never
/// reused, so an issued id without a slot has been destroyed.
struct TableInner {
    next_id: u64,
    slots: HashMap<u64, Slot>,
}

impl TableInner {
    fn issued(&self, id: u64) -> bool {
        id != 0 && id < self.next_id
    }

    fn missing(&self, id: u64) -> LifecycleError {
        if self.issued(id) {
            LifecycleError::Destroyed(id)
        } else {
            LifecycleError::UnknownHandle(id)
        }
    }
}

/// Models addressed by opaque integer ids
///
/// Id 0 is never issued, so hosts can use it as the failure value. The lock
/// is held only for state transitions, never across an engine call, so runs
/// on different ids proceed in parallel. Destroying an id frees its slot;
/// the table grows with live models, not with every model ever created.
pub struct HandleTable {
    inner: Mutex<TableInner>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                next_id: 1,
                slots: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TableInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a model and return its id
    pub fn insert(&self, model: Model) -> u64 {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.slots.insert(id, Slot::Ready(model));
        id
    }

    /// `None` for ids this table never issued
    pub fn state(&self, id: u64) -> Option<HandleState> {
        let inner = self.lock();
        match inner.slots.get(&id) {
            Some(slot) => Some(slot.state()),
            None => inner.issued(id).then_some(HandleState::Destroyed),
        }
    }

    /// Number of ids whose model has not been destroyed
    pub fn live(&self) -> usize {
        self.lock().slots.len()
    }

    /// Run `f` with exclusive access to the model behind `id`
    ///
    /// The slot is `Running` for the duration; concurrent `with_model` or
    /// `destroy` calls on the same id fail with [`LifecycleError::Busy`]. The
    /// model returns to the table even if `f` panics.
    pub fn with_model<R>(
        &self,
        id: u64,
        f: impl FnOnce(&mut Model) -> R,
    ) -> Result<R, LifecycleError> {
        let model = {
            let mut inner = self.lock();
            let missing = inner.missing(id);
            let slot = inner.slots.get_mut(&id).ok_or(missing)?;
            match std::mem::replace(slot, Slot::Running) {
                Slot::Ready(model) => model,
                Slot::Running => return Err(LifecycleError::Busy(id)),
            }
        };

        let mut checkout = Checkout {
            table: self,
            id,
            model: ManuallyDrop::new(model),
        };
        Ok(f(&mut *checkout.model))
    }

    /// Destroy the model behind `id`
    pub fn destroy(&self, id: u64) -> Result<(), LifecycleError> {
        let model = {
            let mut inner = self.lock();
            match inner.slots.remove(&id) {
                Some(Slot::Ready(model)) => model,
                Some(Slot::Running) => {
                    inner.slots.insert(id, Slot::Running);
                    return Err(LifecycleError::Busy(id));
                }
                None => return Err(inner.missing(id)),
            }
        };

        // engine call happens outside the lock
        model.destroy();
        Ok(())
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns a checked-out model to its slot
struct Checkout<'t> {
    table: &'t HandleTable,
    id: u64,
    model: ManuallyDrop<Model>,
}

impl Drop for Checkout<'_> {
    fn drop(&mut self) {
        // SAFETY: taken exactly once, here
        let model = unsafe { ManuallyDrop::take(&mut self.model) };
        self.table.lock().slots.insert(self.id, Slot::Ready(model));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::{CactusModel, TokenCallbackFn};
    use rstest::rstest;
    use std::ffi::{c_char, c_void};

    #[rstest]
    #[case(-3, 16, CompletionStatus::Failed { code: -3 })]
    #[case(0, 16, CompletionStatus::Failed { code: 0 })]
    #[case(1, 16, CompletionStatus::Complete { written: 1 })]
    #[case(16, 16, CompletionStatus::Complete { written: 16 })]
    #[case(17, 16, CompletionStatus::Truncated { written: 16, required: 17 })]
    #[case(10, 4, CompletionStatus::Truncated { written: 4, required: 10 })]
    fn test_status_from_code(
        #[case] code: c_int,
        #[case] capacity: usize,
        #[case] expected: CompletionStatus,
    ) {
        let status = CompletionStatus::from_code(code, capacity);
        assert_eq!(status, expected);
        assert_eq!(status.code(), code);
    }

    #[test]
    fn test_written_never_exceeds_capacity() {
        for capacity in 0..64 {
            for code in -2..128 {
                if let Some(written) = CompletionStatus::from_code(code, capacity).written() {
                    assert!(written <= capacity);
                }
            }
        }
    }

    #[test]
    fn test_request_builder() {
        let request = CompletionRequest::new("[]")
            .with_options("{}")
            .with_tools("[]");
        assert_eq!(request.options, Some("{}"));
        assert_eq!(request.tools, Some("[]"));
    }

    #[test]
    fn test_unknown_handle() {
        let table = HandleTable::new();
        assert_eq!(table.destroy(42), Err(LifecycleError::UnknownHandle(42)));
        assert_eq!(
            table.with_model(0, |_| ()),
            Err(LifecycleError::UnknownHandle(0))
        );
        assert_eq!(table.state(1), None);
        assert_eq!(table.live(), 0);
    }

    unsafe extern "C" fn stub_init(_path: *const c_char, _context_size: usize) -> CactusModel {
        std::ptr::NonNull::<u8>::dangling().as_ptr().cast()
    }

    #[allow(clippy::too_many_arguments)]
    unsafe extern "C" fn stub_complete(
        _model: CactusModel,
        _messages: *const c_char,
        _buffer: *mut c_char,
        _buffer_size: usize,
        _options: *const c_char,
        _tools: *const c_char,
        _callback: Option<TokenCallbackFn>,
        _user_data: *mut c_void,
    ) -> c_int {
        0
    }

    unsafe extern "C" fn stub_destroy(_model: CactusModel) {}

    #[test]
    fn test_destroyed_ids_free_their_slots() {
        let api = unsafe { EngineApi::from_raw_parts(stub_init, stub_complete, stub_destroy) };
        let table = HandleTable::new();

        for _ in 0..1000 {
            let id = table.insert(Model::create(&api, "model.bin", 64).unwrap());
            table.destroy(id).unwrap();
        }

        assert_eq!(table.lock().slots.len(), 0);
        assert_eq!(table.live(), 0);
        // earlier ids still read as destroyed, not unknown
        assert_eq!(table.state(1), Some(HandleState::Destroyed));
        assert_eq!(table.destroy(500), Err(LifecycleError::Destroyed(500)));
        assert_eq!(table.state(1001), None);
        assert_eq!(table.destroy(1001), Err(LifecycleError::UnknownHandle(1001)));

        let id = table.insert(Model::create(&api, "model.bin", 64).unwrap());
        assert_eq!(id, 1001);
        assert_eq!(table.live(), 1);
        table.destroy(id).unwrap();
    }
}
