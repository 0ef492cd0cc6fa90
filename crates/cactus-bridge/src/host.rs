//! The managed host environment, as seen from native code
//!
//! A managed runtime (the JVM, or plain Rust closures) differs from native
//! code in how it names callables, keeps objects alive and reports faults.
//! [`ManagedEnv`] captures the handful of operations the callback bridge
//! needs:
//!
//! - resolve a callable's entry point once per run
//! - pin the callable so the collector cannot reclaim it mid-run
//! - create transient values (token text, boxed token id) and release them
//! - invoke the callable, then check and clear any pending fault
//!
//! Implementations are thread-affine: an environment is only used on the
//! thread it belongs to.

use std::any::Any;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use thiserror::Error;

/// Failure of a host operation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    /// The callable has no usable entry point
    #[error("callable entry point could not be resolved: {0}")]
    Unresolvable(String),

    /// The callable could not be pinned
    #[error("callable could not be pinned: {0}")]
    PinFailed(String),

    /// A transient value could not be created
    #[error("host value could not be created: {0}")]
    Allocation(String),
}

/// A fault raised by managed code and left pending for native code to handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostFault {
    pub description: String,
}

impl HostFault {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
        }
    }

    /// Describe a caught panic payload
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        Self::new(panic_message(payload))
    }
}

impl std::fmt::Display for HostFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.description)
    }
}

/// Best-effort text of a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Operations the callback bridge performs against a managed environment
pub trait ManagedEnv {
    /// A callable as the host hands it over (a local reference on the JVM)
    type Callable;
    /// A pinned callable that survives until [`unpin`](Self::unpin)
    type Pinned;
    /// A resolved entry point, reusable for every event of one run
    type EntryPoint: Copy;
    /// A transient host value that must be released promptly
    type Local;

    fn resolve_entry_point(&mut self, callable: &Self::Callable)
        -> Result<Self::EntryPoint, HostError>;

    fn pin(&mut self, callable: &Self::Callable) -> Result<Self::Pinned, HostError>;

    fn unpin(&mut self, pinned: Self::Pinned);

    fn new_text(&mut self, text: &str) -> Result<Self::Local, HostError>;

    fn box_token_id(&mut self, token_id: u32) -> Result<Self::Local, HostError>;

    /// Call `target(text, token_id)`
    ///
    /// A fault raised by the callable is left pending, never propagated.
    fn invoke(
        &mut self,
        target: &Self::Pinned,
        entry: Self::EntryPoint,
        text: &Self::Local,
        token_id: &Self::Local,
    );

    /// Check for a pending fault and clear it
    fn take_pending_fault(&mut self) -> Option<HostFault>;

    fn release_local(&mut self, local: Self::Local);
}

/// A token sink usable from [`ClosureEnv`]
pub type TokenSink<'f> = RefCell<dyn FnMut(&str, u32) + 'f>;

/// Transient value created by [`ClosureEnv`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClosureValue {
    Text(String),
    TokenId(u32),
}

/// A host whose callables are Rust closures
///
/// A panic inside the closure plays the role of a managed exception: it is
/// caught at the invocation and left pending. `ClosureEnv` keeps counts of
/// live transient values and pins so leaks are observable.
pub struct ClosureEnv<'f> {
    pending: Option<HostFault>,
    live_locals: usize,
    pinned: usize,
    _callables: PhantomData<&'f ()>,
    // thread-affine
    _not_send: PhantomData<*const ()>,
}

impl<'f> ClosureEnv<'f> {
    pub fn new() -> Self {
        Self {
            pending: None,
            live_locals: 0,
            pinned: 0,
            _callables: PhantomData,
            _not_send: PhantomData,
        }
    }

    /// Transient values created and not yet released
    pub fn live_locals(&self) -> usize {
        self.live_locals
    }

    /// Callables pinned and not yet unpinned
    pub fn pinned(&self) -> usize {
        self.pinned
    }
}

impl Default for ClosureEnv<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'f> ManagedEnv for ClosureEnv<'f> {
    type Callable = &'f TokenSink<'f>;
    type Pinned = &'f TokenSink<'f>;
    type EntryPoint = ();
    type Local = ClosureValue;

    fn resolve_entry_point(&mut self, _callable: &Self::Callable) -> Result<(), HostError> {
        Ok(())
    }

    fn pin(&mut self, callable: &Self::Callable) -> Result<Self::Pinned, HostError> {
        self.pinned += 1;
        Ok(*callable)
    }

    fn unpin(&mut self, _pinned: Self::Pinned) {
        self.pinned = self.pinned.saturating_sub(1);
    }

    fn new_text(&mut self, text: &str) -> Result<ClosureValue, HostError> {
        self.live_locals += 1;
        Ok(ClosureValue::Text(text.to_string()))
    }

    fn box_token_id(&mut self, token_id: u32) -> Result<ClosureValue, HostError> {
        self.live_locals += 1;
        Ok(ClosureValue::TokenId(token_id))
    }

    fn invoke(
        &mut self,
        target: &Self::Pinned,
        _entry: (),
        text: &ClosureValue,
        token_id: &ClosureValue,
    ) {
        let (ClosureValue::Text(text), ClosureValue::TokenId(token_id)) = (text, token_id) else {
            self.pending = Some(HostFault::new("callable invoked with mismatched arguments"));
            return;
        };

        let Ok(mut sink) = target.try_borrow_mut() else {
            self.pending = Some(HostFault::new("token sink re-entered during invocation"));
            return;
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (&mut *sink)(text, *token_id)));
        if let Err(payload) = outcome {
            self.pending = Some(HostFault::from_panic(payload.as_ref()));
        }
    }

    fn take_pending_fault(&mut self) -> Option<HostFault> {
        self.pending.take()
    }

    fn release_local(&mut self, _local: ClosureValue) {
        self.live_locals = self.live_locals.saturating_sub(1);
    }
}
