//! Callback bridge: a managed callable seen by the engine as a C function pointer
//!
//! For one run, a host callable is turned into the pair the engine expects:
//! [`token_trampoline`] as the function pointer and a [`CallbackThunk`] as
//! `user_data`. The thunk is built right before the run and dropped right
//! after it, which unpins the callable on every exit path.

use crate::guard;
use crate::host::ManagedEnv;
use crate::sys::TokenCallbackFn;
use std::borrow::Cow;
use std::ffi::{c_char, c_void, CStr};
use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::thread::{self, ThreadId};

/// One generated token, valid only while the callable runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenEvent<'a> {
    pub text: &'a str,
    pub token_id: u32,
}

/// Per-run callback statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventStats {
    /// Events received from the engine
    pub received: u64,
    /// Events handed to the managed callable
    pub delivered: u64,
    /// Events whose invocation left a fault pending (or could not be prepared)
    pub faulted: u64,
    /// Events dropped because they arrived off the origin thread
    pub foreign_thread: u64,
}

/// Token callback for one run
pub enum TokenCallback<'env, E: ManagedEnv> {
    /// Buffer-only mode
    Absent,
    Present(CallbackThunk<'env, E>),
}

impl<'env, E: ManagedEnv> TokenCallback<'env, E> {
    /// Bind `callable` for one run
    ///
    /// `None`, an unresolvable callable or a callable that cannot be pinned
    /// all yield [`TokenCallback::Absent`]; the latter two log a warning.
    pub fn bind(env: &'env mut E, callable: Option<&E::Callable>) -> Self {
        let Some(callable) = callable else {
            return Self::Absent;
        };

        let entry = match env.resolve_entry_point(callable) {
            Ok(entry) => entry,
            Err(err) => {
                discard_pending(env);
                tracing::warn!(error = %err, "Token callback unusable; running without streaming");
                return Self::Absent;
            }
        };

        let pinned = match env.pin(callable) {
            Ok(pinned) => pinned,
            Err(err) => {
                discard_pending(env);
                tracing::warn!(error = %err, "Token callback unusable; running without streaming");
                return Self::Absent;
            }
        };

        Self::Present(CallbackThunk::new(env, pinned, entry))
    }

    pub fn is_present(&self) -> bool {
        matches!(self, Self::Present(_))
    }

    /// Function pointer and `user_data` for `cactus_complete`
    ///
    /// The pointer pair is valid while `self` is neither moved nor dropped.
    pub(crate) fn native_parts(&mut self) -> (Option<TokenCallbackFn>, *mut c_void) {
        match self {
            Self::Absent => (None, ptr::null_mut()),
            Self::Present(thunk) => (Some(token_trampoline::<E>), thunk.user_data()),
        }
    }

    pub fn stats(&self) -> EventStats {
        match self {
            Self::Absent => EventStats::default(),
            Self::Present(thunk) => thunk.state.stats,
        }
    }
}

/// Ephemeral pairing of a pinned callable, its entry point and the environment
///
/// Lives for exactly one run on exactly one thread. Dropping it unpins the
/// callable.
pub struct CallbackThunk<'env, E: ManagedEnv> {
    // boxed so the address handed to the engine stays put
    state: Box<ThunkState<E>>,
    _env: PhantomData<&'env mut E>,
}

struct ThunkState<E: ManagedEnv> {
    env: NonNull<E>,
    pinned: Option<E::Pinned>,
    entry: E::EntryPoint,
    origin: ThreadId,
    stats: EventStats,
}

impl<'env, E: ManagedEnv> CallbackThunk<'env, E> {
    fn new(env: &'env mut E, pinned: E::Pinned, entry: E::EntryPoint) -> Self {
        Self {
            state: Box::new(ThunkState {
                env: NonNull::from(env),
                pinned: Some(pinned),
                entry,
                origin: thread::current().id(),
                stats: EventStats::default(),
            }),
            _env: PhantomData,
        }
    }

    fn user_data(&mut self) -> *mut c_void {
        let state: *mut ThunkState<E> = &mut *self.state;
        state.cast()
    }

    pub fn origin_thread(&self) -> ThreadId {
        self.state.origin
    }
}

impl<E: ManagedEnv> Drop for CallbackThunk<'_, E> {
    fn drop(&mut self) {
        if let Some(pinned) = self.state.pinned.take() {
            // SAFETY: the `'env` borrow is still live while the thunk exists
            let env = unsafe { self.state.env.as_mut() };
            env.unpin(pinned);
        }
    }
}

impl<E: ManagedEnv> ThunkState<E> {
    fn deliver(&mut self, token: *const c_char, token_id: u32) {
        self.stats.received += 1;

        if thread::current().id() != self.origin {
            self.stats.foreign_thread += 1;
            tracing::warn!(token_id, "Token event arrived off the origin thread; dropped");
            return;
        }

        let text: Cow<'_, str> = if token.is_null() {
            Cow::Borrowed("")
        } else {
            unsafe { CStr::from_ptr(token) }.to_string_lossy()
        };
        let event = TokenEvent {
            text: &text,
            token_id,
        };

        let Some(pinned) = self.pinned.as_ref() else {
            return;
        };
        // SAFETY: the `'env` borrow outlives every engine call made with this thunk
        let env = unsafe { self.env.as_mut() };

        let text_local = match env.new_text(event.text) {
            Ok(local) => local,
            Err(err) => {
                self.fail_event(env, event, &err);
                return;
            }
        };
        let id_local = match env.box_token_id(event.token_id) {
            Ok(local) => local,
            Err(err) => {
                env.release_local(text_local);
                self.fail_event(env, event, &err);
                return;
            }
        };

        env.invoke(pinned, self.entry, &text_local, &id_local);
        self.stats.delivered += 1;
        if guard::absorb_fault(env, event.token_id).is_some() {
            self.stats.faulted += 1;
        }

        env.release_local(id_local);
        env.release_local(text_local);
    }

    fn fail_event(&mut self, env: &mut E, event: TokenEvent<'_>, err: &dyn std::error::Error) {
        self.stats.faulted += 1;
        discard_pending(env);
        tracing::warn!(
            token_id = event.token_id,
            error = %err,
            "Token event could not be delivered"
        );
    }
}

fn discard_pending<E: ManagedEnv>(env: &mut E) {
    if let Some(fault) = env.take_pending_fault() {
        tracing::debug!(fault = %fault, "Cleared pending host fault");
    }
}

/// The C function pointer handed to the engine
///
/// # Safety
///
/// `user_data` must be null or the `user_data` produced by
/// [`TokenCallback::native_parts`] for a `TokenCallback<E>` that is still
/// alive. `token` must be null or NUL-terminated.
pub unsafe extern "C" fn token_trampoline<E: ManagedEnv>(
    token: *const c_char,
    token_id: u32,
    user_data: *mut c_void,
) {
    guard::contain_panic("token callback", || {
        let Some(mut state) = NonNull::new(user_data.cast::<ThunkState<E>>()) else {
            return;
        };
        state.as_mut().deliver(token, token_id);
    });
}
