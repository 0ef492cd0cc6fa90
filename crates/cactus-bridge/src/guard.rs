//! Exception-safety guard for calls that cross the boundary
//!
//! Two directions are covered. Native -> managed: after every invocation of
//! managed code the pending fault is taken, logged and cleared, so the next
//! host call starts clean and generation continues. Managed/engine ->
//! Rust: code running on a foreign stack (the token trampoline, exported host
//! entry points) runs under [`contain_panic`] so no panic unwinds through
//! frames that are not Rust.

use crate::host::{panic_message, HostFault, ManagedEnv};
use std::panic::{self, AssertUnwindSafe};

/// Take and clear a pending fault after a managed invocation
///
/// Returns the fault so the caller can count it. Faults never end a run.
pub fn absorb_fault<E: ManagedEnv + ?Sized>(env: &mut E, token_id: u32) -> Option<HostFault> {
    let fault = env.take_pending_fault()?;
    tracing::warn!(
        token_id,
        fault = %fault,
        "Token callback raised; cleared and continuing"
    );
    Some(fault)
}

/// Run `f`, catching any panic
///
/// A caught panic is logged at `error` and becomes `None`.
pub fn contain_panic<R>(context: &'static str, f: impl FnOnce() -> R) -> Option<R> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(payload) => {
            tracing::error!(
                context,
                panic = %panic_message(payload.as_ref()),
                "Panic stopped at the native boundary"
            );
            None
        }
    }
}
