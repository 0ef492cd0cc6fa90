//! Marshaling between host values and native representations
//!
//! One ownership rule per value:
//!
//! - Input text is copied into `CString`s owned by a [`MarshalContext`]. The
//!   pointers handed to the engine are valid until the context is dropped, and
//!   the context lives exactly as long as the native call.
//! - The response region is caller-owned. [`ResponseBuffer`] never reports a
//!   capacity larger than the real region.
//! - Text returned by a collaborator is owned by [`NativeString`] and released
//!   exactly once through the collaborator's release function.
//!
//! Every acquisition failure is reported before any native call executes.

use crate::sys::ReleaseStringFn;
use std::borrow::Cow;
use std::ffi::{c_char, CStr, CString};
use std::ptr::{self, NonNull};
use thiserror::Error;

/// Acquisition failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MarshalError {
    /// Text contains a NUL byte and cannot cross as a C string
    #[error("{argument} contains a NUL byte at offset {position}")]
    InteriorNul {
        argument: &'static str,
        position: usize,
    },

    /// Bytes are not valid UTF-8
    #[error("{argument} is not valid UTF-8")]
    InvalidUtf8 { argument: &'static str },

    /// A required argument was absent
    #[error("required argument {0} is null")]
    NullArgument(&'static str),

    /// Numeric argument outside the accepted range
    #[error("{argument} out of range: {value}")]
    OutOfRange { argument: &'static str, value: i64 },
}

/// Keeps marshaled input strings alive for one native call
///
/// ```
/// # use cactus_bridge::marshal::MarshalContext;
/// let mut ctx = MarshalContext::new();
/// let messages = ctx.text("messages", r#"[{"role":"user","content":"hi"}]"#).unwrap();
/// let tools = ctx.optional_text("tools", None).unwrap();
/// assert!(!messages.is_null());
/// assert!(tools.is_null());
/// // both pointers are invalid once ctx is dropped
/// ```
#[derive(Debug, Default)]
pub struct MarshalContext {
    allocated_strings: Vec<CString>,
}

impl MarshalContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy `value` into a NUL-terminated string owned by this context
    pub fn text(
        &mut self,
        argument: &'static str,
        value: &str,
    ) -> Result<*const c_char, MarshalError> {
        let c_string = CString::new(value).map_err(|e| MarshalError::InteriorNul {
            argument,
            position: e.nul_position(),
        })?;

        // CString owns a heap allocation, so the pointer survives moves of the Vec
        let ptr = c_string.as_ptr();
        self.allocated_strings.push(c_string);
        Ok(ptr)
    }

    /// Like [`text`](Self::text) but `None` becomes a null pointer
    pub fn optional_text(
        &mut self,
        argument: &'static str,
        value: Option<&str>,
    ) -> Result<*const c_char, MarshalError> {
        match value {
            Some(value) => self.text(argument, value),
            None => Ok(ptr::null()),
        }
    }

    /// Validate raw host bytes as UTF-8, then copy them like [`text`](Self::text)
    pub fn text_from_bytes(
        &mut self,
        argument: &'static str,
        bytes: &[u8],
    ) -> Result<*const c_char, MarshalError> {
        let value = std::str::from_utf8(bytes).map_err(|_| MarshalError::InvalidUtf8 { argument })?;
        self.text(argument, value)
    }

    /// Number of strings held
    pub fn len(&self) -> usize {
        self.allocated_strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocated_strings.is_empty()
    }
}

/// Convert a host-supplied size into a native size, rejecting negatives
pub fn to_native_size(argument: &'static str, value: i64) -> Result<usize, MarshalError> {
    usize::try_from(value).map_err(|_| MarshalError::OutOfRange { argument, value })
}

/// Caller-owned response region plus the capacity the engine is told about
pub struct ResponseBuffer<'a> {
    region: &'a mut [u8],
    capacity: usize,
}

impl<'a> ResponseBuffer<'a> {
    /// Use the whole region
    pub fn new(region: &'a mut [u8]) -> Self {
        let capacity = region.len();
        Self { region, capacity }
    }

    /// Use a host-declared size, clamped to the real region
    ///
    /// Hosts pass the size separately from the array. A negative size is an
    /// acquisition failure; a size larger than the region is clamped so the
    /// engine can never be told about bytes that do not exist.
    pub fn with_declared(region: &'a mut [u8], declared: i64) -> Result<Self, MarshalError> {
        let declared = to_native_size("buffer_size", declared)?;
        let capacity = declared.min(region.len());
        if capacity < declared {
            tracing::debug!(
                declared,
                actual = region.len(),
                "Declared buffer size exceeds the buffer; clamped"
            );
        }
        Ok(Self { region, capacity })
    }

    /// Capacity passed to the engine
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut c_char {
        self.region.as_mut_ptr().cast()
    }

    /// The first `len` bytes of the region, never more than the capacity
    pub fn written(&self, len: usize) -> &[u8] {
        &self.region[..len.min(self.capacity)]
    }

    /// Text in the first `len` bytes, up to the first NUL
    ///
    /// Truncation can split a multi-byte character; invalid sequences are
    /// replaced rather than rejected.
    pub fn text(&self, len: usize) -> Cow<'_, str> {
        let bytes = self.written(len);
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        String::from_utf8_lossy(&bytes[..end])
    }
}

impl std::fmt::Debug for ResponseBuffer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseBuffer")
            .field("capacity", &self.capacity)
            .field("region_len", &self.region.len())
            .finish()
    }
}

/// A string allocated by a native collaborator
///
/// Dropping it releases the allocation exactly once. Without a release
/// function the allocation is leaked, which is what a collaborator that
/// exports no deallocator requires.
pub struct NativeString {
    ptr: NonNull<c_char>,
    release: Option<ReleaseStringFn>,
}

impl NativeString {
    /// Take ownership of a collaborator result; null is `None`
    ///
    /// # Safety
    ///
    /// A non-null `ptr` must point to a NUL-terminated string that nothing
    /// else releases, and `release` (if any) must be the matching deallocator.
    pub unsafe fn from_raw(ptr: *mut c_char, release: Option<ReleaseStringFn>) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| Self { ptr, release })
    }

    pub fn as_c_str(&self) -> &CStr {
        unsafe { CStr::from_ptr(self.ptr.as_ptr()) }
    }

    /// Borrow as UTF-8
    pub fn to_str(&self) -> Result<&str, MarshalError> {
        self.as_c_str()
            .to_str()
            .map_err(|_| MarshalError::InvalidUtf8 { argument: "native result" })
    }

    /// Copy into an owned `String` and release the native allocation
    pub fn into_string_lossy(self) -> String {
        self.as_c_str().to_string_lossy().into_owned()
    }

    /// Whether dropping this string releases native memory
    pub fn is_released_on_drop(&self) -> bool {
        self.release.is_some()
    }
}

impl Drop for NativeString {
    fn drop(&mut self) {
        if let Some(release) = self.release {
            unsafe { release(self.ptr.as_ptr()) }
        }
    }
}

impl std::fmt::Debug for NativeString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeString")
            .field("value", &self.as_c_str())
            .field("released_on_drop", &self.release.is_some())
            .finish()
    }
}
