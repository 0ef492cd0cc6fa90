//! Call-boundary layer between managed hosts and the cactus inference engine
//!
//! A managed host (the JVM, or Rust code acting as one) drives an opaque
//! native engine through three entry points: create a model, run a
//! completion, destroy the model. A run writes its full response into a
//! caller-owned buffer and can stream every generated token to a host
//! callable while it runs.
//!
//! # Layout
//!
//! - [`engine`]: the engine entry points and the opaque model handle
//! - [`marshal`]: strings and buffers across the boundary, one ownership rule each
//! - [`host`]: the managed environment ([`ManagedEnv`]) and a closure-backed host
//! - [`callback`]: host callables as C token callbacks
//! - [`guard`]: fault and panic containment at the boundary
//! - [`lifecycle`]: create/run/destroy, return-code interpretation, handle tables
//! - [`utility`]: device registration, device id and data directory
//! - [`payload`]: helpers for the JSON texts the engine consumes and produces
//! - `jvm` (feature `jni`): JVM entry points
//!
//! # Example
//!
//! ```no_run
//! use cactus_bridge::{
//!     ClosureEnv, CompletionRequest, EngineApi, LibraryLoader, Model, ResponseBuffer,
//!     TokenCallback, TokenSink,
//! };
//! use std::cell::RefCell;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut loader = LibraryLoader::new();
//! let api = EngineApi::load(&mut loader, "cactus")?;
//! let mut model = Model::create(&api, "model.gguf", 2048)?;
//!
//! let sink: &TokenSink<'_> = &RefCell::new(|text: &str, _id: u32| print!("{}", text));
//! let mut env = ClosureEnv::new();
//! let callback = TokenCallback::bind(&mut env, Some(&sink));
//!
//! let mut region = vec![0u8; 1024];
//! let mut buffer = ResponseBuffer::new(&mut region);
//! let request = CompletionRequest::new(r#"[{"role":"user","content":"Hi"}]"#);
//! let outcome = model.complete_streaming(&request, &mut buffer, callback)?;
//! println!("\n{:?}", outcome.status);
//! # Ok(())
//! # }
//! ```

pub mod callback;
pub mod engine;
pub mod error;
pub mod guard;
pub mod host;
pub mod lifecycle;
pub mod loader;
pub mod marshal;
pub mod payload;
pub mod sys;
pub mod utility;

#[cfg(feature = "jni")]
pub mod jvm;

pub use callback::{EventStats, TokenCallback, TokenEvent};
pub use engine::EngineApi;
pub use error::{BridgeError, BridgeResult};
pub use host::{ClosureEnv, HostError, HostFault, ManagedEnv, TokenSink};
pub use lifecycle::{
    CompletionOutcome, CompletionRequest, CompletionStatus, HandleState, HandleTable,
    LifecycleError, Model,
};
pub use loader::{LibraryLoader, LoadError};
pub use marshal::{MarshalContext, MarshalError, NativeString, ResponseBuffer};
pub use payload::{ChatMessage, CompletionOptions, CompletionResult};
pub use utility::{UtilityApi, UtilityProxy};
