//! Crate-level error type
//!
//! Component errors live next to their components (`MarshalError`,
//! `LoadError`, `LifecycleError`); `BridgeError` is what public operations
//! return.

use crate::lifecycle::LifecycleError;
use crate::loader::LoadError;
use crate::marshal::MarshalError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// An argument could not be converted for the native side
    #[error(transparent)]
    Marshal(#[from] MarshalError),

    /// A native library could not be loaded
    #[error(transparent)]
    Load(#[from] LoadError),

    /// A handle was used outside its lifecycle
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// `cactus_init` returned a null handle
    #[error("engine failed to create a model from '{model_path}' (context size {context_size})")]
    EngineInit {
        model_path: String,
        context_size: usize,
    },

    /// The engine's response text is not the expected JSON document
    #[error("invalid engine response: {0}")]
    Response(#[from] serde_json::Error),
}

impl BridgeError {
    /// Whether the caller supplied an argument the boundary cannot carry
    pub fn is_acquisition_failure(&self) -> bool {
        matches!(self, BridgeError::Marshal(_))
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
