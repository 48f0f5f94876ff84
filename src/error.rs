//! Error types for wrapping and environment lifecycle.

use thiserror::Error;

use crate::environment::CleanupToken;

/// Boxed error returned by cleanup hooks.
pub type BoxError = Box<dyn std::error::Error + 'static>;

/// Result alias for fallible host operations.
pub type Result<T> = std::result::Result<T, HostError>;

/// Synchronous failures surfaced to the caller of a wrap or environment operation.
///
/// Finalizing an object twice is not an error and has no variant here.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HostError {
    /// The script handle is empty, dead, or belongs to another engine instance.
    #[error("script handle is empty or no longer alive")]
    InvalidHandle,

    /// The environment has begun (or finished) teardown.
    #[error("environment {0} is shutting down")]
    EnvironmentShuttingDown(u64),

    /// The event loop is already bound to another live environment.
    #[error("event loop {loop_id} is already bound to environment {environment}")]
    LoopAlreadyBound { loop_id: u64, environment: u64 },

    /// The handle already carries a wrapped object in its internal field.
    #[error("script handle is already wrapping a native object")]
    HandleAlreadyWrapped,

    /// Charging the native state would exceed the environment's external memory limit.
    #[error("external memory limit exceeded: {requested} bytes requested, {in_use} of {limit} in use")]
    ExternalMemoryLimit {
        requested: usize,
        in_use: usize,
        limit: usize,
    },

    /// The handle adapter refused an operation.
    #[error("handle adapter error: {0}")]
    Adapter(String),
}

/// A cleanup hook that failed during teardown.
///
/// These are collected into the teardown report and never propagated.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("cleanup hook {token:?} failed: {message}")]
pub struct CleanupHookError {
    pub token: CleanupToken,
    pub message: String,
    /// Whether the hook panicked instead of returning an error.
    pub panicked: bool,
}
