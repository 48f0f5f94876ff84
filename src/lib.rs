//! Host objects for embedded script engines.
//!
//! Binds the lifetime of native resources to script handles and scopes them
//! under a per-context [`Environment`]:
//!
//! - [`WrappedObject`]: one native resource bound to one script handle,
//!   dropped exactly once when the collector reclaims the handle, when it is
//!   finalized explicitly, or when its environment is torn down
//! - [`Environment`]: tracks every wrapped object of one execution context,
//!   holds the event loop binding, the native memory account and the
//!   cleanup hooks, and tears them down in a fixed order
//! - [`HandleAdapter`]: the narrow contract to the engine's handle machinery
//! - [`LocalHeap`]: an in-process adapter with an explicit collector

pub mod adapter;
pub mod config;
pub mod environment;
pub mod error;
pub mod gc;
pub mod local_heap;
pub mod wrapped;

// Core API
pub use environment::{
    CleanupHook, CleanupRegistry, CleanupToken, EnvState, Environment, EventLoop, TeardownReport,
};
pub use wrapped::WrappedObject;

pub use adapter::{HandleAdapter, HandleId, ObjectId, ScriptHandle, WeakCallback};
pub use config::EnvironmentConfig;
pub use error::{BoxError, CleanupHookError, HostError, Result};
pub use gc::{DeferredFinalizers, ExternalMemoryGuard, MemoryAccount, NativeState};
pub use local_heap::LocalHeap;

// Derive macro shares the trait's name, like serde
pub use openworkers_host_env_derive::NativeState;
