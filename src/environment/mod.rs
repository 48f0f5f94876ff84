//! Environment - the scope of one script execution context.
//!
//! An environment owns every [`WrappedObject`](crate::WrappedObject) created
//! under it, a binding to the application's event loop, a native memory
//! account, and the cleanup hooks contributed by subsystems.
//!
//! ## Teardown
//!
//! ```text
//! Running ──teardown()──► ShuttingDown ──────────────────────────► TornDown
//!                          1. new wraps rejected
//!                          2. cleanup hooks, FIFO, failures collected
//!                          3. remaining wrapped objects force-finalized
//!                          4. loop binding released, spawned tasks aborted
//! ```
//!
//! Cleanup hooks can be registered until step 2 has drained the registry.
//! Teardown is idempotent. If a hook unwinds out of it (only possible with
//! `catch_hook_panics = false`), the environment stays `ShuttingDown` and the
//! next `teardown()` or drop resumes where it stopped.

mod cleanup;
mod event_loop;

pub use cleanup::{CleanupHook, CleanupRegistry, CleanupToken};
pub use event_loop::EventLoop;

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::task::JoinHandle;

use crate::adapter::{HandleAdapter, ObjectId, ScriptHandle};
use crate::config::EnvironmentConfig;
use crate::error::{BoxError, CleanupHookError, HostError, Result};
use crate::gc::{MemoryAccount, NativeState};
use crate::wrapped::WrappedObject;
use event_loop::LoopBinding;

static NEXT_ENVIRONMENT_ID: AtomicU64 = AtomicU64::new(1);

// Shared by all environments so a handle never resolves inside another one
static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvState {
    Running,
    ShuttingDown,
    TornDown,
}

/// What teardown did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Cleanup hooks run, failed ones included
    pub hooks_run: usize,
    /// Wrapped objects finalized by teardown (not by the collector)
    pub objects_finalized: usize,
    /// Spawned tasks aborted when the loop binding was released
    pub tasks_aborted: usize,
    /// Hooks that returned an error or panicked
    pub failures: Vec<CleanupHookError>,
}

impl TeardownReport {
    /// True if every cleanup hook succeeded.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Type-erased view of a wrapped object, as held in the tracking set.
pub(crate) trait TrackedObject {
    /// Finalize; returns false if already finalized.
    fn finalize(&self) -> bool;

    fn into_any(self: Rc<Self>) -> Rc<dyn Any>;
}

pub(crate) struct EnvInner {
    pub(crate) id: u64,
    pub(crate) config: EnvironmentConfig,
    pub(crate) adapter: Rc<dyn HandleAdapter>,
    pub(crate) memory: Rc<MemoryAccount>,
    state: Cell<EnvState>,
    tracked: RefCell<HashMap<ObjectId, Rc<dyn TrackedObject>>>,
    cleanup: RefCell<CleanupRegistry>,
    loop_binding: RefCell<Option<LoopBinding>>,
    /// Set once teardown has run every cleanup hook
    hooks_closed: Cell<bool>,
    /// Set while a teardown call is on the stack
    tearing_down: Cell<bool>,
}

/// Clears `tearing_down` when teardown returns or unwinds.
struct TeardownGuard<'a>(&'a Cell<bool>);

impl Drop for TeardownGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl EnvInner {
    pub(crate) fn state(&self) -> EnvState {
        self.state.get()
    }

    pub(crate) fn allocate_object_id(&self) -> ObjectId {
        ObjectId::new(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn track(&self, id: ObjectId, object: Rc<dyn TrackedObject>) {
        let previous = self.tracked.borrow_mut().insert(id, object);
        debug_assert!(previous.is_none(), "object {id:?} tracked twice");
    }

    pub(crate) fn untrack(&self, id: ObjectId) {
        // The removed Rc may be the last owner; drop it after the borrow ends
        let removed = self.tracked.borrow_mut().remove(&id);
        drop(removed);
    }

    fn teardown(&self) -> TeardownReport {
        if self.state.get() == EnvState::TornDown || self.tearing_down.get() {
            return TeardownReport::default();
        }

        self.tearing_down.set(true);
        let _guard = TeardownGuard(&self.tearing_down);

        if self.state.get() == EnvState::ShuttingDown {
            tracing::warn!(
                "Resuming interrupted teardown of environment {}",
                self.id
            );
        }

        // 1. Reject new wraps
        self.state.set(EnvState::ShuttingDown);
        tracing::debug!(
            "Tearing down environment {} ({}): {} objects, {} cleanup hooks",
            self.id,
            self.config.name,
            self.tracked.borrow().len(),
            self.cleanup.borrow().len()
        );

        // 2. Cleanup hooks in registration order
        let outcome = CleanupRegistry::run_all(&self.cleanup, self.config.catch_hook_panics);
        self.hooks_closed.set(true);

        for failure in &outcome.failures {
            tracing::warn!("Environment {}: {}", self.id, failure);
        }

        // 3. Force-finalize whatever the collector has not reclaimed
        let remaining: Vec<Rc<dyn TrackedObject>> =
            self.tracked.borrow().values().cloned().collect();
        let objects_finalized = remaining.iter().filter(|object| object.finalize()).count();
        drop(remaining);

        debug_assert!(self.tracked.borrow().is_empty());

        // 4. Release the loop binding
        let binding = self.loop_binding.borrow_mut().take();
        let tasks_aborted = binding.map(|mut binding| binding.release()).unwrap_or(0);

        self.state.set(EnvState::TornDown);
        tracing::debug!(
            "Environment {} torn down: {} hooks run ({} failed), {} objects finalized",
            self.id,
            outcome.hooks_run,
            outcome.failures.len(),
            objects_finalized
        );

        TeardownReport {
            hooks_run: outcome.hooks_run,
            objects_finalized,
            tasks_aborted,
            failures: outcome.failures,
        }
    }
}

/// One script execution context and the native objects scoped to it.
///
/// `Environment` is `!Send`: it and everything wrapped under it live on the
/// thread that runs the engine.
///
/// # Example
///
/// ```ignore
/// let heap = Rc::new(LocalHeap::new());
/// let event_loop = EventLoop::new("main");
/// let env = Environment::new(&event_loop, heap.clone())?;
///
/// let socket = env.wrap(Socket::connect(addr)?)?;
/// let token = env.register_cleanup_hook(|| flush_logs())?;
///
/// let report = env.teardown();
/// assert!(socket.is_finalized());
/// ```
pub struct Environment {
    pub(crate) inner: Rc<EnvInner>,
}

impl Environment {
    /// Create an environment bound to `event_loop` with default config.
    ///
    /// Fails with `LoopAlreadyBound` if another live environment holds the loop.
    pub fn new(event_loop: &EventLoop, adapter: Rc<dyn HandleAdapter>) -> Result<Self> {
        Self::with_config(event_loop, adapter, EnvironmentConfig::default())
    }

    pub fn with_config(
        event_loop: &EventLoop,
        adapter: Rc<dyn HandleAdapter>,
        config: EnvironmentConfig,
    ) -> Result<Self> {
        let id = NEXT_ENVIRONMENT_ID.fetch_add(1, Ordering::Relaxed);
        let loop_binding = LoopBinding::bind(event_loop, id)?;

        tracing::debug!(
            "Created environment {} ({}) with external memory limit {}",
            id,
            config.name,
            config.max_external_memory
        );

        Ok(Self {
            inner: Rc::new(EnvInner {
                id,
                memory: MemoryAccount::new(config.max_external_memory),
                config,
                adapter,
                state: Cell::new(EnvState::Running),
                tracked: RefCell::new(HashMap::new()),
                cleanup: RefCell::new(CleanupRegistry::new()),
                loop_binding: RefCell::new(Some(loop_binding)),
                hooks_closed: Cell::new(false),
                tearing_down: Cell::new(false),
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &EnvironmentConfig {
        &self.inner.config
    }

    pub fn state(&self) -> EnvState {
        self.inner.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == EnvState::Running
    }

    pub fn adapter(&self) -> &Rc<dyn HandleAdapter> {
        &self.inner.adapter
    }

    /// Number of wrapped objects not yet finalized.
    pub fn tracked_count(&self) -> usize {
        self.inner.tracked.borrow().len()
    }

    /// Number of cleanup hooks registered and not yet run.
    pub fn pending_cleanup_hooks(&self) -> usize {
        self.inner.cleanup.borrow().len()
    }

    /// Native memory currently charged by wrapped objects.
    pub fn external_memory(&self) -> usize {
        self.inner.memory.current_usage()
    }

    pub fn memory_account(&self) -> &MemoryAccount {
        &self.inner.memory
    }

    /// Register a hook to run during teardown, after earlier-registered hooks.
    ///
    /// Hooks registered while teardown is running its hooks still run in the
    /// same teardown. Fails with `EnvironmentShuttingDown` once the hooks have
    /// been drained, e.g. from a native `Drop` during force-finalization.
    pub fn register_cleanup_hook<F>(&self, hook: F) -> Result<CleanupToken>
    where
        F: FnOnce() -> std::result::Result<(), BoxError> + 'static,
    {
        if self.inner.hooks_closed.get() {
            return Err(HostError::EnvironmentShuttingDown(self.id()));
        }

        let token = self.inner.cleanup.borrow_mut().register(Box::new(hook));
        tracing::trace!("Environment {} registered cleanup hook {:?}", self.id(), token);
        Ok(token)
    }

    /// Withdraw a hook. Returns false (and does nothing) if the token is
    /// unknown, already run, or already withdrawn.
    pub fn deregister_cleanup_hook(&self, token: CleanupToken) -> bool {
        self.inner.cleanup.borrow_mut().deregister(token)
    }

    /// Create a fresh script handle and bind `state` to it.
    pub fn wrap<T: NativeState + 'static>(&self, state: T) -> Result<WrappedObject<T>> {
        if !self.is_running() {
            return Err(HostError::EnvironmentShuttingDown(self.id()));
        }

        let handle = self.inner.adapter.create_handle(None);

        WrappedObject::new(self, handle, state).inspect_err(|_| {
            self.inner.adapter.release_handle(handle);
        })
    }

    /// Resolve a script handle back to the live object wrapping it.
    ///
    /// Returns `None` if the handle wraps nothing, wraps an object of another
    /// type, or belongs to another environment.
    pub fn unwrap<T: NativeState + 'static>(&self, handle: ScriptHandle) -> Option<WrappedObject<T>> {
        let id = self.inner.adapter.internal_field(handle)?;
        let object = self.inner.tracked.borrow().get(&id).cloned()?;

        WrappedObject::from_tracked(object.into_any())
    }

    /// Spawn a task on the current `LocalSet`, aborted at teardown.
    ///
    /// # Errors
    ///
    /// `EnvironmentShuttingDown` once teardown has begun.
    ///
    /// # Panics
    ///
    /// Panics if called outside a `LocalSet`, like `tokio::task::spawn_local`.
    pub fn spawn_local<F>(&self, future: F) -> Result<JoinHandle<F::Output>>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        if !self.is_running() {
            return Err(HostError::EnvironmentShuttingDown(self.id()));
        }

        let binding = self.inner.loop_binding.borrow();
        let binding = binding
            .as_ref()
            .ok_or(HostError::EnvironmentShuttingDown(self.inner.id))?;

        Ok(binding.spawn_local(future))
    }

    /// Spawned tasks that have not finished yet.
    pub fn pending_tasks(&self) -> usize {
        self.inner
            .loop_binding
            .borrow()
            .as_ref()
            .map(|binding| binding.pending_tasks())
            .unwrap_or(0)
    }

    /// Tear the environment down. See the module docs for the sequence.
    ///
    /// Hook failures never abort teardown; they are returned in the report.
    /// Calling this again, or from inside a cleanup hook, returns an empty
    /// report.
    pub fn teardown(&self) -> TeardownReport {
        self.inner.teardown()
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        if self.inner.state() != EnvState::TornDown {
            let report = self.inner.teardown();

            if !report.is_clean() {
                tracing::warn!(
                    "Environment {} dropped without teardown; {} cleanup hooks failed",
                    self.inner.id,
                    report.failures.len()
                );
            }
        }
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("id", &self.inner.id)
            .field("name", &self.inner.config.name)
            .field("state", &self.inner.state())
            .field("tracked", &self.tracked_count())
            .field("cleanup_hooks", &self.pending_cleanup_hooks())
            .field("memory", &self.inner.memory)
            .finish()
    }
}
