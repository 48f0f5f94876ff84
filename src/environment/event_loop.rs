//! Event loop binding for environments.
//!
//! The application owns the [`EventLoop`]; an environment only holds a
//! scoped [`LoopBinding`] to it. At most one live environment is bound to a
//! loop at a time. Work spawned through the binding runs on the current
//! tokio `LocalSet` and is aborted when the binding is released.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::task::{AbortHandle, JoinHandle};

use crate::error::{HostError, Result};

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

struct LoopState {
    id: u64,
    name: String,
    bound_to: Cell<Option<u64>>,
}

/// Application-owned event loop token.
///
/// Cloning yields another reference to the same loop.
#[derive(Clone)]
pub struct EventLoop {
    state: Rc<LoopState>,
}

impl EventLoop {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            state: Rc::new(LoopState {
                id: NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed),
                name: name.into(),
                bound_to: Cell::new(None),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.state.id
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn is_bound(&self) -> bool {
        self.state.bound_to.get().is_some()
    }

    /// Id of the environment currently bound to this loop.
    pub fn bound_environment(&self) -> Option<u64> {
        self.state.bound_to.get()
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("id", &self.state.id)
            .field("name", &self.state.name)
            .field("bound_to", &self.state.bound_to.get())
            .finish()
    }
}

/// An environment's claim on an [`EventLoop`].
///
/// Released explicitly during teardown, or on drop.
pub(crate) struct LoopBinding {
    state: Option<Rc<LoopState>>,
    environment: u64,
    tasks: RefCell<Vec<AbortHandle>>,
}

impl LoopBinding {
    /// Bind `event_loop` to `environment`.
    pub fn bind(event_loop: &EventLoop, environment: u64) -> Result<Self> {
        let state = &event_loop.state;

        if let Some(current) = state.bound_to.get() {
            return Err(HostError::LoopAlreadyBound {
                loop_id: state.id,
                environment: current,
            });
        }

        state.bound_to.set(Some(environment));
        tracing::debug!(
            "Bound event loop {} ({}) to environment {}",
            state.id,
            state.name,
            environment
        );

        Ok(Self {
            state: Some(Rc::clone(state)),
            environment,
            tasks: RefCell::new(Vec::new()),
        })
    }

    /// Spawn `future` on the current `LocalSet`, scoped to this binding.
    ///
    /// Panics if called outside a `LocalSet`, like `tokio::task::spawn_local`.
    pub fn spawn_local<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let handle = tokio::task::spawn_local(future);

        let mut tasks = self.tasks.borrow_mut();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle.abort_handle());

        handle
    }

    /// Tasks spawned through this binding that have not finished.
    pub fn pending_tasks(&self) -> usize {
        self.tasks
            .borrow()
            .iter()
            .filter(|task| !task.is_finished())
            .count()
    }

    /// Abort pending tasks and unbind the loop. Returns the number of tasks
    /// aborted. Idempotent.
    pub fn release(&mut self) -> usize {
        let Some(state) = self.state.take() else {
            return 0;
        };

        let tasks = std::mem::take(&mut *self.tasks.borrow_mut());
        let mut aborted = 0;

        for task in tasks {
            if !task.is_finished() {
                task.abort();
                aborted += 1;
            }
        }

        if state.bound_to.get() == Some(self.environment) {
            state.bound_to.set(None);
        }

        tracing::debug!(
            "Released event loop {} from environment {} ({} tasks aborted)",
            state.id,
            self.environment,
            aborted
        );

        aborted
    }
}

impl Drop for LoopBinding {
    fn drop(&mut self) {
        self.release();
    }
}
