//! Wrapped objects - native state bound to a script handle.
//!
//! A [`WrappedObject`] pairs one native resource with one script handle. The
//! resource is dropped exactly once, by whichever comes first:
//!
//! - the collector finding the (weak) handle unreachable
//! - an explicit [`WrappedObject::finalize`]
//! - teardown of the owning environment
//!
//! The environment owns the object through its tracking set; the object only
//! keeps a `Weak` back reference, so there is no cycle.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::adapter::{HandleAdapter, ObjectId, ScriptHandle};
use crate::environment::{EnvInner, EnvState, Environment, TrackedObject};
use crate::error::{HostError, Result};
use crate::gc::{ExternalMemoryGuard, NativeState};

struct WrappedInner<T: NativeState + 'static> {
    id: ObjectId,
    environment: Weak<EnvInner>,
    adapter: Rc<dyn HandleAdapter>,
    handle: Cell<ScriptHandle>,
    state: RefCell<Option<T>>,
    finalized: Cell<bool>,
    weak: Cell<bool>,
    memory: RefCell<ExternalMemoryGuard>,
}

impl<T: NativeState + 'static> WrappedInner<T> {
    fn weak_callback(self: &Rc<Self>) -> Box<dyn FnOnce()> {
        let object = Rc::downgrade(self);

        Box::new(move || {
            if let Some(object) = object.upgrade() {
                tracing::trace!("Weak callback for object {:?}", object.id);
                object.finalize();
            }
        })
    }

    fn finalize(&self) -> bool {
        // Set first: dropping the state may run arbitrary code that finalizes again
        if self.finalized.replace(true) {
            return false;
        }

        let handle = self.handle.replace(ScriptHandle::empty());

        // Collected handles are already dead; teardown and explicit
        // finalization detach a live one.
        if !self.adapter.is_handle_empty(handle) {
            let _ = self.adapter.set_internal_field(handle, None);
            self.adapter.release_handle(handle);
        }
        self.weak.set(false);

        let state = self.state.borrow_mut().take();
        drop(state);

        self.memory.borrow_mut().release();

        if let Some(environment) = self.environment.upgrade() {
            environment.untrack(self.id);
        }

        tracing::trace!("Finalized object {:?}", self.id);
        true
    }
}

impl<T: NativeState + 'static> TrackedObject for WrappedInner<T> {
    fn finalize(&self) -> bool {
        WrappedInner::finalize(self)
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}

/// A native resource bound to a script handle under an [`Environment`].
///
/// Cloning yields another reference to the same object; finalizing through
/// any clone finalizes it for all.
pub struct WrappedObject<T: NativeState + 'static> {
    inner: Rc<WrappedInner<T>>,
}

impl<T: NativeState + 'static> Clone for WrappedObject<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: NativeState + 'static> WrappedObject<T> {
    /// Bind `state` to `handle` inside `environment`.
    ///
    /// The handle becomes weak: when the collector finds it unreachable the
    /// state is dropped. On error nothing is tracked, charged, or left in the
    /// handle's internal field; `state` is dropped.
    ///
    /// # Errors
    ///
    /// - `EnvironmentShuttingDown` once teardown has begun
    /// - `InvalidHandle` if `handle` is empty, dead, or foreign
    /// - `HandleAlreadyWrapped` if `handle` already wraps an object
    /// - `ExternalMemoryLimit` if the state does not fit the environment's memory limit
    pub fn new(environment: &Environment, handle: ScriptHandle, state: T) -> Result<Self> {
        let env = &environment.inner;

        if env.state() != EnvState::Running {
            return Err(HostError::EnvironmentShuttingDown(env.id));
        }

        let adapter = &env.adapter;

        if handle.is_empty() || adapter.is_handle_empty(handle) {
            return Err(HostError::InvalidHandle);
        }

        if adapter.internal_field(handle).is_some() {
            return Err(HostError::HandleAlreadyWrapped);
        }

        let memory = ExternalMemoryGuard::charge(&env.memory, adapter, state.external_memory_size())?;

        let id = env.allocate_object_id();
        adapter.set_internal_field(handle, Some(id))?;

        let inner = Rc::new(WrappedInner {
            id,
            environment: Rc::downgrade(env),
            adapter: Rc::clone(adapter),
            handle: Cell::new(handle),
            state: RefCell::new(Some(state)),
            finalized: Cell::new(false),
            weak: Cell::new(true),
            memory: RefCell::new(memory),
        });

        if let Err(err) = adapter.register_weak_finalizer(handle, inner.weak_callback()) {
            let _ = adapter.set_internal_field(handle, None);
            return Err(err);
        }

        env.track(id, inner.clone());

        tracing::trace!(
            "Wrapped object {:?} under handle {:?} in environment {}",
            id,
            handle,
            env.id
        );

        Ok(Self { inner })
    }

    pub(crate) fn from_tracked(object: Rc<dyn Any>) -> Option<Self> {
        object
            .downcast::<WrappedInner<T>>()
            .ok()
            .map(|inner| Self { inner })
    }

    /// Drop the native state and detach from the handle and environment.
    ///
    /// Idempotent: returns true on the call that did the work, false after.
    /// Must not be called from inside `with_state`/`with_state_mut`.
    pub fn finalize(&self) -> bool {
        self.inner.finalize()
    }

    /// The script handle, or the empty handle once finalized.
    pub fn handle(&self) -> ScriptHandle {
        self.inner.handle.get()
    }

    pub fn id(&self) -> ObjectId {
        self.inner.id
    }

    pub fn is_finalized(&self) -> bool {
        self.inner.finalized.get()
    }

    /// Id of the owning environment, while it exists.
    pub fn environment_id(&self) -> Option<u64> {
        self.inner.environment.upgrade().map(|env| env.id)
    }

    /// Borrow the native state. `None` once finalized.
    pub fn with_state<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.inner.state.borrow().as_ref().map(f)
    }

    /// Mutably borrow the native state. `None` once finalized.
    ///
    /// Call [`refresh_external_memory`](Self::refresh_external_memory)
    /// afterwards if the state grew or shrank.
    pub fn with_state_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.inner.state.borrow_mut().as_mut().map(f)
    }

    /// Bytes currently charged for this object.
    pub fn external_memory(&self) -> usize {
        self.inner.memory.borrow().amount()
    }

    /// Re-measure the native state and update the environment's account.
    ///
    /// Fails with `ExternalMemoryLimit` if growth does not fit; the previous
    /// charge stays in effect.
    pub fn refresh_external_memory(&self) -> Result<usize> {
        let size = match self.inner.state.borrow().as_ref() {
            Some(state) => state.external_memory_size(),
            None => return Ok(0),
        };

        self.inner.memory.borrow_mut().resize(size)?;
        Ok(size)
    }

    /// Whether the collector may reclaim the handle.
    pub fn is_weak(&self) -> bool {
        self.inner.weak.get()
    }

    /// Make the handle weak again after [`clear_weak`](Self::clear_weak).
    pub fn make_weak(&self) -> Result<()> {
        if self.is_finalized() {
            return Err(HostError::InvalidHandle);
        }

        if self.inner.weak.get() {
            return Ok(());
        }

        self.inner
            .adapter
            .register_weak_finalizer(self.handle(), self.inner.weak_callback())?;
        self.inner.weak.set(true);
        Ok(())
    }

    /// Make the handle strong: the collector keeps it alive until
    /// [`make_weak`](Self::make_weak), finalize, or teardown.
    pub fn clear_weak(&self) {
        if self.is_finalized() || !self.inner.weak.get() {
            return;
        }

        self.inner.adapter.clear_weak(self.handle());
        self.inner.weak.set(false);
    }
}

impl<T: NativeState + 'static> std::fmt::Debug for WrappedObject<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrappedObject")
            .field("id", &self.inner.id)
            .field("handle", &self.inner.handle.get())
            .field("finalized", &self.inner.finalized.get())
            .field("weak", &self.inner.weak.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::EventLoop;
    use crate::local_heap::LocalHeap;

    struct Counted(Rc<Cell<u32>>);

    impl NativeState for Counted {}

    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    fn setup() -> (Rc<LocalHeap>, EventLoop, Environment) {
        let heap = Rc::new(LocalHeap::new());
        let event_loop = EventLoop::new("wrapped");
        let env = Environment::new(&event_loop, heap.clone()).unwrap();
        (heap, event_loop, env)
    }

    #[test]
    fn test_finalize_releases_once() {
        let (heap, _event_loop, env) = setup();
        let drops = Rc::new(Cell::new(0));

        let handle = heap.create_handle(None);
        let object = WrappedObject::new(&env, handle, Counted(drops.clone())).unwrap();
        assert_eq!(env.tracked_count(), 1);
        assert_eq!(object.handle(), handle);

        assert!(object.finalize());
        assert_eq!(drops.get(), 1);
        assert!(object.handle().is_empty());
        assert_eq!(env.tracked_count(), 0);

        assert!(!object.finalize());
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn test_collector_finalizes() {
        let (heap, _event_loop, env) = setup();
        let drops = Rc::new(Cell::new(0));

        let object = env.wrap(Counted(drops.clone())).unwrap();
        heap.drop_reference(object.handle());
        heap.collect_garbage();

        assert_eq!(drops.get(), 1);
        assert!(object.is_finalized());
        assert_eq!(env.tracked_count(), 0);
    }

    #[test]
    fn test_empty_handle_rejected() {
        let (_heap, _event_loop, env) = setup();

        let err = WrappedObject::new(&env, ScriptHandle::empty(), ()).unwrap_err();
        assert_eq!(err, HostError::InvalidHandle);
        assert_eq!(env.tracked_count(), 0);
    }

    #[test]
    fn test_handle_wrapped_twice_rejected() {
        let (heap, _event_loop, env) = setup();
        let handle = heap.create_handle(None);

        let _first = WrappedObject::new(&env, handle, ()).unwrap();
        let err = WrappedObject::new(&env, handle, ()).unwrap_err();
        assert_eq!(err, HostError::HandleAlreadyWrapped);
        assert_eq!(env.tracked_count(), 1);
    }

    #[test]
    fn test_strong_handle_survives_collection() {
        let (heap, _event_loop, env) = setup();
        let drops = Rc::new(Cell::new(0));

        let object = env.wrap(Counted(drops.clone())).unwrap();
        object.clear_weak();
        assert!(!object.is_weak());
        assert!(!heap.is_weak(object.handle()));

        heap.drop_reference(object.handle());
        heap.collect_garbage();
        assert_eq!(drops.get(), 0);

        object.make_weak().unwrap();
        heap.collect_garbage();
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn test_unwrap_round_trip() {
        let (_heap, _event_loop, env) = setup();
        let object = env.wrap(String::from("payload")).unwrap();

        let found: WrappedObject<String> = env.unwrap(object.handle()).unwrap();
        assert_eq!(found.id(), object.id());
        assert_eq!(found.with_state(|s| s.clone()).as_deref(), Some("payload"));

        // Wrong type
        assert!(env.unwrap::<Vec<u8>>(object.handle()).is_none());

        object.finalize();
        assert!(env.unwrap::<String>(object.handle()).is_none());
    }
}
