//! Contract between the host and the script engine's handle machinery.
//!
//! The engine's value representation, collector and scope machinery stay
//! behind [`HandleAdapter`]. Everything in this crate reaches the engine
//! through these calls and nothing else.

use crate::error::Result;

/// Identifier of a handle slot inside an adapter.
///
/// `space` distinguishes engine instances so a handle minted by one adapter
/// is never mistaken for a live handle of another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId {
    space: u32,
    slot: u32,
    generation: u32,
}

impl HandleId {
    pub fn new(space: u32, slot: u32, generation: u32) -> Self {
        Self {
            space,
            slot,
            generation,
        }
    }

    pub fn space(&self) -> u32 {
        self.space
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// A reference to a value in the engine heap. May be empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ScriptHandle(Option<HandleId>);

impl ScriptHandle {
    /// The empty handle.
    pub const fn empty() -> Self {
        Self(None)
    }

    pub fn from_id(id: HandleId) -> Self {
        Self(Some(id))
    }

    pub fn id(&self) -> Option<HandleId> {
        self.0
    }

    /// True if this handle denotes nothing. Says nothing about liveness;
    /// use [`HandleAdapter::is_handle_empty`] for that.
    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }
}

/// Identity of a wrapped object, stored in its handle's internal field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl ObjectId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Callback run by the collector when a weak handle becomes unreachable.
pub type WeakCallback = Box<dyn FnOnce() + 'static>;

/// Operations the host needs from the engine.
///
/// Implementations are single-threaded: every call, including weak
/// callbacks, happens on the thread that owns the engine instance. Weak
/// callbacks must be invoked without any internal borrow held, since they
/// call back into the adapter.
pub trait HandleAdapter {
    /// Allocate an engine-visible object, optionally tagged with the id of
    /// the native object it wraps.
    fn create_handle(&self, internal: Option<ObjectId>) -> ScriptHandle;

    /// Make `handle` weak and arrange for `callback` to run exactly once when
    /// the collector finds it unreachable. Replaces any previous callback.
    /// The callback never runs if the handle is released first.
    fn register_weak_finalizer(&self, handle: ScriptHandle, callback: WeakCallback) -> Result<()>;

    /// Make `handle` strong again, dropping its weak callback without running
    /// it. Returns whether the handle was weak.
    fn clear_weak(&self, handle: ScriptHandle) -> bool;

    /// Liveness probe: true for the empty handle and for handles that were
    /// collected, released, or minted by another adapter.
    fn is_handle_empty(&self, handle: ScriptHandle) -> bool;

    /// Release `handle` now, bypassing the collector. No-op on dead handles.
    fn release_handle(&self, handle: ScriptHandle);

    /// Read the internal field of a live handle.
    fn internal_field(&self, handle: ScriptHandle) -> Option<ObjectId>;

    /// Write the internal field of a live handle.
    fn set_internal_field(&self, handle: ScriptHandle, value: Option<ObjectId>) -> Result<()>;

    /// Tell the engine that native memory kept alive by its objects changed
    /// by `delta` bytes, so the collector can schedule itself accordingly.
    fn adjust_external_memory(&self, _delta: i64) {}
}
