//! In-process handle table implementing [`HandleAdapter`].
//!
//! `LocalHeap` stands in for an engine when the embedder wants deterministic
//! control over reachability: tests, benchmarks, and hosts whose "script
//! objects" are plain slots. Script reachability is driven explicitly with
//! [`LocalHeap::drop_reference`] / [`LocalHeap::retain`], and a collector pass
//! runs only when [`LocalHeap::collect_garbage`] is called.
//!
//! Collection rules:
//! - A handle is a root while it is strong (no weak callback registered)
//! - A weak handle survives a pass while the script still references it
//! - An unreachable weak handle is freed and its callback runs exactly once

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::adapter::{HandleAdapter, HandleId, ObjectId, ScriptHandle, WeakCallback};
use crate::error::{HostError, Result};
use crate::gc::DeferredFinalizers;

static NEXT_HEAP_ID: AtomicU32 = AtomicU32::new(1);

struct Entry {
    reachable: bool,
    finalizer: Option<WeakCallback>,
    internal: Option<ObjectId>,
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

#[derive(Default)]
struct Table {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl Table {
    fn entry(&self, space: u32, handle: ScriptHandle) -> Option<&Entry> {
        let id = handle.id().filter(|id| id.space() == space)?;
        let slot = self.slots.get(id.slot() as usize)?;

        if slot.generation != id.generation() {
            return None;
        }

        slot.entry.as_ref()
    }

    fn entry_mut(&mut self, space: u32, handle: ScriptHandle) -> Option<&mut Entry> {
        let id = handle.id().filter(|id| id.space() == space)?;
        let slot = self.slots.get_mut(id.slot() as usize)?;

        if slot.generation != id.generation() {
            return None;
        }

        slot.entry.as_mut()
    }

    fn free(&mut self, index: u32) -> Option<Entry> {
        let slot = &mut self.slots[index as usize];
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
        self.live -= 1;
        Some(entry)
    }
}

/// A handle table with an explicit collector.
pub struct LocalHeap {
    id: u32,
    table: RefCell<Table>,
    pending: DeferredFinalizers,
    external_memory: Cell<i64>,
    collections: Cell<u64>,
}

impl Default for LocalHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalHeap {
    pub fn new() -> Self {
        Self {
            id: NEXT_HEAP_ID.fetch_add(1, Ordering::Relaxed),
            table: RefCell::new(Table::default()),
            pending: DeferredFinalizers::new(),
            external_memory: Cell::new(0),
            collections: Cell::new(0),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// The script no longer references `handle`. A weak handle becomes
    /// eligible for collection; a strong one stays alive.
    pub fn drop_reference(&self, handle: ScriptHandle) {
        if let Some(entry) = self.table.borrow_mut().entry_mut(self.id, handle) {
            entry.reachable = false;
        }
    }

    /// The script references `handle` again.
    pub fn retain(&self, handle: ScriptHandle) {
        if let Some(entry) = self.table.borrow_mut().entry_mut(self.id, handle) {
            entry.reachable = true;
        }
    }

    /// Whether `handle` is weak (has a pending weak callback).
    pub fn is_weak(&self, handle: ScriptHandle) -> bool {
        self.table
            .borrow()
            .entry(self.id, handle)
            .is_some_and(|entry| entry.finalizer.is_some())
    }

    /// Run a collector pass. Returns the number of handles collected.
    ///
    /// Weak callbacks run after the pass, on this thread, with no borrow of
    /// the table held.
    pub fn collect_garbage(&self) -> usize {
        let collected = {
            let mut table = self.table.borrow_mut();

            let doomed: Vec<u32> = table
                .slots
                .iter()
                .enumerate()
                .filter_map(|(index, slot)| {
                    let entry = slot.entry.as_ref()?;
                    (!entry.reachable && entry.finalizer.is_some()).then_some(index as u32)
                })
                .collect();

            for &index in &doomed {
                if let Some(callback) = table.free(index).and_then(|entry| entry.finalizer) {
                    self.pending.defer(callback);
                }
            }

            doomed.len()
        };

        self.collections.set(self.collections.get() + 1);
        let finalized = self.pending.process_all();

        tracing::debug!(
            "Heap {} collector pass: {} collected, {} finalizers run",
            self.id,
            collected,
            finalized
        );

        collected
    }

    /// Number of live handles.
    pub fn live_handles(&self) -> usize {
        self.table.borrow().live
    }

    /// Net external memory reported through `adjust_external_memory`.
    pub fn external_memory(&self) -> i64 {
        self.external_memory.get()
    }

    /// Number of collector passes run.
    pub fn collections(&self) -> u64 {
        self.collections.get()
    }
}

impl HandleAdapter for LocalHeap {
    fn create_handle(&self, internal: Option<ObjectId>) -> ScriptHandle {
        let mut table = self.table.borrow_mut();
        let entry = Entry {
            reachable: true,
            finalizer: None,
            internal,
        };

        let index = match table.free.pop() {
            Some(index) => {
                table.slots[index as usize].entry = Some(entry);
                index
            }
            None => {
                table.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                (table.slots.len() - 1) as u32
            }
        };

        table.live += 1;
        let generation = table.slots[index as usize].generation;

        ScriptHandle::from_id(HandleId::new(self.id, index, generation))
    }

    fn register_weak_finalizer(&self, handle: ScriptHandle, callback: WeakCallback) -> Result<()> {
        let mut table = self.table.borrow_mut();
        let entry = table
            .entry_mut(self.id, handle)
            .ok_or(HostError::InvalidHandle)?;

        // Replaced callbacks are dropped, never run
        entry.finalizer = Some(callback);
        Ok(())
    }

    fn clear_weak(&self, handle: ScriptHandle) -> bool {
        let previous = self
            .table
            .borrow_mut()
            .entry_mut(self.id, handle)
            .and_then(|entry| entry.finalizer.take());

        // Dropped outside the borrow: the callback may own values with Drop impls
        previous.is_some()
    }

    fn is_handle_empty(&self, handle: ScriptHandle) -> bool {
        self.table.borrow().entry(self.id, handle).is_none()
    }

    fn release_handle(&self, handle: ScriptHandle) {
        let released = {
            let mut table = self.table.borrow_mut();

            match handle.id() {
                Some(id) if table.entry(self.id, handle).is_some() => table.free(id.slot()),
                _ => None,
            }
        };

        if released.is_some() {
            tracing::trace!("Heap {} released handle {:?}", self.id, handle);
        }
    }

    fn internal_field(&self, handle: ScriptHandle) -> Option<ObjectId> {
        self.table
            .borrow()
            .entry(self.id, handle)
            .and_then(|entry| entry.internal)
    }

    fn set_internal_field(&self, handle: ScriptHandle, value: Option<ObjectId>) -> Result<()> {
        let mut table = self.table.borrow_mut();
        let entry = table
            .entry_mut(self.id, handle)
            .ok_or(HostError::InvalidHandle)?;

        entry.internal = value;
        Ok(())
    }

    fn adjust_external_memory(&self, delta: i64) {
        self.external_memory.set(self.external_memory.get() + delta);
    }
}

impl std::fmt::Debug for LocalHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalHeap")
            .field("id", &self.id)
            .field("live_handles", &self.live_handles())
            .field("external_memory", &self.external_memory.get())
            .field("collections", &self.collections.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn counter() -> (Rc<Cell<u32>>, WeakCallback) {
        let hits = Rc::new(Cell::new(0));
        let inner = hits.clone();
        (hits, Box::new(move || inner.set(inner.get() + 1)))
    }

    #[test]
    fn test_create_and_release() {
        let heap = LocalHeap::new();
        let handle = heap.create_handle(None);

        assert!(!handle.is_empty());
        assert!(!heap.is_handle_empty(handle));
        assert_eq!(heap.live_handles(), 1);

        heap.release_handle(handle);
        assert!(heap.is_handle_empty(handle));
        assert_eq!(heap.live_handles(), 0);

        // Releasing twice is a no-op
        heap.release_handle(handle);
        assert_eq!(heap.live_handles(), 0);
    }

    #[test]
    fn test_empty_handle_is_empty() {
        let heap = LocalHeap::new();
        assert!(heap.is_handle_empty(ScriptHandle::empty()));
    }

    #[test]
    fn test_weak_callback_runs_once_when_unreachable() {
        let heap = LocalHeap::new();
        let handle = heap.create_handle(None);
        let (hits, callback) = counter();
        heap.register_weak_finalizer(handle, callback).unwrap();

        // Still referenced by script
        assert_eq!(heap.collect_garbage(), 0);
        assert_eq!(hits.get(), 0);

        heap.drop_reference(handle);
        assert_eq!(heap.collect_garbage(), 1);
        assert_eq!(hits.get(), 1);
        assert!(heap.is_handle_empty(handle));

        assert_eq!(heap.collect_garbage(), 0);
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn test_strong_handle_survives_collection() {
        let heap = LocalHeap::new();
        let handle = heap.create_handle(None);
        heap.drop_reference(handle);

        assert_eq!(heap.collect_garbage(), 0);
        assert!(!heap.is_handle_empty(handle));
    }

    #[test]
    fn test_clear_weak_drops_callback() {
        let heap = LocalHeap::new();
        let handle = heap.create_handle(None);
        let (hits, callback) = counter();
        heap.register_weak_finalizer(handle, callback).unwrap();

        assert!(heap.clear_weak(handle));
        assert!(!heap.clear_weak(handle));

        heap.drop_reference(handle);
        assert_eq!(heap.collect_garbage(), 0);
        assert_eq!(hits.get(), 0);
    }

    #[test]
    fn test_release_skips_callback() {
        let heap = LocalHeap::new();
        let handle = heap.create_handle(None);
        let (hits, callback) = counter();
        heap.register_weak_finalizer(handle, callback).unwrap();

        heap.release_handle(handle);
        heap.collect_garbage();
        assert_eq!(hits.get(), 0);
    }

    #[test]
    fn test_stale_handle_after_slot_reuse() {
        let heap = LocalHeap::new();
        let first = heap.create_handle(None);
        heap.release_handle(first);

        let second = heap.create_handle(None);
        assert_eq!(first.id().unwrap().slot(), second.id().unwrap().slot());
        assert!(heap.is_handle_empty(first));
        assert!(!heap.is_handle_empty(second));
    }

    #[test]
    fn test_foreign_handle_is_empty() {
        let a = LocalHeap::new();
        let b = LocalHeap::new();
        let handle = a.create_handle(None);

        assert!(b.is_handle_empty(handle));
        assert!(b.register_weak_finalizer(handle, Box::new(|| {})).is_err());
    }

    #[test]
    fn test_internal_field() {
        let heap = LocalHeap::new();
        let handle = heap.create_handle(Some(ObjectId::new(7)));
        assert_eq!(heap.internal_field(handle), Some(ObjectId::new(7)));

        heap.set_internal_field(handle, None).unwrap();
        assert_eq!(heap.internal_field(handle), None);

        heap.release_handle(handle);
        assert_eq!(
            heap.set_internal_field(handle, None),
            Err(HostError::InvalidHandle)
        );
    }

    #[test]
    fn test_callback_may_reenter_heap() {
        let heap = Rc::new(LocalHeap::new());
        let handle = heap.create_handle(None);
        let other = heap.create_handle(None);

        let inner = heap.clone();
        heap.register_weak_finalizer(
            handle,
            Box::new(move || {
                assert!(inner.is_handle_empty(handle));
                inner.release_handle(other);
            }),
        )
        .unwrap();

        heap.drop_reference(handle);
        heap.collect_garbage();
        assert!(heap.is_handle_empty(other));
        assert_eq!(heap.live_handles(), 0);
    }

    #[test]
    fn test_external_memory_adjustments() {
        let heap = LocalHeap::new();
        heap.adjust_external_memory(1024);
        heap.adjust_external_memory(-24);
        assert_eq!(heap.external_memory(), 1000);
    }
}
