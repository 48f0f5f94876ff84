//! NativeState trait for resources owned by wrapped objects.

use std::collections::HashMap;

/// A native resource that can be bound to a script handle.
///
/// The resource is released by dropping it, so any cleanup belongs in its
/// `Drop` impl. `external_memory_size` reports how much memory the resource
/// keeps alive outside the engine heap; the owning environment charges this
/// against its memory limit and reports it to the engine.
///
/// # Example
///
/// ```ignore
/// use openworkers_host_env::NativeState;
///
/// struct ImageBuffer {
///     pixels: Vec<u8>,
///     metadata: String,
/// }
///
/// impl NativeState for ImageBuffer {
///     fn external_memory_size(&self) -> usize {
///         self.pixels.capacity() + self.metadata.capacity()
///     }
/// }
/// ```
///
/// # With derive macro
///
/// ```ignore
/// #[derive(NativeState)]
/// struct ImageBuffer {
///     #[native(track)]
///     pixels: Vec<u8>,
///     #[native(track)]
///     metadata: String,
///     width: u32,
///     height: u32,
/// }
/// ```
pub trait NativeState {
    /// Size in bytes of memory held outside the engine heap.
    ///
    /// Include heap allocations, mapped files and buffers owned by native
    /// handles. Do not include the inline size of `self`.
    fn external_memory_size(&self) -> usize {
        0
    }
}

impl NativeState for () {}

impl NativeState for Vec<u8> {
    fn external_memory_size(&self) -> usize {
        self.capacity()
    }
}

impl NativeState for String {
    fn external_memory_size(&self) -> usize {
        self.capacity()
    }
}

impl NativeState for bytes::Bytes {
    fn external_memory_size(&self) -> usize {
        // Shared backing storage is counted by every owner of a view.
        self.len()
    }
}

impl NativeState for bytes::BytesMut {
    fn external_memory_size(&self) -> usize {
        self.capacity()
    }
}

impl<T: NativeState> NativeState for Option<T> {
    fn external_memory_size(&self) -> usize {
        self.as_ref().map(|v| v.external_memory_size()).unwrap_or(0)
    }
}

impl<T: NativeState> NativeState for Box<T> {
    fn external_memory_size(&self) -> usize {
        std::mem::size_of::<T>() + (**self).external_memory_size()
    }
}

impl<T: NativeState> NativeState for std::rc::Rc<T> {
    fn external_memory_size(&self) -> usize {
        // Only the sole owner accounts for the allocation
        if std::rc::Rc::strong_count(self) == 1 {
            std::mem::size_of::<T>() + (**self).external_memory_size()
        } else {
            0
        }
    }
}

impl<T: NativeState> NativeState for std::sync::Arc<T> {
    fn external_memory_size(&self) -> usize {
        if std::sync::Arc::strong_count(self) == 1 {
            std::mem::size_of::<T>() + (**self).external_memory_size()
        } else {
            0
        }
    }
}

impl<T: NativeState> NativeState for Vec<T> {
    fn external_memory_size(&self) -> usize {
        let base = self.capacity() * std::mem::size_of::<T>();
        let contents: usize = self.iter().map(|v| v.external_memory_size()).sum();
        base + contents
    }
}

impl<V: NativeState> NativeState for HashMap<String, V> {
    fn external_memory_size(&self) -> usize {
        let base = self.capacity() * std::mem::size_of::<(String, V)>();
        let contents: usize = self
            .iter()
            .map(|(k, v)| k.capacity() + v.external_memory_size())
            .sum();
        base + contents
    }
}
