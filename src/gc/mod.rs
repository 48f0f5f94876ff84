//! Native memory accounting and deferred finalization.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  NativeState trait                                          │
//! │  └── external_memory_size() → usize                         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  ExternalMemoryGuard (RAII, one per wrapped object)         │
//! │  ├── Charges the environment's MemoryAccount                │
//! │  ├── Reports deltas to the engine via HandleAdapter         │
//! │  └── Credits both back when dropped or released             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  MemoryAccount (one per environment)                        │
//! │  └── Refuses charges beyond the configured limit            │
//! └─────────────────────────────────────────────────────────────┘
//!
//! ┌─────────────────────────────────────────────────────────────┐
//! │  DeferredFinalizers                                         │
//! │  ├── Weak callbacks queued during a collector pass          │
//! │  └── Drained once the handle table is no longer borrowed    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod deferred_finalization;
mod memory_account;
mod native_state;

pub use deferred_finalization::DeferredFinalizers;
pub use memory_account::{ExternalMemoryGuard, MemoryAccount};
pub use native_state::NativeState;
