//! Per-environment accounting of native memory held by wrapped objects.
//!
//! The engine's own heap limits only cover script values. Native state bound
//! to handles lives outside that heap, so each environment keeps its own
//! account and refuses to wrap resources that would push it over the limit.
//!
//! ## How it works
//!
//! 1. Wrapping a resource charges its `external_memory_size()` to the account
//! 2. If the limit would be exceeded, the charge is rolled back and wrapping fails
//! 3. Accepted charges are also reported to the engine via the adapter
//! 4. Finalizing the wrapped object drops its guard, which credits both back

use std::cell::Cell;
use std::rc::{Rc, Weak};

use crate::adapter::HandleAdapter;
use crate::error::{HostError, Result};

/// Native memory budget for one environment.
///
/// A limit of 0 means unlimited.
pub struct MemoryAccount {
    /// Maximum allowed bytes
    max: usize,
    /// Bytes currently charged
    count: Cell<usize>,
    /// Set once a charge was refused
    limit_hit: Cell<bool>,
}

impl MemoryAccount {
    pub fn new(max_bytes: usize) -> Rc<Self> {
        Rc::new(Self {
            max: max_bytes,
            count: Cell::new(0),
            limit_hit: Cell::new(false),
        })
    }

    /// Charge `n` bytes, or fail without changing the balance.
    pub fn try_charge(&self, n: usize) -> Result<()> {
        let in_use = self.count.get();
        let total = in_use.saturating_add(n);

        if self.max != 0 && total > self.max {
            log::warn!(
                "External memory charge denied: {} bytes requested, {} of {} in use",
                n,
                in_use,
                self.max
            );
            self.limit_hit.set(true);
            return Err(HostError::ExternalMemoryLimit {
                requested: n,
                in_use,
                limit: self.max,
            });
        }

        self.count.set(total);
        Ok(())
    }

    /// Return `n` previously charged bytes.
    pub fn credit(&self, n: usize) {
        self.count.set(self.count.get().saturating_sub(n));
    }

    pub fn current_usage(&self) -> usize {
        self.count.get()
    }

    pub fn limit(&self) -> usize {
        self.max
    }

    /// Whether any charge has been refused since creation.
    pub fn limit_hit(&self) -> bool {
        self.limit_hit.get()
    }
}

impl std::fmt::Debug for MemoryAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryAccount")
            .field("max", &self.max)
            .field("count", &self.count.get())
            .field("limit_hit", &self.limit_hit.get())
            .finish()
    }
}

/// RAII charge against a [`MemoryAccount`].
///
/// When created, charges the account and reports the amount to the engine.
/// When dropped, credits the account and reports the negative amount, unless
/// the engine is already gone.
pub struct ExternalMemoryGuard {
    account: Option<Rc<MemoryAccount>>,
    adapter: Option<Weak<dyn HandleAdapter>>,
    amount: usize,
}

impl ExternalMemoryGuard {
    /// Charge `amount` bytes to `account` and report them to `adapter`.
    pub fn charge(
        account: &Rc<MemoryAccount>,
        adapter: &Rc<dyn HandleAdapter>,
        amount: usize,
    ) -> Result<Self> {
        account.try_charge(amount)?;

        if amount != 0 {
            adapter.adjust_external_memory(amount as i64);
            log::trace!("Charged external memory: {} bytes", amount);
        }

        Ok(Self {
            account: Some(Rc::clone(account)),
            adapter: Some(Rc::downgrade(adapter)),
            amount,
        })
    }

    /// A guard that tracks nothing.
    pub fn empty() -> Self {
        Self {
            account: None,
            adapter: None,
            amount: 0,
        }
    }

    /// Move the charge to `new_amount`. Growth is charged and may fail, in
    /// which case the previous amount stays in effect.
    pub fn resize(&mut self, new_amount: usize) -> Result<()> {
        let Some(account) = &self.account else {
            return Ok(());
        };

        if new_amount > self.amount {
            account.try_charge(new_amount - self.amount)?;
        } else {
            account.credit(self.amount - new_amount);
        }

        let delta = new_amount as i64 - self.amount as i64;
        self.amount = new_amount;
        self.report(delta);
        Ok(())
    }

    /// Credit everything back now. Idempotent.
    pub fn release(&mut self) {
        if let Some(account) = self.account.take() {
            account.credit(self.amount);
            self.report(-(self.amount as i64));
            self.amount = 0;
        }
    }

    pub fn amount(&self) -> usize {
        self.amount
    }

    fn report(&self, delta: i64) {
        if delta == 0 {
            return;
        }

        match self.adapter.as_ref().and_then(|adapter| adapter.upgrade()) {
            Some(adapter) => {
                adapter.adjust_external_memory(delta);
                log::trace!("Adjusted external memory: {} bytes", delta);
            }
            None => log::trace!("Engine gone, dropped external memory adjustment: {} bytes", delta),
        }
    }
}

impl Drop for ExternalMemoryGuard {
    fn drop(&mut self) {
        self.release();
    }
}

impl Default for ExternalMemoryGuard {
    fn default() -> Self {
        Self::empty()
    }
}

impl std::fmt::Debug for ExternalMemoryGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalMemoryGuard")
            .field("amount", &self.amount)
            .finish()
    }
}
