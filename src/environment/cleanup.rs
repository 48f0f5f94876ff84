//! Ordered shutdown callbacks for an environment.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};

use crate::error::{BoxError, CleanupHookError};

/// Identifies a registered cleanup hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CleanupToken(u64);

impl CleanupToken {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// A shutdown callback contributed by a subsystem.
pub type CleanupHook = Box<dyn FnOnce() -> Result<(), BoxError> + 'static>;

/// Outcome of running every hook.
#[derive(Debug, Default)]
pub(crate) struct CleanupOutcome {
    pub hooks_run: usize,
    pub failures: Vec<CleanupHookError>,
}

/// Hooks in registration order.
///
/// Tokens grow monotonically, so ordering by token is registration order.
#[derive(Default)]
pub struct CleanupRegistry {
    hooks: BTreeMap<CleanupToken, CleanupHook>,
    next_token: u64,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a hook. Returns the token used to withdraw it.
    pub fn register(&mut self, hook: CleanupHook) -> CleanupToken {
        self.next_token += 1;
        let token = CleanupToken(self.next_token);
        self.hooks.insert(token, hook);
        token
    }

    /// Withdraw a hook that has not run yet.
    ///
    /// Unknown, already-run and already-removed tokens are ignored. Returns
    /// whether a hook was removed.
    pub fn deregister(&mut self, token: CleanupToken) -> bool {
        self.hooks.remove(&token).is_some()
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run every hook FIFO until the registry is empty.
    ///
    /// Hooks are taken out one at a time and run with no borrow held, so a
    /// hook may register or deregister other hooks. Failures (errors, and
    /// panics when `catch_panics` is set) are collected and the remaining
    /// hooks still run.
    pub(crate) fn run_all(registry: &RefCell<Self>, catch_panics: bool) -> CleanupOutcome {
        let mut outcome = CleanupOutcome::default();

        loop {
            let Some((token, hook)) = registry.borrow_mut().hooks.pop_first() else {
                break;
            };

            outcome.hooks_run += 1;

            let result = if catch_panics {
                catch_unwind(AssertUnwindSafe(hook)).map_err(|payload| CleanupHookError {
                    token,
                    message: panic_message(payload.as_ref()),
                    panicked: true,
                })
            } else {
                Ok(hook())
            };

            match result {
                Ok(Ok(())) => {
                    tracing::trace!("Cleanup hook {:?} completed", token);
                }
                Ok(Err(err)) => outcome.failures.push(CleanupHookError {
                    token,
                    message: err.to_string(),
                    panicked: false,
                }),
                Err(failure) => outcome.failures.push(failure),
            }
        }

        outcome
    }
}

impl std::fmt::Debug for CleanupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupRegistry")
            .field("pending", &self.hooks.len())
            .field("next_token", &self.next_token)
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "cleanup hook panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn recording(log: &Rc<RefCell<Vec<u32>>>, id: u32) -> CleanupHook {
        let log = log.clone();
        Box::new(move || -> Result<(), BoxError> {
            log.borrow_mut().push(id);
            Ok(())
        })
    }

    #[test]
    fn test_runs_in_registration_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let registry = RefCell::new(CleanupRegistry::new());

        for id in 1..=4 {
            registry.borrow_mut().register(recording(&log, id));
        }

        let outcome = CleanupRegistry::run_all(&registry, true);
        assert_eq!(outcome.hooks_run, 4);
        assert!(outcome.failures.is_empty());
        assert_eq!(*log.borrow(), vec![1, 2, 3, 4]);
        assert!(registry.borrow().is_empty());
    }

    #[test]
    fn test_deregister_is_noop_for_unknown_token() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut registry = CleanupRegistry::new();
        let token = registry.register(recording(&log, 1));

        assert!(registry.deregister(token));
        assert!(!registry.deregister(token));
        assert!(!registry.deregister(CleanupToken(999)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_failures_are_collected() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let registry = RefCell::new(CleanupRegistry::new());

        registry.borrow_mut().register(recording(&log, 1));
        let failing = registry
            .borrow_mut()
            .register(Box::new(|| -> Result<(), BoxError> {
                Err("disk detached".into())
            }));
        let panicking = registry
            .borrow_mut()
            .register(Box::new(|| -> Result<(), BoxError> {
                panic!("hook exploded")
            }));
        registry.borrow_mut().register(recording(&log, 4));

        let outcome = CleanupRegistry::run_all(&registry, true);
        assert_eq!(outcome.hooks_run, 4);
        assert_eq!(*log.borrow(), vec![1, 4]);
        assert_eq!(outcome.failures.len(), 2);

        assert_eq!(outcome.failures[0].token, failing);
        assert_eq!(outcome.failures[0].message, "disk detached");
        assert!(!outcome.failures[0].panicked);

        assert_eq!(outcome.failures[1].token, panicking);
        assert_eq!(outcome.failures[1].message, "hook exploded");
        assert!(outcome.failures[1].panicked);
    }

    #[test]
    fn test_hook_can_withdraw_later_hook() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let registry = Rc::new(RefCell::new(CleanupRegistry::new()));

        let pending = Rc::new(RefCell::new(None));
        let first = {
            let registry = registry.clone();
            let pending = pending.clone();
            Box::new(move || -> Result<(), BoxError> {
                if let Some(token) = pending.borrow_mut().take() {
                    registry.borrow_mut().deregister(token);
                }
                Ok(())
            })
        };

        registry.borrow_mut().register(first);
        let second = registry.borrow_mut().register(recording(&log, 2));
        *pending.borrow_mut() = Some(second);

        let outcome = CleanupRegistry::run_all(&registry, true);
        assert_eq!(outcome.hooks_run, 1);
        assert!(log.borrow().is_empty());
    }
}
