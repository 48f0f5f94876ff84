#![allow(dead_code)]

use openworkers_host_env::{Environment, EnvironmentConfig, EventLoop, LocalHeap, NativeState};
use std::cell::Cell;
use std::rc::Rc;
use tokio::task::LocalSet;

/// Runs an async function inside a LocalSet.
/// Required for tests that spawn environment tasks.
pub async fn run_in_local<F, Fut, T>(f: F) -> T
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = T>,
{
    let local = LocalSet::new();
    local.run_until(f()).await
}

/// Install a test subscriber so `tracing` output shows up with `--nocapture`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();
}

/// A heap, a loop and an environment bound to both.
pub struct Fixture {
    pub heap: Rc<LocalHeap>,
    pub event_loop: EventLoop,
    pub env: Environment,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(EnvironmentConfig::named("test"))
    }

    pub fn with_config(config: EnvironmentConfig) -> Self {
        init_tracing();

        let heap = Rc::new(LocalHeap::new());
        let event_loop = EventLoop::new("test-loop");
        let env = Environment::with_config(&event_loop, heap.clone(), config)
            .expect("environment should bind to a fresh loop");

        Self {
            heap,
            event_loop,
            env,
        }
    }
}

/// Native resource that counts how many times it was released.
pub struct DropCounter {
    releases: Rc<Cell<u32>>,
    size: usize,
}

impl DropCounter {
    pub fn new() -> (Self, Rc<Cell<u32>>) {
        Self::with_size(0)
    }

    pub fn with_size(size: usize) -> (Self, Rc<Cell<u32>>) {
        let releases = Rc::new(Cell::new(0));
        (
            Self {
                releases: releases.clone(),
                size,
            },
            releases,
        )
    }

    pub fn grow(&mut self, bytes: usize) {
        self.size += bytes;
    }
}

impl NativeState for DropCounter {
    fn external_memory_size(&self) -> usize {
        self.size
    }
}

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.releases.set(self.releases.get() + 1);
    }
}
