//! The runtime handle: type registry, scheduler and configuration of one
//! event loop.

use std::rc::Rc;

use crate::config::RuntimeConfig;
use crate::error::RuntimeResult;
use crate::registry::TypeRegistry;
use crate::sched::{Promise, Scheduler};
use crate::value::Value;

struct RuntimeInner {
    types: TypeRegistry,
    scheduler: Scheduler,
    config: RuntimeConfig,
}

/// Cheaply clonable handle. Everything reachable from it is single-threaded;
/// a second event loop (worker island) owns its own `Runtime`.
#[derive(Clone)]
pub struct Runtime(Rc<RuntimeInner>);

impl Runtime {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        let scheduler = Scheduler::new(config.scheduler.max_jobs_per_run);
        Runtime(Rc::new(RuntimeInner {
            types: TypeRegistry::new(),
            scheduler,
            config,
        }))
    }

    #[inline]
    pub fn types(&self) -> &TypeRegistry {
        &self.0.types
    }

    #[inline]
    pub fn scheduler(&self) -> &Scheduler {
        &self.0.scheduler
    }

    #[inline]
    pub fn config(&self) -> &RuntimeConfig {
        &self.0.config
    }

    /// Drive the event loop until `promise` settles.
    pub fn block_on(&self, promise: &Promise) -> RuntimeResult<Value> {
        self.0.scheduler.block_on(promise)
    }

    pub fn run_until_idle(&self) -> RuntimeResult<usize> {
        self.0.scheduler.run_until_idle()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}
