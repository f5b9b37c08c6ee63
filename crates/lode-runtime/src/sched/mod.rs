//! Cooperative scheduling: job queue, promises and continuations.

mod continuation;
mod promise;
mod scheduler;

pub use continuation::{Continuation, Frame, Step};
pub use promise::{Maybe, Promise, Resolver, Settlement};
pub use scheduler::{EventSource, Job, Scheduler};
