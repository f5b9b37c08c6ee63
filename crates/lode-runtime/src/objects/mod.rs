//! Heap objects with declared fields.

mod instance;

pub use instance::Instance;
