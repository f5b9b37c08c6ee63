//! # lode-vm
//!
//! Composition root of the Lode runtime.
//!
//! - `module` - module arena, type declaration surface, ordered init
//! - `worker` - worker bridge, remote endpoint, island threads
//! - `envelope` - worker call wire format
//! - `transport` - message pipes between runtimes

pub mod envelope;
pub mod module;
pub mod transport;
pub mod worker;

pub use envelope::{Envelope, EnvelopeKind, WireValue};
pub use module::{Module, ModuleId, ModuleRegistry, ModuleScope};
pub use transport::{channel_pair, ChannelTransport, Message, Transport};
pub use worker::{spawn_island, Island, WorkerBridge, WorkerEndpoint, WorkerFn, WorkerProxy};
