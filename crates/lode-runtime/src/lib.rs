//! # lode-runtime
//!
//! Single-threaded runtime support for compiled Lode programs.
//!
//! - `registry` - type descriptors, generic instantiation, conformance
//! - `value`, `boxing` - host values, typed boxes, casts, equality
//! - `objects` - struct instances with lazy field validation
//! - `sched` - job queue, promises, continuations
//! - `stream` - synchronous and asynchronous generators with delegation
//! - `codec` - JSON and pluggable struct serialization
//! - `resource` - scoped resource release

pub mod boxing;
pub mod codec;
pub mod config;
pub mod error;
pub mod objects;
pub mod registry;
pub mod resource;
pub mod runtime;
pub mod sched;
pub mod stream;
pub mod value;

pub use boxing::{
    assert_not_null, box_as, cast, dynamic_access, is_type, null_or, nullable_invoke,
    structural_equals, to_host, type_name, unbox,
};
pub use codec::{Codec, JsonCodec};
pub use config::RuntimeConfig;
pub use error::{RuntimeError, RuntimeResult};
pub use objects::Instance;
pub use registry::{FieldDef, GenericTemplate, TypeBuilder, TypeDescriptor, TypeHandle, TypeRegistry};
pub use resource::{Resource, ResourceScope};
pub use runtime::Runtime;
pub use sched::{Continuation, EventSource, Frame, Maybe, Promise, Resolver, Scheduler, Step};
pub use stream::{pack_next, unpack_next, GenStep, Stream};
pub use value::{Dict, Repr, Value};

pub use lode_common_core::{BuiltinType, MemberKind, PrimitiveKind, TypeKind, TypeRef};
