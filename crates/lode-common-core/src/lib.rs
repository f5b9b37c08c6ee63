//! # lode-common-core
//!
//! Core type metadata shared by the Lode runtime and by compiled call sites.
//!
//! This crate provides:
//! - `TypeKind`, `MemberKind`, `PrimitiveKind`, `BuiltinType` - flat type tags
//! - `TypeRef` - how a type is referenced in metadata and worker envelopes
//! - `Signature` - structural member sets used for interface conformance

pub mod signature;
pub mod type_ref;
pub mod types;

pub use signature::{MemberSig, Signature};
pub use type_ref::TypeRef;
pub use types::{BuiltinType, MemberKind, PrimitiveKind, TypeKind, BUILTIN_MODULE};
