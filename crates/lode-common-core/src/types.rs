//! Type classification shared by the runtime and the code that calls into it.

use num_enum::TryFromPrimitive;
use serde::{Deserialize, Serialize};

/// Module path that holds the builtin primitive types.
pub const BUILTIN_MODULE: &str = "builtins";

/// Kind of a registered type.
///
/// Unlike the full descriptor, `TypeKind` is a flat tag used for dispatch
/// in boxing, casting and validation. No `TryFromPrimitive` here: its
/// associated `Primitive` type would clash with the `Primitive` variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeKind {
    /// `any`, `struct`, `void`, `null` markers.
    Builtin = 0,
    Primitive = 1,
    Struct = 2,
    Class = 3,
    Interface = 4,
    /// A nominal wrapper over another type (its root).
    Nominal = 5,
}

impl TypeKind {
    #[inline]
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Builtin,
            1 => Self::Primitive,
            2 => Self::Struct,
            3 => Self::Class,
            4 => Self::Interface,
            5 => Self::Nominal,
            _ => return None,
        })
    }

    /// Struct and class instances carry named fields.
    #[inline]
    pub fn has_fields(self) -> bool {
        matches!(self, Self::Struct | Self::Class)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Builtin => "builtin",
            Self::Primitive => "primitive",
            Self::Struct => "struct",
            Self::Class => "class",
            Self::Interface => "interface",
            Self::Nominal => "nominal",
        }
    }
}

/// Member kind inside a structural signature.
///
/// The numeric value is part of the signature key (`name|kind|type`), so it
/// must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, TryFromPrimitive)]
#[repr(u8)]
pub enum MemberKind {
    Constructor = 1,
    Function = 2,
    Property = 3,
    Operator = 4,
    Field = 5,
}

/// The fixed builtin type markers addressable as `{i: name}` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuiltinType {
    /// Matches every value.
    Any,
    /// Matches any struct, or any value whose root is a primitive.
    Struct,
    Void,
    Null,
}

impl BuiltinType {
    pub const ALL: [BuiltinType; 4] = [Self::Any, Self::Struct, Self::Void, Self::Null];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::Struct => "struct",
            Self::Void => "void",
            Self::Null => "null",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|b| b.as_str() == name)
    }
}

/// Host representation underlying a primitive type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u8)]
pub enum PrimitiveKind {
    Bool = 0,
    Int = 1,
    Float = 2,
    String = 3,
    /// `Slice<T>`, generic over its element.
    List = 4,
    /// `Mapping<T>`, string keyed, generic over its value.
    Map = 5,
}

impl PrimitiveKind {
    pub const ALL: [PrimitiveKind; 6] = [
        Self::Bool,
        Self::Int,
        Self::Float,
        Self::String,
        Self::List,
        Self::Map,
    ];

    /// Declared type name inside [`BUILTIN_MODULE`].
    pub fn type_name(self) -> &'static str {
        match self {
            Self::Bool => "Boolean",
            Self::Int => "Integer",
            Self::Float => "Float",
            Self::String => "String",
            Self::List => "Slice",
            Self::Map => "Mapping",
        }
    }

    /// Fully qualified path, e.g. `builtins.Integer`.
    pub fn qualified_name(self) -> String {
        format!("{}.{}", BUILTIN_MODULE, self.type_name())
    }

    /// Name of the host representation, used in validation messages.
    pub fn repr_name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::String => "string",
            Self::List => "list",
            Self::Map => "map",
        }
    }

    #[inline]
    pub fn is_generic(self) -> bool {
        matches!(self, Self::List | Self::Map)
    }

    pub fn from_type_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.type_name() == name)
    }
}
