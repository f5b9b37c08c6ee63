//! Type references: how a type is named in metadata and on the wire.
//!
//! Wire form:
//! - builtin markers: `{"i": "any"}`
//! - named types: `{"t": "module.path.TypeName", "g": [TypeRef...]}`, where
//!   `g` is omitted for non-generic types.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{BuiltinType, PrimitiveKind};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TypeRef {
    Builtin {
        #[serde(rename = "i")]
        builtin: BuiltinType,
    },
    Named {
        #[serde(rename = "t")]
        path: String,
        #[serde(rename = "g", default, skip_serializing_if = "Vec::is_empty")]
        generics: Vec<TypeRef>,
    },
}

impl TypeRef {
    #[inline]
    pub fn any() -> Self {
        TypeRef::Builtin { builtin: BuiltinType::Any }
    }

    #[inline]
    pub fn builtin(builtin: BuiltinType) -> Self {
        TypeRef::Builtin { builtin }
    }

    pub fn named(path: impl Into<String>) -> Self {
        TypeRef::Named {
            path: path.into(),
            generics: Vec::new(),
        }
    }

    pub fn generic(path: impl Into<String>, generics: Vec<TypeRef>) -> Self {
        TypeRef::Named {
            path: path.into(),
            generics,
        }
    }

    /// Reference to a non-generic builtin primitive (`builtins.Integer`, ...).
    /// Generic primitives (`Slice`, `Mapping`) get `any` as their argument.
    pub fn primitive(kind: PrimitiveKind) -> Self {
        if kind.is_generic() {
            TypeRef::generic(kind.qualified_name(), vec![TypeRef::any()])
        } else {
            TypeRef::named(kind.qualified_name())
        }
    }

    pub fn path(&self) -> Option<&str> {
        match self {
            TypeRef::Named { path, .. } => Some(path),
            TypeRef::Builtin { .. } => None,
        }
    }

    pub fn generics(&self) -> &[TypeRef] {
        match self {
            TypeRef::Named { generics, .. } => generics,
            TypeRef::Builtin { .. } => &[],
        }
    }

    #[inline]
    pub fn is_any(&self) -> bool {
        matches!(self, TypeRef::Builtin { builtin: BuiltinType::Any })
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Builtin { builtin } => f.write_str(builtin.as_str()),
            TypeRef::Named { path, generics } => {
                f.write_str(path)?;
                if !generics.is_empty() {
                    f.write_str("<")?;
                    for (i, g) in generics.iter().enumerate() {
                        if i > 0 {
                            f.write_str(",")?;
                        }
                        write!(f, "{}", g)?;
                    }
                    f.write_str(">")?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_wire_form() {
        let r = TypeRef::generic("mod.Pair", vec![TypeRef::any(), TypeRef::named("mod.Point")]);
        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(json, r#"{"t":"mod.Pair","g":[{"i":"any"},{"t":"mod.Point"}]}"#);

        let back: TypeRef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn test_builtin_parse() {
        let r: TypeRef = serde_json::from_str(r#"{"i":"null"}"#).unwrap();
        assert_eq!(r, TypeRef::builtin(BuiltinType::Null));
        assert!(serde_json::from_str::<TypeRef>(r#"{"i":"nope"}"#).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(TypeRef::primitive(PrimitiveKind::List).to_string(), "builtins.Slice<any>");
        assert_eq!(TypeRef::primitive(PrimitiveKind::Int).to_string(), "builtins.Integer");
    }
}
