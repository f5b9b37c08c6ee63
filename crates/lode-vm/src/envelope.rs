//! Worker call envelopes.
//!
//! Wire form:
//! ```json
//! {"token": "call-1", "method": "sum", "arguments": [{"v": 1, "t": {"t": "builtins.Integer"}}]}
//! {"token": "call-1", "method": "sum", "arguments": [], "kind": "resolve", "value": {"v": 3}}
//! ```
//! Typed values carry their type reference in `t`; untyped host values
//! carry only `v`.

use lode_common_core::{TypeKind, TypeRef};
use lode_runtime::codec::{decode_json, encode_json};
use lode_runtime::{box_as, cast, Runtime, RuntimeError, RuntimeResult, Value};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Resolve,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireValue {
    pub v: Json,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<TypeRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub token: String,
    pub method: String,
    #[serde(default)]
    pub arguments: Vec<WireValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<EnvelopeKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<WireValue>,
}

impl Envelope {
    pub fn request(token: impl Into<String>, method: impl Into<String>, arguments: Vec<WireValue>) -> Self {
        Self {
            token: token.into(),
            method: method.into(),
            arguments,
            kind: None,
            value: None,
        }
    }

    pub fn response(token: impl Into<String>, method: impl Into<String>, kind: EnvelopeKind, value: WireValue) -> Self {
        Self {
            token: token.into(),
            method: method.into(),
            arguments: Vec::new(),
            kind: Some(kind),
            value: Some(value),
        }
    }

    #[inline]
    pub fn is_response(&self) -> bool {
        self.kind.is_some()
    }

    pub fn to_text(&self) -> RuntimeResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_text(text: &str) -> RuntimeResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Encode a value. Boxed values and instances record their type.
pub fn encode_value(rt: &Runtime, value: &Value) -> RuntimeResult<WireValue> {
    let t = match value {
        Value::Boxed(b) => Some(b.ty().type_ref().clone()),
        Value::Instance(inst) => Some(inst.ty().type_ref().clone()),
        _ => None,
    };
    Ok(WireValue {
        v: encode_json(rt.types(), value, rt.config().serde.max_depth)?,
        t,
    })
}

/// Decode a value, re-boxing it under its recorded type if any.
pub fn decode_value(rt: &Runtime, wire: WireValue) -> RuntimeResult<Value> {
    let types = rt.types();
    let raw = decode_json(types, wire.v, rt.config().serde.max_depth)?;
    match wire.t {
        None => Ok(raw),
        Some(t) => {
            let ty = types.resolve(&t)?;
            match ty.kind() {
                TypeKind::Struct | TypeKind::Class => box_as(types, raw, &ty),
                _ => cast(types, raw, &ty, true),
            }
        }
    }
}

/// Encode a rejection. Thrown values travel as values, other errors as
/// their message.
pub fn encode_error(rt: &Runtime, err: &RuntimeError) -> WireValue {
    if let RuntimeError::Thrown(v) = err {
        if let Ok(wire) = encode_value(rt, v) {
            return wire;
        }
    }
    WireValue {
        v: Json::String(err.to_string()),
        t: None,
    }
}

/// Decode a rejection into the error delivered to the caller.
pub fn decode_error(rt: &Runtime, wire: WireValue) -> RuntimeError {
    match decode_value(rt, wire) {
        Ok(v) => RuntimeError::Thrown(v),
        Err(e) => e,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lode_common_core::PrimitiveKind;
    use lode_runtime::TypeBuilder;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_wire_shape() {
        let env = Envelope::request(
            "call-1",
            "sum",
            vec![WireValue {
                v: Json::from(1),
                t: Some(TypeRef::primitive(PrimitiveKind::Int)),
            }],
        );
        assert_eq!(
            env.to_text().unwrap(),
            r#"{"token":"call-1","method":"sum","arguments":[{"v":1,"t":{"t":"builtins.Integer"}}]}"#
        );
        let back = Envelope::from_text(&env.to_text().unwrap()).unwrap();
        assert_eq!(back, env);
        assert!(!back.is_response());

        let resp = Envelope::from_text(r#"{"token":"x","method":"m","kind":"reject","value":{"v":"no"}}"#).unwrap();
        assert_eq!(resp.kind, Some(EnvelopeKind::Reject));
        assert!(resp.arguments.is_empty());
    }

    #[test]
    fn test_typed_value_keeps_type() {
        let rt = Runtime::new();
        let mut id = TypeBuilder::new("app.UserId", TypeKind::Nominal);
        id.root(TypeRef::primitive(PrimitiveKind::Int));
        let id = rt.types().register(id).unwrap();
        let boxed = box_as(rt.types(), Value::Int(5), &id).unwrap();

        let wire = encode_value(&rt, &boxed).unwrap();
        assert_eq!(wire.t, Some(TypeRef::named("app.UserId")));
        let back = decode_value(&rt, wire).unwrap();
        assert_eq!(rt.types().type_of(&back).id(), "app.UserId");
        assert_eq!(back.as_int(), Some(5));

        let untyped = encode_value(&rt, &Value::str("plain")).unwrap();
        assert_eq!(untyped.t, None);
    }

    #[test]
    fn test_unknown_type_fails() {
        let rt = Runtime::new();
        let wire = WireValue {
            v: Json::from(1),
            t: Some(TypeRef::named("nope.Gone")),
        };
        assert!(matches!(decode_value(&rt, wire), Err(RuntimeError::UnknownType(_))));
    }
}
