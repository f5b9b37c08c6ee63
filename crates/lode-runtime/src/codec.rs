//! Struct serialization.
//!
//! The built-in codec is JSON. Stringify reads every field through the
//! validating accessor, strips boxes and writes the wire-keyed object. Parse
//! decodes the text, re-boxes host values under their inferred types (object
//! as `Mapping<any>`, array as `Slice<any>`, integral numbers as `Integer`,
//! other numbers as `Float`), fills defaults and validates the whole value
//! before returning.
//!
//! Pluggable codecs see the same wire-keyed, unboxed dictionary.

use std::rc::Rc;

use lode_common_core::PrimitiveKind;
use serde_json::{Map as JsonMap, Number, Value as Json};

use crate::boxing::{box_as, to_host};
use crate::error::{RuntimeError, RuntimeResult};
use crate::objects::Instance;
use crate::registry::{TypeHandle, TypeRegistry};
use crate::runtime::Runtime;
use crate::sched::{Maybe, Promise};
use crate::value::{Dict, Value};

/// A wire format for struct values.
pub trait Codec {
    fn name(&self) -> &str;

    /// The built-in JSON codec; callers may take the synchronous fast path.
    fn is_builtin_json(&self) -> bool {
        false
    }

    /// Encode a wire-keyed dictionary. Resolves with a string.
    fn stringify(&self, rt: &Runtime, mapping: &Value) -> Promise;

    /// Decode text into a wire-keyed dictionary.
    fn parse(&self, rt: &Runtime, text: &str) -> Promise;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &str {
        "json"
    }

    fn is_builtin_json(&self) -> bool {
        true
    }

    fn stringify(&self, rt: &Runtime, mapping: &Value) -> Promise {
        let text = encode_json(rt.types(), mapping, rt.config().serde.max_depth)
            .and_then(|json| Ok(serde_json::to_string(&json)?));
        Promise::from_result(rt.scheduler(), text.map(Value::from))
    }

    fn parse(&self, rt: &Runtime, text: &str) -> Promise {
        let decoded = serde_json::from_str::<Json>(text)
            .map_err(RuntimeError::from)
            .and_then(|json| decode_json(rt.types(), json, rt.config().serde.max_depth));
        Promise::from_result(rt.scheduler(), decoded)
    }
}

// =============================================================================
// Visitors
// =============================================================================

/// Host value to JSON. Boxes are stripped; instances are written by wire
/// name, the same way [`wire_dict`] reads them.
pub fn encode_json(types: &TypeRegistry, value: &Value, max_depth: usize) -> RuntimeResult<Json> {
    encode_at(types, value, 0, max_depth)
}

fn encode_at(types: &TypeRegistry, value: &Value, depth: usize, max_depth: usize) -> RuntimeResult<Json> {
    if depth > max_depth {
        return Err(RuntimeError::Serialization(
            "max depth exceeded (possible cycle)".to_string(),
        ));
    }
    Ok(match value.unboxed() {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(i) => Json::from(*i),
        Value::Float(f) => Number::from_f64(*f).map(Json::Number).ok_or_else(|| {
            RuntimeError::Serialization(format!("cannot encode non-finite float {}", f))
        })?,
        Value::Str(s) => Json::String(s.to_string()),
        Value::List(items) => Json::Array(
            items
                .borrow()
                .iter()
                .map(|v| encode_at(types, v, depth + 1, max_depth))
                .collect::<RuntimeResult<Vec<_>>>()?,
        ),
        Value::Map(dict) => encode_object(types, &dict.borrow(), depth, max_depth)?,
        Value::Instance(_) => encode_at(types, &to_host(types, value)?, depth, max_depth)?,
        Value::Boxed(_) => Json::Null,
    })
}

fn encode_object(types: &TypeRegistry, dict: &Dict, depth: usize, max_depth: usize) -> RuntimeResult<Json> {
    let mut obj = JsonMap::with_capacity(dict.len());
    for (k, v) in dict {
        obj.insert(k.clone(), encode_at(types, v, depth + 1, max_depth)?);
    }
    Ok(Json::Object(obj))
}

/// JSON to host values, boxed under their inferred types.
pub fn decode_json(types: &TypeRegistry, json: Json, max_depth: usize) -> RuntimeResult<Value> {
    decode_at(types, json, 0, max_depth)
}

fn decode_at(types: &TypeRegistry, json: Json, depth: usize, max_depth: usize) -> RuntimeResult<Value> {
    if depth > max_depth {
        return Err(RuntimeError::Serialization("max depth exceeded".to_string()));
    }
    let (raw, kind) = match json {
        Json::Null => return Ok(Value::Null),
        Json::Bool(b) => (Value::Bool(b), PrimitiveKind::Bool),
        Json::Number(n) => decode_number(&n)?,
        Json::String(s) => (Value::from(s), PrimitiveKind::String),
        Json::Array(items) => {
            let items = items
                .into_iter()
                .map(|v| decode_at(types, v, depth + 1, max_depth))
                .collect::<RuntimeResult<Vec<_>>>()?;
            (Value::list(items), PrimitiveKind::List)
        }
        Json::Object(obj) => {
            let mut dict = Dict::with_capacity(obj.len());
            for (k, v) in obj {
                dict.insert(k, decode_at(types, v, depth + 1, max_depth)?);
            }
            (Value::map(dict), PrimitiveKind::Map)
        }
    };
    box_as(types, raw, &types.primitive(kind))
}

/// Numbers without a fractional part decode as integers.
fn decode_number(n: &Number) -> RuntimeResult<(Value, PrimitiveKind)> {
    if let Some(i) = n.as_i64() {
        return Ok((Value::Int(i), PrimitiveKind::Int));
    }
    let f = n
        .as_f64()
        .ok_or_else(|| RuntimeError::Serialization(format!("unrepresentable number {}", n)))?;
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        Ok((Value::Int(f as i64), PrimitiveKind::Int))
    } else {
        Ok((Value::Float(f), PrimitiveKind::Float))
    }
}

// =============================================================================
// Struct entry points
// =============================================================================

/// Wire-keyed, fully unboxed dictionary of an instance, read through the
/// validating accessors.
pub fn wire_dict(rt: &Runtime, inst: &Instance) -> RuntimeResult<Value> {
    to_host(rt.types(), &Value::Instance(inst.clone()))
}

/// Built-in JSON fast path; also the struct `String()` member.
pub fn stringify_json(rt: &Runtime, inst: &Instance) -> RuntimeResult<String> {
    let dict = wire_dict(rt, inst)?;
    let json = encode_json(rt.types(), &dict, rt.config().serde.max_depth)?;
    Ok(serde_json::to_string(&json)?)
}

/// Built-in JSON fast path for `Parse`.
pub fn parse_json(rt: &Runtime, text: &str, ty: &TypeHandle) -> RuntimeResult<Instance> {
    let json: Json = serde_json::from_str(text)?;
    if !json.is_object() {
        return Err(RuntimeError::Serialization(format!(
            "expected a JSON object for `{}`",
            ty.name()
        )));
    }
    let decoded = decode_json(rt.types(), json, rt.config().serde.max_depth)?;
    finish_parse(rt, decoded, ty)
}

/// Turn a decoded dictionary into an instance of `ty`: fill defaults, then
/// validate every field, nested structs included.
fn finish_parse(rt: &Runtime, decoded: Value, ty: &TypeHandle) -> RuntimeResult<Instance> {
    let inst = match decoded.unboxed() {
        Value::Map(dict) => Instance::wrap(ty.clone(), dict.clone(), false),
        Value::Instance(inst) if Rc::ptr_eq(inst.ty(), ty) => return Ok(inst.clone()),
        other => {
            return Err(RuntimeError::Serialization(format!(
                "cannot decode `{}` from {}",
                ty.name(),
                other.repr().name()
            )))
        }
    };
    inst.init_defaults();
    inst.validate_all(rt.types(), true, rt.config().serde.max_depth)?;
    Ok(inst)
}

/// `Stringify(instance, codec)`. Resolves with the encoded string.
pub fn stringify(rt: &Runtime, inst: &Instance, codec: Option<&dyn Codec>) -> Promise {
    match codec {
        Some(codec) if !codec.is_builtin_json() => match wire_dict(rt, inst) {
            Ok(dict) => codec.stringify(rt, &dict),
            Err(e) => Promise::rejected(rt.scheduler(), e),
        },
        _ => Promise::from_result(rt.scheduler(), stringify_json(rt, inst).map(Value::from)),
    }
}

/// `Parse(text, codec, type)`. Resolves with the parsed instance.
pub fn parse(rt: &Runtime, text: &str, ty: &TypeHandle, codec: Option<&dyn Codec>) -> Promise {
    match codec {
        Some(codec) if !codec.is_builtin_json() => {
            let (rt2, ty) = (rt.clone(), ty.clone());
            codec.parse(rt, text).then(move |decoded| {
                let inst = finish_parse(&rt2, decoded, &ty)?;
                Ok(Maybe::Ready(Value::Instance(inst)))
            })
        }
        _ => Promise::from_result(
            rt.scheduler(),
            parse_json(rt, text, ty).map(Value::Instance),
        ),
    }
}
