//! Runtime errors.

use thiserror::Error;

use crate::value::Value;

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors raised by runtime operations.
///
/// `Clone` because a single rejection may be delivered to every callback
/// attached to a promise.
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    /// Failed cast or conformance check. Fatal at the call site.
    #[error("cannot cast {from} to {to}")]
    Type { from: String, to: String },

    /// A struct field does not hold its declared representation.
    #[error("invalid value for field `{field}`: expected {expected}, found {found}")]
    Validation {
        field: String,
        expected: String,
        found: String,
    },

    /// Malformed or unencodable wire payload.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Worker channel failure (closed channel, undeliverable message).
    #[error("transport error: {0}")]
    Transport(String),

    /// Reference to a type that was never registered.
    #[error("unknown type: {0}")]
    UnknownType(String),

    /// Null value asserted to be non-null.
    #[error("null value access")]
    NullAccess,

    /// Protocol misuse: re-entrant resumption, polling a failed stream, ...
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Module declaration or initialization failure.
    #[error("module error: {0}")]
    Module(String),

    /// Bad runtime configuration.
    #[error("config error: {0}")]
    Config(String),

    /// Error value raised by user code.
    #[error("thrown: {0:?}")]
    Thrown(Value),
}

impl RuntimeError {
    pub fn type_mismatch(from: impl Into<String>, to: impl Into<String>) -> Self {
        RuntimeError::Type {
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn validation(
        field: impl Into<String>,
        expected: impl Into<String>,
        found: impl Into<String>,
    ) -> Self {
        RuntimeError::Validation {
            field: field.into(),
            expected: expected.into(),
            found: found.into(),
        }
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        RuntimeError::InvalidState(msg.into())
    }

    #[inline]
    pub fn is_type_error(&self) -> bool {
        matches!(self, RuntimeError::Type { .. })
    }

    #[inline]
    pub fn is_validation_error(&self) -> bool {
        matches!(self, RuntimeError::Validation { .. })
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(e: serde_json::Error) -> Self {
        RuntimeError::Serialization(e.to_string())
    }
}
