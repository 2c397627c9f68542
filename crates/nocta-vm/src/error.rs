//! Runtime error taxonomy.

use nocta_core::string::StringInterner;
use nocta_core::value::TValue;
use thiserror::Error;

/// A runtime error raised by the interpreter or a native function.
///
/// Any value can be raised (`Value`); the other variants classify errors
/// the VM itself produces. All of them unwind to the nearest protected
/// boundary, closing upvalues and to-be-closed slots per unwound frame.
#[derive(Clone, Debug, Error)]
pub enum VmError {
    /// Operator applied to incompatible types with no applicable metamethod.
    #[error("{0}")]
    Type(String),
    /// Arithmetic domain violation: integer division/modulo by zero, or a
    /// float-to-integer conversion out of range.
    #[error("{0}")]
    Arith(String),
    /// Indexing nil or a non-indexable value with no `__index`.
    #[error("{0}")]
    Reference(String),
    /// Malformed bytecode: bad opcode, bad constant, bad upvalue or
    /// prototype index.
    #[error("{0}")]
    Structural(String),
    /// Operand-stack or call-depth limit exceeded.
    #[error("{0}")]
    Resource(String),
    /// A value raised by script or native code (`error(v)`).
    #[error("error object: {0:?}")]
    Value(TValue),
}

impl VmError {
    /// True for errors raised deliberately by script code; these skip the
    /// crash dump.
    pub fn is_user(&self) -> bool {
        matches!(self, VmError::Value(_))
    }

    /// The error as a language value, for protected-call results.
    pub fn to_value(&self, strings: &mut StringInterner) -> TValue {
        match self {
            VmError::Value(v) => *v,
            other => {
                let msg = other.to_string();
                TValue::from_string_id(strings.intern_or_create(msg.as_bytes()))
            }
        }
    }
}
