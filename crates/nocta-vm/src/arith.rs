//! Raw arithmetic with the language's numeric typing rules.
//!
//! These functions implement the fast path only: integer arithmetic wraps
//! two's-complement, any float operand promotes the result to float, `/`
//! and `^` are always float, and string operands are coerced through
//! number parsing. When types still do not fit, the caller takes the
//! metamethod path; this module never dispatches metamethods itself.

use crate::coerce;
use crate::error::VmError;
use nocta_core::heap::Heap;
use nocta_core::string::StringInterner;
use nocta_core::value::TValue;

/// Binary operators the dispatcher can ask for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Mod,
    Pow,
    Div,
    IDiv,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
}

impl ArithOp {
    pub fn is_bitwise(&self) -> bool {
        use ArithOp::*;
        matches!(self, BAnd | BOr | BXor | Shl | Shr)
    }
}

/// Outcome of a fast-path attempt.
pub enum RawArith {
    /// Computed; store and move on.
    Value(TValue),
    /// Types do not fit; consult metamethods.
    NeedMeta,
    /// Domain error; abort the operation.
    Error(VmError),
}

/// Binary fast path. Integer pairs stay integral (except `/` and `^`);
/// mixed or float pairs compute in f64; strings coerce first.
pub fn raw_binary(
    op: ArithOp,
    a: TValue,
    b: TValue,
    heap: &mut Heap,
    strings: &StringInterner,
) -> RawArith {
    if op.is_bitwise() {
        return raw_bitwise(op, a, b, heap, strings);
    }

    if !matches!(op, ArithOp::Div | ArithOp::Pow) {
        // Integer path, taken when both operands are (or coerce to)
        // integers and at least one side is not a float.
        let ia = int_operand(a, heap, strings);
        let ib = int_operand(b, heap, strings);
        if let (Some(ia), Some(ib)) = (ia, ib) {
            return match int_binary(op, ia, ib) {
                Ok(i) => RawArith::Value(TValue::from_full_integer(i, heap)),
                Err(e) => RawArith::Error(e),
            };
        }
    }

    let fa = coerce::to_number(a, heap, strings);
    let fb = coerce::to_number(b, heap, strings);
    match (fa, fb) {
        (Some(fa), Some(fb)) => RawArith::Value(TValue::from_float(float_binary(op, fa, fb))),
        _ => RawArith::NeedMeta,
    }
}

/// Integer view of an operand for the integer fast path: inline/boxed
/// integers, and strings that parse as integers. Floats are excluded so
/// they promote the whole operation.
fn int_operand(v: TValue, heap: &Heap, strings: &StringInterner) -> Option<i64> {
    if v.is_float() {
        return None;
    }
    if let Some(i) = v.as_full_integer(heap) {
        return Some(i);
    }
    if let Some(sid) = v.as_string_id() {
        // Only integer-shaped strings take the integer path; "3.0"
        // denotes a float and promotes.
        let s = std::str::from_utf8(strings.get_bytes(sid)).ok()?;
        return match coerce::parse_number(s) {
            Some(coerce::Parsed::Int(i)) => Some(i),
            _ => None,
        };
    }
    None
}

fn int_binary(op: ArithOp, a: i64, b: i64) -> Result<i64, VmError> {
    Ok(match op {
        ArithOp::Add => a.wrapping_add(b),
        ArithOp::Sub => a.wrapping_sub(b),
        ArithOp::Mul => a.wrapping_mul(b),
        ArithOp::IDiv => {
            if b == 0 {
                return Err(VmError::Arith("attempt to perform 'n//0'".into()));
            }
            floor_div(a, b)
        }
        ArithOp::Mod => {
            if b == 0 {
                return Err(VmError::Arith("attempt to perform 'n%0'".into()));
            }
            floor_mod(a, b)
        }
        ArithOp::BAnd => a & b,
        ArithOp::BOr => a | b,
        ArithOp::BXor => a ^ b,
        ArithOp::Shl => shift_left(a, b),
        ArithOp::Shr => shift_left(a, b.wrapping_neg()),
        ArithOp::Div | ArithOp::Pow => unreachable!("always computed in floats"),
    })
}

fn float_binary(op: ArithOp, a: f64, b: f64) -> f64 {
    match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => a / b,
        ArithOp::Pow => a.powf(b),
        // Float floor-division and modulo by zero follow IEEE-754 and
        // yield inf/NaN; only the integer forms raise.
        ArithOp::IDiv => (a / b).floor(),
        ArithOp::Mod => {
            let r = a % b;
            if r != 0.0 && (r > 0.0) != (b > 0.0) {
                r + b
            } else {
                r
            }
        }
        _ => unreachable!("bitwise handled separately"),
    }
}

/// Floor division, rounding toward negative infinity. `i64::MIN / -1`
/// wraps like the other integer operators.
fn floor_div(a: i64, b: i64) -> i64 {
    let q = a.wrapping_div(b);
    let r = a.wrapping_rem(b);
    if r != 0 && (r ^ b) < 0 {
        q - 1
    } else {
        q
    }
}

/// Floor modulo: result takes the divisor's sign.
fn floor_mod(a: i64, b: i64) -> i64 {
    let r = a.wrapping_rem(b);
    if r != 0 && (r ^ b) < 0 {
        r.wrapping_add(b)
    } else {
        r
    }
}

/// Shift left by `b` bits; negative `b` shifts right. Shifts of 64 or
/// more in either direction produce zero (logical shifts, no sign).
fn shift_left(a: i64, b: i64) -> i64 {
    if b <= -64 || b >= 64 {
        0
    } else if b >= 0 {
        ((a as u64) << b) as i64
    } else {
        ((a as u64) >> -b) as i64
    }
}

/// Bitwise operands must convert exactly to an integer. A number that is
/// not integer-valued is a domain error only when neither operand can
/// possibly carry a metamethod; otherwise the metamethod path decides.
fn raw_bitwise(
    op: ArithOp,
    a: TValue,
    b: TValue,
    heap: &mut Heap,
    strings: &StringInterner,
) -> RawArith {
    let ia = coerce::to_integer(a, heap, strings);
    let ib = coerce::to_integer(b, heap, strings);
    if let (Some(ia), Some(ib)) = (ia, ib) {
        return match int_binary(op, ia, ib) {
            Ok(i) => RawArith::Value(TValue::from_full_integer(i, heap)),
            Err(e) => RawArith::Error(e),
        };
    }
    let mm_capable = |v: TValue| v.is_table() || v.is_userdata();
    if !mm_capable(a) && !mm_capable(b) && a.as_number(heap).is_some() && b.as_number(heap).is_some()
    {
        return RawArith::Error(VmError::Arith(
            "number has no integer representation".into(),
        ));
    }
    RawArith::NeedMeta
}

/// Unary minus fast path.
pub fn raw_negate(v: TValue, heap: &mut Heap, strings: &StringInterner) -> RawArith {
    if let Some(i) = int_operand(v, heap, strings) {
        return RawArith::Value(TValue::from_full_integer(i.wrapping_neg(), heap));
    }
    match coerce::to_number(v, heap, strings) {
        Some(f) => RawArith::Value(TValue::from_float(-f)),
        None => RawArith::NeedMeta,
    }
}

/// Bitwise not fast path.
pub fn raw_bnot(v: TValue, heap: &mut Heap, strings: &StringInterner) -> RawArith {
    if let Some(i) = coerce::to_integer(v, heap, strings) {
        return RawArith::Value(TValue::from_full_integer(!i, heap));
    }
    if !v.is_table() && !v.is_userdata() && v.as_number(heap).is_some() {
        return RawArith::Error(VmError::Arith(
            "number has no integer representation".into(),
        ));
    }
    RawArith::NeedMeta
}
